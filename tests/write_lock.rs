use mica::{Config, Document, Error, OpenMode};
use test_log::test;

#[test]
fn second_writer_is_locked_out() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut h1 = Config::new(&folder).open_writable(OpenMode::Create)?;

    // A second writable handle must fail with a lock error
    assert!(matches!(
        Config::new(&folder).open_writable(OpenMode::CreateOrOpen),
        Err(Error::Locked(_)),
    ));

    // The first handle stays usable
    let mut doc = Document::new();
    doc.add_posting("usable", 1);
    h1.add_document(&doc)?;
    h1.commit()?;

    // Read-only handles are unaffected by the lock
    let reader = Config::new(&folder).open()?;
    assert_eq!(1, reader.doc_count());

    // Dropping the writer releases the lock
    drop(h1);
    let h3 = Config::new(&folder).open_writable(OpenMode::Open)?;
    assert_eq!(1, h3.doc_count());

    Ok(())
}

#[test]
fn open_mode_errors() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    // Opening a database that does not exist
    assert!(matches!(
        Config::new(folder.path().join("nothing-here")).open(),
        Err(Error::Opening(_)),
    ));
    assert!(matches!(
        Config::new(folder.path().join("nothing-here")).open_writable(OpenMode::Open),
        Err(Error::Opening(_)),
    ));

    // Creating over an existing database
    {
        let _db = Config::new(&folder).open_writable(OpenMode::Create)?;
    }
    assert!(matches!(
        Config::new(&folder).open_writable(OpenMode::Create),
        Err(Error::Create(_)),
    ));

    Ok(())
}
