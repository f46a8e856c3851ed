use mica::{Config, Document, OpenMode, Slice};
use test_log::test;

#[test]
fn metadata_roundtrip() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    // Absent keys read as empty
    assert_eq!(Slice::empty(), db.get_metadata(b"missing")?);

    db.set_metadata(b"schema", b"v2")?;
    db.set_metadata(b"language", b"en")?;
    assert_eq!(db.get_metadata(b"schema")?, *b"v2");

    db.commit()?;

    let reader = Config::new(&folder).open()?;
    assert_eq!(reader.metadata(b"schema")?, *b"v2");
    assert_eq!(reader.metadata(b"language")?, *b"en");

    // Setting the empty value removes the key
    db.set_metadata(b"schema", b"")?;
    db.commit()?;
    assert_eq!(Slice::empty(), db.get_metadata(b"schema")?);

    Ok(())
}

#[test]
fn metadata_keys_iteration() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    for (key, value) in [
        ("config.a", "1"),
        ("config.b", "2"),
        ("other", "3"),
        ("zzz", "4"),
    ] {
        db.set_metadata(key.as_bytes(), value.as_bytes())?;
    }

    // Index data must not leak into the metadata key space
    let mut doc = Document::new();
    doc.add_term("aterm", 1);
    db.add_document(&doc)?;
    db.commit()?;

    let collect = |mut it: mica::MetadataIterator<'_>| -> mica::Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        loop {
            it.next()?;
            if it.at_end() {
                break;
            }
            keys.push(it.key().to_vec());
        }
        Ok(keys)
    };

    let all = collect(db.metadata_keys(b"")?)?;
    assert_eq!(
        vec![
            b"config.a".to_vec(),
            b"config.b".to_vec(),
            b"other".to_vec(),
            b"zzz".to_vec(),
        ],
        all,
    );

    let prefixed = collect(db.metadata_keys(b"config.")?)?;
    assert_eq!(vec![b"config.a".to_vec(), b"config.b".to_vec()], prefixed);

    let exact = collect(db.metadata_keys(b"other")?)?;
    assert_eq!(vec![b"other".to_vec()], exact);

    let none = collect(db.metadata_keys(b"nope")?)?;
    assert!(none.is_empty());

    Ok(())
}
