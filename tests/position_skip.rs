use mica::{Config, Document, Error, OpenMode};
use test_log::test;

#[test]
fn position_list_skip_semantics() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    let mut doc = Document::new();
    for pos in [5, 8, 10, 12] {
        doc.add_posting("foo", pos);
    }
    let did = db.add_document(&doc)?;
    db.commit()?;

    let reader = Config::new(&folder).open()?;

    let mut positions = reader.positions(did, b"foo")?;
    positions.skip_to(9)?;
    assert_eq!(10, positions.position());

    positions.next()?;
    assert_eq!(12, positions.position());

    positions.next()?;
    assert!(positions.at_end());

    // A fresh read skipping past the last position ends immediately
    let mut positions = reader.positions(did, b"foo")?;
    positions.skip_to(13)?;
    assert!(positions.at_end());

    Ok(())
}

#[test]
fn position_list_full_iteration() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    let mut doc = Document::new();
    let stored: Vec<u32> = (1..=200).map(|i| i * 3).collect();
    for &pos in &stored {
        doc.add_posting("dense", pos);
    }
    let did = db.add_document(&doc)?;
    db.commit()?;

    let mut positions = db.positions(did, b"dense")?;
    assert_eq!(200, positions.count());

    let mut got = Vec::new();
    loop {
        positions.next()?;
        if positions.at_end() {
            break;
        }
        got.push(positions.position());
    }
    assert_eq!(stored, got);

    Ok(())
}

#[test]
fn positions_for_absent_term_is_a_range_error() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    let mut doc = Document::new();
    doc.add_posting("present", 1);
    let did = db.add_document(&doc)?;
    db.commit()?;

    assert!(matches!(
        db.positions(did, b"absent"),
        Err(Error::Range(_)),
    ));

    // A missing document is reported as such, not as a range error
    assert!(matches!(
        db.positions(99, b"present"),
        Err(Error::DocNotFound(99)),
    ));

    // A term added without positions errors the same way, since no
    // positional data exists for it
    let mut doc = Document::new();
    doc.add_term("posless", 2);
    let did = db.add_document(&doc)?;
    db.commit()?;

    assert!(matches!(
        db.positions(did, b"posless"),
        Err(Error::Range(_)),
    ));

    Ok(())
}

#[test]
fn replace_document_drops_stale_positions() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    let mut doc = Document::new();
    doc.add_posting("old", 1);
    let did = db.add_document(&doc)?;
    db.commit()?;

    let mut replacement = Document::new();
    replacement.add_posting("new", 1);
    db.replace_document(did, &replacement)?;
    db.commit()?;

    let mut positions = db.positions(did, b"new")?;
    positions.next()?;
    assert_eq!(1, positions.position());

    // The dropped term's position list is gone with it
    assert!(db.positions(did, b"old").is_err());

    Ok(())
}
