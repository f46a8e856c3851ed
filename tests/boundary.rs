use mica::table::Table;
use mica::{Config, Document, Error, OpenMode};
use test_log::test;

#[test]
fn empty_tag_is_distinct_from_deletion_after_commit() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    Table::create(folder.path(), "test", 2_048)?;
    let mut table = Table::open(folder.path(), "test", true, None)?;

    table.set_entry(b"present-empty".into(), Some(b"".into()))?;
    table.set_entry(b"present".into(), Some(b"tag".into()))?;
    table.apply(1)?;

    table.set_entry(b"present".into(), None)?;
    table.apply(2)?;

    let table = Table::open(folder.path(), "test", false, None)?;
    assert_eq!(Some(b"".into()), table.get_exact_entry(b"present-empty")?);
    assert_eq!(None, table.get_exact_entry(b"present")?);

    Ok(())
}

#[test]
fn zero_term_document() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    let mut doc = Document::new();
    doc.set_data("no terms at all");
    let did = db.add_document(&doc)?;
    db.commit()?;

    assert_eq!(1, db.doc_count());
    assert_eq!(0, db.doc_length(did)?);
    assert_eq!(0, db.unique_terms(did)?);
    assert_eq!(0, db.total_length());

    let mut terms = db.term_list(did)?;
    assert!(!terms.next()?);
    assert!(terms.at_end());

    Ok(())
}

#[test]
fn term_validation() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    // Longer than any table key can carry
    let mut doc = Document::new();
    doc.add_term(vec![b'x'; 300], 1);
    assert!(matches!(
        db.add_document(&doc),
        Err(Error::InvalidArgument(_)),
    ));

    // The failed add must not leave partial state behind
    assert_eq!(0, db.doc_count());
    db.commit()?;
    assert_eq!(0, Config::new(&folder).open()?.doc_count());

    Ok(())
}

#[test]
fn opening_missing_revision_fails_cleanly() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    Table::create(folder.path(), "test", 2_048)?;
    let mut table = Table::open(folder.path(), "test", true, None)?;
    table.set_entry(b"k".into(), Some(b"v".into()))?;
    table.apply(1)?;

    assert!(matches!(
        Table::open(folder.path(), "test", false, Some(99)),
        Err(Error::RevisionNotFound(99)),
    ));

    // The failure corrupted nothing
    let table = Table::open(folder.path(), "test", false, Some(1))?;
    assert_eq!(Some(b"v".into()), table.get_exact_entry(b"k")?);

    Ok(())
}

#[test]
fn add_then_delete_before_commit() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    let mut doc = Document::new();
    doc.add_term("ephemeral", 2);
    let did = db.add_document(&doc)?;
    db.delete_document(did)?;

    // The term came and went inside one batch; the flush must cope with a
    // posting list that never reached disk
    db.commit()?;

    assert_eq!(0, db.doc_count());
    assert!(!db.term_exists(b"ephemeral")?);
    assert_eq!(0, db.total_length());

    Ok(())
}

#[test]
fn docid_zero_is_rejected() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    assert!(matches!(
        db.replace_document(0, &Document::new()),
        Err(Error::InvalidArgument(_)),
    ));
    assert!(matches!(db.delete_document(0), Err(Error::InvalidArgument(_))));

    Ok(())
}

#[test]
fn missing_documents_are_not_found() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;
    db.add_document(&Document::new())?;
    db.commit()?;

    assert!(matches!(db.get_document(5), Err(Error::DocNotFound(5))));
    assert!(matches!(db.delete_document(5), Err(Error::DocNotFound(5))));
    assert!(matches!(db.doc_length(5), Err(Error::DocNotFound(5))));

    // Deleting a missing document must not wipe buffered changes
    let mut doc = Document::new();
    doc.add_term("survives", 1);
    db.add_document(&doc)?;
    assert!(db.delete_document(99).is_err());
    db.commit()?;
    assert!(db.term_exists(b"survives")?);

    Ok(())
}
