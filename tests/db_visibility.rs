use mica::{Config, Document, OpenMode};
use test_log::test;

#[test]
fn add_delete_commit_visibility() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut writer = Config::new(&folder).open_writable(OpenMode::Create)?;
    assert_eq!(0, writer.doc_count());
    assert_eq!(0.0, writer.avg_length());

    let mut doc = Document::new();
    doc.set_data("Foobar rising");
    doc.add_posting("foobar", 1);
    doc.add_posting("foobar", 3);
    doc.add_posting("rising", 2);

    let did = writer.add_document(&doc)?;
    assert_eq!(1, did);

    // The writer sees its own uncommitted changes
    assert_eq!(1, writer.doc_count());
    assert_eq!(3, writer.doc_length(did)?);

    // A reader opened before the commit sees nothing
    let r1 = Config::new(&folder).open()?;
    assert_eq!(0, r1.doc_count());
    assert_eq!(0.0, r1.avg_length()?);

    writer.commit()?;

    // A reader opened after the commit sees the document
    let r2 = Config::new(&folder).open()?;
    assert_eq!(1, r2.doc_count());
    assert_eq!(3.0, r2.avg_length()?);
    assert_eq!(r2.get_document(did)?, *b"Foobar rising");

    // The old reader still reports the pre-commit state
    assert_eq!(0, r1.doc_count());

    // ... until it reopens
    let mut r1 = r1;
    r1.reopen()?;
    assert_eq!(1, r1.doc_count());

    writer.delete_document(did)?;
    writer.commit()?;

    let r3 = Config::new(&folder).open()?;
    assert_eq!(0, r3.doc_count());
    assert_eq!(0.0, r3.avg_length()?);

    Ok(())
}

#[test]
fn cancel_discards_changes() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut writer = Config::new(&folder).open_writable(OpenMode::Create)?;

    let mut doc = Document::new();
    doc.add_posting("tossed", 1);
    writer.add_document(&doc)?;
    assert_eq!(1, writer.doc_count());

    writer.cancel()?;
    assert_eq!(0, writer.doc_count());
    assert_eq!(0, writer.total_length());

    // Cancel after cancel is a no-op
    writer.cancel()?;
    assert_eq!(0, writer.doc_count());

    // Commit with nothing pending leaves the revision alone
    let revision = writer.revision();
    writer.commit()?;
    assert_eq!(revision, writer.revision());

    Ok(())
}

#[test]
fn document_roundtrip_with_everything() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut writer = Config::new(&folder).open_writable(OpenMode::Create)?;

    let mut doc = Document::new();
    doc.set_data("data blob");
    doc.add_posting("alpha", 1);
    doc.add_posting("beta", 2);
    doc.add_posting("beta", 7);
    doc.add_value(3, "facet");

    let did = writer.add_document(&doc)?;
    writer.commit()?;

    let reader = Config::new(&folder).open()?;
    assert_eq!(reader.get_document(did)?, *b"data blob");
    assert_eq!(Some("facet".into()), reader.get_value(did, 3)?);
    assert_eq!(3, reader.doc_length(did)?);
    assert_eq!(2, reader.unique_terms(did)?);
    assert!(reader.term_exists(b"alpha")?);
    assert!(!reader.term_exists(b"gamma")?);
    assert!(reader.has_positions());

    let mut terms = reader.term_list(did)?;
    assert!(terms.next()?);
    assert_eq!(b"alpha", terms.term());
    assert_eq!(1, terms.wdf());
    assert!(terms.next()?);
    assert_eq!(b"beta", terms.term());
    assert_eq!(2, terms.wdf());
    assert!(!terms.next()?);

    Ok(())
}
