use mica::table::Table;
use mica::{Config, Document, OpenMode};
use test_log::test;

#[test]
fn mismatched_revisions_are_recovered_on_writable_open() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let revision = {
        let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

        let mut doc = Document::new();
        doc.set_data("survivor");
        doc.add_posting("keep", 1);
        db.add_document(&doc)?;
        db.commit()?;

        db.revision()
    };

    // Simulate a crash between the postlist commit and the record commit:
    // push only the postlist table one revision ahead
    {
        let mut postlist = Table::open(folder.path(), "postlist", true, None)?;
        assert_eq!(revision, postlist.latest_revision());
        postlist.apply(revision + 1)?;
    }

    // Reading still works meanwhile (the record revision is available in
    // every table)
    {
        let reader = Config::new(&folder).open()?;
        assert_eq!(1, reader.doc_count());
    }

    // Writable open detects the partial commit and moves every table to a
    // common fresh revision, with no data changes
    let mut db = Config::new(&folder).open_writable(OpenMode::Open)?;
    assert_eq!(revision + 2, db.revision());

    assert_eq!(1, db.doc_count());
    assert_eq!(db.get_document(1)?, *b"survivor");
    assert_eq!(1, db.term_freq(b"keep")?);

    // And the database keeps working normally afterwards
    let mut doc = Document::new();
    doc.add_posting("more", 1);
    db.add_document(&doc)?;
    db.commit()?;
    assert_eq!(2, db.doc_count());

    Ok(())
}

#[test]
fn reopen_writable_after_clean_shutdown() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;
        let mut doc = Document::new();
        doc.add_posting("persisted", 1);
        db.add_document(&doc)?;
        db.commit()?;
    }

    let db = Config::new(&folder).open_writable(OpenMode::CreateOrOpen)?;
    assert_eq!(1, db.doc_count());
    assert_eq!(1, db.term_freq(b"persisted")?);

    Ok(())
}

#[test]
fn uncommitted_changes_are_lost_on_drop() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;
        let mut doc = Document::new();
        doc.add_posting("committed", 1);
        db.add_document(&doc)?;
        db.commit()?;

        let mut doc = Document::new();
        doc.add_posting("dropped", 1);
        db.add_document(&doc)?;
        // no commit
    }

    let db = Config::new(&folder).open()?;
    assert_eq!(1, db.doc_count());
    assert!(db.term_exists(b"committed")?);
    assert!(!db.term_exists(b"dropped")?);

    Ok(())
}

#[test]
fn create_or_overwrite_discards_previous_database() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;
        let mut doc = Document::new();
        doc.add_posting("old", 1);
        db.add_document(&doc)?;
        db.commit()?;
    }

    let db = Config::new(&folder).open_writable(OpenMode::CreateOrOverwrite)?;
    assert_eq!(0, db.doc_count());
    assert!(!db.term_exists(b"old")?);

    Ok(())
}
