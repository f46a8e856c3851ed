use mica::{Config, Document, Error, OpenMode};
use test_log::test;

fn simple_doc(term: &str) -> Document {
    let mut doc = Document::new();
    doc.add_term(term, 1);
    doc
}

#[test]
fn auto_flush_commits_at_threshold() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder)
        .flush_threshold(3)
        .open_writable(OpenMode::Create)?;

    db.add_document(&simple_doc("one"))?;
    db.add_document(&simple_doc("two"))?;

    // Nothing committed yet
    let reader = Config::new(&folder).open()?;
    assert_eq!(0, reader.doc_count());

    // The third document operation triggers the implicit commit
    db.add_document(&simple_doc("three"))?;

    let reader = Config::new(&folder).open()?;
    assert_eq!(3, reader.doc_count());

    Ok(())
}

#[test]
fn transaction_commit_and_cancel() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder)
        .flush_threshold(1)
        .open_writable(OpenMode::Create)?;

    // Transactions suppress the (here: immediate) auto-flush
    db.begin_transaction()?;
    db.add_document(&simple_doc("kept"))?;
    db.add_document(&simple_doc("kept2"))?;

    let reader = Config::new(&folder).open()?;
    assert_eq!(0, reader.doc_count());

    db.commit_transaction()?;

    let reader = Config::new(&folder).open()?;
    assert_eq!(2, reader.doc_count());

    // A cancelled transaction rolls back to its starting point
    db.begin_transaction()?;
    db.add_document(&simple_doc("discarded"))?;
    assert_eq!(3, db.doc_count());
    db.cancel_transaction()?;

    assert_eq!(2, db.doc_count());
    assert!(!db.term_exists(b"discarded")?);

    let reader = Config::new(&folder).open()?;
    assert_eq!(2, reader.doc_count());

    Ok(())
}

#[test]
fn transaction_misuse_errors() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    assert!(matches!(
        db.commit_transaction(),
        Err(Error::InvalidArgument(_)),
    ));
    assert!(matches!(
        db.cancel_transaction(),
        Err(Error::InvalidArgument(_)),
    ));

    db.begin_transaction()?;
    assert!(matches!(
        db.begin_transaction(),
        Err(Error::InvalidArgument(_)),
    ));

    // Plain commit is refused while a transaction is active
    assert!(matches!(db.commit(), Err(Error::InvalidArgument(_))));

    // Opening a posting list whose postings are buffered would force a
    // flush, which a transaction cannot allow
    db.add_document(&simple_doc("pending"))?;
    assert!(matches!(
        db.postings(b"pending"),
        Err(Error::Unimplemented(_)),
    ));

    db.commit_transaction()?;
    let mut postings = db.postings(b"pending")?;
    postings.next()?;
    assert_eq!(1, postings.docid());

    Ok(())
}
