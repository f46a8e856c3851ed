use mica::{Config, Document, OpenMode};
use test_log::test;

#[test]
fn doclength_invariants_hold() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    let specs: &[&[(&str, u32)]] = &[
        &[("apple", 3), ("banana", 1)],
        &[("banana", 2)],
        &[("apple", 1), ("cherry", 5), ("date", 1)],
    ];

    for terms in specs {
        let mut doc = Document::new();
        for (term, wdf) in *terms {
            doc.add_term(*term, *wdf);
        }
        db.add_document(&doc)?;
    }
    db.commit()?;

    let reader = Config::new(&folder).open()?;

    // sum(wdf) over a document's termlist equals its stored length
    let mut length_sum = 0u64;
    for did in 1..=3 {
        let mut terms = reader.term_list(did)?;
        let mut wdf_sum = 0;
        while terms.next()? {
            wdf_sum += terms.wdf();
        }
        assert_eq!(terms.doc_length(), wdf_sum);
        length_sum += u64::from(wdf_sum);
    }

    // ... and the lengths sum to the stored total
    assert_eq!(length_sum, reader.total_length()?);

    Ok(())
}

#[test]
fn all_docs_iteration_with_lengths() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;
    for did in [2u32, 4, 8] {
        let mut doc = Document::new();
        doc.add_term("x", did);
        db.replace_document(did, &doc)?;
    }
    db.commit()?;

    let reader = Config::new(&folder).open()?;

    let mut docs = reader.all_docs()?;
    assert_eq!(3, docs.count());

    let mut got = Vec::new();
    loop {
        docs.next()?;
        if docs.at_end() {
            break;
        }
        got.push((docs.docid(), docs.doc_length()));
    }
    assert_eq!(vec![(2, 2), (4, 4), (8, 8)], got);

    let mut docs = reader.all_docs()?;
    docs.skip_to(3)?;
    assert_eq!(4, docs.docid());

    // Positional data is not meaningful here
    assert!(matches!(
        docs.positions(),
        Err(mica::Error::Unimplemented(_)),
    ));

    docs.skip_to(9)?;
    assert!(docs.at_end());

    Ok(())
}

#[test]
fn all_terms_iteration() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder).open_writable(OpenMode::Create)?;

    let mut doc = Document::new();
    doc.add_term("apple", 1);
    doc.add_term("apricot", 2);
    doc.add_term("banana", 1);
    db.add_document(&doc)?;

    let mut doc = Document::new();
    doc.add_term("apple", 1);
    doc.add_term("cherry", 3);
    db.add_document(&doc)?;

    db.commit()?;

    // Metadata must not leak into the term iteration
    db.set_metadata(b"style", b"fruity")?;
    db.commit()?;

    let mut terms = db.all_terms()?;
    let mut got = Vec::new();
    loop {
        terms.next()?;
        if terms.at_end() {
            break;
        }
        got.push((
            String::from_utf8_lossy(terms.term()).into_owned(),
            terms.termfreq()?,
            terms.collfreq()?,
        ));
    }

    assert_eq!(
        vec![
            ("apple".to_owned(), 2, 2),
            ("apricot".to_owned(), 1, 2),
            ("banana".to_owned(), 1, 1),
            ("cherry".to_owned(), 1, 3),
        ],
        got,
    );

    // Prefix-bounded iteration
    let mut terms = db.all_terms_with_prefix(b"ap")?;
    let mut got = Vec::new();
    loop {
        terms.next()?;
        if terms.at_end() {
            break;
        }
        got.push(terms.term().to_vec());
    }
    assert_eq!(vec![b"apple".to_vec(), b"apricot".to_vec()], got);

    // skip_to within the iteration
    let mut terms = db.all_terms()?;
    terms.skip_to(b"application")?;
    assert_eq!(b"apricot", terms.term());
    terms.skip_to(b"zzz")?;
    assert!(terms.at_end());

    Ok(())
}

#[test]
fn multi_chunk_term_appears_once_in_all_terms() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    let mut db = Config::new(&folder)
        .flush_threshold(100_000)
        .open_writable(OpenMode::Create)?;

    // Enough postings to split into several chunks
    for _ in 0..3_000 {
        let mut doc = Document::new();
        doc.add_term("big", 1);
        db.add_document(&doc)?;
    }
    db.commit()?;

    let mut terms = db.all_terms()?;
    let mut seen = 0;
    loop {
        terms.next()?;
        if terms.at_end() {
            break;
        }
        assert_eq!(b"big", terms.term());
        assert_eq!(3_000, terms.termfreq()?);
        seen += 1;
    }
    assert_eq!(1, seen);

    Ok(())
}
