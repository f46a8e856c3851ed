use mica::btree::{Btree, MIN_BLOCK_SIZE};
use mica::Error;
use test_log::test;

const KEYS: u32 = 200;

fn rewrite_all(tree: &mut Btree, revision: u32) -> mica::Result<()> {
    for i in 0..KEYS {
        let key = format!("key-{i:06}");
        let value = format!("value-{i}-r{revision}");
        tree.put(key.as_bytes(), value.as_bytes())?;
    }
    tree.commit(revision)
}

#[test]
fn reader_survives_one_commit_then_detects_overwrite() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;
    Btree::create(folder.path(), "test", MIN_BLOCK_SIZE)?;

    let mut writer = Btree::open(folder.path(), "test", true, None)?;
    rewrite_all(&mut writer, 1)?;

    // Open a snapshot at revision 1
    let reader = Btree::open(folder.path(), "test", false, Some(1))?;

    // One full rewrite: revision 1's base slot still exists, so its blocks
    // may not be reused and the reader keeps seeing its snapshot
    rewrite_all(&mut writer, 2)?;
    assert_eq!(Some(b"value-0-r1".into()), reader.get(b"key-000000")?);

    // Two more rewrites overwrite revision 1's base slot and recycle its
    // blocks; the reader must now be told its state is gone when it reads
    // a block it has not cached
    rewrite_all(&mut writer, 3)?;
    rewrite_all(&mut writer, 4)?;

    assert!(matches!(
        reader.get(b"key-000199"),
        Err(Error::Modified(_)),
    ));

    // Reopening at revision 1 fails cleanly: the revision is simply gone
    assert!(matches!(
        Btree::open(folder.path(), "test", false, Some(1)),
        Err(Error::RevisionNotFound(1)),
    ));

    Ok(())
}
