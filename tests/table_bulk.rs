use mica::table::Table;
use rand::prelude::*;
use std::collections::BTreeMap;
use test_log::test;

#[test]
fn randomized_operations_match_a_model() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    Table::create(folder.path(), "test", 2_048)?;
    let mut table = Table::open(folder.path(), "test", true, None)?;

    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = rand::rng();
    let mut revision = 0;

    for round in 0..5 {
        for _ in 0..400 {
            let key = format!("key-{:04}", rng.random_range(0..500u32)).into_bytes();

            if rng.random_bool(0.25) {
                model.remove(&key);
                table.set_entry(key.into(), None)?;
            } else {
                let value = nanoid::nanoid!().into_bytes();
                model.insert(key.clone(), value.clone());
                table.set_entry(key.into(), Some(value.into()))?;
            }
        }

        revision += 1;
        table.apply(revision)?;

        assert_eq!(model.len() as u64, table.entry_count(), "round {round}");
    }

    // Reopen from disk and compare a full scan with the model
    let table = Table::open(folder.path(), "test", false, None)?;
    assert_eq!(model.len() as u64, table.entry_count());

    let mut cursor = table.cursor();
    cursor.find_entry(b"")?;

    let mut scanned = BTreeMap::new();
    let mut previous: Option<Vec<u8>> = None;
    while cursor.next()? {
        let key = cursor.current_key().to_vec();
        if let Some(previous) = &previous {
            assert!(*previous < key, "cursor keys must strictly increase");
        }
        scanned.insert(key.clone(), cursor.read_tag()?.to_vec());
        previous = Some(key);
    }

    assert_eq!(model, scanned);

    // Point lookups agree as well
    for (key, value) in model.iter().take(50) {
        assert_eq!(
            Some(value.as_slice()),
            table.get_exact_entry(key)?.as_deref(),
        );
    }

    Ok(())
}

#[test]
fn overlay_merge_with_disk_after_reopen() -> mica::Result<()> {
    let folder = tempfile::tempdir()?;

    Table::create(folder.path(), "test", 2_048)?;
    let mut table = Table::open(folder.path(), "test", true, None)?;

    for i in 0..100u32 {
        let key = format!("k{i:03}").into_bytes();
        table.set_entry(key.into(), Some(b"disk".into()))?;
    }
    table.apply(1)?;

    // Buffer deletions of the even keys and new odd-ish keys
    for i in (0..100u32).step_by(2) {
        let key = format!("k{i:03}").into_bytes();
        table.set_entry(key.into(), None)?;
    }
    table.set_entry(b"k0505".into(), Some(b"mem".into()))?;

    let mut cursor = table.cursor();
    cursor.find_entry(b"")?;

    let mut count = 0;
    let mut saw_inserted = false;
    while cursor.next()? {
        let key = cursor.current_key().to_vec();
        if key == b"k0505" {
            saw_inserted = true;
            assert_eq!(cursor.read_tag()?, *b"mem");
        } else {
            // Only odd keys survive
            let n: u32 = String::from_utf8_lossy(&key[1..]).parse().unwrap();
            assert_eq!(1, n % 2, "key {n} should have been deleted");
        }
        count += 1;
    }

    assert_eq!(51, count);
    assert!(saw_inserted);

    Ok(())
}
