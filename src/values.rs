// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-document value slots.
//!
//! A document's values are one tag: a sorted sequence of
//! `(slot, length-prefixed bytes)` pairs. Per-slot statistics (frequency and
//! bounds) live in the same table under reserved keys starting with a NUL
//! byte, which no docid key can start with.

use crate::pack::{docid_key, pack_string, pack_uint32, Unpacker};
use crate::table::Table;
use crate::{DocId, Error, Slice, Slot};
use std::collections::BTreeMap;

/// Statistics of one value slot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ValueStats {
    /// Number of documents with a value in the slot
    pub freq: u32,

    /// Smallest value currently stored in the slot
    pub lower_bound: Slice,

    /// Largest value currently stored in the slot
    pub upper_bound: Slice,
}

/// Sorted per-document value lists plus per-slot statistics.
pub struct ValueTable {
    pub(crate) store: Table,
}

impl ValueTable {
    pub(crate) fn new(store: Table) -> Self {
        Self { store }
    }

    fn stats_key(slot: Slot) -> Vec<u8> {
        let mut key = vec![0, b'S'];
        pack_uint32(&mut key, slot);
        key
    }

    fn decode_entries(tag: &Slice) -> crate::Result<BTreeMap<Slot, Slice>> {
        let mut entries = BTreeMap::new();
        let mut unpacker = Unpacker::new(tag);

        while !unpacker.is_empty() {
            let slot = unpacker.uint32().map_err(|e| {
                e.into_error(
                    "incomplete item in value table",
                    "value slot number too large",
                )
            })?;
            let value = unpacker.string().map_err(|e| {
                e.into_error("incomplete item in value table", "value too large")
            })?;
            entries.insert(slot, value.into());
        }

        Ok(entries)
    }

    fn encode_entries(entries: &BTreeMap<Slot, Slice>) -> Vec<u8> {
        let mut tag = Vec::new();
        for (slot, value) in entries {
            pack_uint32(&mut tag, *slot);
            pack_string(&mut tag, value);
        }
        tag
    }

    fn doc_entries(&self, did: DocId) -> crate::Result<BTreeMap<Slot, Slice>> {
        match self.store.get_exact_entry(&docid_key(did)?)? {
            Some(tag) => Self::decode_entries(&tag),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Sets one value of a document, replacing any prior value in the slot.
    pub fn add_value(&self, did: DocId, slot: Slot, value: Slice) -> crate::Result<()> {
        let mut entries = self.doc_entries(did)?;
        let old = entries.insert(slot, value.clone());

        let tag = Self::encode_entries(&entries);
        self.store
            .set_entry(docid_key(did)?.into(), Some(tag.into()))?;

        match old {
            Some(old) if old == value => {}
            Some(old) => self.stats_replace(slot, &old, &value)?,
            None => self.stats_add(slot, &value)?,
        }

        Ok(())
    }

    /// Fetches one value of a document.
    pub fn get_value(&self, did: DocId, slot: Slot) -> crate::Result<Option<Slice>> {
        Ok(self.doc_entries(did)?.remove(&slot))
    }

    /// Fetches all values of a document, ascending by slot.
    pub fn get_all_values(&self, did: DocId) -> crate::Result<Vec<(Slot, Slice)>> {
        Ok(self.doc_entries(did)?.into_iter().collect())
    }

    /// Removes every value of a document.
    pub fn delete_all_values(&self, did: DocId) -> crate::Result<()> {
        let entries = self.doc_entries(did)?;
        if entries.is_empty() {
            return Ok(());
        }

        self.store.set_entry(docid_key(did)?.into(), None)?;

        for (slot, value) in &entries {
            self.stats_remove(*slot, value)?;
        }

        Ok(())
    }

    /// Reads the statistics of a slot (all-zero when the slot is unused).
    pub fn stats(&self, slot: Slot) -> crate::Result<ValueStats> {
        let Some(tag) = self.store.get_exact_entry(&Self::stats_key(slot))? else {
            return Ok(ValueStats::default());
        };

        let mut unpacker = Unpacker::new(&tag);
        let freq = unpacker.uint32().map_err(|e| {
            e.into_error("value statistics truncated", "value frequency too large")
        })?;
        let lower_bound: Slice = unpacker
            .string()
            .map_err(|e| e.into_error("value statistics truncated", "value bound too large"))?
            .into();
        let upper_bound: Slice = unpacker
            .string()
            .map_err(|e| e.into_error("value statistics truncated", "value bound too large"))?
            .into();

        Ok(ValueStats {
            freq,
            lower_bound,
            upper_bound,
        })
    }

    fn write_stats(&self, slot: Slot, stats: &ValueStats) -> crate::Result<()> {
        let key = Self::stats_key(slot);

        if stats.freq == 0 {
            return self.store.set_entry(key.into(), None);
        }

        let mut tag = Vec::new();
        pack_uint32(&mut tag, stats.freq);
        pack_string(&mut tag, &stats.lower_bound);
        pack_string(&mut tag, &stats.upper_bound);

        self.store.set_entry(key.into(), Some(tag.into()))
    }

    fn stats_add(&self, slot: Slot, value: &Slice) -> crate::Result<()> {
        let mut stats = self.stats(slot)?;

        if stats.freq == 0 {
            stats.lower_bound = value.clone();
            stats.upper_bound = value.clone();
        } else {
            if *value < stats.lower_bound {
                stats.lower_bound = value.clone();
            }
            if *value > stats.upper_bound {
                stats.upper_bound = value.clone();
            }
        }
        stats.freq += 1;

        self.write_stats(slot, &stats)
    }

    /// A document swapped one value for another; the frequency is
    /// unchanged but the bounds may move.
    fn stats_replace(&self, slot: Slot, old: &Slice, new: &Slice) -> crate::Result<()> {
        let mut stats = self.stats(slot)?;

        if *old == stats.lower_bound || *old == stats.upper_bound {
            // The rescan sees the already-updated document, so it yields
            // both the exact bounds and the unchanged frequency
            return self.rescan_slot(slot);
        }

        if *new < stats.lower_bound {
            stats.lower_bound = new.clone();
        }
        if *new > stats.upper_bound {
            stats.upper_bound = new.clone();
        }

        self.write_stats(slot, &stats)
    }

    fn stats_remove(&self, slot: Slot, value: &Slice) -> crate::Result<()> {
        let mut stats = self.stats(slot)?;

        stats.freq = stats
            .freq
            .checked_sub(1)
            .ok_or(Error::Corrupt("value statistics frequency underflow"))?;

        if stats.freq == 0 {
            stats.lower_bound = Slice::empty();
            stats.upper_bound = Slice::empty();
            return self.write_stats(slot, &stats);
        }

        // Removing a bound-holding value requires a rescan to retighten
        if *value == stats.lower_bound || *value == stats.upper_bound {
            return self.rescan_slot(slot);
        }

        self.write_stats(slot, &stats)
    }

    /// Recomputes a slot's statistics by walking every document's values.
    fn rescan_slot(&self, slot: Slot) -> crate::Result<()> {
        let mut stats = ValueStats::default();

        {
            let mut cursor = self.store.cursor();
            // Docid keys start with their width byte (>= 1), so seeking to
            // [1] skips all reserved statistics keys
            cursor.find_entry(&[1])?;

            while cursor.next()? {
                let tag = cursor.read_tag()?;
                let entries = Self::decode_entries(&tag)?;

                if let Some(value) = entries.get(&slot) {
                    if stats.freq == 0 {
                        stats.lower_bound = value.clone();
                        stats.upper_bound = value.clone();
                    } else {
                        if *value < stats.lower_bound {
                            stats.lower_bound = value.clone();
                        }
                        if *value > stats.upper_bound {
                            stats.upper_bound = value.clone();
                        }
                    }
                    stats.freq += 1;
                }
            }
        }

        self.write_stats(slot, &stats)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::btree::MIN_BLOCK_SIZE;
    use test_log::test;

    fn open_table(dir: &std::path::Path) -> crate::Result<ValueTable> {
        Table::create(dir, "value", MIN_BLOCK_SIZE)?;
        Ok(ValueTable::new(Table::open(dir, "value", true, None)?))
    }

    #[test]
    fn values_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        table.add_value(1, 0, b"zero".into())?;
        table.add_value(1, 7, b"seven".into())?;
        table.add_value(1, 3, b"three".into())?;

        assert_eq!(Some(b"three".into()), table.get_value(1, 3)?);
        assert_eq!(None, table.get_value(1, 4)?);
        assert_eq!(None, table.get_value(2, 3)?);

        assert_eq!(
            vec![
                (0, Slice::from(b"zero")),
                (3, Slice::from(b"three")),
                (7, Slice::from(b"seven")),
            ],
            table.get_all_values(1)?,
        );

        table.delete_all_values(1)?;
        assert!(table.get_all_values(1)?.is_empty());

        Ok(())
    }

    #[test]
    fn value_stats_track_bounds() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        table.add_value(1, 5, b"m".into())?;
        table.add_value(2, 5, b"a".into())?;
        table.add_value(3, 5, b"z".into())?;

        let stats = table.stats(5)?;
        assert_eq!(3, stats.freq);
        assert_eq!(stats.lower_bound, *b"a");
        assert_eq!(stats.upper_bound, *b"z");

        // Deleting the upper-bound holder retightens the bounds
        table.delete_all_values(3)?;
        let stats = table.stats(5)?;
        assert_eq!(2, stats.freq);
        assert_eq!(stats.lower_bound, *b"a");
        assert_eq!(stats.upper_bound, *b"m");

        table.delete_all_values(2)?;
        table.delete_all_values(1)?;
        let stats = table.stats(5)?;
        assert_eq!(0, stats.freq);
        assert_eq!(stats.lower_bound, Slice::empty());
        assert_eq!(stats.upper_bound, Slice::empty());

        Ok(())
    }

    #[test]
    fn value_replace_updates_stats() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        table.add_value(1, 0, b"middle".into())?;
        table.add_value(1, 0, b"aaaa".into())?;

        let stats = table.stats(0)?;
        assert_eq!(1, stats.freq);
        assert_eq!(stats.lower_bound, *b"aaaa");
        assert_eq!(stats.upper_bound, *b"aaaa");

        Ok(())
    }

    #[test]
    fn value_stats_unused_slot() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = open_table(dir.path())?;

        assert_eq!(ValueStats::default(), table.stats(99)?);

        Ok(())
    }
}
