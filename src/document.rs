// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Slice, Slot, TermPos};
use std::collections::BTreeMap;

/// One term of a document under construction.
#[derive(Clone, Debug, Default)]
pub(crate) struct TermData {
    pub wdf: u32,
    pub positions: Vec<TermPos>,
}

/// A document to be indexed: opaque data, terms with within-document
/// frequencies and optional positions, and value slots.
///
/// Terms are kept sorted, which is what the termlist writer demands.
#[derive(Clone, Debug, Default)]
pub struct Document {
    pub(crate) data: Slice,
    pub(crate) terms: BTreeMap<Slice, TermData>,
    pub(crate) values: BTreeMap<Slot, Slice>,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the opaque document data.
    pub fn set_data<D: Into<Slice>>(&mut self, data: D) -> &mut Self {
        self.data = data.into();
        self
    }

    /// The opaque document data.
    #[must_use]
    pub fn data(&self) -> &Slice {
        &self.data
    }

    /// Adds a term occurrence without positional information, increasing
    /// its wdf by `wdf_increment`.
    pub fn add_term<T: Into<Slice>>(&mut self, term: T, wdf_increment: u32) -> &mut Self {
        let entry = self.terms.entry(term.into()).or_default();
        entry.wdf += wdf_increment;
        self
    }

    /// Adds a term occurrence at `position` (wdf increases by one).
    pub fn add_posting<T: Into<Slice>>(&mut self, term: T, position: TermPos) -> &mut Self {
        let entry = self.terms.entry(term.into()).or_default();
        entry.wdf += 1;

        if let Err(at) = entry.positions.binary_search(&position) {
            entry.positions.insert(at, position);
        }
        self
    }

    /// Sets a value slot.
    pub fn add_value<V: Into<Slice>>(&mut self, slot: Slot, value: V) -> &mut Self {
        self.values.insert(slot, value.into());
        self
    }

    /// Number of distinct terms.
    #[must_use]
    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// Sum of all wdfs, which becomes the document's length.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.terms.values().map(|t| u64::from(t.wdf)).sum()
    }
}
