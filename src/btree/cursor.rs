// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::block::BlockView;
use super::Btree;
use crate::{Error, Slice};

#[derive(Copy, Clone, Debug)]
struct PathEntry {
    block: u32,
    idx: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    /// Initial state; also reached by misuse, never by iteration
    Unpositioned,

    /// On the reserved empty-key sentinel that sorts before every real key
    AtStart,

    /// On exactly one key/tag pair
    Positioned,

    /// Past the last entry (distinct from [`State::Unpositioned`])
    AfterEnd,
}

/// A positioned view into a B-tree at its open revision.
///
/// Holds one (block, offset) pair per tree level instead of pointers into
/// page buffers; any write to the table invalidates the cursor, which then
/// fails with [`Error::Modified`].
pub struct Cursor<'a> {
    tree: &'a Btree,
    generation: u64,
    path: Vec<PathEntry>,
    state: State,
    current_key: Slice,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(tree: &'a Btree) -> Self {
        Self {
            tree,
            generation: tree.generation(),
            path: Vec::new(),
            state: State::Unpositioned,
            current_key: Slice::empty(),
        }
    }

    fn check_valid(&self) -> crate::Result<()> {
        if self.generation != self.tree.generation() {
            return Err(Error::Modified(
                "cursor was invalidated by a write to the table",
            ));
        }
        Ok(())
    }

    /// Whether the cursor sits on a real entry.
    #[must_use]
    pub fn is_positioned(&self) -> bool {
        self.state == State::Positioned
    }

    /// Whether the cursor has run off the end of the table.
    #[must_use]
    pub fn after_end(&self) -> bool {
        self.state == State::AfterEnd
    }

    /// Key the cursor is on (empty for the sentinel).
    #[must_use]
    pub fn key(&self) -> &Slice {
        &self.current_key
    }

    /// Positions the cursor on `key`, or on the greatest key before it.
    ///
    /// Returns `true` on an exact match. Afterwards the cursor is always
    /// positioned: on `key`, on its predecessor, or on the empty sentinel if
    /// nothing sorts before `key`.
    pub fn find(&mut self, key: &[u8]) -> crate::Result<bool> {
        self.check_valid()?;
        self.path.clear();

        let mut n = self.tree.committed_root();

        loop {
            let block = self.tree.read_block(n)?;
            let view = BlockView::new(&block, self.tree.block_size())?;

            if view.level() > 0 {
                let idx = view.search_child(key);
                self.path.push(PathEntry { block: n, idx });
                n = view.child_at(idx);
                continue;
            }

            return match view.search_leaf(key) {
                Ok(i) => {
                    self.path.push(PathEntry { block: n, idx: i });
                    self.state = State::Positioned;
                    self.current_key = Slice::from(view.key_at(i));
                    Ok(true)
                }
                Err(i) if i > 0 => {
                    self.path.push(PathEntry { block: n, idx: i - 1 });
                    self.state = State::Positioned;
                    self.current_key = Slice::from(view.key_at(i - 1));
                    Ok(false)
                }
                Err(_) => {
                    // Predecessor lives in an earlier leaf (or nowhere)
                    if self.move_prev(None)? {
                        self.state = State::Positioned;
                    } else {
                        self.state = State::AtStart;
                        self.current_key = Slice::empty();
                    }
                    Ok(false)
                }
            };
        }
    }

    /// Advances to the next key; returns `false` (and transitions to
    /// after-end) when none is left.
    pub fn next(&mut self) -> crate::Result<bool> {
        self.check_valid()?;

        let moved = match self.state {
            State::Positioned => self.move_next(None)?,
            State::AtStart => {
                self.path.clear();
                self.move_next(Some(self.tree.committed_root()))?
            }
            State::Unpositioned | State::AfterEnd => return Ok(false),
        };

        if moved {
            self.state = State::Positioned;
        } else {
            self.state = State::AfterEnd;
            self.current_key = Slice::empty();
        }
        Ok(moved)
    }

    /// Moves to the previous key; lands on the empty sentinel (and returns
    /// `false`) when none is left.
    pub fn prev(&mut self) -> crate::Result<bool> {
        self.check_valid()?;

        let moved = match self.state {
            State::Positioned => self.move_prev(None)?,
            State::AfterEnd => {
                self.path.clear();
                self.move_prev(Some(self.tree.committed_root()))?
            }
            State::AtStart | State::Unpositioned => return Ok(false),
        };

        if moved {
            self.state = State::Positioned;
        } else {
            self.state = State::AtStart;
            self.current_key = Slice::empty();
        }
        Ok(moved)
    }

    /// Fetches the tag of the current entry.
    ///
    /// Tags are read lazily so key-only scans stay cheap.
    pub fn read_tag(&self) -> crate::Result<Slice> {
        self.check_valid()?;

        if self.state != State::Positioned {
            return Err(Error::InvalidArgument("cursor is not on an entry"));
        }

        let top = *self
            .path
            .last()
            .ok_or(Error::Corrupt("positioned cursor has no path"))?;

        let block = self.tree.read_block(top.block)?;
        let view = BlockView::new(&block, self.tree.block_size())?;
        self.tree.materialize_tag(&block, view.leaf_tag_at(top.idx))
    }

    /// Steps forward: either into the leftmost item of subtree `pending`, or
    /// from the current path position. Empty leaves are skipped.
    fn move_next(&mut self, pending: Option<u32>) -> crate::Result<bool> {
        let mut pending = pending;

        loop {
            if let Some(mut n) = pending.take() {
                // Descend to the leftmost item of this subtree
                loop {
                    let block = self.tree.read_block(n)?;
                    let view = BlockView::new(&block, self.tree.block_size())?;

                    if view.level() == 0 {
                        if view.count() > 0 {
                            self.path.push(PathEntry { block: n, idx: 0 });
                            self.current_key = Slice::from(view.key_at(0));
                            return Ok(true);
                        }
                        // Empty leaf: resume advancing through the ancestors
                        break;
                    }

                    self.path.push(PathEntry { block: n, idx: 0 });
                    n = view.child_at(0);
                }
                continue;
            }

            let Some(top) = self.path.last().copied() else {
                return Ok(false);
            };

            let block = self.tree.read_block(top.block)?;
            let view = BlockView::new(&block, self.tree.block_size())?;

            if top.idx + 1 < view.count() {
                if let Some(entry) = self.path.last_mut() {
                    entry.idx += 1;
                }

                if view.level() == 0 {
                    self.current_key = Slice::from(view.key_at(top.idx + 1));
                    return Ok(true);
                }
                pending = Some(view.child_at(top.idx + 1));
            } else {
                self.path.pop();
            }
        }
    }

    /// Mirror image of [`Cursor::move_next`].
    fn move_prev(&mut self, pending: Option<u32>) -> crate::Result<bool> {
        let mut pending = pending;

        loop {
            if let Some(mut n) = pending.take() {
                // Descend to the rightmost item of this subtree
                loop {
                    let block = self.tree.read_block(n)?;
                    let view = BlockView::new(&block, self.tree.block_size())?;
                    let count = view.count();

                    if view.level() == 0 {
                        if count > 0 {
                            self.path.push(PathEntry {
                                block: n,
                                idx: count - 1,
                            });
                            self.current_key = Slice::from(view.key_at(count - 1));
                            return Ok(true);
                        }
                        break;
                    }

                    self.path.push(PathEntry {
                        block: n,
                        idx: count - 1,
                    });
                    n = view.child_at(count - 1);
                }
                continue;
            }

            let Some(top) = self.path.last().copied() else {
                return Ok(false);
            };

            let block = self.tree.read_block(top.block)?;
            let view = BlockView::new(&block, self.tree.block_size())?;

            if top.idx > 0 {
                if let Some(entry) = self.path.last_mut() {
                    entry.idx -= 1;
                }

                if view.level() == 0 {
                    self.current_key = Slice::from(view.key_at(top.idx - 1));
                    return Ok(true);
                }
                pending = Some(view.child_at(top.idx - 1));
            } else {
                self.path.pop();
            }
        }
    }
}
