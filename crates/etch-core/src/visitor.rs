//! Read-only traversal of the index tree, for audit and validation tooling.
//!
//! [`Etch::visit_index`] walks every index block breadth-first, starting at
//! the level-0 block, and hands each one to an [`IndexVisitor`].
//! [`IndexValidator`] is the stock visitor: it counts slots by type and
//! reports structural inconsistencies without failing on the first one.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::engine::Etch;
use crate::error::{EtchError, EtchResult};
use crate::format::{digit, index_size, Slot, SlotKind, INDEX_START};

/// One index block as seen by a visitor.
#[derive(Clone, Debug)]
pub struct IndexBlock {
    /// Radix level, 0 for the root block.
    pub level: usize,
    /// File offset of the block.
    pub offset: u64,
    /// Digits taken at each level above this block to reach it.
    pub prefix: Vec<usize>,
    pub slots: Vec<Slot>,
}

/// Callback invoked once per index block.
///
/// The engine's write lock is held for the whole traversal, so a visitor may
/// read records through the `Etch` handle but must not write.
pub trait IndexVisitor {
    fn visit(&mut self, etch: &Etch, block: &IndexBlock) -> EtchResult<()>;
}

impl Etch {
    /// Visit every index block reachable from the root, parents before
    /// children.
    pub fn visit_index<V: IndexVisitor + ?Sized>(&self, visitor: &mut V) -> EtchResult<()> {
        self.ensure_readable()?;
        let _guard = self.lock_writer();
        self.ensure_readable()?;

        let mut queue = VecDeque::new();
        queue.push_back((INDEX_START, 0usize, Vec::new()));

        while let Some((offset, level, prefix)) = queue.pop_front() {
            let block = IndexBlock {
                level,
                offset,
                slots: self.read_block(offset, level)?,
                prefix,
            };
            visitor.visit(self, &block)?;

            for (ix, slot) in block.slots.iter().enumerate() {
                if slot.is_empty() || slot.kind() != SlotKind::Index {
                    continue;
                }
                let child = slot.offset();
                // Children are always appended after their parent.
                if child <= offset {
                    return Err(EtchError::corruption(child, "child index precedes its parent"));
                }
                self.check_index_block(child, level + 1)?;
                let mut path = block.prefix.clone();
                path.push(ix);
                queue.push_back((child, level + 1, path));
            }
        }
        Ok(())
    }

    /// Walk the whole index with an [`IndexValidator`].
    pub fn validate(&self) -> EtchResult<ValidationReport> {
        let mut validator = IndexValidator::default();
        self.visit_index(&mut validator)?;
        Ok(validator.into_report())
    }
}

/// What is wrong with a slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueKind {
    /// A chain continuation not preceded by a head or another continuation.
    OrphanContinuation,
    /// A chain head not followed by a continuation.
    LoneChainHead,
    /// The record's key does not descend to this slot.
    DigitMismatch { level: usize, expected: usize },
    /// The slot points at something that is not a readable record.
    BadRecord(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub block: u64,
    pub level: usize,
    pub slot: usize,
    pub kind: IssueKind,
}

/// Summary produced by [`IndexValidator`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub blocks: usize,
    pub slots: usize,
    pub empty: usize,
    /// Plain, chain-head and chain-continuation slots.
    pub values: usize,
    pub index_pointers: usize,
    /// Deepest level holding an index block.
    pub max_depth: usize,
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Number of chain adjacency issues.
    pub fn chain_errors(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| {
                matches!(
                    i.kind,
                    IssueKind::OrphanContinuation | IssueKind::LoneChainHead
                )
            })
            .count()
    }
}

/// Counts slots and checks chain adjacency and key placement.
#[derive(Debug, Default)]
pub struct IndexValidator {
    report: ValidationReport,
}

impl IndexValidator {
    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn into_report(self) -> ValidationReport {
        self.report
    }

    fn issue(&mut self, block: &IndexBlock, slot: usize, kind: IssueKind) {
        self.report.issues.push(Issue {
            block: block.offset,
            level: block.level,
            slot,
            kind,
        });
    }

    /// Check that the record behind `slot` descends through `block.prefix`
    /// and lands on digit `home` at this level.
    fn check_placement(
        &mut self,
        etch: &Etch,
        block: &IndexBlock,
        ix: usize,
        slot: Slot,
        home: usize,
    ) {
        let key = match etch.record_header(slot.offset()) {
            Ok(head) => head.key,
            Err(e) => {
                self.issue(block, ix, IssueKind::BadRecord(e.to_string()));
                return;
            }
        };
        let path = block.prefix.iter().copied().chain(std::iter::once(home));
        for (level, expected) in path.enumerate() {
            if digit(&key, level) != expected {
                self.issue(block, ix, IssueKind::DigitMismatch { level, expected });
                return;
            }
        }
    }
}

impl IndexVisitor for IndexValidator {
    fn visit(&mut self, etch: &Etch, block: &IndexBlock) -> EtchResult<()> {
        let size = index_size(block.level);
        self.report.blocks += 1;
        self.report.max_depth = self.report.max_depth.max(block.level);

        let kind_at = |ix: usize| {
            let s = block.slots[ix % size];
            (!s.is_empty()).then(|| s.kind())
        };

        for (ix, &slot) in block.slots.iter().enumerate() {
            self.report.slots += 1;
            if slot.is_empty() {
                self.report.empty += 1;
                continue;
            }
            match slot.kind() {
                SlotKind::Index => self.report.index_pointers += 1,
                SlotKind::Plain => {
                    self.report.values += 1;
                    self.check_placement(etch, block, ix, slot, ix);
                }
                SlotKind::ChainHead => {
                    self.report.values += 1;
                    if kind_at(ix + 1) != Some(SlotKind::ChainContinuation) {
                        self.issue(block, ix, IssueKind::LoneChainHead);
                    }
                    self.check_placement(etch, block, ix, slot, ix);
                }
                SlotKind::ChainContinuation => {
                    self.report.values += 1;
                    // Walk back to the head this member belongs to.
                    let mut head = None;
                    for back in 1..size {
                        let at = (ix + size - back) % size;
                        match kind_at(at) {
                            Some(SlotKind::ChainContinuation) => continue,
                            Some(SlotKind::ChainHead) => head = Some(at),
                            _ => {}
                        }
                        break;
                    }
                    match head {
                        Some(home) => self.check_placement(etch, block, ix, slot, home),
                        None => self.issue(block, ix, IssueKind::OrphanContinuation),
                    }
                }
            }
        }
        Ok(())
    }
}
