//! Depth-first persistence of cell graphs.
//!
//! Both store backends drive the same algorithm through [`Backend`]. The
//! traversal keeps its own stack, so graph depth is bounded by memory, not by
//! the thread's call stack.

use std::sync::Arc;

use etch_core::{EtchError, Record};
use etch_types::{Flags, Hash, Status};
use tracing::trace;

use crate::cell::Cell;
use crate::error::{StoreError, StoreResult};
use crate::reference::Ref;

/// Called with the stored reference the first time a hash is written.
pub type Novelty<'a, C> = &'a dyn Fn(&Ref<C>);

/// Outcome of writing one record.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Written {
    /// Flags held by the store after merging.
    pub flags: Flags,
    /// The hash was not present before.
    pub created: bool,
}

/// Raw record access for one store.
pub(crate) trait Backend<C: Cell> {
    /// Stored flags for `hash`, if present.
    fn lookup(&self, hash: &Hash) -> StoreResult<Option<Flags>>;

    fn load(&self, hash: &Hash) -> StoreResult<Option<Record>>;

    fn put(&self, hash: &Hash, record: &Record) -> StoreResult<Written>;

    /// Whether a reference's own status may short-circuit a store lookup.
    fn trusts_ref_flags(&self) -> bool {
        true
    }

    /// Note a reference whose flags now match the store.
    fn remember(&self, _r: &Ref<C>) {}
}

/// Load and decode the cell stored under `hash`, verifying its content.
pub(crate) fn resolve<C, B>(backend: &B, hash: &Hash) -> StoreResult<Option<Ref<C>>>
where
    C: Cell,
    B: Backend<C> + ?Sized,
{
    let Some(record) = backend.load(hash)? else {
        return Ok(None);
    };
    let computed = Hash::digest(&record.payload);
    if computed != *hash {
        return Err(StoreError::HashMismatch {
            expected: *hash,
            computed,
        });
    }
    let cell = C::decode(&record.payload)?;
    Ok(Some(Ref::Direct {
        cell: Arc::new(cell),
        hash: *hash,
        flags: record.flags,
    }))
}

enum Frame<C> {
    Visit {
        r: Ref<C>,
        top_level: bool,
    },
    /// Runs once the results for `children` are on the done stack.
    Finish {
        cell: Arc<C>,
        hash: Hash,
        flags: Flags,
        children: Vec<Ref<C>>,
        store: bool,
    },
}

/// Bring `root` up to `required` status in `backend`.
///
/// Returns the reference with its flags updated and, where children were
/// persisted, with its cell rebuilt over the updated child references.
/// Embedded cells are only stored on their own when `top_level` is set.
pub(crate) fn store_ref<C, B>(
    backend: &B,
    root: &Ref<C>,
    required: Status,
    novelty: Option<Novelty<'_, C>>,
    top_level: bool,
) -> StoreResult<Ref<C>>
where
    C: Cell,
    B: Backend<C> + ?Sized,
{
    let mut stack = vec![Frame::Visit {
        r: root.clone(),
        top_level,
    }];
    let mut done: Vec<Ref<C>> = Vec::new();

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Visit { r, top_level } => {
                let result = visit(backend, r, required, top_level, novelty, &mut stack)?;
                if let Some(result) = result {
                    done.push(result);
                }
            }
            Frame::Finish {
                cell,
                hash,
                flags,
                children,
                store,
            } => {
                let updated = done.split_off(done.len() - children.len());
                let changed = children
                    .iter()
                    .zip(&updated)
                    .any(|(before, after)| !before.same_as(after));
                let cell = if changed {
                    Arc::new(cell.with_child_refs(updated))
                } else {
                    cell
                };
                let result = if store {
                    write(backend, cell, hash, flags, required, novelty)?
                } else {
                    raise(cell, hash, flags, required)
                };
                done.push(result);
            }
        }
    }

    done.pop()
        .ok_or_else(|| EtchError::Invariant("persistence produced no result".into()).into())
}

fn visit<C, B>(
    backend: &B,
    r: Ref<C>,
    required: Status,
    top_level: bool,
    novelty: Option<Novelty<'_, C>>,
    stack: &mut Vec<Frame<C>>,
) -> StoreResult<Option<Ref<C>>>
where
    C: Cell,
    B: Backend<C> + ?Sized,
{
    if r.is_null() {
        return Ok(Some(r));
    }
    let hash = r.hash();
    let trusted = backend.trusts_ref_flags();
    if trusted && r.status() >= required {
        return Ok(Some(r));
    }

    // Untrusted flags keep only their marker bits.
    let mut flags = if trusted {
        r.flags()
    } else {
        r.flags().set_status(Status::Unknown)
    };
    let embedded = !top_level && r.is_embedded();

    if !embedded {
        if let Some(stored) = backend.lookup(&hash)? {
            flags = flags.merge(stored);
            if stored.status() >= required {
                let r = r.with_flags(flags);
                backend.remember(&r);
                return Ok(Some(r));
            }
        }
    }

    let cell = match r.cell() {
        Some(cell) => Arc::clone(cell),
        None if embedded => {
            return Ok(Some(r.with_flags(flags.merge(Flags::with_status(required)))));
        }
        None => match resolve::<C, B>(backend, &hash)? {
            Some(Ref::Direct { cell, .. }) => cell,
            _ => return Err(StoreError::MissingData(hash)),
        },
    };

    let children = if required.requires_children() {
        cell.child_refs()
    } else {
        Vec::new()
    };
    if children.is_empty() {
        let result = if embedded {
            raise(cell, hash, flags, required)
        } else {
            write(backend, cell, hash, flags, required, novelty)?
        };
        return Ok(Some(result));
    }

    trace!(hash = %hash.short_hex(), children = children.len(), "persisting children");
    let visits: Vec<_> = children
        .iter()
        .rev()
        .map(|child| Frame::Visit {
            r: child.clone(),
            top_level: false,
        })
        .collect();
    stack.push(Frame::Finish {
        cell,
        hash,
        flags,
        children,
        store: !embedded,
    });
    stack.extend(visits);
    Ok(None)
}

/// An embedded cell's status lives only in the reference.
fn raise<C>(cell: Arc<C>, hash: Hash, flags: Flags, required: Status) -> Ref<C> {
    Ref::Direct {
        cell,
        hash,
        flags: flags.merge(Flags::with_status(required)),
    }
}

fn write<C, B>(
    backend: &B,
    cell: Arc<C>,
    hash: Hash,
    flags: Flags,
    required: Status,
    novelty: Option<Novelty<'_, C>>,
) -> StoreResult<Ref<C>>
where
    C: Cell,
    B: Backend<C> + ?Sized,
{
    let marker = if cell.is_embedded() {
        Flags::EMBEDDED
    } else {
        Flags::NON_EMBEDDED
    };
    let flags = flags.merge(Flags::with_status(required)).insert(marker);
    let record = Record::new(flags, cell.memory_size(), cell.encode()?);
    let written = backend.put(&hash, &record)?;

    let r = Ref::Direct {
        cell,
        hash,
        flags: written.flags,
    };
    backend.remember(&r);
    if written.created {
        if let Some(callback) = novelty {
            callback(&r);
        }
    }
    Ok(r)
}
