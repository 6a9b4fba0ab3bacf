// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Physical-to-Machine (P2M) Table
//!
//! Maps every guest frame number to the machine frame backing it.
//!
//! # Design
//!
//! The table starts life as the flat frame list handed over by the domain
//! builder ([`P2m::from_seed`]). Once the allocator is up, [`P2m::relocate`]
//! moves it into a three-level sparse tree and drops the flat array:
//!
//! ```text
//! pfn = [ top index | mid index (9 bits) | leaf index (9 bits) ]
//! ```
//!
//! Mid and leaf pages are only allocated when a valid MFN is stored below
//! them, so large holes cost nothing and read back as [`Mfn::INVALID`].
//!
//! The reverse direction is answered from a machine-to-phys hint that is
//! validated against the forward table on every lookup: an MFN that has since
//! been given back or exchanged yields [`Pfn::INVALID`], never a stale PFN.
//!
//! # Usage
//!
//! ```ignore
//! let p2m = P2m::from_seed(&seed, max_pfn);
//! p2m.relocate();
//! let mfn = p2m.pfn_to_mfn(Pfn(100));
//! ```

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::RwLock;

use crate::kernel::vm::layout::{Mfn, Pfn, ENTRIES_PER_TABLE};
use crate::{log_debug, log_info};

const LOCAL_TRACE: bool = false;

/// Frames covered by one leaf page
const P2M_PER_LEAF: u64 = ENTRIES_PER_TABLE as u64;

/// Frames covered by one mid page
const P2M_PER_MID: u64 = P2M_PER_LEAF * ENTRIES_PER_TABLE as u64;

type Leaf = [u64; ENTRIES_PER_TABLE];
type Mid = [Option<Box<Leaf>>; ENTRIES_PER_TABLE];

enum Storage {
    /// Boot-time flat list, indexed by PFN
    Flat(Vec<u64>),

    /// Runtime sparse tree
    Tree(Vec<Option<Box<Mid>>>),
}

struct Inner {
    max_pfn: u64,
    storage: Storage,
    m2p: BTreeMap<u64, u64>,
}

/// Process-wide PFN to MFN table
pub struct P2m {
    inner: RwLock<Inner>,
}

#[inline]
const fn split(pfn: u64) -> (usize, usize, usize) {
    (
        (pfn / P2M_PER_MID) as usize,
        ((pfn / P2M_PER_LEAF) % ENTRIES_PER_TABLE as u64) as usize,
        (pfn % P2M_PER_LEAF) as usize,
    )
}

fn empty_tree(max_pfn: u64) -> Vec<Option<Box<Mid>>> {
    let tops = ((max_pfn + P2M_PER_MID - 1) / P2M_PER_MID) as usize;
    let mut top = Vec::with_capacity(tops);
    top.resize_with(tops, || None);
    top
}

impl Inner {
    fn lookup(&self, pfn: u64) -> u64 {
        if pfn >= self.max_pfn {
            return Mfn::INVALID.0;
        }

        match &self.storage {
            Storage::Flat(list) => list.get(pfn as usize).copied().unwrap_or(Mfn::INVALID.0),
            Storage::Tree(top) => {
                let (t, m, l) = split(pfn);
                top.get(t)
                    .and_then(|mid| mid.as_ref())
                    .and_then(|mid| mid[m].as_ref())
                    .map(|leaf| leaf[l])
                    .unwrap_or(Mfn::INVALID.0)
            }
        }
    }

    fn store(&mut self, pfn: u64, val: u64) {
        match &mut self.storage {
            Storage::Flat(list) => {
                let idx = pfn as usize;
                if idx >= list.len() {
                    if val == Mfn::INVALID.0 {
                        return;
                    }
                    list.resize(idx + 1, Mfn::INVALID.0);
                }
                list[idx] = val;
            }
            Storage::Tree(top) => {
                let (t, m, l) = split(pfn);
                let mid_slot = &mut top[t];

                // Holes stay holes
                if val == Mfn::INVALID.0 {
                    if let Some(leaf) = mid_slot.as_mut().and_then(|mid| mid[m].as_mut()) {
                        leaf[l] = val;
                    }
                    return;
                }

                let mid = mid_slot.get_or_insert_with(|| Box::new(core::array::from_fn(|_| None)));
                let leaf = mid[m].get_or_insert_with(|| Box::new([Mfn::INVALID.0; ENTRIES_PER_TABLE]));
                leaf[l] = val;
            }
        }
    }
}

impl P2m {
    /// Create an empty table covering `max_pfn` frames
    pub fn new(max_pfn: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                max_pfn,
                storage: Storage::Tree(empty_tree(max_pfn)),
                m2p: BTreeMap::new(),
            }),
        }
    }

    /// Build the boot-time table from the domain builder's frame list
    ///
    /// # Arguments
    ///
    /// * `seed` - MFN of each PFN, starting at PFN 0
    /// * `max_pfn` - Highest frame count the guest may ever address
    pub fn from_seed(seed: &[Mfn], max_pfn: u64) -> Self {
        let max_pfn = max_pfn.max(seed.len() as u64);
        let list: Vec<u64> = seed.iter().map(|mfn| mfn.0).collect();
        let mut m2p = BTreeMap::new();
        for (pfn, mfn) in seed.iter().enumerate() {
            if mfn.is_valid() && !mfn.is_identity() {
                m2p.insert(mfn.strip_markers().0, pfn as u64);
            }
        }

        log_info!("p2m: seeded {} frames, max_pfn {:#x}", seed.len(), max_pfn);

        Self {
            inner: RwLock::new(Inner {
                max_pfn,
                storage: Storage::Flat(list),
                m2p,
            }),
        }
    }

    /// Move the flat boot list into the sparse tree
    ///
    /// Returns the number of leaf pages populated. Calling it again once the
    /// tree is live does nothing.
    pub fn relocate(&self) -> usize {
        let mut inner = self.inner.write();
        let list = match &mut inner.storage {
            Storage::Flat(list) => core::mem::take(list),
            Storage::Tree(_) => return 0,
        };

        inner.storage = Storage::Tree(empty_tree(inner.max_pfn));
        for (pfn, &val) in list.iter().enumerate() {
            inner.store(pfn as u64, val);
        }
        drop(list);

        let leaves = Self::count_leaves(&inner);
        log_info!("p2m: relocated into {} leaf pages", leaves);
        leaves
    }

    fn count_leaves(inner: &Inner) -> usize {
        match &inner.storage {
            Storage::Flat(_) => 0,
            Storage::Tree(top) => top
                .iter()
                .flatten()
                .map(|mid| mid.iter().filter(|leaf| leaf.is_some()).count())
                .sum(),
        }
    }

    /// Number of leaf pages currently allocated
    pub fn populated_leaves(&self) -> usize {
        Self::count_leaves(&self.inner.read())
    }

    /// Check whether the table has left its boot-time flat form
    pub fn is_relocated(&self) -> bool {
        matches!(self.inner.read().storage, Storage::Tree(_))
    }

    /// Highest frame count this table can describe
    pub fn max_pfn(&self) -> u64 {
        self.inner.read().max_pfn
    }

    /// Raw stored value for `pfn`, marker bits included
    pub fn lookup_raw(&self, pfn: Pfn) -> Mfn {
        Mfn(self.inner.read().lookup(pfn.0))
    }

    /// Translate a guest frame to its machine frame
    ///
    /// Returns [`Mfn::INVALID`] for holes and out-of-range frames.
    pub fn pfn_to_mfn(&self, pfn: Pfn) -> Mfn {
        self.lookup_raw(pfn).strip_markers()
    }

    /// Translate a machine frame back to the guest frame that owns it
    ///
    /// Returns [`Pfn::INVALID`] if no guest frame currently maps to `mfn`.
    pub fn mfn_to_pfn(&self, mfn: Mfn) -> Pfn {
        if !mfn.is_valid() {
            return Pfn::INVALID;
        }

        let inner = self.inner.read();
        if let Some(&pfn) = inner.m2p.get(&mfn.0) {
            if Mfn(inner.lookup(pfn)).strip_markers() == mfn {
                return Pfn(pfn);
            }
        }

        // 1:1 regions are not tracked in the hint
        let raw = Mfn(inner.lookup(mfn.0));
        if raw.is_identity() && raw.strip_markers() == mfn {
            return Pfn(mfn.0);
        }

        Pfn::INVALID
    }

    /// Record that `pfn` is now backed by `mfn`
    ///
    /// Storing [`Mfn::INVALID`] punches a hole and never allocates.
    ///
    /// # Returns
    ///
    /// `false` if `pfn` lies outside the table.
    pub fn set_phys_to_machine(&self, pfn: Pfn, mfn: Mfn) -> bool {
        let mut inner = self.inner.write();
        if pfn.0 >= inner.max_pfn {
            return false;
        }

        let old = Mfn(inner.lookup(pfn.0)).strip_markers();
        if old.is_valid() && inner.m2p.get(&old.0) == Some(&pfn.0) {
            inner.m2p.remove(&old.0);
        }

        inner.store(pfn.0, mfn.0);
        if mfn.is_valid() && !mfn.is_identity() {
            inner.m2p.insert(mfn.strip_markers().0, pfn.0);
        }

        crate::log_trace_if!(LOCAL_TRACE, "p2m: {:?} -> {:?}", pfn, mfn);
        true
    }

    /// Mark `[start, end)` as 1:1 mapped
    ///
    /// Returns the number of frames marked.
    pub fn set_identity_range(&self, start: Pfn, end: Pfn) -> u64 {
        let mut marked = 0;
        let mut pfn = start;
        while pfn < end {
            if !self.set_phys_to_machine(pfn, Mfn::identity(pfn)) {
                break;
            }
            marked += 1;
            pfn = pfn.add(1);
        }

        log_debug!("p2m: identity {:?}..{:?} ({} frames)", start, end, marked);
        marked
    }
}
