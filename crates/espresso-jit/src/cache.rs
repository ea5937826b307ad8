//! Shared code cache.
//!
//! All guest threads translate into and execute from one cache. Lookups and
//! insertions are guarded by a single mutex; translation itself happens
//! outside the lock, so two threads may independently translate the same
//! untranslated address. The collision policy is first-writer-wins-whole:
//! the block already present keeps its complete `targets` table and the
//! redundant block is discarded. Tables are never merged, so a
//! partially-overwritten table is not observable.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::block::{CodePtr, JitBlock};

pub struct CodeCache {
    blocks: Mutex<BTreeMap<u32, Arc<JitBlock>>>,
}

impl CodeCache {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Block keyed exactly by `start`, if translated.
    pub fn block_at(&self, start: u32) -> Option<Arc<JitBlock>> {
        self.blocks.lock().unwrap().get(&start).cloned()
    }

    /// Install a freshly translated block.
    ///
    /// Returns the winning block and whether `block` was the winner. A loser
    /// is dropped whole; its code stays in the executable buffer (dead, but
    /// code regions live for the process lifetime anyway).
    pub fn insert(&self, block: JitBlock) -> (Arc<JitBlock>, bool) {
        let mut blocks = self.blocks.lock().unwrap();
        match blocks.entry(block.start) {
            std::collections::btree_map::Entry::Occupied(existing) => {
                tracing::debug!(start = format_args!("{:#010x}", block.start),
                    "discarding redundant translation");
                (existing.get().clone(), false)
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                let arc = Arc::new(block);
                slot.insert(arc.clone());
                (arc, true)
            }
        }
    }

    /// Compiled entry for `address`, consulting per-block target tables so
    /// mid-block entries resolve without retranslation.
    pub fn lookup(&self, address: u32) -> Option<CodePtr> {
        let blocks = self.blocks.lock().unwrap();
        // Blocks can overlap (a later request may start mid-span of an
        // earlier block), so walk every block starting at or below the
        // address rather than only the nearest one.
        for (_, block) in blocks.range(..=address).rev() {
            if !block.contains(address) {
                continue;
            }
            if let Some(entry) = block.entry_for(address) {
                return Some(entry);
            }
        }
        None
    }

    /// External invalidation hook: drop the block keyed by `start`.
    pub fn invalidate(&self, start: u32) -> Option<Arc<JitBlock>> {
        self.blocks.lock().unwrap().remove(&start)
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}
