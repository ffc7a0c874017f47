//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailstore.
//
// Mailstore is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailstore is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Mailstore. If not, see <http://www.gnu.org/licenses/>.

//! The block engine shared by header and body storage.
//!
//! A `BlockSet` owns the directory of blocks of one kind for a folder along
//! with whichever of those blocks are currently loaded. Everything here is
//! synchronous and operates only on resident blocks; loading is the folder
//! store's business.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;

use log::error;

use super::model::*;
use super::search::find_range_for_key;
use crate::support::store_config::BlockConfig;

/// An entry which can be stored in a block.
pub trait BlockEntry: Clone {
    const KIND: BlockKind;

    fn key(&self) -> SortKey;
    fn size_estimate(&self) -> u32;
    fn server_id(&self) -> Option<&str>;

    /// Insert `self` into `block` in sort order, returning its index.
    fn merge_into(self, block: &mut Block<Self>) -> usize {
        let key = self.key();
        let ix = block.entries.partition_point(|e| e.key() > key);
        block.entries.insert(ix, self);
        ix
    }
}

impl BlockEntry for HeaderInfo {
    const KIND: BlockKind = BlockKind::Header;

    fn key(&self) -> SortKey {
        HeaderInfo::key(self)
    }

    fn size_estimate(&self) -> u32 {
        HEADER_EST_SIZE_IN_BYTES
    }

    fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }
}

impl BlockEntry for BodyInfo {
    const KIND: BlockKind = BlockKind::Body;

    fn key(&self) -> SortKey {
        BodyInfo::key(self)
    }

    fn size_estimate(&self) -> u32 {
        self.size
    }

    fn server_id(&self) -> Option<&str> {
        None
    }
}

/// The block chosen to receive a new entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub block_id: BlockId,
    /// Whether the block was created by the placement, in which case it is
    /// already resident.
    pub created: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsertOutcome {
    /// The block which ended up holding the entry.
    pub block_id: BlockId,
    /// If the insertion caused a split, the id of the new, older, sibling.
    pub split: Option<BlockId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discard {
    /// No block contains the requested key.
    NoSuchBlock,
    NotResident,
    /// The block has unsaved changes and was kept.
    Dirty,
    Discarded,
}

/// Blocks to be written by the next save. `None` marks a block which no
/// longer exists.
pub type DirtyBlocks<E> = BTreeMap<BlockId, Option<Block<E>>>;

pub struct BlockSet<E> {
    kind: BlockKind,
    /// Newest first.
    infos: Vec<FolderBlockInfo>,
    cache: HashMap<BlockId, Block<E>>,
    /// Resident blocks in the order they were loaded.
    loaded: Vec<BlockId>,
    dirty: BTreeSet<BlockId>,
    dead: BTreeSet<BlockId>,
    next_block: u32,
}

impl<E: BlockEntry> BlockSet<E> {
    pub fn new(infos: Vec<FolderBlockInfo>, next_block: u32) -> Self {
        Self {
            kind: E::KIND,
            infos,
            cache: HashMap::new(),
            loaded: Vec::new(),
            dirty: BTreeSet::new(),
            dead: BTreeSet::new(),
            next_block,
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn infos(&self) -> &[FolderBlockInfo] {
        &self.infos
    }

    pub fn next_block(&self) -> u32 {
        self.next_block
    }

    pub fn total_count(&self) -> u64 {
        self.infos.iter().map(|i| u64::from(i.count)).sum()
    }

    pub fn find(&self, key: SortKey) -> (usize, Option<&FolderBlockInfo>) {
        find_range_for_key(&self.infos, key)
    }

    pub fn index_of(&self, block_id: BlockId) -> Option<usize> {
        self.infos.iter().position(|i| i.block_id == block_id)
    }

    pub fn info(&self, block_id: BlockId) -> Option<&FolderBlockInfo> {
        self.infos.iter().find(|i| i.block_id == block_id)
    }

    pub fn block(&self, block_id: BlockId) -> Option<&Block<E>> {
        self.cache.get(&block_id)
    }

    /// Get mutable access to a resident block, marking it dirty.
    ///
    /// The caller must not change the keys of any entries.
    pub fn modify(&mut self, block_id: BlockId) -> Option<&mut Block<E>> {
        let block = self.cache.get_mut(&block_id)?;
        self.dirty.insert(block_id);
        Some(block)
    }

    pub fn is_resident(&self, block_id: BlockId) -> bool {
        self.cache.contains_key(&block_id)
    }

    pub fn resident_count(&self) -> usize {
        self.cache.len()
    }

    /// Whether anything needs to be saved.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || !self.dead.is_empty()
    }

    /// Add a freshly loaded block to the cache.
    ///
    /// Returns false and does nothing if the block no longer exists.
    pub fn install(&mut self, block_id: BlockId, block: Block<E>) -> bool {
        if self.info(block_id).is_none() {
            return false;
        }

        if self.cache.insert(block_id, block).is_none() {
            self.loaded.push(block_id);
        }
        true
    }

    fn allocate(&mut self) -> BlockId {
        let block_id = BlockId(self.next_block);
        self.next_block += 1;
        block_id
    }

    /// Choose the block that should receive an entry with the given key and
    /// size.
    ///
    /// If no block contains `key`, the older neighbour is preferred if it has
    /// room, then the younger one. If neither has room, the younger one is
    /// used when the key is in the younger half of the folder or past its
    /// oldest end, and the older one otherwise. The first block of an empty
    /// set is created here.
    pub fn place(
        &mut self,
        key: SortKey,
        cost: u32,
        config: &BlockConfig,
    ) -> Placement {
        let (ix, found) = self.find(key);
        if let Some(info) = found {
            return Placement {
                block_id: info.block_id,
                created: false,
            };
        }

        if self.infos.is_empty() {
            let block_id = self.allocate();
            self.infos.push(FolderBlockInfo {
                block_id,
                start: key,
                end: key,
                count: 0,
                est_size: 0,
            });
            self.cache.insert(block_id, Block::default());
            self.loaded.push(block_id);
            self.dirty.insert(block_id);
            return Placement {
                block_id,
                created: true,
            };
        }

        let len = self.infos.len();
        let has_room = |info: &FolderBlockInfo| {
            info.est_size.saturating_add(cost) < config.max_block_size
        };

        let chosen = if ix < len && has_room(&self.infos[ix]) {
            ix
        } else if ix > 0 && has_room(&self.infos[ix - 1]) {
            ix - 1
        } else if (ix > 0 && 2 * ix < len) || ix == len {
            ix - 1
        } else {
            ix
        };

        Placement {
            block_id: self.infos[chosen].block_id,
            created: false,
        }
    }

    /// Insert `entry` into the resident block `block_id`, splitting the block
    /// if it grows too large.
    ///
    /// Returns `None` if the block does not exist or is not resident.
    pub fn insert_loaded(
        &mut self,
        block_id: BlockId,
        entry: E,
        config: &BlockConfig,
    ) -> Option<InsertOutcome> {
        let ix = self.index_of(block_id)?;
        let block = self.cache.get_mut(&block_id)?;
        let key = entry.key();
        let cost = entry.size_estimate();
        entry.merge_into(block);

        let info = &mut self.infos[ix];
        info.start = info.start.min(key);
        info.end = info.end.max(key);
        info.est_size = info.est_size.saturating_add(cost);
        info.count = block.entries.len() as u32;
        let needs_split =
            info.count > 1 && info.est_size >= config.max_block_size;
        self.dirty.insert(block_id);

        if !needs_split {
            return Some(InsertOutcome {
                block_id,
                split: None,
            });
        }

        let target = if 0 == ix {
            config.split_small_part
        } else if ix + 1 == self.infos.len() {
            config.split_large_part
        } else {
            config.split_equal_part
        };

        let older_id = self.split(ix, target)?;
        let owner = if key <= self.infos[ix + 1].end {
            older_id
        } else {
            block_id
        };

        Some(InsertOutcome {
            block_id: owner,
            split: Some(older_id),
        })
    }

    /// Split the block at `ix` so that its newer part holds roughly `target`
    /// bytes, moving the rest to a new block inserted after it.
    ///
    /// Each side keeps at least one entry.
    fn split(&mut self, ix: usize, target: u32) -> Option<BlockId> {
        let block_id = self.infos[ix].block_id;
        let older_id = self.allocate();
        let block = self.cache.get_mut(&block_id)?;

        let last = block.entries.len().checked_sub(1).filter(|&l| l > 0)?;
        let mut newer_count = last;
        let mut newer_bytes = 0u32;
        for (i, entry) in block.entries[..last].iter().enumerate() {
            newer_bytes = newer_bytes.saturating_add(entry.size_estimate());
            if newer_bytes >= target {
                newer_count = i + 1;
                break;
            }
        }

        let older_entries = block.entries.split_off(newer_count);
        let newer_start = block.entries[newer_count - 1].key();

        let info = &mut self.infos[ix];
        let older_info = FolderBlockInfo {
            block_id: older_id,
            start: info.start,
            end: older_entries[0].key(),
            count: older_entries.len() as u32,
            est_size: info.est_size.saturating_sub(newer_bytes),
        };
        info.start = newer_start;
        info.count = newer_count as u32;
        info.est_size = newer_bytes;

        self.infos.insert(ix + 1, older_info);
        self.cache.insert(
            older_id,
            Block {
                entries: older_entries,
            },
        );
        self.loaded.push(older_id);
        self.dirty.insert(block_id);
        self.dirty.insert(older_id);

        Some(older_id)
    }

    /// Remove the entry with the given id from the resident block
    /// `block_id`.
    ///
    /// A block left empty is removed from the directory and recorded as dead.
    /// Returns `None` if the block is not resident or the entry is not in it.
    pub fn delete_loaded(
        &mut self,
        block_id: BlockId,
        id: MessageId,
    ) -> Option<E> {
        let ix = self.index_of(block_id)?;
        let block = self.cache.get_mut(&block_id)?;
        let pos = block.entries.iter().position(|e| e.key().id == id)?;
        let entry = block.entries.remove(pos);

        let info = &mut self.infos[ix];
        info.est_size = info.est_size.saturating_sub(entry.size_estimate());
        info.count = block.entries.len() as u32;
        if 0 == pos && info.count > 0 {
            info.end = block.entries[0].key();
        }
        if pos == block.entries.len() && pos > 0 {
            info.start = block.entries[pos - 1].key();
        }

        if 0 == info.count {
            self.infos.remove(ix);
            self.cache.remove(&block_id);
            self.loaded.retain(|&b| b != block_id);
            self.dirty.remove(&block_id);
            self.dead.insert(block_id);
        } else {
            self.dirty.insert(block_id);
        }

        Some(entry)
    }

    /// Drop resident blocks for which `should_discard` returns true, most
    /// recently loaded first. Dirty blocks are never dropped.
    ///
    /// Returns the number of blocks dropped.
    pub fn evict(
        &mut self,
        mut should_discard: impl FnMut(&FolderBlockInfo) -> bool,
    ) -> usize {
        let mut discarded = 0;
        for i in (0..self.loaded.len()).rev() {
            let block_id = self.loaded[i];
            if self.dirty.contains(&block_id) {
                continue;
            }

            let discard = self
                .infos
                .iter()
                .find(|info| info.block_id == block_id)
                .map_or(true, &mut should_discard);
            if discard {
                self.cache.remove(&block_id);
                self.loaded.remove(i);
                discarded += 1;
            }
        }

        discarded
    }

    /// Drop the resident block containing `key`, unless it is dirty.
    pub fn discard(&mut self, key: SortKey) -> Discard {
        let block_id = match self.find(key) {
            (_, Some(info)) => info.block_id,
            (_, None) => return Discard::NoSuchBlock,
        };

        if !self.is_resident(block_id) {
            return Discard::NotResident;
        }

        if self.dirty.contains(&block_id) {
            return Discard::Dirty;
        }

        self.cache.remove(&block_id);
        self.loaded.retain(|&b| b != block_id);
        Discard::Discarded
    }

    /// Take a copy of every modified block and the ids of every removed
    /// block, marking everything clean.
    pub fn take_dirty(&mut self) -> DirtyBlocks<E> {
        let mut out = BTreeMap::new();
        for block_id in mem::take(&mut self.dirty) {
            match self.cache.get(&block_id) {
                Some(block) => {
                    out.insert(block_id, Some(block.clone()));
                },
                None => error!(
                    "{} block {} is dirty but not resident",
                    self.kind, block_id
                ),
            }
        }

        for block_id in mem::take(&mut self.dead) {
            out.insert(block_id, None);
        }

        out
    }

    /// Iterate every entry of every resident block, newest first.
    #[cfg(test)]
    pub fn resident_entries(&self) -> impl Iterator<Item = &E> + '_ {
        self.infos
            .iter()
            .filter_map(move |info| self.cache.get(&info.block_id))
            .flat_map(|block| block.entries.iter())
    }
}
