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

//! The per-folder store which owns the block directories, the accuracy
//! ranges and the live slices of one folder.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::prelude::*;
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot};

use super::accuracy::AccuracyRanges;
use super::block::{BlockEntry, BlockSet, Discard, InsertOutcome};
use super::deferred::{LoadRole, LoadTracker};
use super::model::*;
use super::mutex::ExclusiveQueue;
use super::persistence::{Persistence, PersistenceInfo};
use super::search::{
    find_first_dated, find_first_for_date_range, find_range_for_key,
    key_ranges_intersect,
};
use super::slice::SliceState;
use super::sync::SyncDriver;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::store_config::StoreConfig;

/// Notifications for the account layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FolderEvent {
    /// Enough new body blocks have been created that old messages should be
    /// purged. Further requests are suppressed until the purge runs.
    PurgeRequested(FolderId),
    /// The folder was saved, so its metadata has probably changed.
    Modified {
        folder: FolderId,
        unread_count: u32,
        last_synced_at: Option<DateTime<Utc>>,
    },
    /// The body of the given message was replaced.
    BodyChanged(Suid),
    /// The persisted folder predates the current layout and its derived
    /// state must be recomputed.
    UpgradeRequested(FolderId),
}

/// Modifiers for header updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// The update comes from the synchronisation driving the current sync
    /// slice, which is therefore not told about it.
    pub part_of_sync: bool,
    /// Don't tell any slice about the update.
    pub silent: bool,
}

/// The source of the current time.
pub type Clock = Rc<dyn Fn() -> DateTime<Utc>>;

/// The store of one folder.
///
/// Clones share the same underlying store.
#[derive(Clone)]
pub struct FolderStore {
    pub(super) shared: Rc<Shared>,
}

pub(super) struct Shared {
    pub(super) folder: FolderId,
    pub(super) log_prefix: LogPrefix,
    pub(super) config: StoreConfig,
    pub(super) persistence: Rc<dyn Persistence>,
    pub(super) loads: LoadTracker,
    pub(super) exclusive: ExclusiveQueue,
    pub(super) inner: RefCell<Inner>,
}

pub(super) struct Inner {
    pub(super) meta: FolderMeta,
    pub(super) accuracy: AccuracyRanges,
    pub(super) headers: BlockSet<HeaderInfo>,
    pub(super) bodies: BlockSet<BodyInfo>,
    pub(super) server_ids: Option<BTreeMap<String, BlockId>>,
    pub(super) next_id: u32,
    pub(super) header_count: u64,
    /// Whether the folder state outside the blocks needs saving.
    pub(super) dirty: bool,
    /// Live slices, in creation order.
    pub(super) slices: Vec<SliceState>,
    pub(super) next_slice_id: u64,
    pub(super) cur_sync_slice: Option<u64>,
    pub(super) sync_driver: Option<Rc<dyn SyncDriver>>,
    pub(super) online: bool,
    pub(super) clock: Clock,
    pub(super) events: Option<mpsc::UnboundedSender<FolderEvent>>,
    /// Readers waiting for the next body written under the given key.
    pub(super) body_waiters: Vec<(SortKey, oneshot::Sender<()>)>,
    pub(super) purge_scheduled: bool,
    pub(super) flush_timer_armed: bool,
    pub(super) config: StoreConfig,
}

/// Glue between the generic block engine and the two block sets of a
/// folder.
#[async_trait(?Send)]
pub(super) trait StoredEntry: BlockEntry + 'static {
    fn blocks(inner: &Inner) -> &BlockSet<Self>;
    fn blocks_mut(inner: &mut Inner) -> &mut BlockSet<Self>;

    async fn load(
        persistence: &dyn Persistence,
        folder: &FolderId,
        block_id: BlockId,
    ) -> Result<Option<Block<Self>>, Error>;
}

#[async_trait(?Send)]
impl StoredEntry for HeaderInfo {
    fn blocks(inner: &Inner) -> &BlockSet<Self> {
        &inner.headers
    }

    fn blocks_mut(inner: &mut Inner) -> &mut BlockSet<Self> {
        &mut inner.headers
    }

    async fn load(
        persistence: &dyn Persistence,
        folder: &FolderId,
        block_id: BlockId,
    ) -> Result<Option<Block<Self>>, Error> {
        persistence.load_header_block(folder, block_id).await
    }
}

#[async_trait(?Send)]
impl StoredEntry for BodyInfo {
    fn blocks(inner: &Inner) -> &BlockSet<Self> {
        &inner.bodies
    }

    fn blocks_mut(inner: &mut Inner) -> &mut BlockSet<Self> {
        &mut inner.bodies
    }

    async fn load(
        persistence: &dyn Persistence,
        folder: &FolderId,
        block_id: BlockId,
    ) -> Result<Option<Block<Self>>, Error> {
        persistence.load_body_block(folder, block_id).await
    }
}

impl Inner {
    pub(super) fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub(super) fn syncable(&self) -> bool {
        self.sync_driver.as_ref().map_or(false, |d| d.syncable())
    }

    pub(super) fn can_grow_sync(&self) -> bool {
        self.sync_driver.as_ref().map_or(false, |d| d.can_grow_sync())
    }

    pub(super) fn is_local_only(&self) -> bool {
        self.meta.folder_type.is_local_only()
    }

    pub(super) fn youngest_key(&self) -> Option<SortKey> {
        self.headers.infos().first().map(|i| i.end)
    }

    pub(super) fn oldest_key(&self) -> Option<SortKey> {
        self.headers.infos().last().map(|i| i.start)
    }

    /// Whether `key` is the newest message in the folder. An empty folder
    /// has a youngest message of `None`.
    pub(super) fn header_is_youngest_known(
        &self,
        key: Option<SortKey>,
    ) -> bool {
        self.youngest_key() == key
    }

    pub(super) fn header_is_oldest_known(
        &self,
        key: Option<SortKey>,
    ) -> bool {
        self.oldest_key() == key
    }

    pub(super) fn synced_to_today(&self) -> bool {
        use crate::support::chronox::QuantizeX;

        if !self.can_grow_sync() {
            return true;
        }

        let today = self.now().quantize(self.config.sync.quantum());
        self.accuracy
            .newest_full_sync_date()
            .map_or(false, |newest| newest >= today)
    }

    pub(super) fn synced_to_dawn_of_time(&self) -> bool {
        if !self.can_grow_sync() {
            return true;
        }

        self.accuracy.oldest_full_sync_date(self.now())
            <= self.config.sync.oldest_sync_date() + chrono::Duration::days(1)
    }

    fn emit(&self, event: FolderEvent) {
        if let Some(ref events) = self.events {
            if events.send(event).is_err() {
                debug!("{} Folder event receiver gone", self.meta.id);
            }
        }
    }

    fn snapshot(&self) -> FolderState {
        FolderState {
            meta: self.meta.clone(),
            accuracy: self.accuracy.ranges().to_vec(),
            header_blocks: self.headers.infos().to_vec(),
            body_blocks: self.bodies.infos().to_vec(),
            server_id_mapping: self.server_ids.clone(),
            next_id: self.next_id,
            next_header_block: self.headers.next_block(),
            next_body_block: self.bodies.next_block(),
        }
    }
}

impl FolderStore {
    /// Create the store for a folder from its persisted state.
    pub fn new(
        state: FolderState,
        persistence: Rc<dyn Persistence>,
        config: StoreConfig,
    ) -> Self {
        let folder = state.meta.id.clone();
        let log_prefix = LogPrefix::new(&folder.0);
        let headers =
            BlockSet::new(state.header_blocks, state.next_header_block);
        let header_count = headers.total_count();

        Self {
            shared: Rc::new(Shared {
                folder,
                log_prefix,
                config: config.clone(),
                persistence,
                loads: LoadTracker::new(),
                exclusive: ExclusiveQueue::new(),
                inner: RefCell::new(Inner {
                    meta: state.meta,
                    accuracy: AccuracyRanges::new(state.accuracy),
                    headers,
                    bodies: BlockSet::new(
                        state.body_blocks,
                        state.next_body_block,
                    ),
                    server_ids: state.server_id_mapping,
                    next_id: state.next_id,
                    header_count,
                    dirty: false,
                    slices: Vec::new(),
                    next_slice_id: 0,
                    cur_sync_slice: None,
                    sync_driver: None,
                    online: false,
                    clock: Rc::new(Utc::now),
                    events: None,
                    body_waiters: Vec::new(),
                    purge_scheduled: false,
                    flush_timer_armed: false,
                    config,
                }),
            }),
        }
    }

    pub fn folder_id(&self) -> &FolderId {
        &self.shared.folder
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    pub fn meta(&self) -> FolderMeta {
        self.shared.inner.borrow().meta.clone()
    }

    /// Install the driver which synchronises this folder with its server.
    ///
    /// The driver's synchronous methods are called while the store is
    /// internally borrowed and must not call back into the store.
    pub fn set_sync_driver(&self, driver: Rc<dyn SyncDriver>) {
        self.shared.inner.borrow_mut().sync_driver = Some(driver);
    }

    pub fn set_online(&self, online: bool) {
        self.shared.inner.borrow_mut().online = online;
    }

    pub fn is_online(&self) -> bool {
        self.shared.inner.borrow().online
    }

    /// Replace the source of the current time.
    ///
    /// The clock must not call back into the store.
    pub fn set_clock(&self, clock: impl Fn() -> DateTime<Utc> + 'static) {
        self.shared.inner.borrow_mut().clock = Rc::new(clock);
    }

    /// Start receiving `FolderEvent`s, replacing any previous subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FolderEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.inner.borrow_mut().events = Some(tx);
        rx
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        let clock = Rc::clone(&self.shared.inner.borrow().clock);
        clock()
    }

    pub(super) fn driver(&self) -> Option<Rc<dyn SyncDriver>> {
        self.shared.inner.borrow().sync_driver.clone()
    }

    pub(super) fn log_prefix(&self) -> &LogPrefix {
        &self.shared.log_prefix
    }

    pub(super) fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        f(&mut self.shared.inner.borrow_mut())
    }

    fn emit(&self, event: FolderEvent) {
        self.shared.inner.borrow().emit(event);
    }

    /// Allocate the id for a new message in this folder.
    pub fn issue_new_header_id(&self) -> MessageId {
        let mut inner = self.shared.inner.borrow_mut();
        let id = MessageId(inner.next_id);
        inner.next_id += 1;
        inner.dirty = true;
        id
    }

    /// Emit `FolderEvent::UpgradeRequested` if the folder was persisted by an
    /// older version of the store.
    pub fn upgrade_if_needed(&self) -> bool {
        let needed =
            self.shared.inner.borrow().meta.version < FOLDER_DB_VERSION;
        if needed {
            info!(
                "{} Folder layout is out of date, requesting upgrade",
                self.shared.log_prefix
            );
            self.emit(FolderEvent::UpgradeRequested(
                self.shared.folder.clone(),
            ));
        }
        needed
    }

    /// Record that the account layer finished upgrading this folder.
    pub fn mark_upgraded(&self, unread_count: u32) {
        let mut inner = self.shared.inner.borrow_mut();
        inner.meta.version = FOLDER_DB_VERSION;
        inner.meta.unread_count = unread_count;
        inner.dirty = true;
    }

    // ==================== Block loading ====================

    /// Load the given block, or wait for someone else's load of it.
    ///
    /// Returns whether the block was installed.
    async fn load_block<E: StoredEntry>(&self, block_id: BlockId) -> bool {
        let guard = match self.shared.loads.begin_load(E::KIND, block_id) {
            LoadRole::Follow(rx) => return rx.await.unwrap_or(false),
            LoadRole::Lead(guard) => guard,
        };

        debug!(
            "{} Loading {} block {}",
            self.shared.log_prefix,
            E::KIND,
            block_id
        );
        let result = E::load(
            &*self.shared.persistence,
            &self.shared.folder,
            block_id,
        )
        .await;

        let success = match result {
            Ok(Some(block)) => {
                let mut inner = self.shared.inner.borrow_mut();
                let set = E::blocks_mut(&mut inner);
                set.is_resident(block_id) || set.install(block_id, block)
            },
            Ok(None) => {
                error!(
                    "{} Bad block load: {} block {} does not exist",
                    self.shared.log_prefix,
                    E::KIND,
                    block_id
                );
                false
            },
            Err(e) => {
                error!(
                    "{} Bad block load: {} block {}: {}",
                    self.shared.log_prefix,
                    E::KIND,
                    block_id,
                    e
                );
                false
            },
        };

        guard.finish(success);
        debug!(
            "{} Loaded {} block {}: {}",
            self.shared.log_prefix,
            E::KIND,
            block_id,
            success
        );
        self.schedule_flush();
        success
    }

    /// Ensure that `block_id` is resident.
    ///
    /// Returns false if the block does not exist or could not be loaded.
    pub(super) async fn make_resident<E: StoredEntry>(
        &self,
        block_id: BlockId,
    ) -> bool {
        loop {
            {
                let inner = self.shared.inner.borrow();
                let set = E::blocks(&inner);
                if set.is_resident(block_id) {
                    return true;
                }
                if set.info(block_id).is_none() {
                    return false;
                }
            }

            if !self.load_block::<E>(block_id).await {
                return false;
            }
        }
    }

    /// Find the block containing `key` and make it resident.
    ///
    /// Returns `Ok(None)` if no block contains `key`.
    pub(super) async fn resident_block_for_key<E: StoredEntry>(
        &self,
        key: SortKey,
    ) -> Result<Option<BlockId>, Error> {
        loop {
            let (block_id, resident) = {
                let inner = self.shared.inner.borrow();
                let set = E::blocks(&inner);
                match set.find(key) {
                    (_, Some(info)) => {
                        (info.block_id, set.is_resident(info.block_id))
                    },
                    (_, None) => return Ok(None),
                }
            };

            if resident {
                return Ok(Some(block_id));
            }

            if !self.load_block::<E>(block_id).await {
                return Err(Error::BlockUnavailable(E::KIND, block_id.0));
            }
        }
    }

    async fn find_entry<E: StoredEntry>(&self, key: SortKey) -> Option<E> {
        let block_id = self.resident_block_for_key::<E>(key).await.ok()??;
        let inner = self.shared.inner.borrow();
        E::blocks(&inner)
            .block(block_id)?
            .entries
            .iter()
            .find(|e| e.key() == key)
            .cloned()
    }

    /// Insert `entry` into the appropriate block, loading it if needed.
    async fn insert_entry<E: StoredEntry>(
        &self,
        entry: E,
    ) -> Result<InsertOutcome, Error> {
        let key = entry.key();
        let cost = entry.size_estimate();
        let config = &self.shared.config.blocks;
        let blocks_before = E::blocks(&self.shared.inner.borrow()).next_block();

        loop {
            let (placement, resident) = {
                let mut inner = self.shared.inner.borrow_mut();
                let set = E::blocks_mut(&mut inner);
                let placement = set.place(key, cost, config);
                (placement, set.is_resident(placement.block_id))
            };

            if !resident {
                if !self.load_block::<E>(placement.block_id).await {
                    return Err(Error::BlockUnavailable(
                        E::KIND,
                        placement.block_id.0,
                    ));
                }
                continue;
            }

            let mut inner = self.shared.inner.borrow_mut();
            let outcome = E::blocks_mut(&mut inner)
                .insert_loaded(placement.block_id, entry, config)
                .ok_or(Error::BlockUnavailable(
                    E::KIND,
                    placement.block_id.0,
                ))?;
            let blocks_after = E::blocks(&inner).next_block();
            inner.dirty = true;

            if BlockKind::Body == E::KIND {
                self.note_body_blocks_created(
                    &mut inner,
                    blocks_before,
                    blocks_after,
                );
            }

            return Ok(outcome);
        }
    }

    /// Request a purge if any body block numbered in `(before, after]` lands
    /// on the purge interval.
    fn note_body_blocks_created(
        &self,
        inner: &mut Inner,
        before: u32,
        after: u32,
    ) {
        let every_n = self.shared.config.purge.every_n_new_body_blocks;
        if 0 == every_n || inner.purge_scheduled {
            return;
        }

        if (before + 1..=after).any(|n| 0 == n % every_n) {
            inner.purge_scheduled = true;
            inner.emit(FolderEvent::PurgeRequested(self.shared.folder.clone()));
        }
    }

    async fn delete_entry<E: StoredEntry>(
        &self,
        key: SortKey,
    ) -> Result<Option<E>, Error> {
        let block_id = match self.resident_block_for_key::<E>(key).await? {
            Some(block_id) => block_id,
            None => return Ok(None),
        };

        let mut inner = self.shared.inner.borrow_mut();
        let removed = E::blocks_mut(&mut inner).delete_loaded(block_id, key.id);
        if removed.is_some() {
            inner.dirty = true;
        }
        Ok(removed)
    }

    // ==================== Mutations ====================

    /// Add a new message header, and optionally its body.
    pub async fn add_message_header(
        &self,
        header: HeaderInfo,
        body: Option<BodyInfo>,
    ) -> Result<(), Error> {
        let _gate = self.shared.loads.enter().await;
        let key = header.key();
        self.add_message_header_locked(header.clone()).await?;
        if let Some(body) = body {
            self.add_message_body_locked(key, body).await?;
        }
        Ok(())
    }

    async fn add_message_header_locked(
        &self,
        header: HeaderInfo,
    ) -> Result<(), Error> {
        trace!(
            "{} Add header {} server_id={:?}",
            self.shared.log_prefix,
            header.key(),
            header.server_id
        );

        let youngest = self.shared.inner.borrow().youngest_key();
        let outcome = self.insert_entry(header.clone()).await?;

        let mut inner = self.shared.inner.borrow_mut();
        let inner = &mut *inner;
        if !header.is_seen() {
            inner.meta.unread_count += 1;
        }
        inner.header_count += 1;
        inner.notify_header_added(&header, youngest);

        let server_id = header.server_id;
        if let Some(ref mut server_ids) = inner.server_ids {
            if let Some(server_id) = server_id {
                server_ids.insert(server_id, outcome.block_id);
            }

            if let Some(split) = outcome.split {
                if let Some(block) = inner.headers.block(split) {
                    for header in &block.entries {
                        if let Some(ref server_id) = header.server_id {
                            server_ids.insert(server_id.clone(), split);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Apply `mutator` to the header with the given key.
    ///
    /// The mutator returns whether it changed anything; if it does not,
    /// nothing is dirtied and no slice is told. It must not change the key
    /// of the header or call back into the store.
    ///
    /// Returns the updated header, or `None` if there is no such header or
    /// the mutator declined.
    pub async fn mutate_message_header(
        &self,
        key: SortKey,
        opts: UpdateOptions,
        mutator: impl FnOnce(&mut HeaderInfo) -> bool,
    ) -> Result<Option<HeaderInfo>, Error> {
        let _gate = self.shared.loads.enter().await;
        self.mutate_message_header_locked(key, opts, mutator).await
    }

    /// Replace the header with the given key.
    pub async fn update_message_header(
        &self,
        key: SortKey,
        header: HeaderInfo,
        opts: UpdateOptions,
    ) -> Result<(), Error> {
        let _gate = self.shared.loads.enter().await;
        self.mutate_message_header_locked(key, opts, |h| {
            *h = header;
            true
        })
        .await?
        .map(|_| ())
        .ok_or(Error::MessageNotFound)
    }

    async fn mutate_message_header_locked(
        &self,
        key: SortKey,
        opts: UpdateOptions,
        mutator: impl FnOnce(&mut HeaderInfo) -> bool,
    ) -> Result<Option<HeaderInfo>, Error> {
        let block_id =
            match self.resident_block_for_key::<HeaderInfo>(key).await? {
                Some(block_id) => block_id,
                None => return Ok(None),
            };

        let (pos, mut header) = {
            let inner = self.shared.inner.borrow();
            let found = inner.headers.block(block_id).and_then(|block| {
                block
                    .entries
                    .iter()
                    .position(|h| h.id == key.id)
                    .map(|pos| (pos, block.entries[pos].clone()))
            });
            match found {
                Some(found) => found,
                None => return Ok(None),
            }
        };

        let was_seen = header.is_seen();
        let old_server_id = header.server_id.clone();
        if !mutator(&mut header) {
            return Ok(None);
        }

        if header.key() != key {
            error!(
                "{} Header update attempted to move {} to {}",
                self.shared.log_prefix,
                key,
                header.key()
            );
            return Ok(None);
        }

        trace!("{} Update header {}", self.shared.log_prefix, key);
        let mut inner = self.shared.inner.borrow_mut();
        let inner = &mut *inner;
        match inner.headers.modify(block_id) {
            Some(block) => block.entries[pos] = header.clone(),
            None => {
                return Err(Error::BlockUnavailable(
                    BlockKind::Header,
                    block_id.0,
                ))
            },
        }
        inner.dirty = true;

        match (was_seen, header.is_seen()) {
            (true, false) => inner.meta.unread_count += 1,
            (false, true) => {
                inner.meta.unread_count =
                    inner.meta.unread_count.saturating_sub(1)
            },
            _ => (),
        }

        if old_server_id != header.server_id {
            if let Some(ref mut server_ids) = inner.server_ids {
                if let Some(old) = old_server_id {
                    server_ids.remove(&old);
                }
                if let Some(ref new) = header.server_id {
                    server_ids.insert(new.clone(), block_id);
                }
            }
        }

        inner.notify_header_modified(&header, opts);
        Ok(Some(header))
    }

    /// Like `mutate_message_header`, but locates the header by its server
    /// id.
    pub async fn mutate_message_header_by_server_id(
        &self,
        server_id: &str,
        opts: UpdateOptions,
        mutator: impl FnOnce(&mut HeaderInfo) -> bool,
    ) -> Result<Option<HeaderInfo>, Error> {
        let _gate = self.shared.loads.enter().await;
        match self.locate_by_server_id(server_id).await? {
            Some(header) => {
                self.mutate_message_header_locked(header.key(), opts, mutator)
                    .await
            },
            None => Ok(None),
        }
    }

    pub async fn update_message_header_by_server_id(
        &self,
        server_id: &str,
        header: HeaderInfo,
        opts: UpdateOptions,
    ) -> Result<(), Error> {
        self.mutate_message_header_by_server_id(server_id, opts, |h| {
            *h = header;
            true
        })
        .await?
        .map(|_| ())
        .ok_or(Error::MessageNotFound)
    }

    async fn locate_by_server_id(
        &self,
        server_id: &str,
    ) -> Result<Option<HeaderInfo>, Error> {
        let block_id = {
            let inner = self.shared.inner.borrow();
            let server_ids = inner
                .server_ids
                .as_ref()
                .ok_or(Error::ServerIdMappingUnsupported)?;
            match server_ids.get(server_id) {
                Some(&block_id) => block_id,
                None => {
                    warn!(
                        "{} Server id mapping missing for {:?}",
                        self.shared.log_prefix, server_id
                    );
                    return Ok(None);
                },
            }
        };

        if !self.make_resident::<HeaderInfo>(block_id).await {
            let exists =
                self.shared.inner.borrow().headers.info(block_id).is_some();
            if exists {
                return Err(Error::BlockUnavailable(
                    BlockKind::Header,
                    block_id.0,
                ));
            }

            error!(
                "{} Server id {:?} maps to nonexistent block {}",
                self.shared.log_prefix, server_id, block_id
            );
            return Ok(None);
        }

        let inner = self.shared.inner.borrow();
        Ok(inner.headers.block(block_id).and_then(|block| {
            block
                .entries
                .iter()
                .find(|h| h.server_id.as_deref() == Some(server_id))
                .cloned()
        }))
    }

    /// Note that synchronisation found `header` unchanged.
    ///
    /// Only the current sync slice hears about this.
    pub async fn unchanged_message_header(&self, header: &HeaderInfo) {
        let _gate = self.shared.loads.enter().await;
        self.shared
            .inner
            .borrow_mut()
            .notify_header_unchanged(header);
    }

    /// Delete the given header, leaving its body in place.
    pub async fn delete_message_header_using_header(
        &self,
        header: &HeaderInfo,
    ) -> Result<(), Error> {
        let _gate = self.shared.loads.enter().await;
        self.delete_message_header_locked(header).await
    }

    pub(super) async fn delete_message_header_locked(
        &self,
        header: &HeaderInfo,
    ) -> Result<(), Error> {
        trace!("{} Delete header {}", self.shared.log_prefix, header.key());

        let removed = match self.delete_entry::<HeaderInfo>(header.key()).await?
        {
            Some(removed) => removed,
            None => {
                warn!(
                    "{} Bad deletion request for header {}",
                    self.shared.log_prefix,
                    header.key()
                );
                return Ok(());
            },
        };

        let mut inner = self.shared.inner.borrow_mut();
        let inner = &mut *inner;
        inner.header_count = inner.header_count.saturating_sub(1);
        if !removed.is_seen() {
            inner.meta.unread_count = inner.meta.unread_count.saturating_sub(1);
        }
        inner.notify_header_removed(&removed);

        if let (Some(server_ids), Some(server_id)) =
            (inner.server_ids.as_mut(), removed.server_id.as_ref())
        {
            server_ids.remove(server_id);
            inner.dirty = true;
        }

        Ok(())
    }

    /// Delete the given header and its body.
    pub async fn delete_message_header_and_body_using_header(
        &self,
        header: &HeaderInfo,
    ) -> Result<(), Error> {
        let _gate = self.shared.loads.enter().await;
        self.delete_message_header_and_body_locked(header).await
    }

    pub(super) async fn delete_message_header_and_body_locked(
        &self,
        header: &HeaderInfo,
    ) -> Result<(), Error> {
        self.delete_message_header_locked(header).await?;
        if self.delete_entry::<BodyInfo>(header.key()).await?.is_none() {
            debug!(
                "{} No body to delete for {}",
                self.shared.log_prefix,
                header.key()
            );
        }
        Ok(())
    }

    /// Delete the message with the given id and date, if it exists.
    pub async fn delete_message_header_and_body(
        &self,
        suid: &Suid,
        date: DateTime<Utc>,
    ) -> Result<(), Error> {
        let _gate = self.shared.loads.enter().await;
        match self.find_entry::<HeaderInfo>(SortKey::new(date, suid.id)).await {
            Some(header) => {
                self.delete_message_header_and_body_locked(&header).await
            },
            None => Ok(()),
        }
    }

    pub async fn delete_message_by_server_id(
        &self,
        server_id: &str,
    ) -> Result<(), Error> {
        let _gate = self.shared.loads.enter().await;
        match self.locate_by_server_id(server_id).await? {
            Some(header) => {
                self.delete_message_header_and_body_locked(&header).await
            },
            None => Ok(()),
        }
    }

    /// Add the body of the message described by `header`.
    ///
    /// The body's date, id and size are derived by the store.
    pub async fn add_message_body(
        &self,
        header: &HeaderInfo,
        body: BodyInfo,
    ) -> Result<(), Error> {
        let _gate = self.shared.loads.enter().await;
        self.add_message_body_locked(header.key(), body).await
    }

    async fn add_message_body_locked(
        &self,
        key: SortKey,
        mut body: BodyInfo,
    ) -> Result<(), Error> {
        body.date = key.date;
        body.id = key.id;
        body.size = body.estimate_size();
        trace!(
            "{} Add body {} size={}",
            self.shared.log_prefix,
            key,
            body.size
        );
        self.insert_entry(body).await?;

        let mut inner = self.shared.inner.borrow_mut();
        let waiters = std::mem::take(&mut inner.body_waiters);
        for (waiting_on, tx) in waiters {
            if waiting_on == key {
                let _ = tx.send(());
            } else if !tx.is_closed() {
                inner.body_waiters.push((waiting_on, tx));
            }
        }
        Ok(())
    }

    /// Replace the body of the message described by `header`.
    ///
    /// The size estimate is recomputed. If `notify`, a
    /// `FolderEvent::BodyChanged` is emitted.
    pub async fn update_message_body(
        &self,
        header: &HeaderInfo,
        body: BodyInfo,
        notify: bool,
    ) -> Result<(), Error> {
        let _gate = self.shared.loads.enter().await;
        let key = header.key();
        if self.delete_entry::<BodyInfo>(key).await?.is_none() {
            warn!(
                "{} Bad deletion request for body {}",
                self.shared.log_prefix, key
            );
        }
        self.add_message_body_locked(key, body).await?;

        if notify {
            self.emit(FolderEvent::BodyChanged(header.suid.clone()));
        }
        Ok(())
    }

    // ==================== Reads ====================

    /// Look up a single header.
    ///
    /// The folder part of `suid` is not checked.
    pub async fn get_message_header(
        &self,
        suid: &Suid,
        date: DateTime<Utc>,
    ) -> Option<HeaderInfo> {
        self.find_entry(SortKey::new(date, suid.id)).await
    }

    /// Look up several headers, skipping any which do not exist.
    pub async fn get_message_headers(
        &self,
        namers: &[(Suid, DateTime<Utc>)],
    ) -> Vec<HeaderInfo> {
        let mut out = Vec::with_capacity(namers.len());
        for (suid, date) in namers {
            if let Some(header) = self.get_message_header(suid, *date).await {
                out.push(header);
            }
        }
        out
    }

    pub async fn get_message_body(
        &self,
        suid: &Suid,
        date: DateTime<Utc>,
    ) -> Option<BodyInfo> {
        let _gate = self.shared.loads.enter().await;
        self.find_entry(SortKey::new(date, suid.id)).await
    }

    /// Look up a body, waiting until all of its representations have been
    /// downloaded.
    ///
    /// Returns `None` if there is no such body.
    pub async fn get_message_body_with_reps(
        &self,
        suid: &Suid,
        date: DateTime<Utc>,
        require_attachments: bool,
    ) -> Option<BodyInfo> {
        let key = SortKey::new(date, suid.id);
        loop {
            let body = self.get_message_body(suid, date).await?;
            if body.reps_downloaded(require_attachments) {
                return Some(body);
            }

            debug!(
                "{} Waiting for body reps of {}",
                self.shared.log_prefix, key
            );
            let (tx, rx) = oneshot::channel();
            self.shared.inner.borrow_mut().body_waiters.push((key, tx));
            rx.await.ok()?;
        }
    }

    /// Look up a message's header along with its body, if it has one.
    pub async fn get_message(
        &self,
        suid: &Suid,
        date: DateTime<Utc>,
    ) -> Option<(HeaderInfo, Option<BodyInfo>)> {
        let header = self.get_message_header(suid, date).await?;
        let body = self.get_message_body(suid, date).await;
        Some((header, body))
    }

    /// Collect headers dated within `[start, end)`, newest first.
    ///
    /// A missing `end` is unbounded. Blocks are walked until at least `min`
    /// headers have been found (or the range is exhausted), but never more
    /// than `max` headers are returned. Both default to the configured
    /// "too many messages" count.
    pub async fn messages_in_date_range(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        min: Option<usize>,
        max: Option<usize>,
    ) -> Vec<HeaderInfo> {
        let too_many = self.shared.config.sync.too_many_messages;
        let mut to_fill = min.unwrap_or(too_many);
        let mut max_fill = max.unwrap_or(too_many);
        let mut out = Vec::new();

        let mut block_ix = {
            let inner = self.shared.inner.borrow();
            match find_first_for_date_range(inner.headers.infos(), start, end) {
                (ix, Some(_)) => ix,
                (_, None) => return out,
            }
        };

        loop {
            let block_id =
                match self.shared.inner.borrow().headers.infos().get(block_ix) {
                    Some(info) => info.block_id,
                    None => return out,
                };
            if !self.make_resident::<HeaderInfo>(block_id).await {
                return out;
            }

            let inner = self.shared.inner.borrow();
            let headers = match inner.headers.block(block_id) {
                Some(block) => &block.entries,
                None => return out,
            };
            let first =
                match find_first_dated(headers, |h| h.date, start, end) {
                    Some(first) => first,
                    None => return out,
                };

            let mut ix = first;
            while ix < headers.len() && max_fill > 0 {
                if headers[ix].date < start {
                    break;
                }
                ix += 1;
                max_fill -= 1;
            }
            out.extend_from_slice(&headers[first..ix]);

            // Stopping short of the end of the block means either the range
            // or the limit was exhausted.
            to_fill = to_fill.saturating_sub(ix - first);
            if ix < headers.len() || 0 == to_fill {
                return out;
            }

            block_ix += 1;
            match inner.headers.infos().get(block_ix) {
                None => return out,
                Some(info) if start > info.end.date => return out,
                Some(_) => (),
            }
        }
    }

    /// Collect every header dated within `[start, end)`, up to the "too many
    /// messages" count.
    pub async fn all_messages_in_date_range(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<HeaderInfo> {
        self.messages_in_date_range(start, end, None, None).await
    }

    /// Collect up to `limit` headers older than `key`, newest first.
    ///
    /// `key` need not name an existing message. A `key` of `None` starts
    /// from the newest message, inclusive.
    pub async fn messages_before(
        &self,
        key: Option<SortKey>,
        limit: Option<usize>,
    ) -> Vec<HeaderInfo> {
        let mut to_fill =
            limit.unwrap_or(self.shared.config.sync.too_many_messages);
        let mut out = Vec::new();

        let mut block_ix = {
            let inner = self.shared.inner.borrow();
            let infos = inner.headers.infos();
            let ix = match key {
                Some(key) => find_range_for_key(infos, key).0,
                None => 0,
            };
            if ix >= infos.len() {
                return out;
            }
            ix
        };

        let mut first_block = true;
        while to_fill > 0 {
            let block_id =
                match self.shared.inner.borrow().headers.infos().get(block_ix) {
                    Some(info) => info.block_id,
                    None => break,
                };
            if !self.make_resident::<HeaderInfo>(block_id).await {
                break;
            }

            let inner = self.shared.inner.borrow();
            let headers = match inner.headers.block(block_id) {
                Some(block) => &block.entries,
                None => break,
            };

            let begin = match key {
                Some(key) if first_block => {
                    headers.partition_point(|h| h.key() >= key)
                },
                _ => 0,
            };
            first_block = false;

            let take = headers.len().saturating_sub(begin).min(to_fill);
            out.extend_from_slice(&headers[begin..begin + take]);
            to_fill -= take;
            block_ix += 1;
        }

        out
    }

    /// Collect up to `limit` headers newer than the message at `key`, newest
    /// first.
    ///
    /// `key` must name an existing message.
    pub async fn messages_after(
        &self,
        key: SortKey,
        limit: Option<usize>,
    ) -> Vec<HeaderInfo> {
        let mut to_fill =
            limit.unwrap_or(self.shared.config.sync.too_many_messages);
        let mut out = Vec::<HeaderInfo>::new();

        let mut block_ix = {
            let inner = self.shared.inner.borrow();
            match find_range_for_key(inner.headers.infos(), key) {
                (ix, Some(_)) => ix,
                (_, None) => {
                    warn!(
                        "{} Bad iteration start {}",
                        self.shared.log_prefix, key
                    );
                    return out;
                },
            }
        };

        let mut first_block = true;
        loop {
            let block_id =
                match self.shared.inner.borrow().headers.infos().get(block_ix) {
                    Some(info) => info.block_id,
                    None => break,
                };
            if !self.make_resident::<HeaderInfo>(block_id).await {
                break;
            }

            let inner = self.shared.inner.borrow();
            let headers = match inner.headers.block(block_id) {
                Some(block) => &block.entries,
                None => break,
            };

            let end = if first_block {
                first_block = false;
                match headers.iter().position(|h| h.key() == key) {
                    Some(pos) => pos,
                    None => {
                        warn!(
                            "{} Bad iteration start {}",
                            self.shared.log_prefix, key
                        );
                        break;
                    },
                }
            } else {
                headers.len()
            };

            let take = end.min(to_fill);
            let mut chunk = headers[end - take..end].to_vec();
            chunk.append(&mut out);
            out = chunk;
            to_fill -= take;

            if 0 == to_fill || 0 == block_ix {
                break;
            }
            block_ix -= 1;
        }

        out
    }

    /// Whether a message with the given server id is known.
    pub fn has_message_with_server_id(
        &self,
        server_id: &str,
    ) -> Result<bool, Error> {
        let inner = self.shared.inner.borrow();
        let server_ids = inner
            .server_ids
            .as_ref()
            .ok_or(Error::ServerIdMappingUnsupported)?;
        Ok(server_ids.contains_key(server_id))
    }

    pub fn known_message_count(&self) -> u64 {
        self.shared.inner.borrow().header_count
    }

    pub fn youngest_message_timestamp(&self) -> Option<DateTime<Utc>> {
        self.shared.inner.borrow().youngest_key().map(|k| k.date)
    }

    pub fn oldest_message_timestamp(&self) -> Option<DateTime<Utc>> {
        self.shared.inner.borrow().oldest_key().map(|k| k.date)
    }

    /// Whether `key` names the newest message in the folder, or is `None`
    /// and the folder is empty.
    pub fn header_is_youngest_known(&self, key: Option<SortKey>) -> bool {
        self.shared.inner.borrow().header_is_youngest_known(key)
    }

    pub fn header_is_oldest_known(&self, key: Option<SortKey>) -> bool {
        self.shared.inner.borrow().header_is_oldest_known(key)
    }

    pub fn newest_full_sync_date(&self) -> Option<DateTime<Utc>> {
        self.shared.inner.borrow().accuracy.newest_full_sync_date()
    }

    pub fn oldest_full_sync_date(&self) -> DateTime<Utc> {
        let now = self.now();
        self.shared.inner.borrow().accuracy.oldest_full_sync_date(now)
    }

    /// Whether synchronisation has reached the current day, or cannot grow
    /// anyway.
    pub fn synced_to_today(&self) -> bool {
        self.shared.inner.borrow().synced_to_today()
    }

    /// Whether synchronisation has reached the oldest date it ever goes
    /// back to, or cannot grow anyway.
    pub fn synced_to_dawn_of_time(&self) -> bool {
        self.shared.inner.borrow().synced_to_dawn_of_time()
    }

    // ==================== Accuracy ====================

    /// Record that `[start, end)` was synchronised at `updated`. A missing
    /// `end` means now.
    pub fn mark_sync_range(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        modseq: Option<String>,
        updated: DateTime<Utc>,
    ) -> Result<(), Error> {
        let now = self.now();
        let mut inner = self.shared.inner.borrow_mut();
        inner.accuracy.mark_synced(start, end, modseq, updated, now)?;
        inner.meta.last_synced_at = Some(now);
        inner.dirty = true;
        Ok(())
    }

    /// Record that nothing older than the oldest range exists on the server.
    pub fn mark_synced_to_dawn_of_time(&self) {
        let now = self.now();
        let mut inner = self.shared.inner.borrow_mut();
        let oldest = inner.config.sync.oldest_sync_date();
        if inner.accuracy.mark_synced_to_dawn_of_time(oldest) {
            inner.meta.last_synced_at = Some(now);
            inner.dirty = true;
        } else {
            warn!(
                "{} Cannot sync to the dawn of time without any sync",
                self.shared.log_prefix
            );
        }
    }

    /// Retract `mark_synced_to_dawn_of_time`, e.g., because a message older
    /// than the oldest range was discovered.
    pub fn clear_synced_to_dawn_of_time(&self, new_oldest: DateTime<Utc>) {
        let now = self.now();
        let mut inner = self.shared.inner.borrow_mut();
        if let Some(removed) =
            inner.accuracy.clear_synced_to_dawn_of_time(new_oldest)
        {
            warn!(
                "{} Removed accuracy range [{}, {}) left empty by {}",
                self.shared.log_prefix,
                removed.start_ts,
                removed.end_ts,
                new_oldest
            );
        }
        inner.meta.last_synced_at = Some(now);
        inner.dirty = true;
    }

    /// Find the part of `[start, end)` not fully synchronised within the last
    /// `threshold`, if any.
    pub fn check_accuracy_coverage_needing_refresh(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let now = self.now();
        self.shared
            .inner
            .borrow()
            .accuracy
            .coverage_needing_refresh(start, end, threshold, now)
    }

    // ==================== Cache ====================

    /// Drop cached blocks which are neither dirty nor needed by a live
    /// slice.
    ///
    /// Header blocks are kept while they overlap a slice's window. One body
    /// block is kept while any slice is attached, since users tend to step
    /// between adjacent messages.
    pub fn flush_excess_cached_blocks(&self, label: &str) {
        let mut inner = self.shared.inner.borrow_mut();
        let windows = inner
            .slices
            .iter()
            .filter(|s| s.attached)
            .filter_map(|s| Some((s.start?, s.end?)))
            .collect::<Vec<_>>();
        let keep_bodies = usize::from(inner.has_attached_slices());

        let headers = inner.headers.evict(|info| {
            !windows
                .iter()
                .any(|&w| key_ranges_intersect((info.start, info.end), w))
        });
        let mut kept = 0;
        let bodies = inner.bodies.evict(|_| {
            if kept < keep_bodies {
                kept += 1;
                false
            } else {
                true
            }
        });

        debug!(
            "{} Flushed {} header and {} body blocks ({}); {}+{} resident",
            self.shared.log_prefix,
            headers,
            bodies,
            label,
            inner.headers.resident_count(),
            inner.bodies.resident_count(),
        );
    }

    /// Drop the cached block of the given kind containing `key`.
    pub fn discard_cached_block(&self, kind: BlockKind, key: SortKey) -> bool {
        let mut inner = self.shared.inner.borrow_mut();
        let result = match kind {
            BlockKind::Header => inner.headers.discard(key),
            BlockKind::Body => inner.bodies.discard(key),
        };

        match result {
            Discard::Discarded => true,
            Discard::NotResident => false,
            Discard::Dirty => {
                warn!(
                    "{} Not discarding dirty {} block containing {}",
                    self.shared.log_prefix, kind, key
                );
                false
            },
            Discard::NoSuchBlock => {
                warn!(
                    "{} Bad discard request: no {} block contains {}",
                    self.shared.log_prefix, kind, key
                );
                false
            },
        }
    }

    /// Arm the timer which trims the cache once things go quiet.
    fn schedule_flush(&self) {
        let delay = self.shared.config.cache.flush_excess_delay_ms;
        if 0 == delay || !self.shared.exclusive.is_idle() {
            return;
        }

        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.flush_timer_armed {
                return;
            }
            inner.flush_timer_armed = true;
        }

        let weak = Rc::downgrade(&self.shared);
        tokio::task::spawn_local(async move {
            tokio::time::sleep(StdDuration::from_millis(delay)).await;
            if let Some(shared) = weak.upgrade() {
                let store = FolderStore { shared };
                store.shared.inner.borrow_mut().flush_timer_armed = false;
                if store.shared.exclusive.is_idle() {
                    store.flush_excess_cached_blocks("timer");
                }
            }
        });
    }

    // ==================== Persistence ====================

    /// Hand over everything that needs saving, marking it clean.
    ///
    /// Returns `None` if nothing changed since the last call.
    pub fn generate_persistence_info(&self) -> Option<PersistenceInfo> {
        let (info, event) = {
            let mut inner = self.shared.inner.borrow_mut();
            if !inner.dirty
                && !inner.headers.is_dirty()
                && !inner.bodies.is_dirty()
            {
                return None;
            }

            let header_blocks = inner.headers.take_dirty();
            let body_blocks = inner.bodies.take_dirty();
            inner.dirty = false;
            let info = PersistenceInfo {
                folder: self.shared.folder.clone(),
                state: inner.snapshot(),
                header_blocks,
                body_blocks,
            };
            let event = FolderEvent::Modified {
                folder: self.shared.folder.clone(),
                unread_count: inner.meta.unread_count,
                last_synced_at: inner.meta.last_synced_at,
            };
            (info, event)
        };

        debug!(
            "{} Generated persistence info: {} header and {} body blocks",
            self.shared.log_prefix,
            info.header_blocks.len(),
            info.body_blocks.len()
        );
        self.flush_excess_cached_blocks("persist");
        self.emit(event);
        Some(info)
    }

    /// Save this folder if anything changed.
    ///
    /// Returns whether anything was written.
    pub async fn save_state(&self) -> Result<bool, Error> {
        match self.generate_persistence_info() {
            Some(info) => {
                self.shared.persistence.save_folder_states(vec![info]).await?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Save every changed folder among `stores` in one transaction.
    ///
    /// Returns the number of folders written.
    pub async fn save_folders(
        persistence: &dyn Persistence,
        stores: &[FolderStore],
    ) -> Result<usize, Error> {
        let batch = stores
            .iter()
            .filter_map(FolderStore::generate_persistence_info)
            .collect::<Vec<_>>();
        let count = batch.len();
        if count > 0 {
            persistence.save_folder_states(batch).await?;
        }
        Ok(count)
    }

    // ==================== Lifecycle ====================

    /// Detach every slice and shut the sync driver down.
    pub fn shutdown(&self) {
        let (slices, driver) = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.cur_sync_slice = None;
            (std::mem::take(&mut inner.slices), inner.sync_driver.clone())
        };

        for slice in slices {
            debug!(
                "{} Dropping slice {} on shutdown",
                self.shared.log_prefix, slice.id
            );
        }

        if let Some(driver) = driver {
            driver.shutdown();
        }
    }
}
