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

//! Ordered windows over a folder's messages, as shown by a message list.
//!
//! The window state lives inside the folder store so that mutations can
//! update every interested window synchronously. Each window reports its
//! changes as positional `SliceEvent`s over its own channel; the `MailSlice`
//! handle is how the UI side drives it.

use std::cell::Cell;

use log::{debug, warn};
use tokio::sync::mpsc;

use super::folder::{FolderStore, Inner, UpdateOptions};
use super::model::*;
use super::sync::SyncStatus;

/// A change to a slice, as seen by its consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum SliceEvent {
    /// `removed` headers starting at `index` were replaced by `inserted`.
    Splice {
        index: usize,
        removed: usize,
        inserted: Vec<HeaderInfo>,
        requested: bool,
        more_expected: bool,
    },
    /// The header at `index` changed in place.
    Update { index: usize, header: HeaderInfo },
    Status {
        status: SyncStatus,
        requested: bool,
        more_expected: bool,
        progress: Option<f64>,
        /// Set when a refresh through now completes: the number of unseen
        /// messages newer than the previous top of the slice.
        new_email_count: Option<u32>,
    },
    Progress(f64),
    Flags(SliceFlags),
    HeaderCount(u64),
}

pub type SliceEvents = mpsc::UnboundedReceiver<SliceEvent>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SliceFlags {
    /// The newest header in the slice is the newest known message.
    pub at_top: bool,
    /// The oldest header in the slice is the oldest known message.
    pub at_bottom: bool,
    /// Growing upwards would need to talk to the server.
    pub user_can_grow_upwards: bool,
    /// Growing downwards would need to talk to the server.
    pub user_can_grow_downwards: bool,
}

/// The facts about a folder which slice flags are derived from.
pub(super) struct FolderView {
    youngest: Option<SortKey>,
    oldest: Option<SortKey>,
    synced_to_today: bool,
    synced_to_dawn_of_time: bool,
}

/// Counts unseen messages newer than `since` during a refresh.
#[derive(Clone, Copy, Debug)]
pub(super) struct NewEmailTracker {
    since: Option<SortKey>,
    pub(super) count: u32,
}

impl NewEmailTracker {
    pub(super) fn new(since: Option<SortKey>) -> Self {
        Self { since, count: 0 }
    }

    fn note(&mut self, header: &HeaderInfo) {
        let newer = self.since.map_or(true, |since| header.date >= since.date);
        if newer && !header.is_seen() {
            self.count += 1;
        }
    }
}

pub(super) struct SliceState {
    pub(super) id: u64,
    tx: mpsc::UnboundedSender<SliceEvent>,
    /// Whether the slice receives notifications. Slices are only attached
    /// once their open operation holds the folder mutex.
    pub(super) attached: bool,
    /// Newest first.
    pub(super) headers: Vec<HeaderInfo>,
    /// Key of the oldest header, inclusive.
    pub(super) start: Option<SortKey>,
    /// Key of the newest header, inclusive.
    pub(super) end: Option<SortKey>,
    pub(super) desired: usize,
    pub(super) waiting_on_data: Option<&'static str>,
    pub(super) ignore_headers: bool,
    pub(super) new_email: Option<NewEmailTracker>,
    flags: SliceFlags,
}

impl SliceState {
    fn new(
        id: u64,
        tx: mpsc::UnboundedSender<SliceEvent>,
        desired: usize,
    ) -> Self {
        Self {
            id,
            tx,
            attached: false,
            headers: Vec::new(),
            start: None,
            end: None,
            desired,
            waiting_on_data: None,
            ignore_headers: false,
            new_email: None,
            flags: SliceFlags::default(),
        }
    }

    fn send(&self, event: SliceEvent) {
        if self.tx.send(event).is_err() {
            debug!("Slice {} receiver gone, dropping event", self.id);
        }
    }

    pub(super) fn flags(&self) -> SliceFlags {
        self.flags
    }

    fn set_flags(&mut self, flags: SliceFlags) {
        if flags != self.flags {
            self.flags = flags;
            self.send(SliceEvent::Flags(flags));
        }
    }

    pub(super) fn update_flags(&mut self, view: &FolderView) {
        let at_top = view.youngest == self.end;
        let at_bottom = view.oldest == self.start;
        self.set_flags(SliceFlags {
            at_top,
            at_bottom,
            user_can_grow_upwards: at_top && !view.synced_to_today,
            user_can_grow_downwards: at_bottom && !view.synced_to_dawn_of_time,
        });
    }

    pub(super) fn set_header_count(&self, count: u64) {
        self.send(SliceEvent::HeaderCount(count));
    }

    fn window_contains(&self, key: SortKey) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= key && key <= end,
            _ => false,
        }
    }

    fn extend_bounds(&mut self, key: SortKey) {
        self.start = Some(self.start.map_or(key, |s| s.min(key)));
        self.end = Some(self.end.map_or(key, |e| e.max(key)));
    }

    fn position(&self, key: SortKey) -> Result<usize, usize> {
        self.headers.binary_search_by(|h| key.cmp(&h.key()))
    }

    pub(super) fn set_status(
        &mut self,
        view: &FolderView,
        status: SyncStatus,
        requested: bool,
        more_expected: bool,
        progress: Option<f64>,
        new_email_count: Option<u32>,
    ) {
        if matches!(status, SyncStatus::Synced | SyncStatus::SyncFailed) {
            self.update_flags(view);
        }

        self.send(SliceEvent::Status {
            status,
            requested,
            more_expected,
            progress,
            new_email_count,
        });
    }

    pub(super) fn set_sync_progress(&self, value: f64) {
        self.send(SliceEvent::Progress(value));
    }

    /// Forget every header in the slice.
    pub(super) fn reset(&mut self) {
        if self.headers.is_empty() {
            return;
        }

        self.send(SliceEvent::Splice {
            index: 0,
            removed: self.headers.len(),
            inserted: vec![],
            requested: false,
            more_expected: true,
        });
        self.headers.clear();
        self.start = None;
        self.end = None;
    }

    /// Insert a run of headers, already in order, at `at` (or at the end if
    /// `None`).
    pub(super) fn batch_append_headers(
        &mut self,
        view: &FolderView,
        headers: Vec<HeaderInfo>,
        at: Option<usize>,
        more_coming: bool,
    ) {
        let index = at.unwrap_or(self.headers.len()).min(self.headers.len());
        for header in &headers {
            self.extend_bounds(header.key());
        }
        self.headers
            .splice(index..index, headers.iter().cloned())
            .for_each(drop);

        self.update_flags(view);
        self.send(SliceEvent::Splice {
            index,
            removed: 0,
            inserted: headers,
            requested: true,
            more_expected: more_coming,
        });
    }

    /// Add a header which the slice should know about.
    ///
    /// Headers which would land past the oldest end of a full slice are
    /// dropped. Inserting anywhere else grows the desired size to match.
    ///
    /// Returns whether the slice took the header.
    pub(super) fn on_header_added(&mut self, header: &HeaderInfo) -> bool {
        let key = header.key();
        let index = match self.position(key) {
            Ok(_) => return false,
            Err(index) => index,
        };

        let len = self.headers.len();
        if len >= self.desired {
            if index == len {
                return false;
            }
            self.desired += 1;
        }

        self.extend_bounds(key);
        if let Some(ref mut tracker) = self.new_email {
            tracker.note(header);
        }
        let waiting = self.waiting_on_data.is_some();
        self.send(SliceEvent::Splice {
            index,
            removed: 0,
            inserted: vec![header.clone()],
            requested: waiting,
            more_expected: waiting,
        });
        self.headers.insert(index, header.clone());
        true
    }

    pub(super) fn on_header_modified(&mut self, header: &HeaderInfo) {
        if let Ok(index) = self.position(header.key()) {
            self.headers[index] = header.clone();
            self.send(SliceEvent::Update {
                index,
                header: header.clone(),
            });
        }
    }

    /// Returns whether the header was in the slice.
    pub(super) fn on_header_removed(&mut self, header: &HeaderInfo) -> bool {
        let key = header.key();
        let index = match self.position(key) {
            Ok(index) => index,
            Err(_) => return false,
        };

        let waiting = self.waiting_on_data.is_some();
        self.send(SliceEvent::Splice {
            index,
            removed: 1,
            inserted: vec![],
            requested: waiting,
            more_expected: waiting,
        });
        self.headers.remove(index);

        if Some(key) == self.end {
            self.end = self.headers.first().map(HeaderInfo::key);
        }
        if Some(key) == self.start {
            self.start = self.headers.last().map(HeaderInfo::key);
        }
        true
    }

    /// Decide whether a header added to the folder should be reported to
    /// this slice, which is not the one being synchronised.
    fn wants_new_header(
        &mut self,
        key: SortKey,
        youngest: Option<SortKey>,
    ) -> bool {
        let (start, end) = match (self.start, self.end) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                // An empty slice wants anything
                self.desired += 1;
                return true;
            },
        };

        if key.date < start.date {
            // Only grow into the past if not yet full
            self.headers.len() < self.desired
        } else if key.date >= end.date {
            // Only grow into the present if already showing it
            youngest == Some(end)
        } else {
            !(key.date == start.date && key.id < start.id)
        }
    }

    /// Shrink the slice to the headers between the two given positions.
    ///
    /// The indices are only hints; if they no longer name the given
    /// messages, the messages are searched for.
    fn note_ranges(
        &mut self,
        mut first_index: usize,
        first_suid: &Suid,
        mut last_index: usize,
        last_suid: &Suid,
    ) {
        if self.headers.get(first_index).map(|h| &h.suid) != Some(first_suid) {
            first_index = self
                .headers
                .iter()
                .position(|h| h.suid == *first_suid)
                .unwrap_or(0);
        }
        if self.headers.get(last_index).map(|h| &h.suid) != Some(last_suid) {
            if let Some(ix) =
                self.headers.iter().rposition(|h| h.suid == *last_suid)
            {
                last_index = ix;
            }
        }

        let mut flags = self.flags;
        if last_index + 1 < self.headers.len() {
            let removed = self.headers.len() - last_index - 1;
            flags.at_bottom = false;
            flags.user_can_grow_downwards = false;
            self.desired = self.desired.saturating_sub(removed);
            self.send(SliceEvent::Splice {
                index: last_index + 1,
                removed,
                inserted: vec![],
                requested: true,
                more_expected: first_index > 0,
            });
            self.headers.truncate(last_index + 1);
            self.start = self.headers.last().map(HeaderInfo::key);
        }

        if first_index > 0 && first_index < self.headers.len() {
            flags.at_top = false;
            flags.user_can_grow_upwards = false;
            self.desired = self.desired.saturating_sub(first_index);
            self.send(SliceEvent::Splice {
                index: 0,
                removed: first_index,
                inserted: vec![],
                requested: true,
                more_expected: false,
            });
            self.headers.drain(..first_index);
            self.end = self.headers.first().map(HeaderInfo::key);
        }

        self.set_flags(flags);
    }
}

impl Inner {
    pub(super) fn folder_view(&self) -> FolderView {
        FolderView {
            youngest: self.youngest_key(),
            oldest: self.oldest_key(),
            synced_to_today: self.synced_to_today(),
            synced_to_dawn_of_time: self.synced_to_dawn_of_time(),
        }
    }

    /// Run `f` on the live slice with the given id, if there is one.
    pub(super) fn with_slice<T>(
        &mut self,
        id: u64,
        f: impl FnOnce(&mut SliceState, &FolderView) -> T,
    ) -> Option<T> {
        let view = self.folder_view();
        self.slices
            .iter_mut()
            .find(|s| s.id == id)
            .map(|s| f(s, &view))
    }

    pub(super) fn has_attached_slices(&self) -> bool {
        self.slices.iter().any(|s| s.attached)
    }

    /// Tell the slices about a header just added to the folder.
    ///
    /// The slice being synchronised gets every header; other slices only
    /// get headers adjacent to or inside their window. Only slices which
    /// take the header hear the new header count.
    ///
    /// `youngest` is the newest key the folder held before the addition.
    pub(super) fn notify_header_added(
        &mut self,
        header: &HeaderInfo,
        youngest: Option<SortKey>,
    ) {
        let key = header.key();
        let count = self.header_count;
        let cur_sync = self.cur_sync_slice;

        for slice in self.slices.iter_mut().filter(|s| s.attached) {
            let taken = if Some(slice.id) == cur_sync {
                !slice.ignore_headers && slice.on_header_added(header)
            } else {
                slice.wants_new_header(key, youngest)
                    && slice.on_header_added(header)
            };

            if taken {
                slice.set_header_count(count);
            }
        }
    }

    pub(super) fn notify_header_modified(
        &mut self,
        header: &HeaderInfo,
        opts: UpdateOptions,
    ) {
        if opts.silent {
            return;
        }

        let key = header.key();
        let cur_sync = self.cur_sync_slice;
        for slice in self.slices.iter_mut().filter(|s| s.attached) {
            if opts.part_of_sync && Some(slice.id) == cur_sync {
                continue;
            }

            if slice.window_contains(key) {
                slice.on_header_modified(header);
            }
        }
    }

    pub(super) fn notify_header_removed(&mut self, header: &HeaderInfo) {
        let key = header.key();
        let count = self.header_count;
        let cur_sync = self.cur_sync_slice;

        for slice in self.slices.iter_mut().filter(|s| s.attached) {
            let removed = if Some(slice.id) == cur_sync {
                !slice.ignore_headers && slice.on_header_removed(header)
            } else {
                slice.window_contains(key) && slice.on_header_removed(header)
            };

            if removed {
                slice.set_header_count(count);
            }
        }
    }

    /// Synchronisation saw `header` and found nothing to change.
    pub(super) fn notify_header_unchanged(&mut self, header: &HeaderInfo) {
        let cur_sync = match self.cur_sync_slice {
            Some(id) => id,
            None => return,
        };

        if let Some(slice) = self
            .slices
            .iter_mut()
            .find(|s| s.id == cur_sync && s.attached)
        {
            if !slice.ignore_headers {
                slice.on_header_added(header);
            }
        }
    }

    pub(super) fn attach_slice(&mut self, id: u64) -> bool {
        match self.slices.iter_mut().find(|s| s.id == id) {
            Some(slice) => {
                slice.attached = true;
                true
            },
            None => false,
        }
    }

    pub(super) fn slice_ids(&self) -> Vec<u64> {
        self.slices
            .iter()
            .filter(|s| s.attached)
            .map(|s| s.id)
            .collect()
    }
}

/// A window onto a folder, owned by whatever displays it.
///
/// Dropping the slice kills it.
pub struct MailSlice {
    store: FolderStore,
    id: u64,
    alive: Cell<bool>,
}

impl MailSlice {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    pub fn store(&self) -> &FolderStore {
        &self.store
    }

    /// Fill the slice with the most recent messages, synchronising as
    /// needed. Unless `force_refresh`, a refresh is skipped when the data is
    /// recent enough.
    pub async fn open(&self, force_refresh: bool) {
        if self.check_alive("open") {
            self.store
                .slice_open_most_recent(self.id, force_refresh)
                .await;
        }
    }

    /// Ask for more messages: pastwards for a positive `dir_magnitude`,
    /// futurewards for a negative one. A magnitude of 1 means one fill's
    /// worth. Only a `user_requested` growth goes to the server for
    /// messages not yet known locally.
    pub async fn grow(&self, dir_magnitude: i32, user_requested: bool) {
        if !self.check_alive("grow") {
            return;
        }

        let fill = self.store.config().sync.initial_fill_size as i32;
        let dir_magnitude = match dir_magnitude {
            1 => fill,
            -1 => -fill,
            m => m,
        };
        self.store
            .grow_slice(self.id, dir_magnitude, user_requested)
            .await;
    }

    /// Bring the messages in the slice up to date with the server.
    pub async fn refresh(&self) {
        if self.check_alive("refresh") {
            self.store.refresh_slice(self.id).await;
        }
    }

    /// Shrink the slice to the headers from `first_index` to `last_index`,
    /// which should be displaying `first_suid` and `last_suid`.
    pub fn note_ranges(
        &self,
        first_index: usize,
        first_suid: &Suid,
        last_index: usize,
        last_suid: &Suid,
    ) {
        self.store.shared.inner.borrow_mut().with_slice(self.id, |s, _| {
            s.note_ranges(first_index, first_suid, last_index, last_suid)
        });

        if self.store.shared.exclusive.is_idle() {
            self.store.flush_excess_cached_blocks("shrunk");
        }
    }

    /// The headers currently in the slice, newest first.
    pub fn headers(&self) -> Vec<HeaderInfo> {
        self.store
            .shared
            .inner
            .borrow_mut()
            .with_slice(self.id, |s, _| s.headers.clone())
            .unwrap_or_default()
    }

    pub fn flags(&self) -> SliceFlags {
        self.store
            .shared
            .inner
            .borrow_mut()
            .with_slice(self.id, |s, _| s.flags())
            .unwrap_or_default()
    }

    pub fn desired_headers(&self) -> usize {
        self.store
            .shared
            .inner
            .borrow_mut()
            .with_slice(self.id, |s, _| s.desired)
            .unwrap_or(0)
    }

    /// Detach the slice from the folder. Calling this more than once has no
    /// further effect.
    pub fn die(&self) {
        if self.alive.replace(false) {
            self.store.dying_slice(self.id);
        }
    }

    fn check_alive(&self, what: &str) -> bool {
        if !self.alive.get() {
            warn!(
                "{} Attempted to {} dead slice {}",
                self.store.log_prefix(),
                what,
                self.id
            );
        }
        self.alive.get()
    }
}

impl Drop for MailSlice {
    fn drop(&mut self) {
        self.die();
    }
}

impl FolderStore {
    /// Create a new, empty slice over this folder.
    ///
    /// The slice receives nothing but status until it is opened.
    pub fn create_slice(&self) -> (MailSlice, SliceEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.shared.inner.borrow_mut();
            let id = inner.next_slice_id;
            inner.next_slice_id += 1;

            let slice = SliceState::new(
                id,
                tx,
                self.config().sync.initial_fill_size,
            );
            slice.set_header_count(inner.header_count);
            inner.slices.push(slice);
            id
        };

        let slice = MailSlice {
            store: self.clone(),
            id,
            alive: Cell::new(true),
        };
        (slice, rx)
    }

    pub(super) fn dying_slice(&self, id: u64) {
        let (now_unused, driver) = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.slices.retain(|s| s.id != id);
            (!inner.has_attached_slices(), inner.sync_driver.clone())
        };

        debug!("{} Slice {} died", self.log_prefix(), id);
        self.flush_excess_cached_blocks("deadslice");

        if now_unused && self.shared.exclusive.is_idle() {
            if let Some(driver) = driver {
                driver.all_consumers_dead();
            }
        }
    }

    /// The number of slices currently receiving notifications.
    pub fn attached_slice_count(&self) -> usize {
        self.shared.inner.borrow().slice_ids().len()
    }
}
