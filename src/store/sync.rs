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

//! Orchestration of slice opens, growth and refreshes against the local
//! database and the server.
//!
//! The store decides which date ranges need to be fetched; talking to the
//! server is the business of a `SyncDriver`. A driver reports what it finds
//! by mutating the store through the `SyncContext` it is handed, and the
//! slice being synchronised is told about each header as it lands.

use async_trait::async_trait;
use chrono::prelude::*;
use chrono::Duration;
use log::{debug, warn};

use super::folder::FolderStore;
use super::model::*;
use super::mutex::ExclusiveTicket;
use super::slice::NewEmailTracker;
use crate::support::chronox::*;
use crate::support::error::Error;

/// The progress reported as soon as any synchronisation starts, so that
/// progress bars visibly begin.
pub const SYNC_START_MINIMUM_PROGRESS: f64 = 0.02;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Synchronizing,
    Synced,
    SyncFailed,
    /// The folder cannot be synchronised at all right now, e.g., because the
    /// account is missing credentials.
    SyncBlocked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Towards older messages.
    Pastwards,
    /// Towards newer messages.
    Futurewards,
}

/// What a driver reports when a synchronisation step finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncCompletion {
    /// The status to report to the slice, `Synced` if `None`.
    pub status: Option<SyncStatus>,
    pub more_expected: bool,
}

/// The handle through which a driver works on the slice it synchronises.
pub struct SyncContext {
    store: FolderStore,
    slice: u64,
}

impl SyncContext {
    pub fn store(&self) -> &FolderStore {
        &self.store
    }

    pub fn slice_id(&self) -> u64 {
        self.slice
    }

    /// Declare that data for the slice is now arriving from the server.
    ///
    /// Until the step completes, every header the driver adds is reported to
    /// this slice, unless `ignore_headers` is set.
    pub fn begin(&self, mode: &'static str, ignore_headers: bool) {
        let slice = self.slice;
        self.store.with_inner(|inner| {
            inner.cur_sync_slice = Some(slice);
            inner.with_slice(slice, |s, _| {
                s.waiting_on_data = Some(mode);
                s.ignore_headers = ignore_headers;
            });
        });
    }

    /// Report how far along the current step is, from 0 to 1.
    pub fn progress(&self, value: f64) {
        let value = value.clamp(0.0, 1.0);
        self.store.with_inner(|inner| {
            inner.with_slice(self.slice, |s, _| s.set_sync_progress(value))
        });
    }
}

/// Talks to the server on behalf of a folder.
///
/// Time ranges are half-open; an `end` of `None` means "through now".
#[async_trait(?Send)]
pub trait SyncDriver {
    /// Whether the folder can be synchronised at all.
    fn syncable(&self) -> bool;
    /// Whether the server can be asked for messages outside what is already
    /// known, as opposed to e.g. a POP3 inbox.
    fn can_grow_sync(&self) -> bool;

    /// Fetch the last `days` days of a folder never synchronised before.
    async fn initial_sync(
        &self,
        ctx: &SyncContext,
        days: u32,
    ) -> Result<SyncCompletion, Error>;

    /// Bring `[start, end)` up to date. `orig_start` is set when `start` was
    /// widened to the oldest full synchronisation, and holds what the slice
    /// actually covers.
    async fn refresh_sync(
        &self,
        ctx: &SyncContext,
        dir: Direction,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        orig_start: Option<DateTime<Utc>>,
    ) -> Result<SyncCompletion, Error>;

    /// Fetch `days` days of messages beyond `start` in direction `dir`.
    async fn grow_sync(
        &self,
        ctx: &SyncContext,
        dir: Direction,
        start: DateTime<Utc>,
        days: u32,
    ) -> Result<SyncCompletion, Error>;

    /// No slice is open and no operation is pending, so any connection
    /// held for this folder can be let go.
    fn all_consumers_dead(&self) {}

    fn shutdown(&self) {}
}

impl FolderStore {
    fn context(&self, slice: u64) -> SyncContext {
        SyncContext {
            store: self.clone(),
            slice,
        }
    }

    /// Local-only folders have nothing to synchronise with and do not queue
    /// behind the folder mutex.
    async fn lock_unless_local(
        &self,
        label: &'static str,
    ) -> Option<ExclusiveTicket> {
        if self.with_inner(|inner| inner.is_local_only()) {
            None
        } else {
            Some(self.acquire_exclusive(label).await)
        }
    }

    fn slice_status(
        &self,
        id: u64,
        status: SyncStatus,
        requested: bool,
        progress: Option<f64>,
    ) {
        self.with_inner(|inner| {
            inner.with_slice(id, |s, view| {
                s.set_status(view, status, requested, true, progress, None)
            })
        });
    }

    /// End the synchronisation step of slice `id` with `result`.
    fn complete_sync(
        &self,
        id: u64,
        what: &str,
        result: Result<SyncCompletion, Error>,
        settle_desired: bool,
    ) {
        let completion = match result {
            Ok(completion) => completion,
            Err(e) => {
                warn!(
                    "{} {} failed for slice {}: {}",
                    self.log_prefix(),
                    what,
                    id,
                    e
                );
                SyncCompletion {
                    status: Some(SyncStatus::SyncFailed),
                    more_expected: false,
                }
            },
        };

        self.with_inner(|inner| {
            if inner.cur_sync_slice == Some(id) {
                inner.cur_sync_slice = None;
            }

            inner.with_slice(id, |s, view| {
                s.waiting_on_data = None;
                s.ignore_headers = false;
                if settle_desired {
                    s.desired = s.headers.len();
                }
                let new_email_count = s.new_email.take().map(|t| t.count);
                s.set_status(
                    view,
                    completion.status.unwrap_or(SyncStatus::Synced),
                    true,
                    completion.more_expected,
                    None,
                    new_email_count,
                );
            });
        });
    }

    pub(super) async fn slice_open_most_recent(
        &self,
        id: u64,
        force_refresh: bool,
    ) {
        self.slice_status(
            id,
            SyncStatus::Synchronizing,
            false,
            Some(SYNC_START_MINIMUM_PROGRESS),
        );

        let _ticket = self.lock_unless_local("sync").await;
        if !self.with_inner(|inner| inner.attach_slice(id)) {
            debug!("{} Slice {} died before opening", self.log_prefix(), id);
            return;
        }

        let (has_ranges, local_only, online, syncable) =
            self.with_inner(|inner| {
                (
                    !inner.accuracy.is_empty(),
                    inner.is_local_only(),
                    inner.online,
                    inner.syncable(),
                )
            });

        if has_ranges || local_only {
            let fill = self.config().sync.initial_fill_size;
            self.with_inner(|inner| {
                inner.with_slice(id, |s, _| s.waiting_on_data = Some("db"))
            });
            let headers = self
                .messages_in_date_range(
                    Utc.timestamp0(),
                    None,
                    Some(fill),
                    Some(fill),
                )
                .await;
            debug!(
                "{} Opening slice {} with {} headers from the database",
                self.log_prefix(),
                id,
                headers.len()
            );

            self.with_inner(|inner| {
                inner.with_slice(id, |s, view| {
                    if !headers.is_empty() {
                        s.batch_append_headers(view, headers, None, true);
                        s.desired = s.headers.len();
                    }
                })
            });

            if online && syncable && !local_only {
                self.with_inner(|inner| inner.cur_sync_slice = None);
                self.refresh_locked(id, !force_refresh).await;
            } else {
                self.complete_sync(
                    id,
                    "Open",
                    Ok(SyncCompletion::default()),
                    false,
                );
            }
        } else if !online || local_only {
            self.complete_sync(
                id,
                "Open",
                Ok(SyncCompletion::default()),
                false,
            );
        } else if !syncable {
            self.complete_sync(
                id,
                "Open",
                Ok(SyncCompletion {
                    status: Some(SyncStatus::SyncBlocked),
                    more_expected: true,
                }),
                false,
            );
        } else {
            self.with_inner(|inner| {
                inner.with_slice(id, |s, view| s.update_flags(view))
            });

            let days = self.config().sync.initial_sync_days;
            let result = match self.driver() {
                Some(driver) => {
                    driver.initial_sync(&self.context(id), days).await
                },
                None => Ok(SyncCompletion::default()),
            };
            self.complete_sync(id, "Initial sync", result, false);
        }
    }

    pub(super) async fn grow_slice(
        &self,
        id: u64,
        dir_magnitude: i32,
        user_requested: bool,
    ) {
        if user_requested {
            self.slice_status(
                id,
                SyncStatus::Synchronizing,
                true,
                Some(SYNC_START_MINIMUM_PROGRESS),
            );
        }

        if self.shared.exclusive.is_idle() {
            self.flush_excess_cached_blocks("grow");
        }
        let _ticket = self.lock_unless_local("grow").await;

        let bounds = self.with_inner(|inner| {
            inner.with_slice(id, |s, _| (s.start, s.end))
        });
        let (start, end) = match bounds {
            Some(bounds) => bounds,
            None => {
                debug!(
                    "{} Slice {} died before growing",
                    self.log_prefix(),
                    id
                );
                return;
            },
        };

        let (dir, count) = if dir_magnitude < 0 {
            (Direction::Futurewards, dir_magnitude.unsigned_abs() as usize)
        } else {
            (Direction::Pastwards, dir_magnitude as usize)
        };

        let headers = match dir {
            Direction::Futurewards => match end {
                Some(end) => self.messages_after(end, Some(count)).await,
                None => vec![],
            },
            Direction::Pastwards => {
                self.messages_before(start, Some(count)).await
            },
        };

        let (online, can_grow) =
            self.with_inner(|inner| (inner.online, inner.can_grow_sync()));

        if !headers.is_empty() {
            let interval = if online && can_grow {
                self.grow_refresh_interval(dir, start, end, &headers)
            } else {
                None
            };

            self.with_inner(|inner| {
                inner.with_slice(id, |s, view| {
                    let at = match dir {
                        Direction::Pastwards => None,
                        Direction::Futurewards => Some(0),
                    };
                    s.batch_append_headers(
                        view,
                        headers,
                        at,
                        interval.is_some(),
                    );
                    s.desired = s.desired.max(s.headers.len());
                })
            });

            let (refresh_start, refresh_end) = match interval {
                Some(interval) => interval,
                None => {
                    self.complete_sync(
                        id,
                        "Grow",
                        Ok(SyncCompletion::default()),
                        true,
                    );
                    return;
                },
            };

            if !user_requested {
                self.slice_status(
                    id,
                    SyncStatus::Synchronizing,
                    false,
                    Some(SYNC_START_MINIMUM_PROGRESS),
                );
            }

            let result = match self.driver() {
                Some(driver) => {
                    driver
                        .refresh_sync(
                            &self.context(id),
                            dir,
                            refresh_start,
                            refresh_end,
                            None,
                        )
                        .await
                },
                None => Ok(SyncCompletion::default()),
            };
            self.complete_sync(id, "Grow refresh", result, true);
            return;
        }

        let driver = match self.driver() {
            Some(driver) if online && can_grow && user_requested => driver,
            _ => {
                self.complete_sync(
                    id,
                    "Grow",
                    Ok(SyncCompletion::default()),
                    false,
                );
                return;
            },
        };

        self.with_inner(|inner| {
            inner.cur_sync_slice = Some(id);
            inner.with_slice(id, |s, _| {
                s.waiting_on_data = Some("grow");
                s.desired += count;
            });
        });

        let now = self.now();
        let quantum = self.config().sync.quantum();
        let sync_start = match dir {
            Direction::Pastwards => {
                start.map_or(now, |k| k.date).quantize(quantum)
            },
            Direction::Futurewards => (end.map_or(now, |k| k.date)
                + Duration::days(1))
            .quantize(quantum),
        };
        let days = self.config().sync.initial_sync_growth_days;

        debug!(
            "{} Growing slice {} {:?} from {} by {} days",
            self.log_prefix(),
            id,
            dir,
            sync_start,
            days
        );
        let result = driver
            .grow_sync(&self.context(id), dir, sync_start, days)
            .await;
        self.complete_sync(id, "Grow", result, true);
    }

    /// Determine what needs refreshing after growing a slice from `start`
    /// and `end` (its bounds before growing) by `headers`, all from the
    /// database.
    fn grow_refresh_interval(
        &self,
        dir: Direction,
        start: Option<SortKey>,
        end: Option<SortKey>,
        headers: &[HeaderInfo],
    ) -> Option<(DateTime<Utc>, Option<DateTime<Utc>>)> {
        let config = &self.config().sync;
        let quantum = config.quantum();
        let now = self.now();

        let (start, end, highest) = match dir {
            Direction::Pastwards => {
                let oldest = headers.last()?;
                let from = if self.header_is_oldest_known(Some(oldest.key()))
                {
                    self.oldest_full_sync_date()
                } else {
                    oldest.date - config.search_ambiguity()
                };
                (
                    from,
                    start.map_or(now, |k| k.date) + Duration::days(1),
                    now - config.open_refresh_thresh(),
                )
            },
            Direction::Futurewards => {
                let youngest = headers.first()?;
                (
                    end.map_or(now, |k| k.date),
                    youngest.date + Duration::days(1),
                    now - config.grow_refresh_thresh(),
                )
            },
        };

        let (end, open_ended) = if end > highest {
            (highest, true)
        } else {
            (end.quantize(quantum), false)
        };
        let start = start.quantize(quantum);
        if start >= end {
            return None;
        }

        let (gap_start, gap_end) = self.check_accuracy_coverage_needing_refresh(
            start,
            end,
            config.grow_refresh_thresh(),
        )?;
        if gap_start == gap_end {
            return None;
        }

        let gap_end = if open_ended && gap_end == highest {
            None
        } else {
            Some(gap_end.quantize_up(quantum))
        };
        Some((gap_start, gap_end))
    }

    pub(super) async fn refresh_slice(&self, id: u64) {
        self.slice_status(id, SyncStatus::Synchronizing, true, Some(0.0));
        let _ticket = self.lock_unless_local("refresh").await;
        self.refresh_locked(id, false).await;
    }

    /// Refresh the range covered by slice `id`. If `check_coverage`, nothing
    /// is fetched when the range was synchronised recently enough.
    async fn refresh_locked(&self, id: u64, check_coverage: bool) {
        let bounds = self.with_inner(|inner| {
            inner.with_slice(id, |s, _| {
                s.waiting_on_data = Some("refresh");
                (s.start, s.end)
            })
        });
        let (start, end) = match bounds {
            Some(bounds) => bounds,
            None => {
                warn!(
                    "{} Attempted to refresh dead slice {}",
                    self.log_prefix(),
                    id
                );
                return;
            },
        };

        let config = &self.config().sync;
        let quantum = config.quantum();
        let now = self.now();

        // A slice showing the newest message refreshes through now, and
        // counts what turns up as new email.
        let through_now = end.is_none() || self.header_is_youngest_known(end);
        let end_ts = match end {
            Some(end) if !through_now => {
                Some((end.date + Duration::days(1)).quantize(quantum))
            },
            _ => None,
        };

        let mut orig_start = None;
        let start_date = start.map_or(now, |k| k.date);
        let start_ts = if self.header_is_oldest_known(start) {
            orig_start = Some(start_date.quantize(quantum));
            self.oldest_full_sync_date()
        } else {
            start_date - config.search_ambiguity()
        };
        let start_ts = start_ts.quantize(quantum);

        if check_coverage {
            let check_end =
                end_ts.unwrap_or_else(|| now - config.open_refresh_thresh());
            let fresh = start_ts >= check_end
                || self
                    .check_accuracy_coverage_needing_refresh(
                        start_ts,
                        check_end,
                        config.open_refresh_thresh(),
                    )
                    .is_none();
            if fresh {
                debug!(
                    "{} Slice {} is fresh, skipping refresh",
                    self.log_prefix(),
                    id
                );
                self.complete_sync(
                    id,
                    "Refresh",
                    Ok(SyncCompletion::default()),
                    false,
                );
                return;
            }
        }

        if through_now {
            self.with_inner(|inner| {
                inner.with_slice(id, |s, _| {
                    s.new_email = Some(NewEmailTracker::new(end))
                })
            });
        }

        let result = match self.driver() {
            Some(driver) => {
                driver
                    .refresh_sync(
                        &self.context(id),
                        Direction::Futurewards,
                        start_ts,
                        end_ts,
                        orig_start,
                    )
                    .await
            },
            None => Ok(SyncCompletion::default()),
        };
        self.complete_sync(id, "Refresh", result, false);
    }

    /// Empty every attached slice and open each afresh, e.g. after the
    /// folder's contents were invalidated on the server.
    pub async fn reset_and_refresh_active_slices(&self) {
        let fill = self.config().sync.initial_fill_size;
        let ids = self.with_inner(|inner| {
            let mut ids = Vec::new();
            for slice in inner.slices.iter_mut().rev().filter(|s| s.attached)
            {
                slice.desired = fill;
                slice.reset();
                slice.attached = false;
                ids.push(slice.id);
            }
            ids
        });

        for id in ids {
            self.slice_open_most_recent(id, true).await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;
    use crate::store::slice::{MailSlice, SliceEvent};
    use crate::store::test_support::*;

    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 24 * HOUR;

    fn online_store() -> (FolderStore, Rc<FakeDriver>) {
        let (store, _) = memory_store(FolderType::Inbox);
        store.set_clock(|| Utc.millisx(100 * DAY));
        store.set_online(true);
        let driver = Rc::new(FakeDriver::new());
        store.set_sync_driver(driver.clone());
        (store, driver)
    }

    fn ids(slice: &MailSlice) -> Vec<u32> {
        slice.headers().iter().map(|h| h.id.0).collect()
    }

    fn final_status(
        status: SyncStatus,
        more_expected: bool,
        new_email_count: Option<u32>,
    ) -> SliceEvent {
        SliceEvent::Status {
            status,
            requested: true,
            more_expected,
            progress: None,
            new_email_count,
        }
    }

    fn splices(events: &[SliceEvent]) -> Vec<(usize, usize, Vec<u32>)> {
        events
            .iter()
            .filter_map(|e| match *e {
                SliceEvent::Splice {
                    index,
                    removed,
                    ref inserted,
                    ..
                } => Some((
                    index,
                    removed,
                    inserted.iter().map(|h| h.id.0).collect(),
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn initial_sync_fills_slice() {
        run(async {
            let (store, driver) = online_store();
            let folder = store.folder_id().clone();
            *driver.server_headers.borrow_mut() = vec![
                header(&folder, 100 * DAY - 2 * HOUR, 2),
                header(&folder, 100 * DAY - HOUR, 1),
                header(&folder, 98 * DAY, 3),
            ];

            let (slice, mut rx) = store.create_slice();
            slice.open(false).await;

            assert_eq!(vec![DriverCall::Initial(3)], driver.take_calls());
            assert_eq!(vec![1, 2, 3], ids(&slice));
            let events = drain(&mut rx);
            assert!(events.contains(&SliceEvent::Progress(0.5)));
            assert_eq!(
                Some(&final_status(SyncStatus::Synced, false, None)),
                events.last()
            );
            assert_eq!(
                Some(Utc.millisx(100 * DAY)),
                store.newest_full_sync_date()
            );
        });
    }

    #[test]
    fn progress_is_clamped() {
        run(async {
            let (store, _) = online_store();
            let (slice, mut rx) = store.create_slice();
            drain(&mut rx);

            let ctx = store.context(slice.id());
            ctx.progress(1.5);
            ctx.progress(-0.25);
            ctx.progress(0.75);
            assert_eq!(
                vec![
                    SliceEvent::Progress(1.0),
                    SliceEvent::Progress(0.0),
                    SliceEvent::Progress(0.75),
                ],
                drain(&mut rx)
            );
        });
    }

    #[test]
    fn fresh_open_skips_refresh() {
        run(async {
            let (store, driver) = online_store();
            let folder = store.folder_id().clone();
            store
                .mark_sync_range(
                    Utc.millisx(97 * DAY),
                    None,
                    None,
                    Utc.millisx(100 * DAY),
                )
                .unwrap();
            store
                .add_message_header(
                    header(&folder, 100 * DAY - 2 * HOUR, 1),
                    None,
                )
                .await
                .unwrap();
            store
                .add_message_header(header(&folder, 100 * DAY - HOUR, 2), None)
                .await
                .unwrap();

            let (slice, mut rx) = store.create_slice();
            slice.open(false).await;
            assert!(driver.take_calls().is_empty());
            assert_eq!(vec![2, 1], ids(&slice));
            assert_eq!(
                Some(&final_status(SyncStatus::Synced, false, None)),
                drain(&mut rx).last()
            );

            let mut seen = header(&folder, 100 * DAY - 20 * 60_000, 4);
            seen.flags.push(Flag::Seen);
            *driver.server_headers.borrow_mut() =
                vec![header(&folder, 100 * DAY - 30 * 60_000, 3), seen];
            slice.refresh().await;

            assert_eq!(
                vec![DriverCall::Refresh {
                    dir: Direction::Futurewards,
                    start: Utc.millisx(97 * DAY),
                    end: None,
                    orig_start: Some(Utc.millisx(99 * DAY)),
                }],
                driver.take_calls()
            );
            assert_eq!(vec![4, 3, 2, 1], ids(&slice));

            let events = drain(&mut rx);
            assert_eq!(
                Some(&SliceEvent::Status {
                    status: SyncStatus::Synchronizing,
                    requested: true,
                    more_expected: true,
                    progress: Some(0.0),
                    new_email_count: None,
                }),
                events.first()
            );
            // Only the unseen message counts as new
            assert_eq!(
                Some(&final_status(SyncStatus::Synced, false, Some(1))),
                events.last()
            );
        });
    }

    #[test]
    fn forced_open_refreshes() {
        run(async {
            let (store, driver) = online_store();
            let folder = store.folder_id().clone();
            store
                .mark_sync_range(
                    Utc.millisx(97 * DAY),
                    None,
                    None,
                    Utc.millisx(100 * DAY),
                )
                .unwrap();
            store
                .add_message_header(header(&folder, 98 * DAY, 1), None)
                .await
                .unwrap();

            let (slice, _rx) = store.create_slice();
            slice.open(true).await;
            assert_eq!(
                vec![DriverCall::Refresh {
                    dir: Direction::Futurewards,
                    start: Utc.millisx(97 * DAY),
                    end: None,
                    orig_start: Some(Utc.millisx(98 * DAY)),
                }],
                driver.take_calls()
            );
        });
    }

    #[test]
    fn grow_from_database() {
        run(async {
            let (store, _) = memory_store(FolderType::Inbox);
            let folder = store.folder_id().clone();
            store.set_clock(|| Utc.millisx(100 * DAY));
            store
                .mark_sync_range(
                    Utc.millisx(0),
                    None,
                    None,
                    Utc.millisx(100 * DAY),
                )
                .unwrap();
            for id in 1..=30u32 {
                store
                    .add_message_header(
                        header(&folder, i64::from(id) * HOUR, id),
                        None,
                    )
                    .await
                    .unwrap();
            }

            let (slice, mut rx) = store.create_slice();
            slice.open(false).await;
            assert_eq!((16..=30).rev().collect::<Vec<_>>(), ids(&slice));
            assert!(!slice.flags().at_bottom);
            drain(&mut rx);

            slice.grow(1, false).await;
            assert_eq!((1..=30).rev().collect::<Vec<_>>(), ids(&slice));
            assert_eq!(30, slice.desired_headers());
            assert!(slice.flags().at_bottom);
            let events = drain(&mut rx);
            assert_eq!(
                vec![(15, 0, (1..=15).rev().collect::<Vec<_>>())],
                splices(&events)
            );
            assert_eq!(
                Some(&final_status(SyncStatus::Synced, false, None)),
                events.last()
            );

            // Already at the top, nothing newer to find
            slice.grow(-1, false).await;
            assert_eq!(30, slice.headers().len());
            assert!(splices(&drain(&mut rx)).is_empty());
        });
    }

    #[test]
    fn user_grow_asks_server() {
        run(async {
            let (store, driver) = online_store();
            let folder = store.folder_id().clone();
            store
                .mark_sync_range(
                    Utc.millisx(97 * DAY),
                    None,
                    None,
                    Utc.millisx(100 * DAY),
                )
                .unwrap();
            store
                .add_message_header(header(&folder, 100 * DAY - HOUR, 1), None)
                .await
                .unwrap();
            store
                .add_message_header(
                    header(&folder, 100 * DAY - 2 * HOUR, 2),
                    None,
                )
                .await
                .unwrap();

            let (slice, mut rx) = store.create_slice();
            slice.open(false).await;
            assert!(driver.take_calls().is_empty());
            drain(&mut rx);

            // Growing without the user asking never goes to the server
            slice.grow(1, false).await;
            assert!(driver.take_calls().is_empty());

            *driver.server_headers.borrow_mut() =
                vec![header(&folder, 98 * DAY, 3)];
            slice.grow(1, true).await;
            assert_eq!(
                vec![DriverCall::Grow {
                    dir: Direction::Pastwards,
                    start: Utc.millisx(99 * DAY),
                    days: 3,
                }],
                driver.take_calls()
            );
            assert_eq!(vec![1, 2, 3], ids(&slice));
            assert_eq!(3, slice.desired_headers());
            assert_eq!(
                Some(&final_status(SyncStatus::Synced, false, None)),
                drain(&mut rx).last()
            );
        });
    }

    #[test]
    fn failed_sync_reports_failure() {
        run(async {
            let (store, driver) = online_store();
            driver.fail.set(true);

            let (slice, mut rx) = store.create_slice();
            slice.open(false).await;
            assert_eq!(vec![DriverCall::Initial(3)], driver.take_calls());
            assert_eq!(
                Some(&final_status(SyncStatus::SyncFailed, false, None)),
                drain(&mut rx).last()
            );
            assert!(slice.headers().is_empty());
        });
    }

    #[test]
    fn unsyncable_folder_is_blocked() {
        run(async {
            let (store, driver) = online_store();
            driver.syncable.set(false);

            let (slice, mut rx) = store.create_slice();
            slice.open(false).await;
            assert!(driver.take_calls().is_empty());
            assert_eq!(
                Some(&final_status(SyncStatus::SyncBlocked, true, None)),
                drain(&mut rx).last()
            );
        });
    }

    #[test]
    fn local_folder_opens_without_lock() {
        run(async {
            let (store, _) = memory_store(FolderType::Outbox);
            let folder = store.folder_id().clone();
            store.set_online(true);
            let driver = Rc::new(FakeDriver::new());
            store.set_sync_driver(driver.clone());
            store
                .add_message_header(header(&folder, 1000, 1), None)
                .await
                .unwrap();

            let busy = store.acquire_exclusive("busy").await;
            let (slice, mut rx) = store.create_slice();
            slice.open(false).await;
            assert_eq!(vec![1], ids(&slice));
            assert_eq!(
                Some(&final_status(SyncStatus::Synced, false, None)),
                drain(&mut rx).last()
            );
            busy.release(None);
            assert!(driver.take_calls().is_empty());
        });
    }

    #[test]
    fn reset_reopens_attached_slices() {
        run(async {
            let (store, _) = memory_store(FolderType::Inbox);
            let folder = store.folder_id().clone();
            store
                .mark_sync_range(
                    Utc.millisx(0),
                    Some(Utc.millisx(1)),
                    None,
                    Utc.millisx(1),
                )
                .unwrap();
            for id in 1..=3u32 {
                store
                    .add_message_header(
                        header(&folder, i64::from(id) * 1000, id),
                        None,
                    )
                    .await
                    .unwrap();
            }

            let (slice, mut rx) = store.create_slice();
            slice.open(false).await;
            drain(&mut rx);

            store.reset_and_refresh_active_slices().await;
            assert_eq!(
                vec![(0, 3, vec![]), (0, 0, vec![3, 2, 1])],
                splices(&drain(&mut rx))
            );
            assert_eq!(vec![3, 2, 1], ids(&slice));
            assert_eq!(1, store.attached_slice_count());
        });
    }
}
