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

//! Removal of old messages from a folder.

use chrono::prelude::*;
use chrono::Duration;
use log::{debug, info};

use super::folder::FolderStore;
use super::model::*;
use crate::support::chronox::*;
use crate::support::error::Error;

/// What a purge did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Everything older than this was removed. `None` if nothing needed
    /// purging.
    pub cut: Option<DateTime<Utc>>,
    pub deleted: usize,
}

impl FolderStore {
    /// Delete messages which are either too old to be kept up to date or
    /// beyond the hard block limit, along with the accuracy ranges covering
    /// them.
    pub async fn purge_excess_messages(&self) -> Result<PurgeOutcome, Error> {
        let _gate = self.shared.loads.enter().await;
        let result = self.purge_locked().await;
        self.with_inner(|inner| inner.purge_scheduled = false);
        result
    }

    async fn purge_locked(&self) -> Result<PurgeOutcome, Error> {
        let purge = &self.config().purge;
        let cut = self.with_inner(|inner| {
            let limit = purge.hard_max_block_limit;
            [
                inner.accuracy.last_access_cut_point(
                    inner.now(),
                    purge.staleness(),
                    purge.sync_range(),
                ),
                inner.headers.infos().get(limit).map(|i| i.start.date),
                inner.bodies.infos().get(limit).map(|i| i.start.date),
            ]
            .iter()
            .flatten()
            .max()
            .copied()
        });

        let cut = match cut {
            Some(cut) => cut,
            None => {
                debug!("{} Nothing to purge", self.log_prefix());
                return Ok(PurgeOutcome::default());
            },
        };

        let quantum = self.config().sync.quantum();
        let cut = (cut + Duration::days(1)).quantize(quantum);
        self.with_inner(|inner| {
            inner.accuracy.truncate_before(cut);
            inner.dirty = true;
        });

        let mut deleted = 0;
        loop {
            let last =
                self.shared.inner.borrow().headers.infos().last().cloned();
            let block_id = match last {
                Some(info) => info.block_id,
                None => break,
            };

            if !self.make_resident::<HeaderInfo>(block_id).await {
                return Err(Error::BlockUnavailable(
                    BlockKind::Header,
                    block_id.0,
                ));
            }

            let oldest = self
                .shared
                .inner
                .borrow()
                .headers
                .block(block_id)
                .and_then(|block| block.entries.last().cloned());
            let oldest = match oldest {
                Some(oldest) if oldest.date < cut => oldest,
                _ => break,
            };

            self.delete_message_header_and_body_locked(&oldest).await?;
            deleted += 1;
        }

        info!(
            "{} Purged {} messages older than {}",
            self.log_prefix(),
            deleted,
            cut
        );
        Ok(PurgeOutcome {
            cut: Some(cut),
            deleted,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::test_support::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn purge_stale_ranges() {
        run(async {
            let (store, _) = memory_store(FolderType::Inbox);
            let folder = store.folder_id().clone();
            store.set_clock(|| Utc.millisx(100 * DAY));

            store
                .mark_sync_range(
                    Utc.millisx(10 * DAY),
                    Some(Utc.millisx(40 * DAY)),
                    None,
                    Utc.millisx(50 * DAY),
                )
                .unwrap();
            store
                .mark_sync_range(
                    Utc.millisx(41 * DAY),
                    Some(Utc.millisx(100 * DAY)),
                    None,
                    Utc.millisx(99 * DAY),
                )
                .unwrap();

            let days = [20, 30, 39, 40, 50, 60];
            for (id, day) in days.into_iter().enumerate() {
                store
                    .add_message_header(
                        header(&folder, day * DAY, id as u32),
                        None,
                    )
                    .await
                    .unwrap();
            }

            let outcome = store.purge_excess_messages().await.unwrap();
            assert_eq!(
                PurgeOutcome {
                    cut: Some(Utc.millisx(41 * DAY)),
                    deleted: 4,
                },
                outcome
            );
            assert_eq!(2, store.known_message_count());
            assert_eq!(
                Some(Utc.millisx(50 * DAY)),
                store.oldest_message_timestamp()
            );
            assert!(store
                .shared
                .inner
                .borrow()
                .accuracy
                .ranges()
                .iter()
                .all(|r| r.start_ts >= Utc.millisx(41 * DAY)));
            assert!(!store.shared.inner.borrow().purge_scheduled);
        });
    }

    #[test]
    fn purge_beyond_block_limit() {
        run(async {
            let mut config = test_config();
            config.purge.hard_max_block_limit = 1;
            let (store, _) = memory_store_with(FolderType::Inbox, config);
            let folder = store.folder_id().clone();
            store.set_clock(|| Utc.millisx(100 * DAY));

            for day in 1..=30i64 {
                store
                    .add_message_header(
                        header(&folder, day * DAY, day as u32),
                        None,
                    )
                    .await
                    .unwrap();
            }

            let infos = store.shared.inner.borrow().headers.infos().to_vec();
            assert!(infos.len() > 1);
            let expected = (infos[1].start.date + Duration::days(1))
                .quantize(Duration::days(1));
            let older = (1..=30i64)
                .filter(|&day| Utc.millisx(day * DAY) < expected)
                .count();

            let outcome = store.purge_excess_messages().await.unwrap();
            assert_eq!(Some(expected), outcome.cut);
            assert_eq!(older, outcome.deleted);
            assert_eq!(30 - older as u64, store.known_message_count());
            assert!(store
                .oldest_message_timestamp()
                .map_or(true, |oldest| oldest >= expected));
        });
    }

    #[test]
    fn nothing_to_purge() {
        run(async {
            let (store, _) = memory_store(FolderType::Inbox);
            let folder = store.folder_id().clone();
            store.set_clock(|| Utc.millisx(100 * DAY));
            store
                .mark_sync_range(
                    Utc.millisx(90 * DAY),
                    None,
                    None,
                    Utc.millisx(100 * DAY),
                )
                .unwrap();
            store
                .add_message_header(header(&folder, 95 * DAY, 1), None)
                .await
                .unwrap();

            let outcome = store.purge_excess_messages().await.unwrap();
            assert_eq!(PurgeOutcome::default(), outcome);
            assert_eq!(1, store.known_message_count());
        });
    }
}
