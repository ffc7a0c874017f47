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

use std::fs;
use std::path::Path;

use chrono::prelude::*;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::support::chronox::NaiveDateX;
use crate::support::error::Error;

/// Tunables for the folder stores of one account.
///
/// This is typically stored in a file named `mailstore.toml` next to the
/// account's data. Every section is optional; the defaults are what a mobile
/// client syncing over IMAP would want.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    /// How headers and bodies are partitioned into blocks.
    #[serde(default)]
    pub blocks: BlockConfig,

    /// When old messages are discarded from local storage.
    #[serde(default)]
    pub purge: PurgeConfig,

    /// Parameters of slice filling and synchronisation windows.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Block cache management.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl StoreConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let data = fs::read_to_string(path)?;
        Self::from_toml_str(&data)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BlockConfig {
    /// The estimated byte size at which a block with more than one entry is
    /// split.
    pub max_block_size: u32,
    /// Bytes kept in the newer half when splitting the newest block.
    ///
    /// New messages usually arrive at the young end, so this leaves most of
    /// the room there.
    pub split_small_part: u32,
    /// Bytes kept in the newer half when splitting an interior block.
    pub split_equal_part: u32,
    /// Bytes kept in the newer half when splitting the oldest block.
    pub split_large_part: u32,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            max_block_size: 96 * 1024,
            split_small_part: 32 * 1024,
            split_equal_part: 48 * 1024,
            split_large_part: 64 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PurgeConfig {
    /// Time ranges which have not been synchronised for this many days are
    /// eligible for purging.
    pub only_after_unsynced_days: u32,
    /// If a folder has more header or body blocks than this, everything
    /// older than the block at this index is purged regardless of access
    /// time.
    pub hard_max_block_limit: usize,
    /// A purge is requested every time this many body blocks have been
    /// allocated.
    pub every_n_new_body_blocks: u32,
    /// The number of days the account is configured to keep synchronised.
    /// Nothing inside this horizon is purged because of access time.
    pub sync_range_days: u32,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            only_after_unsynced_days: 14,
            hard_max_block_limit: 1024,
            every_n_new_body_blocks: 32,
            sync_range_days: 30,
        }
    }
}

impl PurgeConfig {
    pub fn staleness(&self) -> Duration {
        Duration::days(self.only_after_unsynced_days.into())
    }

    pub fn sync_range(&self) -> Duration {
        Duration::days(self.sync_range_days.into())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// The number of headers a fresh slice asks for, and the magnitude of a
    /// unit growth request.
    pub initial_fill_size: usize,
    /// The number of messages returned by an unbounded range query.
    pub too_many_messages: usize,
    /// The number of days covered by the first synchronisation of a folder.
    pub initial_sync_days: u32,
    /// The number of days covered by each step of growing into the past.
    pub initial_sync_growth_days: u32,
    /// How fresh synchronised data must be to skip the refresh on slice
    /// open.
    pub open_refresh_thresh_secs: i64,
    /// How fresh synchronised data must be to skip the refresh when growing
    /// a slice.
    pub grow_refresh_thresh_secs: i64,
    /// Padding applied around known messages when refreshing, since server
    /// date searches are only accurate to the day.
    pub search_ambiguity_secs: i64,
    /// The granularity onto which synchronisation and purge boundaries are
    /// aligned.
    pub quantum_secs: i64,
    /// The oldest date any synchronisation reaches back to.
    pub oldest_sync_date: NaiveDate,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_fill_size: 15,
            too_many_messages: 2000,
            initial_sync_days: 3,
            initial_sync_growth_days: 3,
            open_refresh_thresh_secs: 10 * 60,
            grow_refresh_thresh_secs: 60 * 60,
            search_ambiguity_secs: 24 * 60 * 60,
            quantum_secs: 24 * 60 * 60,
            oldest_sync_date: NaiveDate::from_ymdx(1990, 1, 1),
        }
    }
}

impl SyncConfig {
    pub fn open_refresh_thresh(&self) -> Duration {
        Duration::seconds(self.open_refresh_thresh_secs)
    }

    pub fn grow_refresh_thresh(&self) -> Duration {
        Duration::seconds(self.grow_refresh_thresh_secs)
    }

    pub fn search_ambiguity(&self) -> Duration {
        Duration::seconds(self.search_ambiguity_secs)
    }

    pub fn quantum(&self) -> Duration {
        Duration::seconds(self.quantum_secs)
    }

    pub fn oldest_sync_date(&self) -> DateTime<Utc> {
        self.oldest_sync_date.and_hmsx_utc(0, 0, 0)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long after a block load the cache is trimmed if no exclusive
    /// operation is pending. 0 disables the timer.
    pub flush_excess_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            flush_excess_delay_ms: 5000,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(96 * 1024, config.blocks.max_block_size);
        assert_eq!(1024, config.purge.hard_max_block_limit);
        assert_eq!(15, config.sync.initial_fill_size);
        assert_eq!(Duration::days(1), config.sync.quantum());
        assert_eq!(
            NaiveDate::from_ymdx(1990, 1, 1).and_hmsx_utc(0, 0, 0),
            config.sync.oldest_sync_date()
        );
        assert_eq!(5000, config.cache.flush_excess_delay_ms);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = StoreConfig::from_toml_str(
            r#"
[blocks]
max_block_size = 4096

[sync]
quantum_secs = 3600
oldest_sync_date = "2000-02-03"

[purge]
sync_range_days = 7
"#,
        )
        .unwrap();

        assert_eq!(4096, config.blocks.max_block_size);
        assert_eq!(32 * 1024, config.blocks.split_small_part);
        assert_eq!(Duration::hours(1), config.sync.quantum());
        assert_eq!(
            NaiveDate::from_ymdx(2000, 2, 3),
            config.sync.oldest_sync_date
        );
        assert_eq!(Duration::days(7), config.purge.sync_range());
        assert_eq!(14, config.purge.only_after_unsynced_days);
    }

    #[test]
    fn bad_config_is_an_error() {
        assert_matches!(
            Err(Error::Config(..)),
            StoreConfig::from_toml_str("[blocks]\nmax_block_size = \"big\"")
        );
    }
}
