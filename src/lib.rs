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

//! Offline message storage for a single mail account's folders.
//!
//! Each synchronised folder is backed by a `FolderStore`, which keeps the
//! folder's headers and bodies in size-bounded, time-ordered blocks that are
//! loaded on demand through a `Persistence` implementation, and feeds ordered
//! window views (`MailSlice`) to a UI layer.
//!
//! Everything here is single-threaded: a `FolderStore` is `!Send` and its
//! futures are expected to be driven from a tokio `LocalSet`.

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

pub mod store;
pub mod support;

pub use store::folder::{Clock, FolderEvent, FolderStore, UpdateOptions};
pub use store::mutex::ExclusiveTicket;
pub use store::purge::PurgeOutcome;
pub use store::model::*;
pub use store::persistence::{
    DirPersistence, MemoryPersistence, Persistence, PersistenceInfo,
};
pub use store::slice::{MailSlice, SliceEvent, SliceEvents, SliceFlags};
pub use store::sync::{
    Direction, SyncCompletion, SyncContext, SyncDriver, SyncStatus,
};
pub use support::error::Error;
pub use support::store_config::StoreConfig;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}][{}] {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    message,
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stderr())
            .apply()
            .unwrap();
    })
}
