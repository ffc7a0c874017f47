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

//! Coalescing of block loads, and the gate which holds data calls back until
//! outstanding loads have resolved.
//!
//! Calls which touch block data are serialised through a fair lock, and each
//! one, on acquiring the lock, additionally waits for every in-flight load to
//! finish. This gives the calls a stable view of the cache and means they
//! observe each other's effects in the order they were made. Reads of
//! headers and date ranges do not go through the gate.

use std::cell::RefCell;
use std::collections::HashMap;

use log::warn;
use tokio::sync::{oneshot, Mutex, MutexGuard, Notify};

use super::model::{BlockId, BlockKind};

#[derive(Default)]
pub struct LoadTracker {
    pending: RefCell<HashMap<(BlockKind, BlockId), Vec<oneshot::Sender<bool>>>>,
    idle: Notify,
    gate: Mutex<()>,
}

/// How a caller wanting a block loaded should proceed.
pub enum LoadRole<'a> {
    /// The caller must perform the load and then `finish` the guard.
    Lead(LoadGuard<'a>),
    /// Another caller is already loading the block. The receiver yields
    /// whether that load succeeded.
    Follow(oneshot::Receiver<bool>),
}

/// Held by the one caller actually loading a block.
///
/// Dropping the guard without calling `finish` reports failure to everyone
/// waiting on the load.
pub struct LoadGuard<'a> {
    tracker: &'a LoadTracker,
    key: (BlockKind, BlockId),
    done: bool,
}

/// Proof that the holder has passed the gate.
pub type GateGuard<'a> = MutexGuard<'a, ()>;

impl LoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in loading the given block.
    pub fn begin_load(
        &self,
        kind: BlockKind,
        block_id: BlockId,
    ) -> LoadRole<'_> {
        let key = (kind, block_id);
        let mut pending = self.pending.borrow_mut();
        if let Some(listeners) = pending.get_mut(&key) {
            let (tx, rx) = oneshot::channel();
            listeners.push(tx);
            return LoadRole::Follow(rx);
        }

        pending.insert(key, Vec::new());
        LoadRole::Lead(LoadGuard {
            tracker: self,
            key,
            done: false,
        })
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Wait until no load is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.has_pending() {
                return;
            }

            notified.await;
        }
    }

    /// Pass through the gate.
    ///
    /// Callers are admitted one at a time in the order they arrived, and only
    /// once no load is pending.
    pub async fn enter(&self) -> GateGuard<'_> {
        let guard = self.gate.lock().await;
        self.wait_idle().await;
        guard
    }

    fn complete(&self, key: (BlockKind, BlockId), success: bool) {
        let (listeners, now_idle) = {
            let mut pending = self.pending.borrow_mut();
            let listeners = pending.remove(&key).unwrap_or_default();
            (listeners, pending.is_empty())
        };

        for listener in listeners {
            // The waiter may have been cancelled, which is fine
            let _ = listener.send(success);
        }

        if now_idle {
            self.idle.notify_waiters();
        }
    }
}

impl LoadGuard<'_> {
    pub fn finish(mut self, success: bool) {
        self.done = true;
        self.tracker.complete(self.key, success);
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            warn!("{} block {} load abandoned", self.key.0, self.key.1);
            self.tracker.complete(self.key, false);
        }
    }
}
