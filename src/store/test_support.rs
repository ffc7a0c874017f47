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

//! Fixtures shared by the store tests.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Poll;

use async_trait::async_trait;
use chrono::prelude::*;
use chrono::Duration;

use super::folder::FolderStore;
use super::model::*;
use super::persistence::MemoryPersistence;
use super::slice::{SliceEvent, SliceEvents};
use super::sync::{Direction, SyncCompletion, SyncContext, SyncDriver};
use crate::support::chronox::*;
use crate::support::error::Error;
use crate::support::store_config::StoreConfig;

/// Run `fut` to completion on a single-threaded runtime inside a
/// `LocalSet`, so that it may spawn `!Send` tasks.
pub fn run<F: Future>(fut: F) -> F::Output {
    crate::init_test_log();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    tokio::task::LocalSet::new().block_on(&rt, fut)
}

/// A configuration with small blocks, so that tests see splits quickly.
pub fn test_config() -> StoreConfig {
    let mut config = StoreConfig::default();
    config.blocks.max_block_size = 1500;
    config.blocks.split_small_part = 500;
    config.blocks.split_equal_part = 750;
    config.blocks.split_large_part = 1000;
    config.cache.flush_excess_delay_ms = 0;
    config
}

pub fn header(folder: &FolderId, date_ms: i64, id: u32) -> HeaderInfo {
    HeaderInfo {
        id: MessageId(id),
        server_id: None,
        suid: Suid::new(folder.clone(), MessageId(id)),
        guid: None,
        author: Address::default(),
        date: Utc.millisx(date_ms),
        flags: vec![],
        has_attachments: false,
        subject: None,
        snippet: Snippet::default(),
    }
}

pub fn memory_store(
    folder_type: FolderType,
) -> (FolderStore, Rc<MemoryPersistence>) {
    memory_store_with(folder_type, test_config())
}

pub fn memory_store_with(
    folder_type: FolderType,
    config: StoreConfig,
) -> (FolderStore, Rc<MemoryPersistence>) {
    let persistence = Rc::new(MemoryPersistence::new());
    let state = FolderState::new(
        FolderMeta::new(FolderId::new("acct", "0"), "Folder", folder_type),
        true,
    );
    let store = FolderStore::new(state, persistence.clone(), config);
    (store, persistence)
}

/// Poll `fut` exactly once, returning whether it completed.
pub async fn poll_once<F: Future>(mut fut: Pin<&mut F>) -> bool {
    std::future::poll_fn(|cx| Poll::Ready(fut.as_mut().poll(cx).is_ready()))
        .await
}

/// Take every event queued for a slice.
pub fn drain(rx: &mut SliceEvents) -> Vec<SliceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    Initial(u32),
    Refresh {
        dir: Direction,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        orig_start: Option<DateTime<Utc>>,
    },
    Grow {
        dir: Direction,
        start: DateTime<Utc>,
        days: u32,
    },
    AllConsumersDead,
    Shutdown,
}

/// A sync driver whose "server" is a list of headers handed out by the next
/// synchronisation.
pub struct FakeDriver {
    calls: RefCell<Vec<DriverCall>>,
    pub syncable: Cell<bool>,
    pub can_grow: Cell<bool>,
    pub fail: Cell<bool>,
    pub server_headers: RefCell<Vec<HeaderInfo>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            syncable: Cell::new(true),
            can_grow: Cell::new(true),
            fail: Cell::new(false),
            server_headers: RefCell::new(Vec::new()),
        }
    }

    pub fn take_calls(&self) -> Vec<DriverCall> {
        mem::take(&mut *self.calls.borrow_mut())
    }

    fn record(&self, call: DriverCall) {
        self.calls.borrow_mut().push(call);
    }

    async fn deliver(
        &self,
        ctx: &SyncContext,
        mode: &'static str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<SyncCompletion, Error> {
        ctx.begin(mode, false);
        if self.fail.get() {
            return Err(Error::Sync("server unreachable".to_owned()));
        }

        let headers = mem::take(&mut *self.server_headers.borrow_mut());
        for header in headers {
            ctx.store().add_message_header(header, None).await?;
        }
        ctx.progress(0.5);

        let now = ctx.store().now();
        ctx.store().mark_sync_range(start, end, None, now)?;
        Ok(SyncCompletion::default())
    }
}

#[async_trait(?Send)]
impl SyncDriver for FakeDriver {
    fn syncable(&self) -> bool {
        self.syncable.get()
    }

    fn can_grow_sync(&self) -> bool {
        self.can_grow.get()
    }

    async fn initial_sync(
        &self,
        ctx: &SyncContext,
        days: u32,
    ) -> Result<SyncCompletion, Error> {
        self.record(DriverCall::Initial(days));
        let start = ctx.store().now() - Duration::days(days.into());
        self.deliver(ctx, "initial", start, None).await
    }

    async fn refresh_sync(
        &self,
        ctx: &SyncContext,
        dir: Direction,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        orig_start: Option<DateTime<Utc>>,
    ) -> Result<SyncCompletion, Error> {
        self.record(DriverCall::Refresh {
            dir,
            start,
            end,
            orig_start,
        });
        self.deliver(ctx, "refresh", start, end).await
    }

    async fn grow_sync(
        &self,
        ctx: &SyncContext,
        dir: Direction,
        start: DateTime<Utc>,
        days: u32,
    ) -> Result<SyncCompletion, Error> {
        self.record(DriverCall::Grow { dir, start, days });
        let span = Duration::days(days.into());
        let (start, end) = match dir {
            Direction::Pastwards => (start - span, start),
            Direction::Futurewards => (start, start + span),
        };
        self.deliver(ctx, "grow", start, Some(end)).await
    }

    fn all_consumers_dead(&self) {
        self.record(DriverCall::AllConsumersDead);
    }

    fn shutdown(&self) {
        self.record(DriverCall::Shutdown);
    }
}
