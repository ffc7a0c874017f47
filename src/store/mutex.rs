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

//! The per-folder queue of exclusive operations.
//!
//! Synchronisation passes, slice opens and growth each run as one exclusive
//! operation, so that two of them never interleave their mutations.
//! Operations are admitted strictly in submission order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use log::{debug, error};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::folder::FolderStore;
use crate::support::error::Error;

pub(super) struct ExclusiveQueue {
    lock: Arc<Mutex<()>>,
    /// Every operation holding or waiting for the lock, head first.
    labels: RefCell<VecDeque<(u64, &'static str)>>,
    next_seq: Cell<u64>,
}

impl ExclusiveQueue {
    pub(super) fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            labels: RefCell::new(VecDeque::new()),
            next_seq: Cell::new(0),
        }
    }

    /// Whether no operation is running or waiting.
    pub(super) fn is_idle(&self) -> bool {
        self.labels.borrow().is_empty()
    }

    pub(super) fn len(&self) -> usize {
        self.labels.borrow().len()
    }

    pub(super) fn labels(&self) -> Vec<&'static str> {
        self.labels.borrow().iter().map(|&(_, l)| l).collect()
    }

    fn remove(&self, seq: u64) {
        self.labels.borrow_mut().retain(|&(s, _)| s != seq);
    }
}

/// Removes the label of a waiter cancelled before its turn.
struct QueuedWaiter<'a> {
    queue: &'a ExclusiveQueue,
    seq: u64,
    admitted: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if !self.admitted {
            self.queue.remove(self.seq);
        }
    }
}

/// The right to run one exclusive operation on a folder.
///
/// The ticket is consumed by `release`; dropping it releases it as well.
pub struct ExclusiveTicket {
    store: FolderStore,
    seq: u64,
    label: &'static str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ExclusiveTicket {
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// End the operation. `err` is the failure it ended with, if any.
    pub fn release(mut self, err: Option<&Error>) {
        self.finish(err);
    }

    fn finish(&mut self, err: Option<&Error>) {
        let guard = match self.guard.take() {
            Some(guard) => guard,
            None => return,
        };

        let shared = &self.store.shared;
        let head = shared.exclusive.labels.borrow_mut().pop_front();
        match head {
            Some((seq, _)) if seq == self.seq => (),
            head => {
                error!(
                    "{} Mutex invariant failure: {} (#{}) completed but \
                     queue head is {:?}",
                    shared.log_prefix, self.label, self.seq, head
                );
                shared.exclusive.remove(self.seq);
                if let Some(head) = head {
                    shared.exclusive.labels.borrow_mut().push_front(head);
                }
            },
        }

        match err {
            Some(e) => debug!(
                "{} End exclusive {} with error: {}",
                shared.log_prefix, self.label, e
            ),
            None => {
                debug!("{} End exclusive {}", shared.log_prefix, self.label)
            },
        }
        shared.log_prefix.set_operation(None);
        drop(guard);

        if !shared.exclusive.is_idle() {
            return;
        }

        self.store.flush_excess_cached_blocks("mutex");
        let driver = {
            let inner = shared.inner.borrow();
            if inner.has_attached_slices() {
                None
            } else {
                inner.sync_driver.clone()
            }
        };
        if let Some(driver) = driver {
            driver.all_consumers_dead();
        }
    }
}

impl Drop for ExclusiveTicket {
    fn drop(&mut self) {
        self.finish(None);
    }
}

impl FolderStore {
    /// Wait for the turn of a new exclusive operation labelled `label`.
    pub async fn acquire_exclusive(
        &self,
        label: &'static str,
    ) -> ExclusiveTicket {
        let queue = &self.shared.exclusive;
        let seq = queue.next_seq.get();
        queue.next_seq.set(seq + 1);
        queue.labels.borrow_mut().push_back((seq, label));

        let mut waiter = QueuedWaiter {
            queue,
            seq,
            admitted: false,
        };
        let guard = Arc::clone(&queue.lock).lock_owned().await;
        waiter.admitted = true;

        self.shared.log_prefix.set_operation(Some(label));
        debug!(
            "{} Begin exclusive {} ({} queued)",
            self.shared.log_prefix,
            label,
            queue.len() - 1
        );

        ExclusiveTicket {
            store: self.clone(),
            seq,
            label,
            guard: Some(guard),
        }
    }

    /// Run `op` as an exclusive operation once every operation submitted
    /// before it has completed.
    pub async fn run_exclusive<T, F, Fut>(
        &self,
        label: &'static str,
        op: F,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let ticket = self.acquire_exclusive(label).await;
        let result = op().await;
        ticket.release(result.as_ref().err());
        result
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use chrono::prelude::*;

    use super::*;
    use crate::store::model::*;
    use crate::store::test_support::*;
    use crate::support::chronox::*;

    #[test]
    fn operations_run_in_submission_order() {
        run(async {
            let (store, _) = memory_store(FolderType::Inbox);
            let folder = store.folder_id().clone();
            store
                .add_message_header(header(&folder, 1000, 1), None)
                .await
                .unwrap();
            store.save_state().await.unwrap();
            store.flush_excess_cached_blocks("test");

            let log = Rc::new(RefCell::new(Vec::<&'static str>::new()));
            let x = {
                let store = store.clone();
                let log = Rc::clone(&log);
                let folder = folder.clone();
                tokio::task::spawn_local(async move {
                    store
                        .run_exclusive("x", || async {
                            log.borrow_mut().push("x begin");
                            // Forces a block load, which suspends
                            let h = store
                                .get_message_header(
                                    &Suid::new(folder, MessageId(1)),
                                    Utc.millisx(1000),
                                )
                                .await;
                            assert!(h.is_some());
                            log.borrow_mut().push("x end");
                            Ok(())
                        })
                        .await
                })
            };
            let y = {
                let store = store.clone();
                let log = Rc::clone(&log);
                tokio::task::spawn_local(async move {
                    store
                        .run_exclusive("y", || async {
                            log.borrow_mut().push("y");
                            Err::<(), _>(Error::MessageNotFound)
                        })
                        .await
                })
            };

            x.await.unwrap().unwrap();
            assert_matches!(Err(Error::MessageNotFound), y.await.unwrap());
            assert_eq!(vec!["x begin", "x end", "y"], *log.borrow());
            assert!(store.shared.exclusive.is_idle());
        });
    }

    #[test]
    fn dropped_ticket_releases() {
        run(async {
            let (store, _) = memory_store(FolderType::Inbox);
            let ticket = store.acquire_exclusive("a").await;
            assert_eq!("a", ticket.label());
            assert_eq!(vec!["a"], store.shared.exclusive.labels());
            drop(ticket);
            assert!(store.shared.exclusive.is_idle());

            let ticket = store.acquire_exclusive("b").await;
            ticket.release(None);
            assert!(store.shared.exclusive.is_idle());
        });
    }

    #[test]
    fn cancelled_waiter_leaves_queue() {
        run(async {
            let (store, _) = memory_store(FolderType::Inbox);
            let first = store.acquire_exclusive("first").await;

            {
                let waiting = store.acquire_exclusive("second");
                tokio::pin!(waiting);
                let polled = poll_once(waiting.as_mut()).await;
                assert!(!polled);
                assert_eq!(
                    vec!["first", "second"],
                    store.shared.exclusive.labels()
                );
            }

            assert_eq!(vec!["first"], store.shared.exclusive.labels());
            first.release(None);
            assert!(store.shared.exclusive.is_idle());
        });
    }

    #[test]
    fn idle_without_slices_tells_driver() {
        run(async {
            let (store, _) = memory_store(FolderType::Inbox);
            let driver = Rc::new(FakeDriver::new());
            store.set_sync_driver(driver.clone());

            let ticket = store.acquire_exclusive("a").await;
            ticket.release(None);
            assert_eq!(vec![DriverCall::AllConsumersDead], driver.take_calls());
        });
    }
}
