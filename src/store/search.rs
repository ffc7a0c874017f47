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

//! Binary searches over the newest-first lists kept by the store.
//!
//! Every list searched here is sorted in descending order and its items do
//! not overlap, so each search reduces to a `partition_point` over a
//! monotone predicate.

use chrono::prelude::*;

use super::model::{AccuracyRange, FolderBlockInfo, SortKey};

/// Items covering an inclusive range of composite keys.
pub trait KeyRange {
    fn start_key(&self) -> SortKey;
    fn end_key(&self) -> SortKey;
}

/// Items covering a range of dates.
pub trait TimeSpan {
    fn start_ts(&self) -> DateTime<Utc>;
    fn end_ts(&self) -> DateTime<Utc>;
}

impl KeyRange for FolderBlockInfo {
    fn start_key(&self) -> SortKey {
        self.start
    }

    fn end_key(&self) -> SortKey {
        self.end
    }
}

impl TimeSpan for FolderBlockInfo {
    fn start_ts(&self) -> DateTime<Utc> {
        self.start.date
    }

    fn end_ts(&self) -> DateTime<Utc> {
        self.end.date
    }
}

impl TimeSpan for AccuracyRange {
    fn start_ts(&self) -> DateTime<Utc> {
        self.start_ts
    }

    fn end_ts(&self) -> DateTime<Utc> {
        self.end_ts
    }
}

/// Find the item containing `key`.
///
/// If there is no such item, returns the index at which an item containing
/// `key` would be inserted.
pub fn find_range_for_key<T: KeyRange>(
    list: &[T],
    key: SortKey,
) -> (usize, Option<&T>) {
    let ix = list.partition_point(|item| item.start_key() > key);
    match list.get(ix) {
        Some(item) if key <= item.end_key() => (ix, Some(item)),
        _ => (ix, None),
    }
}

/// Find the newest item overlapping `[start, end)`, where a missing `end` is
/// unbounded.
///
/// On a miss, the index is where the range would be inserted.
pub fn find_first_for_date_range<T: TimeSpan>(
    list: &[T],
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> (usize, Option<&T>) {
    let ix = list.partition_point(|item| {
        start <= item.end_ts()
            && end.map_or(false, |end| end <= item.start_ts())
    });

    match list.get(ix) {
        Some(item) if start > item.end_ts() => (ix, None),
        Some(item) => (ix, Some(item)),
        None => (ix, None),
    }
}

/// Find the oldest item overlapping `[start, end)`.
///
/// On a miss, the index is the position just after where the range would
/// be, i.e., the index of the newest item older than it.
pub fn find_last_for_date_range<T: TimeSpan>(
    list: &[T],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> (usize, Option<&T>) {
    let pp = list.partition_point(|item| {
        end <= item.start_ts() || start < item.end_ts()
    });
    if 0 == pp {
        return (0, None);
    }

    let ix = pp - 1;
    let item = &list[ix];
    if end <= item.start_ts() {
        (ix + 1, None)
    } else {
        (ix, Some(item))
    }
}

/// Find the first (newest) entry of a newest-first list whose date falls in
/// `[start, end)`, where a missing `end` is unbounded.
pub fn find_first_dated<T>(
    list: &[T],
    date_of: impl Fn(&T) -> DateTime<Utc>,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> Option<usize> {
    let ix = match end {
        Some(end) => list.partition_point(|item| date_of(item) >= end),
        None => 0,
    };

    list.get(ix).filter(|item| date_of(item) >= start).map(|_| ix)
}

/// Whether the inclusive key windows `a` and `b` overlap.
pub fn key_ranges_intersect(
    (a_start, a_end): (SortKey, SortKey),
    (b_start, b_end): (SortKey, SortKey),
) -> bool {
    a_end >= b_start && a_start <= b_end
}
