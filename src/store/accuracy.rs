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

//! Tracking of which date ranges are known to reflect the server.

use chrono::prelude::*;
use chrono::Duration;

use super::model::{AccuracyRange, FullSync};
use super::search::{find_first_for_date_range, find_last_for_date_range};
use crate::support::error::Error;

/// The accuracy ranges of one folder, newest first.
///
/// Ranges never overlap, and adjacent ranges are only distinct if their
/// provenance differs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccuracyRanges {
    ranges: Vec<AccuracyRange>,
}

fn has_provenance(
    range: &AccuracyRange,
    modseq: &Option<String>,
    updated: DateTime<Utc>,
) -> bool {
    range.full_sync.as_ref().map_or(false, |fs| {
        fs.highest_modseq == *modseq && fs.updated == updated
    })
}

impl AccuracyRanges {
    pub fn new(ranges: Vec<AccuracyRange>) -> Self {
        Self { ranges }
    }

    pub fn ranges(&self) -> &[AccuracyRange] {
        &self.ranges
    }

    pub fn into_inner(self) -> Vec<AccuracyRange> {
        self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Record that `[start, end)` was fully synchronised at `updated`.
    ///
    /// A missing `end` means `now`. Existing ranges only partially covered
    /// keep their provenance for the part outside the new range, unless that
    /// provenance is the same as the new one, in which case they are merged.
    pub fn mark_synced(
        &mut self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        modseq: Option<String>,
        updated: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut end = end.unwrap_or(now);
        if start > end {
            return Err(Error::InvertedRange);
        }

        let (mut new_ix, newest) =
            find_first_for_date_range(&self.ranges, start, Some(end));
        let newest = newest.cloned();
        let (old_ix, oldest) =
            find_last_for_date_range(&self.ranges, start, end);
        let oldest = oldest.cloned();

        let mut del_count = old_ix.saturating_sub(new_ix);
        if oldest.is_some() {
            del_count += 1;
        }

        let mut insertions = Vec::<AccuracyRange>::new();
        if let Some(newest) = newest.filter(|r| r.end_ts > end) {
            if has_provenance(&newest, &modseq, updated) {
                end = newest.end_ts;
            } else {
                insertions.push(AccuracyRange {
                    start_ts: end,
                    end_ts: newest.end_ts,
                    full_sync: newest.full_sync,
                });
            }
        }

        insertions.push(AccuracyRange {
            start_ts: start,
            end_ts: end,
            full_sync: Some(FullSync {
                highest_modseq: modseq.clone(),
                updated,
            }),
        });

        if let Some(oldest) = oldest.as_ref().filter(|r| r.start_ts < start) {
            if has_provenance(oldest, &modseq, updated) {
                if let Some(last) = insertions.last_mut() {
                    last.start_ts = oldest.start_ts;
                }
            } else {
                insertions.push(AccuracyRange {
                    start_ts: oldest.start_ts,
                    end_ts: start,
                    full_sync: oldest.full_sync.clone(),
                });
            }
        }

        if new_ix > 0 {
            let neighbour = &self.ranges[new_ix - 1];
            if insertions[0].end_ts == neighbour.start_ts
                && has_provenance(neighbour, &modseq, updated)
            {
                insertions[0].end_ts = neighbour.end_ts;
                new_ix -= 1;
                del_count += 1;
            }
        }

        let old_neighbour_ix = old_ix + usize::from(oldest.is_some());
        if let Some(neighbour) = self.ranges.get(old_neighbour_ix) {
            let last = insertions.len() - 1;
            if insertions[last].start_ts == neighbour.end_ts
                && has_provenance(neighbour, &modseq, updated)
            {
                insertions[last].start_ts = neighbour.start_ts;
                del_count += 1;
            }
        }

        let del_end = (new_ix + del_count).min(self.ranges.len());
        self.ranges.splice(new_ix..del_end, insertions);
        Ok(())
    }

    /// Determine which part of `[start, end)` is not covered by full
    /// synchronisations more recent than `now - threshold`.
    ///
    /// Returns `None` if the whole interval is covered. Otherwise, a single
    /// interval covering every gap is returned.
    pub fn coverage_needing_refresh(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let (new_ix, newest) =
            find_first_for_date_range(&self.ranges, start, Some(end));
        let (old_ix, _) = find_last_for_date_range(&self.ranges, start, end);
        let recency_cutoff = now - threshold;
        let is_fresh = |r: &AccuracyRange| {
            r.full_sync
                .as_ref()
                .map_or(false, |fs| fs.updated >= recency_cutoff)
        };

        let (mut gap_start, mut gap_end) = (start, end);
        if newest.is_none() {
            return Some((gap_start, gap_end));
        }

        for range in self.ranges.iter().take(old_ix + 1).skip(new_ix) {
            if range.end_ts < gap_end || !is_fresh(range) {
                break;
            }

            if range.start_ts <= gap_start {
                return None;
            }

            gap_end = range.start_ts;
        }

        for range in self.ranges[..=old_ix.min(self.ranges.len() - 1)]
            .iter()
            .rev()
        {
            if range.start_ts > gap_start || !is_fresh(range) {
                break;
            }

            gap_start = range.end_ts;
        }

        Some((gap_start, gap_end))
    }

    /// Extend the oldest range back to `oldest`, recording that everything
    /// before it is known.
    ///
    /// Returns false if there are no ranges to extend.
    pub fn mark_synced_to_dawn_of_time(
        &mut self,
        oldest: DateTime<Utc>,
    ) -> bool {
        match self.ranges.last_mut() {
            Some(last) => {
                last.start_ts = oldest;
                true
            },
            None => false,
        }
    }

    /// Undo `mark_synced_to_dawn_of_time` by moving the start of the oldest
    /// range up to `new_oldest`.
    ///
    /// If that would leave the oldest range empty, it is removed instead and
    /// the removed range is returned so the caller can report it.
    pub fn clear_synced_to_dawn_of_time(
        &mut self,
        new_oldest: DateTime<Utc>,
    ) -> Option<AccuracyRange> {
        let last = self.ranges.last_mut()?;
        if last.end_ts > new_oldest {
            last.start_ts = new_oldest;
            None
        } else {
            self.ranges.pop()
        }
    }

    /// The end of the newest range.
    pub fn newest_full_sync_date(&self) -> Option<DateTime<Utc>> {
        self.ranges.first().map(|r| r.end_ts)
    }

    /// The start of the oldest range with full-sync provenance, or `now` if
    /// there is none.
    pub fn oldest_full_sync_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.ranges
            .iter()
            .rev()
            .find(|r| r.full_sync.is_some())
            .map_or(now, |r| r.start_ts)
    }

    /// Stop claiming coverage of anything before `cut`.
    pub fn truncate_before(&mut self, cut: DateTime<Utc>) {
        let (ix, straddles) =
            find_first_for_date_range(&self.ranges, cut, Some(cut));
        if straddles.is_none() {
            self.ranges.truncate(ix);
            return;
        }

        self.ranges[ix].start_ts = cut;
        let keep = if self.ranges[ix].end_ts > cut {
            ix + 1
        } else {
            ix
        };
        self.ranges.truncate(keep);
    }

    /// Find the point before which the folder has gone unsynchronised long
    /// enough that messages may be purged.
    ///
    /// Ranges are examined from the oldest end; those without full-sync
    /// provenance are skipped, and the first one synchronised within
    /// `staleness` stops the scan. The cut is the end of the newest range
    /// passed over, but never later than `now - sync_range - 1 day`.
    pub fn last_access_cut_point(
        &self,
        now: DateTime<Utc>,
        staleness: Duration,
        sync_range: Duration,
    ) -> Option<DateTime<Utc>> {
        let cutoff = now - staleness;
        let mut cut_ix = self.ranges.len();
        while cut_ix >= 1 {
            let range = &self.ranges[cut_ix - 1];
            if range
                .full_sync
                .as_ref()
                .map_or(false, |fs| fs.updated > cutoff)
            {
                break;
            }
            cut_ix -= 1;
        }

        if cut_ix == self.ranges.len() {
            return None;
        }

        let cut = self.ranges[cut_ix].end_ts;
        let horizon = now - sync_range - Duration::days(1);
        Some(cut.min(horizon))
    }
}
