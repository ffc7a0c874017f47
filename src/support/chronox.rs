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

//! Helper traits which restore non-deprecated panicking constructors (with
//! 'x' appended to disambiguate) for values that are obviously valid, plus the
//! date quantisation used to line timestamps up with synchronisation
//! boundaries.

use chrono::prelude::*;
use chrono::Duration;

pub trait NaiveDateX {
    fn from_ymdx(y: i32, m: u32, d: u32) -> Self;
    fn and_hmsx(&self, h: u32, m: u32, s: u32) -> NaiveDateTime;
    fn and_hmsx_utc(&self, h: u32, m: u32, s: u32) -> DateTime<Utc>;
}

pub trait OffsetX {
    type DateTime;

    fn timestamp0(&self) -> Self::DateTime;
    fn millisx(&self, ms: i64) -> Self::DateTime;
}

impl NaiveDateX for NaiveDate {
    fn from_ymdx(y: i32, m: u32, d: u32) -> Self {
        Self::from_ymd_opt(y, m, d).unwrap()
    }

    fn and_hmsx(&self, h: u32, m: u32, s: u32) -> NaiveDateTime {
        self.and_hms_opt(h, m, s).unwrap()
    }

    fn and_hmsx_utc(&self, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        self.and_hmsx(h, m, s).and_utc()
    }
}

impl<T: chrono::TimeZone + chrono::Offset> OffsetX for T {
    type DateTime = DateTime<T>;

    fn timestamp0(&self) -> Self::DateTime {
        self.timestamp_millis_opt(0).unwrap()
    }

    fn millisx(&self, ms: i64) -> Self::DateTime {
        self.timestamp_millis_opt(ms).unwrap()
    }
}

/// Alignment of timestamps onto a fixed grid anchored at the UNIX epoch.
///
/// With a one-day quantum this is UTC midnight, which is what IMAP `SINCE`
/// and `BEFORE` searches operate on. A non-positive quantum leaves
/// timestamps unchanged.
pub trait QuantizeX: Sized {
    /// Round down onto the grid.
    fn quantize(self, quantum: Duration) -> Self;
    /// Round up onto the grid. Values already on the grid are unchanged.
    fn quantize_up(self, quantum: Duration) -> Self;
}

impl QuantizeX for DateTime<Utc> {
    fn quantize(self, quantum: Duration) -> Self {
        let q = quantum.num_milliseconds();
        if q <= 0 {
            return self;
        }

        let ms = self.timestamp_millis();
        Utc.timestamp_millis_opt(ms.div_euclid(q) * q)
            .single()
            .unwrap_or(self)
    }

    fn quantize_up(self, quantum: Duration) -> Self {
        let down = self.quantize(quantum);
        if down == self {
            self
        } else {
            down + quantum
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quantize_to_days() {
        let day = Duration::days(1);
        let t = NaiveDate::from_ymdx(2020, 5, 17).and_hmsx_utc(13, 4, 5);
        assert_eq!(
            NaiveDate::from_ymdx(2020, 5, 17).and_hmsx_utc(0, 0, 0),
            t.quantize(day)
        );
        assert_eq!(
            NaiveDate::from_ymdx(2020, 5, 18).and_hmsx_utc(0, 0, 0),
            t.quantize_up(day)
        );

        let midnight = NaiveDate::from_ymdx(2020, 5, 17).and_hmsx_utc(0, 0, 0);
        assert_eq!(midnight, midnight.quantize(day));
        assert_eq!(midnight, midnight.quantize_up(day));
    }

    #[test]
    fn quantize_before_epoch_rounds_down() {
        let hour = Duration::hours(1);
        assert_eq!(Utc.millisx(-3_600_000), Utc.millisx(-1).quantize(hour));
        assert_eq!(Utc.timestamp0(), Utc.millisx(-1).quantize_up(hour));
    }

    #[test]
    fn zero_quantum_is_identity() {
        let t = Utc.millisx(12345);
        assert_eq!(t, t.quantize(Duration::zero()));
        assert_eq!(t, t.quantize_up(Duration::zero()));
    }
}
