//! DOS date/time encoding (spec.md §3's `fat_dirent` date/time fields).
//!
//! Grounded on `original_source/fat/filesystem.cpp`'s `timespec_to_fat` and
//! `fat_to_timespec`: a packed 16-bit date (`day | month << 5 | (year-1980)
//! << 9`), a packed 16-bit time with two-second resolution
//! (`sec/2 | min << 5 | hour << 11`), and an optional centisecond byte
//! (0-199, i.e. it can carry one extra second) used only by the creation
//! timestamp. FAT has no on-disk access *time*, only an access *date*.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// Earliest representable FAT year.
const FAT_EPOCH_YEAR: i32 = 1980;

/// Decode a packed FAT date/time pair (plus optional centiseconds) into a
/// `NaiveDateTime`. Falls back to the FAT epoch if the fields describe a
/// date the calendar doesn't have (a corrupt or never-initialized field).
pub fn fat_to_datetime(date: u16, time: u16, centiseconds: u8) -> NaiveDateTime {
    let day = (date & 0x1F) as u32;
    let month = ((date >> 5) & 0x0F) as u32;
    let year = FAT_EPOCH_YEAR + ((date >> 9) & 0x7F) as i32;

    let extra_second = if centiseconds >= 100 { 1 } else { 0 };
    let hundredths = (centiseconds % 100) as u32;
    let second = ((time & 0x1F) as u32 * 2) + extra_second;
    let minute = (time >> 5) & 0x3F;
    let hour = (time >> 11) & 0x1F;

    let date = NaiveDate::from_ymd_opt(year, month.max(1), day.max(1))
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(FAT_EPOCH_YEAR, 1, 1).unwrap());
    let time = NaiveTime::from_hms_milli_opt(
        hour.min(23),
        minute.min(59),
        second.min(59),
        hundredths * 10,
    )
    .unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    NaiveDateTime::new(date, time)
}

/// Encode a `NaiveDateTime` into a packed FAT date/time pair plus a
/// centisecond byte. Dates before 1980 or after 2107 saturate to the
/// nearest representable FAT date.
pub fn datetime_to_fat(dt: NaiveDateTime) -> (u16, u16, u8) {
    let year = (dt.year() - FAT_EPOCH_YEAR).clamp(0, 127) as u16;
    let date = (dt.day() as u16 & 0x1F)
        | ((dt.month() as u16 & 0x0F) << 5)
        | (year << 9);
    let time = ((dt.second() as u16 / 2) & 0x1F)
        | ((dt.minute() as u16 & 0x3F) << 5)
        | ((dt.hour() as u16 & 0x1F) << 11);
    let centiseconds = ((dt.second() % 2) * 100 + dt.nanosecond() / 10_000_000) as u8;
    (date, time, centiseconds)
}

/// Encode only the date half, for the access-date-only field.
pub fn datetime_to_fat_date(dt: NaiveDateTime) -> u16 {
    datetime_to_fat(dt).0
}

/// A requested timestamp update for `utimens`, mirroring the POSIX
/// `UTIME_NOW`/`UTIME_OMIT` sentinels without pulling in `libc`.
#[derive(Debug, Clone, Copy)]
pub enum TimeUpdate {
    /// Leave the field untouched.
    Omit,
    /// Set it to the current time, supplied by the caller (the core never
    /// reads the wall clock itself).
    Now,
    /// Set it to an explicit timestamp.
    Set(NaiveDateTime),
}

impl TimeUpdate {
    /// Resolve against a caller-supplied "now", returning the new value to
    /// store, or `None` if the field should be left alone.
    pub fn resolve(self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            TimeUpdate::Omit => None,
            TimeUpdate::Now => Some(now),
            TimeUpdate::Set(t) => Some(t),
        }
    }
}
