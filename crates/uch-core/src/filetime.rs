use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::Failure;

/// 100ns ticks between 1601-01-01 and 1970-01-01.
pub const UNIX_EPOCH_TICKS: u64 = 116_444_736_000_000_000;

pub const TICKS_PER_SECOND: u64 = 10_000_000;

pub const TICKS_PER_MINUTE: u64 = 60 * TICKS_PER_SECOND;

/// `FileTimeToSystemTime` rejects anything with the top bit set.
const MAX_TICKS: u64 = i64::MAX as u64;

/// Windows FILETIME: 100ns intervals since 1601-01-01 UTC, split in two words.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FileTime {
    pub low_date_time: u32,
    pub high_date_time: u32,
}

impl FileTime {
    pub fn from_u64(ticks: u64) -> Self {
        Self {
            low_date_time: ticks as u32,
            high_date_time: (ticks >> 32) as u32,
        }
    }

    pub fn as_u64(self) -> u64 {
        (u64::from(self.high_date_time) << 32) | u64::from(self.low_date_time)
    }

    /// Drops the seconds and sub-second part.
    pub fn truncate_to_minute(self) -> Self {
        Self::from_u64(clamp_filetime_to_minute(self.as_u64()))
    }

    pub fn from_system_time(time: SystemTime) -> Result<Self, Failure> {
        let ticks = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => duration_ticks(after)
                .and_then(|t| t.checked_add(UNIX_EPOCH_TICKS))
                .ok_or(Failure::TimestampConversionFailed)?,
            Err(before) => duration_ticks(before.duration())
                .and_then(|t| UNIX_EPOCH_TICKS.checked_sub(t))
                .ok_or(Failure::TimestampConversionFailed)?,
        };
        if ticks > MAX_TICKS {
            return Err(Failure::TimestampConversionFailed);
        }
        Ok(Self::from_u64(ticks))
    }

    pub fn to_system_time(self) -> Result<SystemTime, Failure> {
        let ticks = self.as_u64();
        if ticks > MAX_TICKS {
            return Err(Failure::TimestampConversionFailed);
        }
        let converted = if ticks >= UNIX_EPOCH_TICKS {
            UNIX_EPOCH.checked_add(ticks_duration(ticks - UNIX_EPOCH_TICKS))
        } else {
            UNIX_EPOCH.checked_sub(ticks_duration(UNIX_EPOCH_TICKS - ticks))
        };
        converted.ok_or(Failure::TimestampConversionFailed)
    }
}

fn duration_ticks(d: Duration) -> Option<u64> {
    let secs = d.as_secs().checked_mul(TICKS_PER_SECOND)?;
    secs.checked_add(u64::from(d.subsec_nanos() / 100))
}

fn ticks_duration(ticks: u64) -> Duration {
    Duration::new(
        ticks / TICKS_PER_SECOND,
        ((ticks % TICKS_PER_SECOND) * 100) as u32,
    )
}

pub fn clamp_filetime_to_minute(filetime: u64) -> u64 {
    filetime - (filetime % TICKS_PER_MINUTE)
}

pub fn filetime_to_regdate_hex(filetime: u64) -> String {
    format!("{:016x}", filetime)
}

/// True when both instants fall into the same UTC minute.
pub fn same_minute(a: SystemTime, b: SystemTime) -> Result<bool, Failure> {
    let a = FileTime::from_system_time(a)?.truncate_to_minute();
    let b = FileTime::from_system_time(b)?.truncate_to_minute();
    Ok(a == b)
}
