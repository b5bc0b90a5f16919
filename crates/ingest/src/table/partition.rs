//! Time-based partition naming.
//!
//! Timestamps here are microseconds since the Unix epoch. Partition bounds
//! use floor division so pre-epoch timestamps land in the right bucket.

use std::ops::Range;

const MICROS_PER_HOUR: i64 = 3_600_000_000;
const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

/// Directory name of the single partition of a non-partitioned table.
pub const DEFAULT_PARTITION_NAME: &str = "default";

/// How a table's rows are split into partition directories.
///
/// # Examples
/// ```rust,ignore
/// use alopex_ingest::table::PartitionBy;
///
/// let name = PartitionBy::Day.partition_name(0);
/// assert_eq!(name, "1970-01-01");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PartitionBy {
    /// Single `default` partition.
    None = 0,
    /// One partition per hour, `YYYY-MM-DDTHH`.
    Hour = 1,
    /// One partition per day, `YYYY-MM-DD`.
    Day = 2,
    /// One partition per month, `YYYY-MM`.
    Month = 3,
    /// One partition per year, `YYYY`.
    Year = 4,
}

impl PartitionBy {
    /// Creates a PartitionBy from its on-disk tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Hour),
            2 => Some(Self::Day),
            3 => Some(Self::Month),
            4 => Some(Self::Year),
            _ => None,
        }
    }

    /// Returns the half-open timestamp range of the partition holding `ts`.
    pub fn bounds(self, ts: i64) -> Range<i64> {
        match self {
            Self::None => i64::MIN..i64::MAX,
            Self::Hour => {
                let start = align(ts, MICROS_PER_HOUR);
                start..start.saturating_add(MICROS_PER_HOUR)
            }
            Self::Day => {
                let start = align(ts, MICROS_PER_DAY);
                start..start.saturating_add(MICROS_PER_DAY)
            }
            Self::Month => {
                let (year, month, _) = civil_from_days(div_floor(ts, MICROS_PER_DAY).0);
                let (next_year, next_month) = if month == 12 {
                    (year + 1, 1)
                } else {
                    (year, month + 1)
                };
                month_start(year, month)..month_start(next_year, next_month)
            }
            Self::Year => {
                let (year, _, _) = civil_from_days(div_floor(ts, MICROS_PER_DAY).0);
                month_start(year, 1)..month_start(year + 1, 1)
            }
        }
    }

    /// Returns the directory name of the partition holding `ts`.
    pub fn partition_name(self, ts: i64) -> String {
        let (days, micros_of_day) = div_floor(ts, MICROS_PER_DAY);
        let (year, month, day) = civil_from_days(days);
        match self {
            Self::None => DEFAULT_PARTITION_NAME.to_string(),
            Self::Hour => format!(
                "{:04}-{:02}-{:02}T{:02}",
                year,
                month,
                day,
                micros_of_day / MICROS_PER_HOUR
            ),
            Self::Day => format!("{:04}-{:02}-{:02}", year, month, day),
            Self::Month => format!("{:04}-{:02}", year, month),
            Self::Year => format!("{:04}", year),
        }
    }

    /// Parses a partition directory name back to its start timestamp.
    pub fn parse_partition_name(self, name: &str) -> Option<i64> {
        let number = |s: &str| -> Option<i64> {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            s.parse().ok()
        };

        match self {
            Self::None => (name == DEFAULT_PARTITION_NAME).then_some(i64::MIN),
            Self::Year => {
                let year = number(name)?;
                Some(month_start(year, 1))
            }
            Self::Month => {
                let (y, m) = name.split_once('-')?;
                let year = number(y)?;
                let month = number(m)?;
                (1..=12).contains(&month).then(|| month_start(year, month))
            }
            Self::Day | Self::Hour => {
                let (date, hour) = match self {
                    Self::Hour => {
                        let (date, hour) = name.split_once('T')?;
                        (date, number(hour)?)
                    }
                    _ => (name, 0),
                };
                let mut parts = date.splitn(3, '-');
                let year = number(parts.next()?)?;
                let month = number(parts.next()?)?;
                let day = number(parts.next()?)?;
                if !(1..=12).contains(&month) || !(1..=31).contains(&day) || !(0..24).contains(&hour)
                {
                    return None;
                }
                let days = days_from_civil(year, month, day);
                Some(days * MICROS_PER_DAY + hour * MICROS_PER_HOUR)
            }
        }
    }
}

fn align(ts: i64, unit: i64) -> i64 {
    div_floor(ts, unit).0 * unit
}

fn month_start(year: i64, month: i64) -> i64 {
    days_from_civil(year, month, 1) * MICROS_PER_DAY
}

fn div_floor(value: i64, divisor: i64) -> (i64, i64) {
    let mut quotient = value / divisor;
    let mut remainder = value % divisor;
    if remainder < 0 {
        quotient -= 1;
        remainder += divisor;
    }
    (quotient, remainder)
}

fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };
    (year, month, day)
}

fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
