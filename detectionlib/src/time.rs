use chrono::prelude::*;
use serde::{Deserialize, Serialize};

/// Number of 10 minute intervals covered by one TEK, i.e. one UTC day.
pub const TEK_ROLLING_PERIOD: u32 = 144;

const EN_INTERVAL_SECONDS: i64 = 60 * 10;
const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// A point in time expressed as an ExposureNotification interval number,
/// i.e. the number of full 10 minute windows since the Unix epoch.
#[derive(
    Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct ExposureTime {
    en_interval_number: u32,
}

impl ExposureTime {
    pub fn from_en_interval_number(en_interval_number: u32) -> Self {
        Self { en_interval_number }
    }
    pub fn en_interval_number(&self) -> u32 {
        self.en_interval_number
    }
    pub fn as_bytes(&self) -> [u8; 4] {
        self.en_interval_number.to_le_bytes()
    }
    pub fn advanced_by(&self, intervals: u32) -> ExposureTime {
        Self {
            en_interval_number: self.en_interval_number + intervals,
        }
    }
    /// Start of the TEK window (UTC day) containing `self`.
    pub fn floor_tek_rolling_period(&self) -> ExposureTime {
        Self {
            en_interval_number: self.en_interval_number - self.en_interval_number % TEK_ROLLING_PERIOD,
        }
    }
    pub fn is_tek_rolling_period_aligned(&self) -> bool {
        self.en_interval_number % TEK_ROLLING_PERIOD == 0
    }
}

impl From<DateTime<Utc>> for ExposureTime {
    fn from(utc: DateTime<Utc>) -> Self {
        Self {
            en_interval_number: (utc.timestamp() / EN_INTERVAL_SECONDS) as u32,
        }
    }
}

/// UTC midnight of the day containing the given absolute unix timestamp.
pub fn utc_day_start(timestamp: f64) -> DateTime<Utc> {
    let day = (timestamp as i64).div_euclid(SECONDS_PER_DAY);
    Utc.timestamp(day * SECONDS_PER_DAY, 0)
}

/// Whole days from `date` to `now`, floored.
pub fn days_between(date: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now.timestamp() - date.timestamp()).div_euclid(SECONDS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposure_time_creation() {
        let exposure_time: ExposureTime = Utc.timestamp(0, 0).into();
        assert_eq!(exposure_time.en_interval_number(), 0);
        let exposure_time: ExposureTime = Utc.timestamp(10 * 60, 0).into();
        assert_eq!(exposure_time.en_interval_number(), 1);
        let exposure_time: ExposureTime = Utc.timestamp(9 * 60, 999).into();
        assert_eq!(exposure_time.en_interval_number(), 0);
        let exposure_time: ExposureTime = Utc.ymd(1970, 1, 2).and_hms(0, 0, 0).into();
        assert_eq!(exposure_time.en_interval_number(), TEK_ROLLING_PERIOD);
        let exposure_time: ExposureTime = Utc.ymd(1970, 1, 2).and_hms(0, 9, 59).into();
        assert_eq!(exposure_time.en_interval_number(), TEK_ROLLING_PERIOD);
        let exposure_time: ExposureTime = Utc.ymd(1970, 1, 2).and_hms(0, 10, 0).into();
        assert_eq!(exposure_time.en_interval_number(), TEK_ROLLING_PERIOD + 1);
    }

    #[test]
    fn test_tek_rolling_period_alignment() {
        let aligned = ExposureTime::from_en_interval_number(18408 * TEK_ROLLING_PERIOD);
        assert!(aligned.is_tek_rolling_period_aligned());
        assert_eq!(aligned.floor_tek_rolling_period(), aligned);

        let unaligned = aligned.advanced_by(55);
        assert!(!unaligned.is_tek_rolling_period_aligned());
        assert_eq!(unaligned.floor_tek_rolling_period(), aligned);
    }

    #[test]
    fn test_exposure_time_bytes_are_little_endian() {
        let exposure_time = ExposureTime::from_en_interval_number(2650847);
        assert_eq!(exposure_time.as_bytes(), 2650847u32.to_le_bytes());
    }

    #[test]
    fn test_utc_day_start() {
        let date = utc_day_start(86400.0 * 3.0 + 12.5 * 3600.0);
        assert_eq!(date, Utc.ymd(1970, 1, 4).and_hms(0, 0, 0));
        assert_eq!(utc_day_start(86399.9), Utc.ymd(1970, 1, 1).and_hms(0, 0, 0));
    }

    #[test]
    fn test_days_between() {
        let date = Utc.ymd(2020, 5, 1).and_hms(0, 0, 0);
        let now = Utc.ymd(2020, 5, 4).and_hms(13, 30, 0);
        assert_eq!(days_between(date, now), 3);
        assert_eq!(days_between(date, date), 0);
    }
}
