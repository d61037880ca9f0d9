use crate::advertisement::Advertisement;
use crate::error::{DetectionError, ErrorKind};
use crate::primitives::{TekKeyring, ATTENUATION_SATURATED, ATTENUATION_UNKNOWN};
use crate::time::{days_between, utc_day_start};
use chrono::prelude::*;
use serde::{Deserialize, Serialize};

/// Granularity of reported exposure durations in seconds.
pub const DURATION_INCREMENT_SECONDS: u32 = 60;
/// Cap on any single reported exposure duration.
pub const DURATION_MAX_SECONDS: u32 = 30 * 60;
/// Cap on the integer risk score.
pub const RISK_SCORE_MAX: u32 = 4096;

/// One matched advertisement, prepared for scoring: exposure day, clamped
/// duration, attenuation, bucketed attenuation durations and the risk
/// scores under the session's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureInfo {
    date: DateTime<Utc>,
    duration_seconds: u32,
    attenuation_value: u8,
    attenuation_durations: Vec<u32>,
    transmission_risk_level: u8,
    total_risk_score: u16,
    total_risk_score_full_range: f64,
}

impl ExposureInfo {
    pub(crate) fn from_matched_advertisement(
        advertisement: &Advertisement,
        keyring: &TekKeyring,
        attenuation_duration_thresholds: &[u8],
        configuration: &ExposureConfiguration,
        now: DateTime<Utc>,
    ) -> Self {
        let attenuation_value = keyring.attenuation(
            &advertisement.rpi,
            &advertisement.encrypted_aem,
            advertisement.rssi,
            advertisement.saturated,
        );
        let duration_seconds = clamped_duration(advertisement.scan_interval);
        let date = utc_day_start(advertisement.timestamp);
        let bucket_count = attenuation_duration_thresholds.len() + 1;
        let mut attenuation_durations = vec![0u32; bucket_count];
        // both sentinels stay out of the buckets; scoring still sees them
        if attenuation_value != ATTENUATION_SATURATED && attenuation_value != ATTENUATION_UNKNOWN {
            let bucket = attenuation_duration_thresholds
                .iter()
                .position(|threshold| attenuation_value <= *threshold)
                .unwrap_or(bucket_count - 1);
            attenuation_durations[bucket] = duration_seconds;
        }
        let transmission_risk_level = keyring.tek().transmission_risk_level();
        let (total_risk_score, total_risk_score_full_range) = configuration.risk_score(
            attenuation_value,
            days_between(date, now),
            duration_seconds,
            transmission_risk_level,
        );
        Self {
            date,
            duration_seconds,
            attenuation_value,
            attenuation_durations,
            transmission_risk_level,
            total_risk_score,
            total_risk_score_full_range,
        }
    }
    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }
    pub fn duration_seconds(&self) -> u32 {
        self.duration_seconds
    }
    pub fn attenuation_value(&self) -> u8 {
        self.attenuation_value
    }
    pub fn attenuation_durations(&self) -> &[u32] {
        &self.attenuation_durations
    }
    pub fn transmission_risk_level(&self) -> u8 {
        self.transmission_risk_level
    }
    pub fn total_risk_score(&self) -> u16 {
        self.total_risk_score
    }
    pub fn total_risk_score_full_range(&self) -> f64 {
        self.total_risk_score_full_range
    }
}

fn clamped_duration(scan_interval: u16) -> u32 {
    let rounded = (u32::from(scan_interval) + DURATION_INCREMENT_SECONDS - 1)
        / DURATION_INCREMENT_SECONDS
        * DURATION_INCREMENT_SECONDS;
    rounded.min(DURATION_MAX_SECONDS)
}

/// Score curves for the four risk inputs. Each curve has eight levels with
/// values within 0..=8; the per-match risk score is the product of the four
/// looked-up values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureConfiguration {
    pub attenuation_level_values: [u8; 8],
    pub days_since_last_exposure_level_values: [u8; 8],
    pub duration_level_values: [u8; 8],
    pub transmission_risk_level_values: [u8; 8],
}

impl Default for ExposureConfiguration {
    fn default() -> Self {
        Self {
            attenuation_level_values: [1; 8],
            days_since_last_exposure_level_values: [1; 8],
            duration_level_values: [1; 8],
            transmission_risk_level_values: [1; 8],
        }
    }
}

impl ExposureConfiguration {
    pub fn validate(&self) -> Result<(), DetectionError> {
        let curves = [
            &self.attenuation_level_values,
            &self.days_since_last_exposure_level_values,
            &self.duration_level_values,
            &self.transmission_risk_level_values,
        ];
        for curve in &curves {
            if curve.iter().any(|value| *value > 8) {
                return Err(DetectionError::new(
                    ErrorKind::ApiMisuse,
                    "score curve values must be within 0..=8",
                ));
            }
        }
        Ok(())
    }
    pub fn risk_score(
        &self,
        attenuation: u8,
        days_since_exposure: i64,
        duration_seconds: u32,
        transmission_risk_level: u8,
    ) -> (u16, f64) {
        let product = u32::from(self.attenuation_level_values[Self::attenuation_level(attenuation)])
            * u32::from(
                self.days_since_last_exposure_level_values
                    [Self::days_since_exposure_level(days_since_exposure)],
            )
            * u32::from(self.duration_level_values[Self::duration_level(duration_seconds)])
            * u32::from(
                self.transmission_risk_level_values
                    [Self::transmission_risk_level(transmission_risk_level)],
            );
        (product.min(RISK_SCORE_MAX) as u16, f64::from(product))
    }

    fn attenuation_level(attenuation: u8) -> usize {
        match attenuation {
            a if a > 73 => 0,
            a if a > 63 => 1,
            a if a > 51 => 2,
            a if a > 33 => 3,
            a if a > 27 => 4,
            a if a > 15 => 5,
            a if a > 10 => 6,
            _ => 7,
        }
    }
    fn days_since_exposure_level(days: i64) -> usize {
        match days {
            d if d >= 14 => 0,
            d if d >= 12 => 1,
            d if d >= 10 => 2,
            d if d >= 8 => 3,
            d if d >= 6 => 4,
            d if d >= 4 => 5,
            d if d >= 2 => 6,
            _ => 7,
        }
    }
    fn duration_level(duration_seconds: u32) -> usize {
        match duration_seconds / 60 {
            0 => 0,
            m if m <= 5 => 1,
            m if m <= 10 => 2,
            m if m <= 15 => 3,
            m if m <= 20 => 4,
            m if m <= 25 => 5,
            m if m <= 30 => 6,
            _ => 7,
        }
    }
    // levels 7 and 8 share the top slot of the eight element curve
    fn transmission_risk_level(level: u8) -> usize {
        usize::from(level.min(7))
    }
}

/// Aggregate over all matches of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureDetectionSummary {
    pub matched_key_count: u64,
    pub days_since_last_exposure: i64,
    pub maximum_risk_score: u16,
    pub maximum_risk_score_full_range: f64,
    pub risk_score_sum_full_range: f64,
    pub attenuation_durations: Vec<u32>,
}

impl ExposureDetectionSummary {
    pub fn aggregate(
        exposure_info: &[ExposureInfo],
        matched_key_count: u64,
        bucket_count: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let mut summary = Self {
            matched_key_count,
            days_since_last_exposure: -1,
            maximum_risk_score: 0,
            maximum_risk_score_full_range: 0.0,
            risk_score_sum_full_range: 0.0,
            attenuation_durations: vec![0; bucket_count],
        };
        for info in exposure_info {
            let days = days_between(info.date(), now);
            if summary.days_since_last_exposure < 0 || days < summary.days_since_last_exposure {
                summary.days_since_last_exposure = days;
            }
            summary.maximum_risk_score = summary.maximum_risk_score.max(info.total_risk_score());
            if info.total_risk_score_full_range() > summary.maximum_risk_score_full_range {
                summary.maximum_risk_score_full_range = info.total_risk_score_full_range();
            }
            summary.risk_score_sum_full_range += info.total_risk_score_full_range();
            for (bucket, duration) in info.attenuation_durations().iter().enumerate() {
                if let Some(total) = summary.attenuation_durations.get_mut(bucket) {
                    *total = total.saturating_add(*duration);
                }
            }
        }
        summary
    }
}
