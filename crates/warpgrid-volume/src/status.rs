//! Autoscaler status persisted in the volume's own annotations.
//!
//! The status annotation is the only durable controller state. It records
//! when the volume was last grown and when the last grow attempt failed,
//! which gates retries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::annotations;
use crate::error::{VolumeError, VolumeResult};
use crate::types::TrackedVolume;

/// Decoded status annotation. `None` timestamps mean "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerStatus {
    #[serde(default, with = "zero_time")]
    pub last_scale_time: Option<DateTime<Utc>>,
    #[serde(default, with = "zero_time")]
    pub last_failed_attempt: Option<DateTime<Utc>>,
}

impl AutoscalerStatus {
    /// Decode the status annotation of `volume`.
    ///
    /// A missing annotation decodes to the zero-valued status.
    pub fn decode(volume: &TrackedVolume) -> VolumeResult<Self> {
        match volume.annotation(annotations::STATUS) {
            Some(raw) => serde_json::from_str(raw).map_err(|e| VolumeError::Status(e.to_string())),
            None => Ok(Self::default()),
        }
    }

    pub fn encode(&self) -> VolumeResult<String> {
        serde_json::to_string(self).map_err(|e| VolumeError::Status(e.to_string()))
    }

    /// Time left before a failed attempt may be retried, if any.
    pub fn retry_remaining(&self, now: DateTime<Utc>, retry_after: Duration) -> Option<Duration> {
        let failed_at = self.last_failed_attempt?;
        let elapsed = now.signed_duration_since(failed_at).to_std().unwrap_or_default();
        retry_after.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

/// Write the default status if the volume has none. Returns true if the
/// volume was modified.
pub fn init_status_annotation(volume: &mut TrackedVolume) -> VolumeResult<bool> {
    if volume.annotations.contains_key(annotations::STATUS) {
        return Ok(false);
    }
    let encoded = AutoscalerStatus::default().encode()?;
    volume
        .annotations
        .insert(annotations::STATUS.to_string(), encoded);
    Ok(true)
}

/// Remove the status annotation. Returns true if one was present.
pub fn clear_status_annotation(volume: &mut TrackedVolume) -> bool {
    volume.annotations.remove(annotations::STATUS).is_some()
}

/// Stamp `last_failed_attempt` on the volume's status annotation.
///
/// A malformed existing annotation is replaced by a fresh status.
pub fn record_failed_attempt(volume: &mut TrackedVolume, now: DateTime<Utc>) -> VolumeResult<()> {
    let mut status = AutoscalerStatus::decode(volume).unwrap_or_default();
    status.last_failed_attempt = Some(now);
    let encoded = status.encode()?;
    volume
        .annotations
        .insert(annotations::STATUS.to_string(), encoded);
    Ok(())
}

/// Stamp `last_scale_time` on the volume's status annotation.
pub fn record_scale(volume: &mut TrackedVolume, now: DateTime<Utc>) -> VolumeResult<()> {
    let mut status = AutoscalerStatus::decode(volume).unwrap_or_default();
    status.last_scale_time = Some(now);
    let encoded = status.encode()?;
    volume
        .annotations
        .insert(annotations::STATUS.to_string(), encoded);
    Ok(())
}

/// RFC 3339 timestamps where `0001-01-01T00:00:00Z` (or null) means "never".
mod zero_time {
    use chrono::{DateTime, Datelike, SecondsFormat, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    const ZERO: &str = "0001-01-01T00:00:00Z";

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => s.serialize_str(ZERO),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let parsed = DateTime::parse_from_rfc3339(&raw)
            .map_err(D::Error::custom)?
            .with_timezone(&Utc);
        if parsed.year() <= 1 {
            Ok(None)
        } else {
            Ok(Some(parsed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn volume_with_status(raw: Option<&str>) -> TrackedVolume {
        let mut volume = TrackedVolume {
            namespace: "default".into(),
            name: "data".into(),
            ..Default::default()
        };
        if let Some(raw) = raw {
            volume
                .annotations
                .insert(annotations::STATUS.into(), raw.into());
        }
        volume
    }

    #[test]
    fn missing_annotation_decodes_to_default() {
        let status = AutoscalerStatus::decode(&volume_with_status(None)).unwrap();
        assert_eq!(status, AutoscalerStatus::default());
    }

    #[test]
    fn malformed_annotation_is_an_error() {
        let result = AutoscalerStatus::decode(&volume_with_status(Some("{not json")));
        assert!(matches!(result, Err(VolumeError::Status(_))));
    }

    #[test]
    fn zero_timestamps_decode_to_never() {
        let raw = r#"{"lastScaleTime": "0001-01-01T00:00:00Z", "lastFailedAttempt": "0001-01-01T00:00:00Z"}"#;
        let status = AutoscalerStatus::decode(&volume_with_status(Some(raw))).unwrap();
        assert_eq!(status, AutoscalerStatus::default());
    }

    #[test]
    fn encode_then_decode_preserves_timestamps() {
        let failed = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let status = AutoscalerStatus {
            last_scale_time: None,
            last_failed_attempt: Some(failed),
        };
        let encoded = status.encode().unwrap();
        assert!(encoded.contains("\"lastScaleTime\":\"0001-01-01T00:00:00Z\""));

        let decoded = AutoscalerStatus::decode(&volume_with_status(Some(&encoded))).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn retry_remaining_honours_window() {
        let failed = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let status = AutoscalerStatus {
            last_scale_time: None,
            last_failed_attempt: Some(failed),
        };
        let window = Duration::from_secs(300);

        let soon = failed + chrono::Duration::seconds(60);
        assert_eq!(status.retry_remaining(soon, window), Some(Duration::from_secs(240)));

        let later = failed + chrono::Duration::seconds(301);
        assert_eq!(status.retry_remaining(later, window), None);

        assert_eq!(AutoscalerStatus::default().retry_remaining(soon, window), None);
    }

    #[test]
    fn init_is_idempotent() {
        let mut volume = volume_with_status(None);
        assert!(init_status_annotation(&mut volume).unwrap());
        let first = volume.annotation(annotations::STATUS).map(str::to_string);
        assert!(!init_status_annotation(&mut volume).unwrap());
        assert_eq!(volume.annotation(annotations::STATUS).map(str::to_string), first);
    }

    #[test]
    fn record_failed_attempt_replaces_malformed_status() {
        let mut volume = volume_with_status(Some("garbage"));
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        record_failed_attempt(&mut volume, now).unwrap();

        let status = AutoscalerStatus::decode(&volume).unwrap();
        assert_eq!(status.last_failed_attempt, Some(now));
        assert_eq!(status.last_scale_time, None);
    }

    #[test]
    fn clear_removes_annotation() {
        let mut volume = volume_with_status(Some("{}"));
        assert!(clear_status_annotation(&mut volume));
        assert!(!clear_status_annotation(&mut volume));
    }
}
