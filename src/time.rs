//! NTP epoch time helpers.
//!
//! The OMS timestamps every attribute value in NTP seconds (epoch 1900-01-01),
//! so watermarks and emitted samples use the same representation.

use chrono::{DateTime, Utc};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET: f64 = 2_208_988_800.0;

/// Convert Unix seconds to NTP seconds.
pub fn system_to_ntp_time(unix_secs: f64) -> f64 {
    unix_secs + NTP_UNIX_OFFSET
}

/// Convert NTP seconds to Unix seconds.
pub fn ntp_to_system_time(ntp_secs: f64) -> f64 {
    ntp_secs - NTP_UNIX_OFFSET
}

/// Current wall-clock time in NTP seconds.
pub fn ntp_now() -> f64 {
    datetime_to_ntp(Utc::now())
}

/// Convert a UTC datetime to NTP seconds.
pub fn datetime_to_ntp(time: DateTime<Utc>) -> f64 {
    let unix = time.timestamp() as f64 + f64::from(time.timestamp_subsec_micros()) / 1e6;
    system_to_ntp_time(unix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unix_epoch_maps_to_ntp_offset() {
        assert_eq!(system_to_ntp_time(0.0), NTP_UNIX_OFFSET);
        assert_eq!(ntp_to_system_time(NTP_UNIX_OFFSET), 0.0);
    }

    #[test]
    fn test_datetime_conversion() {
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single();
        let t = t.map(datetime_to_ntp);
        assert_eq!(t, Some(946_684_800.0 + NTP_UNIX_OFFSET));
    }

    #[test]
    fn test_ntp_now_is_after_2020() {
        assert!(ntp_now() > system_to_ntp_time(1_577_836_800.0));
    }
}
