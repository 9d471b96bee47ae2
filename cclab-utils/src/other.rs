use std::time::{Duration, SystemTime, UNIX_EPOCH};

use time::{format_description, OffsetDateTime};

/// Human-readable local clock time (`hh:mm:ss.mmm`) of the given instant, used to prefix live
/// progress output.
pub fn clock_time(t: SystemTime) -> String {
    let t = OffsetDateTime::from(t);
    let t = match time::UtcOffset::current_local_offset() {
        Ok(offset) => t.to_offset(offset),
        Err(_) => t,
    };
    t.format(
        &format_description::parse("[hour]:[minute]:[second].[subsecond digits:3]").unwrap(),
    )
    .unwrap_or_else(|_| "??:??:??.???".to_string())
}

/// Milliseconds since the Unix epoch. Times before the epoch are clamped to zero.
pub fn unix_millis(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
}

/// Seconds since the Unix epoch as a float. Times before the epoch are clamped to zero.
pub fn unix_secs_f64(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn epoch_conversions() {
        let t = UNIX_EPOCH + Duration::from_millis(1_234_567);
        assert_eq!(unix_millis(t), 1_234_567);
        assert!((unix_secs_f64(t) - 1234.567).abs() < 1e-9);
        assert_eq!(unix_millis(UNIX_EPOCH - Duration::from_secs(1)), 0);
    }

    #[test]
    fn clock_time_has_millis() {
        let s = clock_time(SystemTime::now());
        assert_eq!(s.len(), "00:00:00.000".len());
        assert_eq!(s.matches(':').count(), 2);
    }
}
