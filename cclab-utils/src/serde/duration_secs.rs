//! (De-)serialize a `Duration` as a floating-point number of seconds.
//!
//! Use it with `#[serde(with = "cclab_utils::serde::duration_secs")]`.

use std::time::Duration;

use serde::{de::Error, Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(|_| D::Error::custom(format!("invalid duration: {secs}s")))
}
