//! (De-)serialize an `Option<f64>` that may be infinite or NaN.
//!
//! JSON has no representation for non-finite numbers, so they are written as the strings `"inf"`,
//! `"-inf"` and `"nan"`. Finite values stay numbers, and `None` is `null`. Use it with
//! `#[serde(default, with = "cclab_utils::serde::option_float")]`.

use serde::{de::Error, Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Repr {
    Number(f64),
    Text(String),
}

pub fn serialize<S: Serializer>(x: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match x {
        None => serializer.serialize_none(),
        Some(x) if x.is_nan() => serializer.serialize_str("nan"),
        Some(x) if *x == f64::INFINITY => serializer.serialize_str("inf"),
        Some(x) if *x == f64::NEG_INFINITY => serializer.serialize_str("-inf"),
        Some(x) => serializer.serialize_f64(*x),
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Repr>::deserialize(deserializer)? {
        None => None,
        Some(Repr::Number(x)) => Some(x),
        Some(Repr::Text(s)) => match s.as_str() {
            "inf" => Some(f64::INFINITY),
            "-inf" => Some(f64::NEG_INFINITY),
            "nan" => Some(f64::NAN),
            _ => return Err(D::Error::custom(format!("invalid number: {s:?}"))),
        },
    })
}
