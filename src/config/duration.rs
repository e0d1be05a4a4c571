//! Serde helpers for durations written as integer seconds or as a number with
//! an `ms`, `s`, `m` or `h` suffix.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};

pub fn parse(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;

    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(number)),
        "ms" => Some(Duration::from_millis(number)),
        "m" => number.checked_mul(60).map(Duration::from_secs),
        "h" => number.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if duration.subsec_millis() == 0 {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    } else {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("seconds, or a duration such as 500ms, 30s, 10m or 1h")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            parse(value).ok_or_else(|| E::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Holder {
        #[serde(with = "super")]
        value: Duration,
    }

    #[test]
    fn suffixes() {
        assert_eq!(parse("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse("1d"), None);
        assert_eq!(parse("ms"), None);
    }

    #[test]
    fn oversized_values_are_rejected() {
        assert_eq!(parse(&format!("{}h", u64::MAX)), None);
        assert_eq!(parse(&format!("{}m", u64::MAX / 2)), None);
        assert_eq!(
            parse(&format!("{}s", u64::MAX)),
            Some(Duration::from_secs(u64::MAX))
        );

        let config = format!(r#"{{"value": "{}h"}}"#, u64::MAX);
        assert!(serde_json::from_str::<Holder>(&config).is_err());
    }

    #[test]
    fn integers_are_seconds() {
        let holder: Holder = serde_json::from_str(r#"{"value": 12}"#).unwrap();
        assert_eq!(holder.value, Duration::from_secs(12));
    }

    #[test]
    fn strings_are_parsed() {
        let holder: Holder = serde_json::from_str(r#"{"value": "250ms"}"#).unwrap();
        assert_eq!(holder.value, Duration::from_millis(250));

        assert!(serde_json::from_str::<Holder>(r#"{"value": "soon"}"#).is_err());
        assert!(serde_json::from_str::<Holder>(r#"{"value": -1}"#).is_err());
    }

    #[test]
    fn serializes_back_to_suffixed_form() {
        let mut out = vec![];
        serialize(
            &Duration::from_millis(1500),
            &mut serde_json::Serializer::new(&mut out),
        )
        .unwrap();
        assert_eq!(out, br#""1500ms""#);
    }
}
