//! Serde support for `std::time::Duration` written as humantime strings
//! (`"200ms"`, `"30s"`, `"1m 30s"`).
//!
//! ```ignore
//! #[derive(Deserialize)]
//! struct Foo {
//!     #[serde(with = "crate::humantime_serde")]
//!     timeout: Duration,
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer, de};

pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(de::Error::custom)
}

pub fn serialize<S>(value: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.collect_str(&humantime::format_duration(*value))
}

/// Same as the parent module, for `Option<Duration>`.
pub mod option {
    use super::{Deserialize, Deserializer, Duration, Serializer, de};

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(d)?
            .map(|raw| humantime::parse_duration(&raw).map_err(de::Error::custom))
            .transpose()
    }

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => s.collect_str(&humantime::format_duration(*d)),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "super")]
        d: Duration,
        #[serde(with = "super::option", default)]
        o: Option<Duration>,
    }

    #[test]
    fn parses_humantime_strings() {
        let h: Holder = serde_json::from_str(r#"{"d":"1m 30s","o":"250ms"}"#).unwrap();
        assert_eq!(h.d, Duration::from_secs(90));
        assert_eq!(h.o, Some(Duration::from_millis(250)));
    }

    #[test]
    fn missing_option_is_none() {
        let h: Holder = serde_json::from_str(r#"{"d":"5s"}"#).unwrap();
        assert!(h.o.is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Holder>(r#"{"d":"soon"}"#).is_err());
    }

    #[test]
    fn serializes_back_to_humantime() {
        let h = Holder {
            d: Duration::from_millis(200),
            o: None,
        };
        assert_eq!(serde_json::to_string(&h).unwrap(), r#"{"d":"200ms","o":null}"#);
    }
}
