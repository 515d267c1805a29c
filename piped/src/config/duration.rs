//! Duration strings made of number+unit pairs ("1h30m", "45s", "500ms")

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

use crate::errors::PipedError;

/// Parse a duration such as `1h30m`, `2m`, `1.5s` or `300ms`.
pub fn parse(input: &str) -> Result<Duration, PipedError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(PipedError::Config("empty duration".to_string()));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(PipedError::Config(format!("invalid duration {:?}", input)));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| PipedError::Config(format!("invalid duration {:?}", input)))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let secs_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => {
                return Err(PipedError::Config(format!(
                    "missing unit in duration {:?}",
                    input
                )))
            }
            unit => {
                return Err(PipedError::Config(format!(
                    "unknown unit {:?} in duration {:?}",
                    unit, input
                )))
            }
        };
        rest = &rest[unit_len..];
        total += value * secs_per_unit;
    }

    Ok(Duration::from_secs_f64(total))
}

/// Format a duration back into the same notation (`1h30m0s`, `45s`, `500ms`).
pub fn format(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    let total_ms = d.as_millis();
    if total_ms < 1000 {
        return format!("{}ms", total_ms);
    }
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let ms = d.subsec_millis();
    let sec_part = if ms > 0 {
        format!("{}.{:03}", s, ms).trim_end_matches('0').to_string() + "s"
    } else {
        format!("{}s", s)
    };
    if h > 0 {
        format!("{}h{}m{}", h, m, sec_part)
    } else if m > 0 {
        format!("{}m{}", m, sec_part)
    } else {
        sec_part
    }
}

/// Serde adapter for `Duration` fields, use with `#[serde(with = "duration::serde_str")]`.
pub mod serde_str {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<Duration>` fields.
pub mod serde_str_opt {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => serializer.serialize_str(&format(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) if !s.trim().is_empty() => {
                parse(&s).map(Some).map_err(serde::de::Error::custom)
            }
            _ => Ok(None),
        }
    }
}
