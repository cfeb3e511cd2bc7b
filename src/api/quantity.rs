//! Kubernetes-style resource quantities ("100m", "1", "128Mi").
//!
//! Quantities are compared and aggregated through their milli-value, the
//! same unit the emitted CSV artifacts use. The original text form is kept
//! so scenario files round-trip unchanged.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("invalid quantity {0:?}")]
    Invalid(String),
}

/// A resource quantity such as `500m` cpu or `8Gi` memory.
#[derive(Debug, Clone)]
pub struct Quantity {
    text: String,
    millis: i64,
}

impl Quantity {
    pub fn parse(s: &str) -> Result<Self, QuantityError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Invalid(s.to_string()));
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let value: f64 = number
            .parse()
            .map_err(|_| QuantityError::Invalid(s.to_string()))?;

        // Factor converts the suffixed value into milli-units.
        let factor: f64 = match suffix {
            "m" => 1.0,
            "" => 1_000.0,
            "k" => 1_000.0 * 1e3,
            "M" => 1_000.0 * 1e6,
            "G" => 1_000.0 * 1e9,
            "T" => 1_000.0 * 1e12,
            "Ki" => 1_000.0 * 1024.0,
            "Mi" => 1_000.0 * 1024.0 * 1024.0,
            "Gi" => 1_000.0 * 1024.0 * 1024.0 * 1024.0,
            "Ti" => 1_000.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
            _ => return Err(QuantityError::Invalid(s.to_string())),
        };

        Ok(Self {
            text: s.to_string(),
            millis: (value * factor).round() as i64,
        })
    }

    pub fn from_millis(millis: i64) -> Self {
        let text = if millis % 1_000 == 0 {
            (millis / 1_000).to_string()
        } else {
            format!("{millis}m")
        };
        Self { text, millis }
    }

    pub fn zero() -> Self {
        Self::from_millis(0)
    }

    /// Milli-value, e.g. `1` cpu -> 1000, `128Mi` -> 134217728000.
    pub fn milli_value(&self) -> i64 {
        self.millis
    }

    /// Whole-unit value, truncated.
    pub fn value(&self) -> i64 {
        self.millis / 1_000
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.millis == other.millis
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis.cmp(&other.millis)
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity::from_millis(self.millis + rhs.millis)
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity::from_millis(self.millis - rhs.millis)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a quantity string or number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
                Quantity::parse(v).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
                Ok(Quantity::from_millis(v as i64 * 1_000))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
                Ok(Quantity::from_millis(v * 1_000))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Quantity, E> {
                Ok(Quantity::from_millis((v * 1_000.0).round() as i64))
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_quantities() {
        assert_eq!(Quantity::parse("100m").unwrap().milli_value(), 100);
        assert_eq!(Quantity::parse("1").unwrap().milli_value(), 1_000);
        assert_eq!(Quantity::parse("2").unwrap().value(), 2);
        assert_eq!(Quantity::parse("0.5").unwrap().milli_value(), 500);
    }

    #[test]
    fn parses_memory_quantities() {
        assert_eq!(
            Quantity::parse("128Mi").unwrap().milli_value(),
            128 * 1024 * 1024 * 1_000
        );
        assert_eq!(
            Quantity::parse("1Gi").unwrap().milli_value(),
            1024 * 1024 * 1024 * 1_000
        );
        assert_eq!(Quantity::parse("1k").unwrap().milli_value(), 1_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Quantity::parse("").is_err());
        assert!(Quantity::parse("10Xi").is_err());
        assert!(Quantity::parse("abc").is_err());
    }

    #[test]
    fn equality_is_by_milli_value() {
        assert_eq!(Quantity::parse("1").unwrap(), Quantity::parse("1000m").unwrap());
        assert!(Quantity::parse("2").unwrap() > Quantity::parse("1500m").unwrap());
    }

    #[test]
    fn arithmetic() {
        let sum = Quantity::parse("1").unwrap() + Quantity::parse("500m").unwrap();
        assert_eq!(sum.milli_value(), 1_500);
        let diff = Quantity::parse("1").unwrap() - Quantity::parse("250m").unwrap();
        assert_eq!(diff.milli_value(), 750);
    }

    #[test]
    fn serde_round_trip_preserves_text() {
        let q: Quantity = serde_yaml::from_str("128Mi").unwrap();
        assert_eq!(serde_yaml::to_string(&q).unwrap().trim(), "128Mi");

        let q: Quantity = serde_yaml::from_str("1").unwrap();
        assert_eq!(q.milli_value(), 1_000);
    }
}
