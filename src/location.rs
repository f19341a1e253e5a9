//! Hardware locations.
//!
//! A location names a hardware unit class and, optionally, one instance of it:
//! `"SRAM"` or `"SRAM[2]"`.

use crate::error::ConfigError;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref LOCATION_RE: Regex =
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*(?:\[\s*(\d+)\s*\])?\s*$")
            .expect("location pattern is valid");
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Location {
    /// Unit name as declared in the hardware description
    pub name: String,
    /// Instance index; `None` means any instance
    pub unit: Option<u64>,
}

impl Location {
    pub fn new(name: impl Into<String>) -> Self {
        Location {
            name: name.into(),
            unit: None,
        }
    }

    pub fn with_unit(name: impl Into<String>, unit: u64) -> Self {
        Location {
            name: name.into(),
            unit: Some(unit),
        }
    }

    /// Whether `self` (a location on an IR node) falls under `selector`.
    ///
    /// A selector without a unit covers every instance of its unit class.
    pub fn is_within(&self, selector: &Location) -> bool {
        self.name == selector.name && (selector.unit.is_none() || selector.unit == self.unit)
    }
}

impl FromStr for Location {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = LOCATION_RE
            .captures(s)
            .ok_or_else(|| ConfigError::MalformedLocation(s.to_string()))?;
        let unit = match caps.get(2) {
            Some(m) => Some(
                m.as_str()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::MalformedLocation(s.to_string()))?,
            ),
            None => None,
        };
        Ok(Location {
            name: caps[1].to_string(),
            unit,
        })
    }
}

impl TryFrom<String> for Location {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Location> for String {
    fn from(loc: Location) -> Self {
        loc.to_string()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Some(unit) => write!(f, "{}[{}]", self.name, unit),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_indexed() {
        let plain: Location = "DRAM".parse().unwrap();
        assert_eq!(plain, Location::new("DRAM"));

        let indexed: Location = " SRAM [ 3 ] ".parse().unwrap();
        assert_eq!(indexed, Location::with_unit("SRAM", 3));
        assert_eq!(indexed.to_string(), "SRAM[3]");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Location>().is_err());
        assert!("SRAM[x]".parse::<Location>().is_err());
        assert!("3SRAM".parse::<Location>().is_err());
    }

    #[test]
    fn test_selector_matching() {
        let any_sram = Location::new("SRAM");
        let sram1 = Location::with_unit("SRAM", 1);
        assert!(sram1.is_within(&any_sram));
        assert!(sram1.is_within(&Location::with_unit("SRAM", 1)));
        assert!(!sram1.is_within(&Location::with_unit("SRAM", 0)));
        assert!(!sram1.is_within(&Location::new("DRAM")));
    }

    #[test]
    fn test_serde_as_string() {
        let loc: Location = serde_json::from_str("\"MAC[7]\"").unwrap();
        assert_eq!(loc, Location::with_unit("MAC", 7));
        assert_eq!(serde_json::to_string(&loc).unwrap(), "\"MAC[7]\"");
    }
}
