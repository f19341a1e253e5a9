//! Accelerator description: execution, memory and transfer units plus the buses
//! between them. Read-only for the whole pipeline run.

use crate::error::ConfigError;
use crate::location::Location;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

fn one() -> u64 {
    1
}

/// One dimension of a fixed hardware compute shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StencilIndex {
    pub name: String,
    /// Exact extent, or -1 for "any extent"
    pub size: i64,
    /// Required stride class per output: 0 absent, 1 contiguous, -1 any
    pub outs: Vec<i32>,
    /// Required stride class per input: 0 absent, 1 contiguous, -1 any
    pub ins: Vec<i32>,
}

impl Default for StencilIndex {
    fn default() -> Self {
        StencilIndex {
            name: String::new(),
            size: -1,
            outs: Vec::new(),
            ins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stencil {
    pub startup_cost: u64,
    pub idxs: Vec<StencilIndex>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    #[serde(default = "one")]
    pub count: u64,
    #[serde(default)]
    pub ops_per_cycle: u64,
    #[serde(default)]
    pub stencils: Vec<Stencil>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUnit {
    #[serde(default = "one")]
    pub count: u64,
    #[serde(rename = "size_KiB", default)]
    pub size_kib: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferUnit {
    #[serde(default = "one")]
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bus {
    pub sources: Vec<String>,
    pub sinks: Vec<String>,
    pub bytes_per_cycle: f64,
}

/// Unit classes a location may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitClass {
    Execution,
    Memory,
    Transfer,
}

impl UnitClass {
    pub fn label(&self) -> &'static str {
        match self {
            UnitClass::Execution => "execution",
            UnitClass::Memory => "memory",
            UnitClass::Transfer => "transfer",
        }
    }
}

impl fmt::Display for UnitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hardware {
    pub clock_mhz: f64,
    pub execution_units: BTreeMap<String, ExecutionUnit>,
    pub memory_units: BTreeMap<String, MemoryUnit>,
    pub transfer_units: BTreeMap<String, TransferUnit>,
    pub buses: Vec<Bus>,
}

impl Hardware {
    /// Class and instance count of the unit called `name`.
    pub fn unit(&self, name: &str) -> Option<(UnitClass, u64)> {
        if let Some(m) = self.memory_units.get(name) {
            return Some((UnitClass::Memory, m.count));
        }
        if let Some(t) = self.transfer_units.get(name) {
            return Some((UnitClass::Transfer, t.count));
        }
        self.execution_units
            .get(name)
            .map(|e| (UnitClass::Execution, e.count))
    }

    /// Capacity in bytes of the memory unit a location names.
    pub fn memory_bytes(&self, loc: &Location) -> Option<u64> {
        self.memory_units.get(&loc.name).map(|m| m.size_kib * 1024)
    }

    /// Every stencil declared by any execution unit, in unit-name order.
    pub fn stencils(&self) -> Vec<Stencil> {
        self.execution_units
            .values()
            .flat_map(|e| e.stencils.iter().cloned())
            .collect()
    }

    /// Check that `loc` exists and, when `expected` is set, has that class.
    pub fn check_location(
        &self,
        pass: &str,
        loc: &Location,
        expected: Option<UnitClass>,
    ) -> Result<(), ConfigError> {
        let (class, count) = self
            .unit(&loc.name)
            .ok_or_else(|| ConfigError::UnknownLocation {
                pass: pass.to_string(),
                location: loc.to_string(),
            })?;
        if let Some(expected) = expected {
            if expected != class {
                return Err(ConfigError::WrongUnitClass {
                    pass: pass.to_string(),
                    location: loc.to_string(),
                    expected: expected.label(),
                });
            }
        }
        if let Some(unit) = loc.unit {
            if unit >= count {
                return Err(ConfigError::UnitOutOfRange {
                    location: loc.to_string(),
                    unit,
                    count,
                });
            }
        }
        Ok(())
    }

    /// Check the unit records and buses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (bus_idx, bus) in self.buses.iter().enumerate() {
            for name in bus.sources.iter().chain(&bus.sinks) {
                if self.unit(name).is_none() {
                    return Err(ConfigError::UnknownBusUnit {
                        bus: bus_idx,
                        unit: name.clone(),
                    });
                }
            }
        }
        let counts = self
            .execution_units
            .iter()
            .map(|(n, u)| (n, u.count))
            .chain(self.memory_units.iter().map(|(n, u)| (n, u.count)))
            .chain(self.transfer_units.iter().map(|(n, u)| (n, u.count)));
        for (name, count) in counts {
            if count == 0 {
                return Err(ConfigError::InvalidField {
                    pass: format!("<unit {}>", name),
                    field: "count",
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Hardware {
        serde_json::from_str(
            r#"{
                "clock_mhz": 1000.0,
                "execution_units": { "MAC": { "count": 4, "ops_per_cycle": 256 } },
                "memory_units": { "DRAM": { "size_KiB": 1048576 }, "SRAM": { "count": 2, "size_KiB": 16 } },
                "transfer_units": { "DMA": {} },
                "buses": [ { "sources": ["DRAM"], "sinks": ["SRAM"], "bytes_per_cycle": 64.0 } ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_and_lookup() {
        let hw = sample();
        assert_eq!(hw.transfer_units["DMA"].count, 1);
        assert_eq!(hw.memory_units["DRAM"].count, 1);
        assert_eq!(hw.unit("SRAM"), Some((UnitClass::Memory, 2)));
        assert_eq!(hw.memory_bytes(&Location::new("SRAM")), Some(16 * 1024));
        assert!(hw.validate().is_ok());
    }

    #[test]
    fn test_check_location() {
        let hw = sample();
        assert!(hw
            .check_location("p", &Location::with_unit("SRAM", 1), Some(UnitClass::Memory))
            .is_ok());
        assert!(matches!(
            hw.check_location("p", &Location::with_unit("SRAM", 2), None),
            Err(ConfigError::UnitOutOfRange { .. })
        ));
        assert!(matches!(
            hw.check_location("p", &Location::new("DMA"), Some(UnitClass::Memory)),
            Err(ConfigError::WrongUnitClass { .. })
        ));
        assert!(matches!(
            hw.check_location("p", &Location::new("L2"), None),
            Err(ConfigError::UnknownLocation { .. })
        ));
    }

    #[test]
    fn test_bus_with_unknown_unit() {
        let mut hw = sample();
        hw.buses.push(Bus {
            sources: vec!["SRAM".into()],
            sinks: vec!["L3".into()],
            bytes_per_cycle: 8.0,
        });
        assert!(matches!(
            hw.validate(),
            Err(ConfigError::UnknownBusUnit { bus: 1, .. })
        ));
    }
}
