//! Integer affine polynomials over index names.
//!
//! The constant term is stored under the empty name. Zero coefficients are never
//! stored, so structural equality is semantic equality.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Sub};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Affine(BTreeMap<String, i64>);

impl Affine {
    pub fn zero() -> Self {
        Affine::default()
    }

    pub fn constant(value: i64) -> Self {
        let mut a = Affine::zero();
        a.add_term("", value);
        a
    }

    pub fn index(name: &str) -> Self {
        Affine::term(name, 1)
    }

    pub fn term(name: &str, coeff: i64) -> Self {
        let mut a = Affine::zero();
        a.add_term(name, coeff);
        a
    }

    fn add_term(&mut self, name: &str, coeff: i64) {
        if coeff == 0 {
            return;
        }
        let entry = self.0.entry(name.to_string()).or_insert(0);
        *entry += coeff;
        if *entry == 0 {
            self.0.remove(name);
        }
    }

    /// Coefficient of `name` (0 when absent).
    pub fn coeff(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn constant_term(&self) -> i64 {
        self.coeff("")
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_constant(&self) -> bool {
        self.0.keys().all(|k| k.is_empty())
    }

    pub fn uses(&self, name: &str) -> bool {
        !name.is_empty() && self.0.contains_key(name)
    }

    /// Index names with non-zero coefficient.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().filter(|k| !k.is_empty()).map(String::as_str)
    }

    /// Index terms as `(name, coeff)` pairs.
    pub fn terms(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0
            .iter()
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, v)| (k.as_str(), *v))
    }

    /// Replace `name` by `value` everywhere.
    pub fn substitute(&self, name: &str, value: &Affine) -> Affine {
        let coeff = self.coeff(name);
        if coeff == 0 || name.is_empty() {
            return self.clone();
        }
        let mut out = self.clone();
        out.0.remove(name);
        out + value.clone() * coeff
    }

    /// Simultaneous substitution of several names.
    pub fn substitute_all(&self, map: &BTreeMap<String, Affine>) -> Affine {
        let mut out = Affine::constant(self.constant_term());
        for (name, coeff) in self.terms() {
            match map.get(name) {
                Some(value) => out = out + value.clone() * coeff,
                None => out.add_term(name, coeff),
            }
        }
        out
    }

    /// Drop every term whose name is not kept, leaving the constant in place.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) -> Affine {
        let mut out = self.clone();
        out.0.retain(|k, _| k.is_empty() || keep(k));
        out
    }

    /// Evaluate with every named index bound to `values` (missing names count as 0).
    pub fn eval(&self, values: &BTreeMap<String, i64>) -> i64 {
        self.constant_term()
            + self
                .terms()
                .map(|(name, c)| c * values.get(name).copied().unwrap_or(0))
                .sum::<i64>()
    }
}

impl Add for Affine {
    type Output = Affine;

    fn add(mut self, rhs: Affine) -> Affine {
        for (name, coeff) in rhs.0 {
            self.add_term(&name, coeff);
        }
        self
    }
}

impl Sub for Affine {
    type Output = Affine;

    fn sub(self, rhs: Affine) -> Affine {
        self + rhs * -1
    }
}

impl Mul<i64> for Affine {
    type Output = Affine;

    fn mul(self, rhs: i64) -> Affine {
        if rhs == 0 {
            return Affine::zero();
        }
        Affine(self.0.into_iter().map(|(k, v)| (k, v * rhs)).collect())
    }
}

impl fmt::Display for Affine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "0");
        }
        let mut first = true;
        for (name, coeff) in self.terms() {
            let (sign, mag) = if coeff < 0 { ("-", -coeff) } else { ("+", coeff) };
            if first {
                if coeff < 0 {
                    write!(f, "-")?;
                }
            } else {
                write!(f, " {} ", sign)?;
            }
            if mag == 1 {
                write!(f, "{}", name)?;
            } else {
                write!(f, "{}*{}", mag, name)?;
            }
            first = false;
        }
        let c = self.constant_term();
        if c != 0 {
            if first {
                write!(f, "{}", c)?;
            } else if c < 0 {
                write!(f, " - {}", -c)?;
            } else {
                write!(f, " + {}", c)?;
            }
        }
        Ok(())
    }
}
