// Copyright 2025 The Tenama Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Resource quantity arithmetic.
//!
//! Quantities are non-negative values with an SI suffix, e.g. `500m` CPU or
//! `2Gi` memory. Internally they are stored as integral milliunits so that
//! addition, subtraction and comparison are exact; values finer than one
//! milliunit are rounded up on parse.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Milliunits per base unit.
const MILLI: u128 = 1_000;

/// Errors produced when parsing a quantity string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantityParseError {
    /// The input was empty or whitespace.
    #[error("quantity is empty")]
    Empty,

    /// The numeric part of the input was missing or malformed.
    #[error("invalid quantity mantissa in {0:?}")]
    InvalidMantissa(String),

    /// The suffix was not a recognized decimal or binary SI suffix.
    #[error("unknown quantity suffix in {0:?}")]
    UnknownSuffix(String),

    /// The value does not fit the internal representation.
    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

/// Suffix family a quantity was expressed in.
///
/// The family is a formatting hint only; it does not take part in equality
/// or ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixFamily {
    /// Decimal SI suffixes: `m`, none, `k`, `M`, `G`, `T`.
    Decimal,
    /// Binary SI suffixes: `Ki`, `Mi`, `Gi`, `Ti`.
    Binary,
}

/// Decimal suffixes with their scale in milliunits, largest first.
const DECIMAL_SUFFIXES: [(&str, u128); 5] = [
    ("T", 1_000_000_000_000 * MILLI),
    ("G", 1_000_000_000 * MILLI),
    ("M", 1_000_000 * MILLI),
    ("k", 1_000 * MILLI),
    ("", MILLI),
];

/// Binary suffixes with their scale in milliunits, largest first. The bare
/// unit is included as the integer fallback for fractional mantissas.
const BINARY_SUFFIXES: [(&str, u128); 5] = [
    ("Ti", (1 << 40) * MILLI),
    ("Gi", (1 << 30) * MILLI),
    ("Mi", (1 << 20) * MILLI),
    ("Ki", (1 << 10) * MILLI),
    ("", MILLI),
];

fn suffix_scale(suffix: &str) -> Option<(u128, SuffixFamily)> {
    match suffix {
        "" => Some((MILLI, SuffixFamily::Decimal)),
        "m" => Some((1, SuffixFamily::Decimal)),
        "k" => Some((1_000 * MILLI, SuffixFamily::Decimal)),
        "M" => Some((1_000_000 * MILLI, SuffixFamily::Decimal)),
        "G" => Some((1_000_000_000 * MILLI, SuffixFamily::Decimal)),
        "T" => Some((1_000_000_000_000 * MILLI, SuffixFamily::Decimal)),
        "Ki" => Some(((1 << 10) * MILLI, SuffixFamily::Binary)),
        "Mi" => Some(((1 << 20) * MILLI, SuffixFamily::Binary)),
        "Gi" => Some(((1 << 30) * MILLI, SuffixFamily::Binary)),
        "Ti" => Some(((1 << 40) * MILLI, SuffixFamily::Binary)),
        _ => None,
    }
}

/// A non-negative resource quantity.
#[derive(Debug, Clone, Copy)]
pub struct Quantity {
    millis: u128,
    family: SuffixFamily,
}

impl Quantity {
    /// The zero quantity.
    pub const fn zero() -> Self {
        Quantity {
            millis: 0,
            family: SuffixFamily::Decimal,
        }
    }

    /// Builds a quantity directly from milliunits.
    pub const fn from_millis(millis: u128, family: SuffixFamily) -> Self {
        Quantity { millis, family }
    }

    /// Parses a quantity string such as `500m`, `2`, `1.5Gi` or `100Ki`.
    pub fn parse(input: &str) -> Result<Self, QuantityParseError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(QuantityParseError::Empty);
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (mantissa, suffix) = s.split_at(split);
        let (scale, family) =
            suffix_scale(suffix).ok_or_else(|| QuantityParseError::UnknownSuffix(input.into()))?;

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        if (int_part.is_empty() && frac_part.is_empty())
            || frac_part.contains('.')
            || !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(QuantityParseError::InvalidMantissa(input.into()));
        }
        // Enough fractional digits to express a milli of the smallest unit.
        if frac_part.len() > 15 {
            return Err(QuantityParseError::OutOfRange(input.into()));
        }

        let int: u128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| QuantityParseError::OutOfRange(input.to_string()))?
        };
        let frac: u128 = if frac_part.is_empty() {
            0
        } else {
            frac_part
                .parse()
                .map_err(|_| QuantityParseError::OutOfRange(input.to_string()))?
        };
        let frac_den = 10u128.pow(frac_part.len() as u32);

        // millis = (int + frac/den) * scale, rounded up to the next milli.
        let whole = int
            .checked_mul(scale)
            .ok_or_else(|| QuantityParseError::OutOfRange(input.to_string()))?;
        let frac_millis = frac
            .checked_mul(scale)
            .and_then(|n| n.checked_add(frac_den - 1))
            .map(|n| n / frac_den)
            .ok_or_else(|| QuantityParseError::OutOfRange(input.to_string()))?;
        let millis = whole
            .checked_add(frac_millis)
            .ok_or_else(|| QuantityParseError::OutOfRange(input.to_string()))?;

        Ok(Quantity { millis, family })
    }

    /// Returns the value in milliunits.
    pub fn millis(&self) -> u128 {
        self.millis
    }

    /// Returns true if the quantity is zero.
    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    /// Sign of the value: `0` for zero, `1` otherwise. Quantities are never
    /// negative; negative intermediate results surface as a failed
    /// [`Quantity::checked_sub`].
    pub fn sign(&self) -> i8 {
        if self.millis == 0 {
            0
        } else {
            1
        }
    }

    /// Adds two quantities, saturating at the representable maximum. The
    /// suffix family of the first non-zero operand is kept for formatting.
    pub fn saturating_add(&self, other: &Quantity) -> Quantity {
        let family = if self.is_zero() {
            other.family
        } else {
            self.family
        };
        Quantity {
            millis: self.millis.saturating_add(other.millis),
            family,
        }
    }

    /// Subtracts `other`, returning `None` if the result would be negative.
    pub fn checked_sub(&self, other: &Quantity) -> Option<Quantity> {
        self.millis.checked_sub(other.millis).map(|millis| Quantity {
            millis,
            family: self.family,
        })
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

impl fmt::Display for Quantity {
    /// Formats the canonical string form: the largest suffix of the original
    /// family that yields an integer mantissa, falling back to milliunits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis == 0 {
            return write!(f, "0");
        }
        let table = match self.family {
            SuffixFamily::Decimal => &DECIMAL_SUFFIXES,
            SuffixFamily::Binary => &BINARY_SUFFIXES,
        };
        for (suffix, scale) in table {
            if self.millis % scale == 0 {
                return write!(f, "{}{}", self.millis / scale, suffix);
            }
        }
        write!(f, "{}m", self.millis)
    }
}

/// The resource dimensions tracked per tenant namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// CPU time share, usually expressed in millicores.
    Cpu,
    /// Main memory in bytes.
    Memory,
    /// Persistent storage in bytes.
    Storage,
}

impl ResourceKind {
    /// All tracked kinds.
    pub const ALL: [ResourceKind; 3] =
        [ResourceKind::Cpu, ResourceKind::Memory, ResourceKind::Storage];

    /// The Kubernetes resource name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mapping from resource kind to a non-negative quantity.
///
/// Absent kinds mean zero; explicit zeroes are normalized away on insert so
/// the two states are indistinguishable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceVector(BTreeMap<ResourceKind, Quantity>);

impl ResourceVector {
    /// Creates an empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, dropping zero values.
    pub fn with(mut self, kind: ResourceKind, quantity: Quantity) -> Self {
        self.set(kind, quantity);
        self
    }

    /// Sets a component; zero removes it.
    pub fn set(&mut self, kind: ResourceKind, quantity: Quantity) {
        if quantity.is_zero() {
            self.0.remove(&kind);
        } else {
            self.0.insert(kind, quantity);
        }
    }

    /// Removes a component.
    pub fn remove(&mut self, kind: ResourceKind) {
        self.0.remove(&kind);
    }

    /// Returns a component, if present and non-zero.
    pub fn get(&self, kind: ResourceKind) -> Option<Quantity> {
        self.0.get(&kind).copied()
    }

    /// Returns true if no component is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of non-zero components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over the non-zero components in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, Quantity)> + '_ {
        self.0.iter().map(|(k, q)| (*k, *q))
    }

    /// Adds every component of `other` into this vector.
    pub fn merge_add(&mut self, other: &ResourceVector) {
        for (kind, quantity) in other.iter() {
            let sum = self
                .get(kind)
                .unwrap_or_else(Quantity::zero)
                .saturating_add(&quantity);
            self.set(kind, sum);
        }
    }
}
