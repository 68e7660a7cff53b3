//! Typed cell values and object identifiers.
//!
//! Every table cell holds a [`Value`] whose variant must match the
//! [`ProtocolType`] its column declares. Values are totally ordered so that
//! they can form composite row keys, and they know how to render themselves
//! as OID sub-identifiers when a row is named in a snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An object identifier: an ordered sequence of sub-identifiers.
///
/// Ordering is lexicographic, which is the order the management protocol
/// walks a MIB in.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid(Vec<u32>);

impl Oid {
    /// Creates an OID from its sub-identifiers.
    pub fn new(arcs: impl Into<Vec<u32>>) -> Self {
        Self(arcs.into())
    }

    /// Parses a dotted string such as `1.3.6.1.4.1`.
    ///
    /// A leading dot is accepted. Returns `None` if any component is not a
    /// non-negative integer.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.strip_prefix('.').unwrap_or(text);
        if text.is_empty() {
            return Some(Self::default());
        }
        text.split('.')
            .map(|arc| arc.parse::<u32>().ok())
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// Returns the sub-identifiers.
    pub fn arcs(&self) -> &[u32] {
        &self.0
    }

    /// Returns the number of sub-identifiers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the OID has no sub-identifiers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if `prefix` is a (non-strict) prefix of this OID.
    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Returns a new OID with one more sub-identifier.
    #[must_use]
    pub fn child(&self, arc: u32) -> Self {
        let mut arcs = self.0.clone();
        arcs.push(arc);
        Self(arcs)
    }

    /// Returns a new OID with `suffix` appended.
    #[must_use]
    pub fn extend(&self, suffix: &[u32]) -> Self {
        let mut arcs = self.0.clone();
        arcs.extend_from_slice(suffix);
        Self(arcs)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arc in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{arc}")?;
            first = false;
        }
        Ok(())
    }
}

impl From<&[u32]> for Oid {
    fn from(arcs: &[u32]) -> Self {
        Self(arcs.to_vec())
    }
}

/// The protocol type a column declares for its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    /// Signed 32-bit integer.
    Integer,
    /// Octet string, carried as UTF-8 text.
    OctetString,
    /// Unsigned 64-bit counter.
    Counter64,
    /// Unsigned 32-bit gauge.
    Gauge32,
    /// Object identifier.
    ObjectId,
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "INTEGER",
            Self::OctetString => "OCTET STRING",
            Self::Counter64 => "Counter64",
            Self::Gauge32 => "Gauge32",
            Self::ObjectId => "OBJECT IDENTIFIER",
        };
        f.write_str(name)
    }
}

/// A typed cell value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Signed 32-bit integer.
    Integer(i32),
    /// Octet string.
    OctetString(String),
    /// Unsigned 64-bit counter.
    Counter64(u64),
    /// Unsigned 32-bit gauge.
    Gauge32(u32),
    /// Object identifier.
    ObjectId(Oid),
}

impl Value {
    /// Returns the default value for a column of type `ty`.
    pub fn zero(ty: ProtocolType) -> Self {
        match ty {
            ProtocolType::Integer => Self::Integer(0),
            ProtocolType::OctetString => Self::OctetString(String::new()),
            ProtocolType::Counter64 => Self::Counter64(0),
            ProtocolType::Gauge32 => Self::Gauge32(0),
            ProtocolType::ObjectId => Self::ObjectId(Oid::default()),
        }
    }

    /// Returns the protocol type of this value.
    pub fn protocol_type(&self) -> ProtocolType {
        match self {
            Self::Integer(_) => ProtocolType::Integer,
            Self::OctetString(_) => ProtocolType::OctetString,
            Self::Counter64(_) => ProtocolType::Counter64,
            Self::Gauge32(_) => ProtocolType::Gauge32,
            Self::ObjectId(_) => ProtocolType::ObjectId,
        }
    }

    /// Returns the integer payload, if this is an `Integer`.
    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload, if this is an `OctetString`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::OctetString(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the counter payload, widening gauges.
    pub fn as_counter(&self) -> Option<u64> {
        match self {
            Self::Counter64(v) => Some(*v),
            Self::Gauge32(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    /// Returns the OID payload, if this is an `ObjectId`.
    pub fn as_oid(&self) -> Option<&Oid> {
        match self {
            Self::ObjectId(v) => Some(v),
            _ => None,
        }
    }

    /// Encodes this value as an index component of an instance OID.
    ///
    /// Integers map to a single sub-identifier, strings to their length
    /// followed by one sub-identifier per byte, and OIDs to their length
    /// followed by their arcs.
    pub fn index_sub_ids(&self) -> Vec<u32> {
        match self {
            #[allow(clippy::cast_sign_loss)]
            Self::Integer(v) => vec![*v as u32],
            Self::Gauge32(v) => vec![*v],
            #[allow(clippy::cast_possible_truncation)]
            Self::Counter64(v) => vec![*v as u32],
            #[allow(clippy::cast_possible_truncation)]
            Self::OctetString(s) => {
                let mut out = Vec::with_capacity(s.len() + 1);
                out.push(s.len() as u32);
                out.extend(s.bytes().map(u32::from));
                out
            }
            #[allow(clippy::cast_possible_truncation)]
            Self::ObjectId(oid) => {
                let mut out = Vec::with_capacity(oid.len() + 1);
                out.push(oid.len() as u32);
                out.extend_from_slice(oid.arcs());
                out
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::OctetString(v) => write!(f, "{v:?}"),
            Self::Counter64(v) => write!(f, "{v}"),
            Self::Gauge32(v) => write!(f, "{v}"),
            Self::ObjectId(v) => write!(f, "{v}"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Counter64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::OctetString(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::OctetString(v)
    }
}

impl From<Oid> for Value {
    fn from(v: Oid) -> Self {
        Self::ObjectId(v)
    }
}
