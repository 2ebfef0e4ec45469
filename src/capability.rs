//! Capability flags: which analysis steps are requested or already done.
//!
//! Stored in the database as a plain integer bitmask, so the bit values are
//! part of the persisted format and must not change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not, Sub};

/// One unit of analysis, bound to at most one engine slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Basic,
    Risk,
    Tags,
    Face,
    Vector,
}

impl Capability {
    /// Dispatch order within a scan. Derived outputs (tag statistics) always
    /// run after their inputs.
    pub const ORDERED: [Capability; 5] = [
        Capability::Basic,
        Capability::Risk,
        Capability::Tags,
        Capability::Face,
        Capability::Vector,
    ];

    pub fn bit(self) -> u32 {
        match self {
            Capability::Basic => 1,
            Capability::Risk => 2,
            Capability::Tags => 4,
            Capability::Face => 8,
            Capability::Vector => 16,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Capability::Basic => "basic",
            Capability::Risk => "risk",
            Capability::Tags => "tags",
            Capability::Face => "face",
            Capability::Vector => "vector",
        }
    }

    pub fn flags(self) -> CapabilityFlags {
        CapabilityFlags(self.bit())
    }
}

/// A set of capabilities as a fixed bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const NONE: CapabilityFlags = CapabilityFlags(0);
    pub const BASIC: CapabilityFlags = CapabilityFlags(1);
    pub const RISK: CapabilityFlags = CapabilityFlags(2);
    pub const TAGS: CapabilityFlags = CapabilityFlags(4);
    pub const FACE: CapabilityFlags = CapabilityFlags(8);
    pub const VECTOR: CapabilityFlags = CapabilityFlags(16);
    pub const ALL: CapabilityFlags = CapabilityFlags(31);
    /// Capabilities requiring a loaded engine (everything but basic).
    pub const HEAVY: CapabilityFlags = CapabilityFlags(30);

    pub fn from_bits(bits: u32) -> Self {
        CapabilityFlags(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Map request module names to flags. Unknown names are ignored; an
    /// empty or fully unrecognized list falls back to basic, never to an
    /// empty set.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = CapabilityFlags::NONE;
        for name in names {
            flags |= match name.as_ref().trim().to_ascii_lowercase().as_str() {
                "basic" | "statistics" => CapabilityFlags::BASIC,
                "nsfw" | "risk" => CapabilityFlags::RISK,
                "tags" => CapabilityFlags::TAGS,
                "face" => CapabilityFlags::FACE,
                "vector" => CapabilityFlags::VECTOR,
                _ => CapabilityFlags::NONE,
            };
        }
        if flags.is_empty() {
            CapabilityFlags::BASIC
        } else {
            flags
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn contains_all(self, other: CapabilityFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: CapabilityFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    /// Capabilities present in the set, in dispatch order.
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ORDERED
            .into_iter()
            .filter(move |cap| self.contains(*cap))
    }

    pub fn names(self) -> Vec<&'static str> {
        self.iter().map(Capability::name).collect()
    }
}

impl BitOr for CapabilityFlags {
    type Output = CapabilityFlags;
    fn bitor(self, rhs: Self) -> Self {
        CapabilityFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for CapabilityFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CapabilityFlags {
    type Output = CapabilityFlags;
    fn bitand(self, rhs: Self) -> Self {
        CapabilityFlags(self.0 & rhs.0)
    }
}

impl Not for CapabilityFlags {
    type Output = CapabilityFlags;
    fn not(self) -> Self {
        CapabilityFlags(!self.0 & Self::ALL.0)
    }
}

/// Set difference: `requested - done` is the still-needed delta.
impl Sub for CapabilityFlags {
    type Output = CapabilityFlags;
    fn sub(self, rhs: Self) -> Self {
        CapabilityFlags(self.0 & !rhs.0)
    }
}

impl fmt::Debug for CapabilityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityFlags({})", self)
    }
}

impl fmt::Display for CapabilityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for cap in self.iter() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{}", cap.name())?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values_are_stable() {
        assert_eq!(CapabilityFlags::BASIC.bits(), 1);
        assert_eq!(CapabilityFlags::RISK.bits(), 2);
        assert_eq!(CapabilityFlags::TAGS.bits(), 4);
        assert_eq!(CapabilityFlags::FACE.bits(), 8);
        assert_eq!(CapabilityFlags::VECTOR.bits(), 16);
    }

    #[test]
    fn test_from_names_maps_aliases() {
        let flags = CapabilityFlags::from_names(["statistics", "nsfw", "TAGS"]);
        assert!(flags.contains(Capability::Basic));
        assert!(flags.contains(Capability::Risk));
        assert!(flags.contains(Capability::Tags));
        assert!(!flags.contains(Capability::Face));
    }

    #[test]
    fn test_from_names_defaults_to_basic() {
        assert_eq!(
            CapabilityFlags::from_names(Vec::<String>::new()),
            CapabilityFlags::BASIC
        );
        assert_eq!(
            CapabilityFlags::from_names(["bogus", "unknown"]),
            CapabilityFlags::BASIC
        );
    }

    #[test]
    fn test_difference_is_needed_delta() {
        let requested = CapabilityFlags::BASIC | CapabilityFlags::RISK | CapabilityFlags::TAGS;
        let done = CapabilityFlags::BASIC | CapabilityFlags::TAGS;
        let needed = requested - done;
        assert_eq!(needed, CapabilityFlags::RISK);
        assert!((requested - requested).is_empty());
    }

    #[test]
    fn test_iter_follows_dispatch_order() {
        let flags = CapabilityFlags::VECTOR | CapabilityFlags::BASIC | CapabilityFlags::FACE;
        let order: Vec<_> = flags.iter().collect();
        assert_eq!(
            order,
            vec![Capability::Basic, Capability::Face, Capability::Vector]
        );
    }

    #[test]
    fn test_display() {
        let flags = CapabilityFlags::RISK | CapabilityFlags::TAGS;
        assert_eq!(flags.to_string(), "risk|tags");
        assert_eq!(CapabilityFlags::NONE.to_string(), "none");
    }
}
