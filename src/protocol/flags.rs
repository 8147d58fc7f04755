use serde::Serialize;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Coordination bits stored in byte 0 of the channel.
///
/// | Flag | Set by | Cleared by |
/// |---|---|---|
/// | `RECEIVER_READY` | receiver | receiver |
/// | `DATA_READY` | sender | sender |
/// | `DATA_READ` | receiver | sender |
/// | `EOF` | sender | never during a transfer |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct Flags(u8);

impl Flags {
    pub const EMPTY: Flags = Flags(0);
    pub const RECEIVER_READY: Flags = Flags(1);
    pub const DATA_READY: Flags = Flags(2);
    pub const DATA_READ: Flags = Flags(4);
    pub const EOF: Flags = Flags(8);

    /// Bits that only mean something while a chunk is in flight. A fresh
    /// transfer starts with all of them low.
    pub const TRANSFER: Flags = Flags(2 | 4 | 8);

    const NAMED: [(Flags, &'static str); 4] = [
        (Flags::RECEIVER_READY, "RECEIVER_READY"),
        (Flags::DATA_READY, "DATA_READY"),
        (Flags::DATA_READ, "DATA_READ"),
        (Flags::EOF, "EOF"),
    ];

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when at least one bit of `other` is set.
    pub const fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersection(self, other: Flags) -> Flags {
        Flags(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Flags) -> Flags {
        Flags(self.0 & !other.0)
    }

    /// Names of the set bits, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.union(rhs)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        *self = self.union(rhs);
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            write!(f, "(none)")?;
        } else {
            write!(f, "{}", names.join(" | "))?;
        }
        // Bits outside the four known signals.
        let unknown = self.difference(Flags::RECEIVER_READY | Flags::TRANSFER);
        if !unknown.is_empty() {
            write!(f, " +{:#04x}", unknown.bits())?;
        }
        Ok(())
    }
}
