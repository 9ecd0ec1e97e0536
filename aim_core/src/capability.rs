//! Capability flags and capability sets.
//!
//! Every authority the daemon hands out is one of eighteen named flags.
//! A set of flags travels as a 32-bit mask with one bit per flag, in the
//! declaration order of [`Capability`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use lazy_static::lazy_static;

use crate::error::AimError;

/// A single named capability flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Capability {
    Root = 0,
    System,
    Usr,
    Am,
    Net,
    Dev,
    Proc,
    FileR,
    FileW,
    FileX,
    Mem,
    Log,
    Sec,
    Aud,
    Cfg,
    Upd,
    Srv,
    Dbg,
}

/// Name and bit position of every flag, in bit order.
const CAPABILITY_TABLE: [(Capability, &str); 18] = [
    (Capability::Root, "ROOT"),
    (Capability::System, "SYSTEM"),
    (Capability::Usr, "USR"),
    (Capability::Am, "AM"),
    (Capability::Net, "NET"),
    (Capability::Dev, "DEV"),
    (Capability::Proc, "PROC"),
    (Capability::FileR, "FILE_R"),
    (Capability::FileW, "FILE_W"),
    (Capability::FileX, "FILE_X"),
    (Capability::Mem, "MEM"),
    (Capability::Log, "LOG"),
    (Capability::Sec, "SEC"),
    (Capability::Aud, "AUD"),
    (Capability::Cfg, "CFG"),
    (Capability::Upd, "UPD"),
    (Capability::Srv, "SRV"),
    (Capability::Dbg, "DBG"),
];

lazy_static! {
    static ref CAPABILITY_BY_NAME: HashMap<&'static str, Capability> = CAPABILITY_TABLE
        .iter()
        .map(|(cap, name)| (*name, *cap))
        .collect();
}

impl Capability {
    /// All flags in bit order.
    pub fn all() -> impl Iterator<Item = Capability> {
        CAPABILITY_TABLE.iter().map(|(cap, _)| *cap)
    }

    /// The canonical upper-case name of this flag.
    pub fn name(self) -> &'static str {
        CAPABILITY_TABLE[self as usize].1
    }

    /// Look a flag up by name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Capability> {
        CAPABILITY_BY_NAME
            .get(name.trim().to_ascii_uppercase().as_str())
            .copied()
    }

    /// The single-bit set holding only this flag.
    pub fn bit(self) -> CapabilitySet {
        CapabilitySet::from_bits_retain(1 << (self as u32))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = AimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::from_name(s)
            .ok_or_else(|| AimError::InvalidOperation(format!("unknown capability: {}", s.trim())))
    }
}

bitflags! {
    /// A set of capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapabilitySet: u32 {
        const ROOT   = 1 << 0;
        const SYSTEM = 1 << 1;
        const USR    = 1 << 2;
        const AM     = 1 << 3;
        const NET    = 1 << 4;
        const DEV    = 1 << 5;
        const PROC   = 1 << 6;
        const FILE_R = 1 << 7;
        const FILE_W = 1 << 8;
        const FILE_X = 1 << 9;
        const MEM    = 1 << 10;
        const LOG    = 1 << 11;
        const SEC    = 1 << 12;
        const AUD    = 1 << 13;
        const CFG    = 1 << 14;
        const UPD    = 1 << 15;
        const SRV    = 1 << 16;
        const DBG    = 1 << 17;
    }
}

impl CapabilitySet {
    /// Base set for ordinary (non-system) users.
    pub const USER_BASE: CapabilitySet = CapabilitySet::USR
        .union(CapabilitySet::FILE_R)
        .union(CapabilitySet::PROC);

    /// Whether `cap` is a member of this set.
    pub fn has(self, cap: Capability) -> bool {
        self.contains(cap.bit())
    }

    /// Members of this set in bit order.
    pub fn capabilities(self) -> Vec<Capability> {
        Capability::all().filter(|cap| self.has(*cap)).collect()
    }

    /// Names of the members, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        self.capabilities().into_iter().map(Capability::name).collect()
    }

    /// Everything a holder of this set may delegate to somebody else.
    ///
    /// ROOT implies every flag and SYSTEM every flag but ROOT.
    pub fn authority(self) -> CapabilitySet {
        if self.contains(CapabilitySet::ROOT) {
            CapabilitySet::all()
        } else if self.contains(CapabilitySet::SYSTEM) {
            CapabilitySet::all().difference(CapabilitySet::ROOT)
        } else {
            self
        }
    }

    /// Parse a comma-joined name list (`"NET,DEV"`) or a numeric mask
    /// (`"48"`, `"0x30"`). The empty string is the empty set.
    pub fn parse(input: &str) -> Result<CapabilitySet, AimError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(CapabilitySet::empty());
        }

        let numeric = if let Some(hex) = input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))
        {
            Some(u32::from_str_radix(hex, 16))
        } else if input.bytes().all(|b| b.is_ascii_digit()) {
            Some(input.parse::<u32>())
        } else {
            None
        };

        if let Some(mask) = numeric {
            let mask = mask
                .map_err(|_| AimError::InvalidOperation(format!("invalid capability mask: {}", input)))?;
            return CapabilitySet::from_bits(mask).ok_or_else(|| {
                AimError::InvalidOperation(format!("capability mask has unknown bits: {:#x}", mask))
            });
        }

        input
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .try_fold(CapabilitySet::empty(), |set, part| {
                Ok::<_, AimError>(set | part.parse::<Capability>()?.bit())
            })
    }
}

impl From<Capability> for CapabilitySet {
    fn from(cap: Capability) -> Self {
        cap.bit()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter()
            .fold(CapabilitySet::empty(), |set, cap| set | cap.bit())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}
