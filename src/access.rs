//! File access rights.
//!
//! Each DESFire file carries four independent rights, one nibble each,
//! packed into a 16-bit word: read, write, read+write and change-rights.
//! Nibble values `0x0`..`0xD` name the application key that must have been
//! authenticated, `0xE` grants the right to everyone and `0xF` to no one.


use std::fmt;


/// One access right: a key number, free access, or denied access.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AccessRight {
    /// Requires a session authenticated with this key number (`0..=13`).
    Key(u8),
    /// Granted without authentication.
    Free,
    /// Never granted, not even to the application master key.
    Never,
}
impl AccessRight {
    const FREE_NIBBLE: u8 = 0xE;
    const NEVER_NIBBLE: u8 = 0xF;

    /// Decodes one nibble; values above `0xF` are rejected.
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        if nibble > 0xF {
            return None;
        }
        Some(Self::from_masked(nibble))
    }

    fn from_masked(nibble: u8) -> Self {
        match nibble & 0xF {
            Self::FREE_NIBBLE => Self::Free,
            Self::NEVER_NIBBLE => Self::Never,
            key_no => Self::Key(key_no),
        }
    }

    pub fn to_nibble(self) -> u8 {
        match self {
            Self::Key(key_no) => key_no,
            Self::Free => Self::FREE_NIBBLE,
            Self::Never => Self::NEVER_NIBBLE,
        }
    }
}
impl fmt::Display for AccessRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key_no) => write!(f, "key {}", key_no),
            Self::Free => write!(f, "free"),
            Self::Never => write!(f, "never"),
        }
    }
}


/// The four rights of one file.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AccessRights {
    pub read: AccessRight,
    pub write: AccessRight,
    pub read_write: AccessRight,
    pub change: AccessRight,
}
impl AccessRights {
    /// Packs into the on-card order: read in the top nibble, change in the
    /// bottom one.
    pub fn pack(&self) -> u16 {
        (u16::from(self.read.to_nibble()) << 12)
            | (u16::from(self.write.to_nibble()) << 8)
            | (u16::from(self.read_write.to_nibble()) << 4)
            | u16::from(self.change.to_nibble())
    }

    pub fn unpack(packed: u16) -> Self {
        let nibble = |shift: u16| AccessRight::from_masked((packed >> shift) as u8);
        Self {
            read: nibble(12),
            write: nibble(8),
            read_write: nibble(4),
            change: nibble(0),
        }
    }
}
