//! Cryptographic keys and their storage handles.


use std::fmt;

use zeroize::Zeroizing;

use crate::remote::RemoteKeyRef;


/// The cipher family a key belongs to.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyKind {
    /// Single-length DES (8 key bytes).
    Des,
    /// Two-key triple DES (16 key bytes, EDE with `K3 = K1`).
    Des3_2k,
    /// Three-key triple DES (24 key bytes).
    Des3_3k,
    /// AES-128 (16 key bytes).
    Aes128,
}
impl KeyKind {
    /// Number of raw key bytes for this kind.
    pub const fn key_len(&self) -> usize {
        match self {
            Self::Des => 8,
            Self::Des3_2k => 16,
            Self::Des3_3k => 24,
            Self::Aes128 => 16,
        }
    }

    /// Cipher block size in bytes.
    pub const fn block_size(&self) -> usize {
        match self {
            Self::Des|Self::Des3_2k|Self::Des3_3k => 8,
            Self::Aes128 => 16,
        }
    }
}
impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Des => write!(f, "DES"),
            Self::Des3_2k => write!(f, "2K3DES"),
            Self::Des3_3k => write!(f, "3K3DES"),
            Self::Aes128 => write!(f, "AES-128"),
        }
    }
}


/// Where the raw key bytes live.
///
/// `Local` keys are materialized inside the engine. `Remote` keys are held by
/// an external custodian (a key vault or secure hardware); the engine never
/// sees their bytes and instead hands the opaque reference to a
/// [`RemoteCrypto`](crate::remote::RemoteCrypto) delegate.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum KeyStorage {
    Local,
    Remote(RemoteKeyRef),
}


#[derive(Debug)]
pub enum KeyError {
    /// A local key with no bytes was used for a cryptographic operation.
    Empty,
    Length { obtained: usize, expected: usize },
    /// The key kind is not usable where it was offered.
    KindMismatch { expected: &'static str, obtained: KeyKind },
    /// The key is flagged for diversification but no input was supplied.
    DiversificationInputMissing,
    DiversificationUnsupported { kind: KeyKind },
    /// Raw key bytes were requested from a key that is not materialized locally.
    NotLocal,
}
impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty
                => write!(f, "key is empty"),
            Self::Length { obtained, expected }
                => write!(f, "key has {} bytes, expected {}", obtained, expected),
            Self::KindMismatch { expected, obtained }
                => write!(f, "expected a {} key, obtained {}", expected, obtained),
            Self::DiversificationInputMissing
                => write!(f, "key requires diversification but no input was supplied"),
            Self::DiversificationUnsupported { kind }
                => write!(f, "diversification is not defined for {} keys", kind),
            Self::NotLocal
                => write!(f, "key bytes are not materialized locally"),
        }
    }
}
impl std::error::Error for KeyError {
}


/// A DESFire application or master key.
///
/// The engine borrows a key for the duration of one authentication or re-key
/// operation and never retains a reference afterward. Raw bytes are zeroed
/// when the key is dropped.
#[derive(Clone, Debug)]
pub struct Key {
    kind: KeyKind,
    data: Zeroizing<Vec<u8>>,
    version: u8,
    diversify: bool,
    storage: KeyStorage,
}
impl Key {
    /// Creates a locally-materialized key from raw bytes.
    ///
    /// The byte count must match the kind exactly; no padding or truncation
    /// is performed.
    pub fn new(kind: KeyKind, data: &[u8]) -> Result<Self, KeyError> {
        if data.len() != kind.key_len() {
            return Err(KeyError::Length { obtained: data.len(), expected: kind.key_len() });
        }
        Ok(Self {
            kind,
            data: Zeroizing::new(data.to_vec()),
            version: 0,
            diversify: false,
            storage: KeyStorage::Local,
        })
    }

    /// Creates an empty local key slot.
    ///
    /// An empty key exists so key tables can represent unset positions; it
    /// must never be used for a cryptographic operation, and every engine
    /// entry point rejects it.
    pub fn empty(kind: KeyKind) -> Self {
        Self {
            kind,
            data: Zeroizing::new(Vec::with_capacity(0)),
            version: 0,
            diversify: false,
            storage: KeyStorage::Local,
        }
    }

    /// Creates a key whose bytes are held by a remote custodian.
    pub fn remote(kind: KeyKind, key_ref: RemoteKeyRef) -> Self {
        Self {
            kind,
            data: Zeroizing::new(Vec::with_capacity(0)),
            version: 0,
            diversify: false,
            storage: KeyStorage::Remote(key_ref),
        }
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Flags this key for per-card diversification before use.
    pub fn with_diversification(mut self) -> Self {
        self.diversify = true;
        self
    }

    pub fn kind(&self) -> KeyKind { self.kind }
    pub fn version(&self) -> u8 { self.version }
    pub fn is_diversified(&self) -> bool { self.diversify }
    pub fn storage(&self) -> &KeyStorage { &self.storage }

    /// Whether this is a local key slot with no bytes.
    pub fn is_empty(&self) -> bool {
        matches!(self.storage, KeyStorage::Local) && self.data.is_empty()
    }

    /// Raw key bytes of a usable local key.
    ///
    /// Fails for empty slots and for keys held by a remote custodian.
    pub fn bytes(&self) -> Result<&[u8], KeyError> {
        match &self.storage {
            KeyStorage::Local => {
                if self.data.is_empty() {
                    Err(KeyError::Empty)
                } else {
                    Ok(&self.data)
                }
            },
            KeyStorage::Remote(_) => Err(KeyError::NotLocal),
        }
    }
}
