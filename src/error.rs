//! The crate-wide error type.


use std::fmt;

use crate::crypt::CryptError;
use crate::key::KeyError;
use crate::remote::RemoteCryptoError;
use crate::transport::TransportError;


/// Any failure of authentication, secure messaging or key management.
///
/// Integrity failures ([`Error::AuthenticationFailed`],
/// [`Error::MacVerificationFailed`], [`Error::DecryptionIntegrityFailed`])
/// deliberately carry no cryptographic detail; logging the reason is the
/// caller's decision.
#[derive(Debug)]
pub enum Error {
    /// A key was unusable where it was offered.
    InvalidKey(KeyError),
    /// A cipher-level precondition was violated.
    Crypt(CryptError),
    /// The card's proof of key possession did not verify, or the card
    /// rejected ours.
    AuthenticationFailed,
    /// A MAC or CMAC on a received frame did not verify.
    MacVerificationFailed,
    /// Deciphered response data failed its CRC or padding check.
    DecryptionIntegrityFailed,
    /// The remote crypto delegate failed or was missing.
    CryptoProvider(RemoteCryptoError),
    /// The session is not in a state that allows the operation.
    SessionState { reason: &'static str },
    /// The card link failed.
    Transport(TransportError),
    /// A frame had the wrong length for the step being performed.
    LengthMismatch { obtained: usize, expected: usize },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey(e)
                => write!(f, "invalid key: {}", e),
            Self::Crypt(e)
                => write!(f, "cryptographic operation failed: {}", e),
            Self::AuthenticationFailed
                => write!(f, "mutual authentication failed"),
            Self::MacVerificationFailed
                => write!(f, "response MAC verification failed"),
            Self::DecryptionIntegrityFailed
                => write!(f, "deciphered response failed its integrity check"),
            Self::CryptoProvider(e)
                => write!(f, "remote crypto delegate error: {}", e),
            Self::SessionState { reason }
                => write!(f, "invalid session state: {}", reason),
            Self::Transport(e)
                => write!(f, "card transport error: {}", e),
            Self::LengthMismatch { obtained, expected }
                => write!(f, "obtained {} bytes, expected {}", obtained, expected),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidKey(e) => Some(e),
            Self::Crypt(e) => Some(e),
            Self::CryptoProvider(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}
impl From<KeyError> for Error {
    fn from(e: KeyError) -> Self { Self::InvalidKey(e) }
}
impl From<CryptError> for Error {
    fn from(e: CryptError) -> Self { Self::Crypt(e) }
}
impl From<RemoteCryptoError> for Error {
    fn from(e: RemoteCryptoError) -> Self { Self::CryptoProvider(e) }
}
impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self { Self::Transport(e) }
}
