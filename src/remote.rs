//! The remote crypto delegate boundary.
//!
//! When a key's bytes must never leave a vault or secure element, the engine
//! performs its cipher steps through a [`RemoteCrypto`] delegate instead of a
//! local [`BlockCipher`]. [`CipherOps`] is the single capability the CMAC
//! engine, the authentication state machine and the secure messaging codec
//! are written against, so the protocol logic is identical either way.


use std::fmt;

use zeroize::Zeroizing;

use crate::crypt::{BlockCipher, CipherMode, CryptError};
use crate::error::Error;
use crate::key::KeyKind;


/// Opaque handle to a key held by a remote custodian (vault slot identifier,
/// secure-element slot, ...). The engine never inspects it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RemoteKeyRef {
    id: String,
}
impl RemoteKeyRef {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str { &self.id }
}
impl fmt::Display for RemoteKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}


/// Connection settings for a concrete delegate implementation.
///
/// The engine never holds this globally; whoever constructs a delegate passes
/// it explicitly, and its lifecycle is tied to the session that uses it.
/// Timeout and retry policy are the delegate's responsibility.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RemoteVaultConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
}


#[derive(Debug)]
pub enum RemoteCryptoError {
    /// A remote key was used but no delegate was supplied.
    DelegateUnavailable,
    /// The delegate cannot perform this operation for this key.
    UnsupportedOperation { operation: &'static str },
    /// The delegate itself failed (network, vault, policy).
    Backend { message: String },
}
impl fmt::Display for RemoteCryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DelegateUnavailable
                => write!(f, "key is remotely stored but no crypto delegate was supplied"),
            Self::UnsupportedOperation { operation }
                => write!(f, "crypto delegate cannot perform {}", operation),
            Self::Backend { message }
                => write!(f, "crypto delegate failed: {}", message),
        }
    }
}
impl std::error::Error for RemoteCryptoError {
}


/// Session key material handed back by a delegate after a remote handshake:
/// either the raw bytes, or a reference the codec keeps delegating to.
#[derive(Debug)]
pub enum RemoteSessionKey {
    Bytes(Zeroizing<Vec<u8>>),
    Reference(RemoteKeyRef),
}


/// Cryptographic operations executed against keys the engine cannot read.
///
/// The authentication helpers mirror the local state machine's steps: step 1
/// receives the card's encrypted challenge and returns the token to send,
/// step 2 receives the card's final cryptogram, performs the verification
/// vault-side and returns the session key material. Diversification, when
/// requested, is applied inside the vault from the supplied input.
pub trait RemoteCrypto {
    fn aes_encrypt(&mut self, key: &RemoteKeyRef, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, RemoteCryptoError>;
    fn aes_decrypt(&mut self, key: &RemoteKeyRef, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, RemoteCryptoError>;
    fn des_encrypt(&mut self, key: &RemoteKeyRef, mode: CipherMode, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, RemoteCryptoError>;
    fn des_decrypt(&mut self, key: &RemoteKeyRef, mode: CipherMode, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, RemoteCryptoError>;

    fn iso_auth_step1(&mut self, key: &RemoteKeyRef, diversification_input: Option<&[u8]>, enc_rnd_b: &[u8]) -> Result<Vec<u8>, RemoteCryptoError>;
    fn iso_auth_step2(&mut self, key: &RemoteKeyRef, enc_card_response: &[u8]) -> Result<RemoteSessionKey, RemoteCryptoError>;
    fn aes_auth_step1(&mut self, key: &RemoteKeyRef, diversification_input: Option<&[u8]>, enc_rnd_b: &[u8]) -> Result<Vec<u8>, RemoteCryptoError>;
    fn aes_auth_step2(&mut self, key: &RemoteKeyRef, enc_card_response: &[u8]) -> Result<RemoteSessionKey, RemoteCryptoError>;

    /// Builds the re-key cryptogram for a vault-held new key, enciphered on
    /// the session chain starting at `iv`.
    fn change_key_cryptogram(&mut self, key: &RemoteKeyRef, old_key: Option<&RemoteKeyRef>, key_no: u8, iv: &[u8]) -> Result<Vec<u8>, RemoteCryptoError>;
}


/// A block cipher capability backed either by local key material or by a
/// remote delegate.
///
/// The delegate is held through a reborrow (`'a`) that is independent of the
/// delegate's own lifetime (`'d`), so a long-lived delegate can be lent out
/// once per operation.
pub enum CipherOps<'a, 'd> {
    Local(BlockCipher),
    Remote {
        delegate: &'a mut (dyn RemoteCrypto + 'd),
        key: RemoteKeyRef,
        kind: KeyKind,
    },
}
impl<'a, 'd> CipherOps<'a, 'd> {
    pub fn block_size(&self) -> usize {
        match self {
            Self::Local(cipher) => cipher.block_size(),
            Self::Remote { kind, .. } => kind.block_size(),
        }
    }

    fn check_input(&self, iv: &[u8], mode: CipherMode, data: &[u8]) -> Result<(), CryptError> {
        let block_size = self.block_size();
        if data.len() % block_size != 0 {
            return Err(CryptError::InvalidBlockSize { length: data.len(), block_size });
        }
        if mode == CipherMode::Cbc && iv.len() != block_size {
            return Err(CryptError::InvalidBlockSize { length: iv.len(), block_size });
        }
        Ok(())
    }

    pub fn encrypt(&mut self, iv: &[u8], mode: CipherMode, data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Self::Local(cipher) => Ok(cipher.encrypt(iv, mode, data)?),
            Self::Remote { .. } => {
                self.check_input(iv, mode, data)?;
                self.remote_transform(iv, mode, data, false)
            },
        }
    }

    pub fn decrypt(&mut self, iv: &[u8], mode: CipherMode, data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Self::Local(cipher) => Ok(cipher.decrypt(iv, mode, data)?),
            Self::Remote { .. } => {
                self.check_input(iv, mode, data)?;
                self.remote_transform(iv, mode, data, true)
            },
        }
    }

    fn remote_transform(&mut self, iv: &[u8], mode: CipherMode, data: &[u8], decrypt: bool) -> Result<Vec<u8>, Error> {
        let Self::Remote { delegate, key, kind } = self else {
            unreachable!("remote_transform called on a local cipher");
        };
        match kind {
            KeyKind::Aes128 => {
                match mode {
                    CipherMode::Cbc => {
                        let out = if decrypt {
                            delegate.aes_decrypt(key, iv, data)
                        } else {
                            delegate.aes_encrypt(key, iv, data)
                        };
                        Ok(out?)
                    },
                    CipherMode::Ecb => {
                        // the delegate boundary only exposes chained AES;
                        // single blocks with a zero IV are equivalent
                        let zero_iv = [0u8; 16];
                        let mut out = Vec::with_capacity(data.len());
                        for block in data.chunks(16) {
                            let piece = if decrypt {
                                delegate.aes_decrypt(key, &zero_iv, block)?
                            } else {
                                delegate.aes_encrypt(key, &zero_iv, block)?
                            };
                            out.extend(piece);
                        }
                        Ok(out)
                    },
                }
            },
            KeyKind::Des|KeyKind::Des3_2k|KeyKind::Des3_3k => {
                let out = if decrypt {
                    delegate.des_decrypt(key, mode, iv, data)
                } else {
                    delegate.des_encrypt(key, mode, iv, data)
                };
                Ok(out?)
            },
        }
    }

    /// See [`BlockCipher::legacy_send_transform`]; the remote variant chains
    /// locally and delegates one decipher call per block.
    pub fn legacy_send_transform(&mut self, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Self::Local(cipher) => Ok(cipher.legacy_send_transform(iv, data)?),
            Self::Remote { .. } => {
                self.check_input(iv, CipherMode::Cbc, data)?;
                let Self::Remote { delegate, key, kind } = self else {
                    unreachable!();
                };
                if *kind == KeyKind::Aes128 {
                    return Err(RemoteCryptoError::UnsupportedOperation {
                        operation: "the legacy send transform with an AES key",
                    }.into());
                }
                let mut previous = iv.to_vec();
                let mut out = Vec::with_capacity(data.len());
                for block in data.chunks(8) {
                    let mut mixed = block.to_vec();
                    for (m, p) in mixed.iter_mut().zip(previous.iter()) {
                        *m ^= *p;
                    }
                    let sent = delegate.des_decrypt(key, CipherMode::Ecb, &[], &mixed)?;
                    previous.copy_from_slice(&sent);
                    out.extend(sent);
                }
                Ok(out)
            },
        }
    }
}
