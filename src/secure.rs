//! The secure messaging codec.
//!
//! After a successful three-pass authentication, command and response
//! payloads are protected according to the communication mode of the file
//! being touched: passed through unchanged, authenticated with a truncated
//! MAC, or enciphered with an integrity checksum. The session's chain value
//! (`last_iv`) threads through every protected operation in both directions,
//! so a dropped, replayed or reordered frame makes every subsequent integrity
//! check fail.
//!
//! A [`SecureChannel`] borrows its [`SessionContext`] mutably for as long as
//! it lives. That exclusive borrow is the concurrency story: two codecs can
//! never interleave operations on one session, because the borrow checker
//! refuses to construct the second one.


use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypt::checksum::{crc16_bytes, crc32_bytes};
use crate::crypt::cmac::Cmac;
use crate::crypt::{BlockCipher, CipherMode};
use crate::error::Error;
use crate::key::{Key, KeyError, KeyKind, KeyStorage};
use crate::remote::{CipherOps, RemoteCrypto, RemoteCryptoError};
use crate::session::{AuthMethod, SessionContext, SessionKey};


/// How a payload travels between reader and card.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CommunicationMode {
    Plain,
    Maced,
    Encrypted,
}


/// Appends the legacy CRC-16 in on-wire order, for plain-mode writes on
/// legacy-authenticated files that still demand a checksum.
pub fn append_crc16(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc16_bytes(data));
    out
}


/// Protects outgoing payloads and verifies incoming ones for one session.
pub struct SecureChannel<'s, 'd> {
    session: &'s mut SessionContext,
    delegate: Option<&'d mut dyn RemoteCrypto>,
}
impl<'s, 'd> SecureChannel<'s, 'd> {
    pub fn new(session: &'s mut SessionContext) -> Self {
        Self { session, delegate: None }
    }

    /// A channel that can also serve sessions whose key lives with a remote
    /// custodian.
    pub fn with_delegate(session: &'s mut SessionContext, delegate: &'d mut dyn RemoteCrypto) -> Self {
        Self { session, delegate: Some(delegate) }
    }

    pub fn session(&self) -> &SessionContext {
        self.session
    }

    /// Protects an outgoing payload, possibly supplied in several chunks.
    ///
    /// Chunks are buffered until `end` is true; only then is the payload
    /// padded, checksummed, MACed or enciphered as `mode` demands, and the
    /// wire form returned. Intermediate calls return `None`.
    pub fn encipher_data(
        &mut self,
        mode: CommunicationMode,
        chunk: &[u8],
        end: bool,
    ) -> Result<Option<Vec<u8>>, Error> {
        self.ensure_active()?;
        self.session.push_pending(chunk);
        if !end {
            return Ok(None);
        }
        let data = Zeroizing::new(self.session.take_pending());
        let out = match mode {
            CommunicationMode::Plain => data.to_vec(),
            CommunicationMode::Maced => self.apply_mac(&data)?,
            CommunicationMode::Encrypted => self.encipher(&data)?,
        };
        Ok(Some(out))
    }

    /// Verifies and strips the protection of an incoming payload.
    ///
    /// Any MAC or checksum/padding mismatch invalidates the session and
    /// returns no data at all; the caller must re-authenticate.
    pub fn decipher_data(&mut self, mode: CommunicationMode, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.ensure_active()?;
        match mode {
            CommunicationMode::Plain => Ok(data.to_vec()),
            CommunicationMode::Maced => self.verify_mac(data),
            CommunicationMode::Encrypted => self.decipher(data),
        }
    }

    /// Builds the enciphered payload of a `CHANGE KEY` command.
    ///
    /// Re-keying a key other than the one the session was authenticated with
    /// additionally binds the old key by XOR and a second checksum, as the
    /// card demands before it accepts the exchange. The cryptogram rides on
    /// the session chain like any enciphered payload.
    pub fn change_key_cryptogram(
        &mut self,
        key_no: u8,
        new_key: &Key,
        old_key: Option<&Key>,
    ) -> Result<Vec<u8>, Error> {
        self.ensure_active()?;
        let different_key = key_no != self.session.current_key_no();

        if let KeyStorage::Remote(new_ref) = new_key.storage() {
            let old_ref = match old_key.map(Key::storage) {
                None => None,
                Some(KeyStorage::Remote(reference)) => Some(reference),
                Some(KeyStorage::Local) => {
                    return Err(RemoteCryptoError::UnsupportedOperation {
                        operation: "mixing a local old key into a vault-held re-key",
                    }.into());
                },
            };
            let delegate = self.delegate.as_deref_mut()
                .ok_or(RemoteCryptoError::DelegateUnavailable)?;
            let cryptogram = delegate.change_key_cryptogram(
                new_ref, old_ref, key_no, self.session.last_iv(),
            )?;
            self.advance_chain(&cryptogram);
            return Ok(cryptogram);
        }

        let block_size = self.session.block_size() as usize;
        let mut plain = Zeroizing::new(new_key.bytes()?.to_vec());
        if different_key {
            let old = old_key.ok_or(KeyError::Empty)?;
            let old_bytes = old.bytes()?;
            if old_bytes.len() != plain.len() {
                return Err(KeyError::Length {
                    obtained: old_bytes.len(),
                    expected: plain.len(),
                }.into());
            }
            for (p, o) in plain.iter_mut().zip(old_bytes.iter()) {
                *p ^= *o;
            }
        }
        if new_key.kind() == KeyKind::Aes128 {
            plain.push(new_key.version());
        }
        let legacy = self.session.auth_method() == AuthMethod::Legacy;
        if legacy {
            let crc = crc16_bytes(&plain);
            plain.extend_from_slice(&crc);
            if different_key {
                plain.extend_from_slice(&crc16_bytes(new_key.bytes()?));
            }
        } else {
            let crc = crc32_bytes(&plain);
            plain.extend_from_slice(&crc);
            if different_key {
                plain.extend_from_slice(&crc32_bytes(new_key.bytes()?));
            }
        }
        while plain.len() % block_size != 0 {
            plain.push(0x00);
        }

        let mut ops = session_ops(&*self.session, self.delegate.as_deref_mut())?;
        let cryptogram = if legacy {
            ops.legacy_send_transform(self.session.last_iv(), &plain)?
        } else {
            ops.encrypt(self.session.last_iv(), CipherMode::Cbc, &plain)?
        };
        self.advance_chain(&cryptogram);
        Ok(cryptogram)
    }

    fn ensure_active(&self) -> Result<(), Error> {
        if !self.session.is_valid() {
            return Err(Error::SessionState {
                reason: "the session has been invalidated; authenticate again",
            });
        }
        Ok(())
    }

    fn advance_chain(&mut self, ciphertext: &[u8]) {
        let block_size = self.session.block_size() as usize;
        if ciphertext.len() >= block_size {
            let tail = ciphertext[ciphertext.len() - block_size..].to_vec();
            self.session.set_last_iv(&tail);
        }
    }

    fn apply_mac(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut ops = session_ops(&*self.session, self.delegate.as_deref_mut())?;
        match self.session.auth_method() {
            AuthMethod::Legacy => {
                let mac = legacy_mac(&mut ops, data)?;
                let mut out = Vec::with_capacity(data.len() + 4);
                out.extend_from_slice(data);
                out.extend_from_slice(&mac);
                Ok(out)
            },
            AuthMethod::Iso|AuthMethod::Aes => {
                let cmac = Cmac::new(&mut ops)?;
                let tag = cmac.compute(&mut ops, self.session.last_iv(), data)?;
                let mut out = Vec::with_capacity(data.len() + 8);
                out.extend_from_slice(data);
                out.extend_from_slice(&tag[..8]);
                self.session.set_last_iv(&tag);
                Ok(out)
            },
        }
    }

    fn verify_mac(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mac_size = self.session.mac_size() as usize;
        if data.len() < mac_size {
            return Err(Error::LengthMismatch { obtained: data.len(), expected: mac_size });
        }
        let (body, received_mac) = data.split_at(data.len() - mac_size);

        let mut ops = session_ops(&*self.session, self.delegate.as_deref_mut())?;
        match self.session.auth_method() {
            AuthMethod::Legacy => {
                let computed = legacy_mac(&mut ops, body)?;
                if !bool::from(received_mac.ct_eq(&computed)) {
                    self.session.invalidate();
                    return Err(Error::MacVerificationFailed);
                }
            },
            AuthMethod::Iso|AuthMethod::Aes => {
                let cmac = Cmac::new(&mut ops)?;
                let tag = cmac.compute(&mut ops, self.session.last_iv(), body)?;
                if !bool::from(received_mac.ct_eq(&tag[..8])) {
                    self.session.invalidate();
                    return Err(Error::MacVerificationFailed);
                }
                self.session.set_last_iv(&tag);
            },
        }
        Ok(body.to_vec())
    }

    fn encipher(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let block_size = self.session.block_size() as usize;
        let mut ops = session_ops(&*self.session, self.delegate.as_deref_mut())?;
        let ciphertext = match self.session.auth_method() {
            AuthMethod::Legacy => {
                let mut plain = Zeroizing::new(data.to_vec());
                let crc = crc32_bytes(data);
                plain.extend_from_slice(&crc);
                while plain.len() % block_size != 0 {
                    plain.push(0x00);
                }
                ops.legacy_send_transform(self.session.last_iv(), &plain)?
            },
            AuthMethod::Iso|AuthMethod::Aes => {
                let mut plain = Zeroizing::new(data.to_vec());
                plain.push(0x80);
                while plain.len() % block_size != 0 {
                    plain.push(0x00);
                }
                ops.encrypt(self.session.last_iv(), CipherMode::Cbc, &plain)?
            },
        };
        self.advance_chain(&ciphertext);
        Ok(ciphertext)
    }

    fn decipher(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let block_size = self.session.block_size() as usize;
        if data.is_empty() {
            return Err(Error::LengthMismatch { obtained: 0, expected: block_size });
        }
        let mut ops = session_ops(&*self.session, self.delegate.as_deref_mut())?;
        let plain = Zeroizing::new(ops.decrypt(self.session.last_iv(), CipherMode::Cbc, data)?);
        self.advance_chain(data);

        let stripped = match self.session.auth_method() {
            AuthMethod::Legacy => strip_crc32_padding(&plain),
            AuthMethod::Iso|AuthMethod::Aes => strip_marker_padding(&plain),
        };
        match stripped {
            Some(body) => Ok(body),
            None => {
                self.session.invalidate();
                Err(Error::DecryptionIntegrityFailed)
            },
        }
    }
}


/// The legacy 4-byte MAC: a plain CBC-MAC over the zero-padded payload with
/// a zero IV, truncated to the first four bytes of the last cipher block.
fn legacy_mac(ops: &mut CipherOps<'_, '_>, data: &[u8]) -> Result<[u8; 4], Error> {
    let block_size = ops.block_size();
    let mut padded = Zeroizing::new(data.to_vec());
    if padded.is_empty() {
        padded.resize(block_size, 0x00);
    }
    while padded.len() % block_size != 0 {
        padded.push(0x00);
    }
    let zero_iv = vec![0u8; block_size];
    let ciphertext = ops.encrypt(&zero_iv, CipherMode::Cbc, &padded)?;
    let mut mac = [0u8; 4];
    mac.copy_from_slice(&ciphertext[ciphertext.len() - block_size..][..4]);
    Ok(mac)
}

fn session_ops<'a, 'd: 'a>(
    session: &SessionContext,
    delegate: Option<&'a mut (dyn RemoteCrypto + 'd)>,
) -> Result<CipherOps<'a, 'd>, Error> {
    match session.session_key() {
        SessionKey::Local(bytes) => {
            Ok(CipherOps::Local(BlockCipher::new(session.session_kind(), bytes)?))
        },
        SessionKey::Remote(reference) => {
            let delegate = delegate.ok_or(RemoteCryptoError::DelegateUnavailable)?;
            Ok(CipherOps::Remote {
                delegate,
                key: reference.clone(),
                kind: session.session_kind(),
            })
        },
    }
}

/// Strips `crc32 || 00..` from a deciphered legacy payload, scanning for the
/// longest body whose checksum matches and whose padding is all zero.
fn strip_crc32_padding(plain: &[u8]) -> Option<Vec<u8>> {
    if plain.len() < 4 {
        return None;
    }
    for body_len in (0..=plain.len() - 4).rev() {
        let (body, rest) = plain.split_at(body_len);
        let (crc, pad) = rest.split_at(4);
        if pad.iter().all(|b| *b == 0x00) && crc == crc32_bytes(body) {
            return Some(body.to_vec());
        }
    }
    None
}

/// Strips `80 00..` from a deciphered payload.
fn strip_marker_padding(plain: &[u8]) -> Option<Vec<u8>> {
    let mut end = plain.len();
    while end > 0 && plain[end - 1] == 0x00 {
        end -= 1;
    }
    if end == 0 || plain[end - 1] != 0x80 {
        return None;
    }
    Some(plain[..end - 1].to_vec())
}


#[cfg(test)]
mod tests {
    use super::{append_crc16, strip_crc32_padding, strip_marker_padding, CommunicationMode, SecureChannel};
    use crate::crypt::checksum::crc32_bytes;
    use crate::crypt::{BlockCipher, CipherMode};
    use crate::error::Error;
    use crate::key::KeyKind;
    use crate::session::{AuthMethod, SessionContext, SessionKey};
    use hex_literal::hex;
    use zeroize::Zeroizing;

    const AES_SESSION_KEY: [u8; 16] = hex!("00112233445566778899AABBCCDDEEFF");
    const DES_SESSION_KEY: [u8; 8] = hex!("0123456789ABCDEF");

    fn aes_session() -> SessionContext {
        SessionContext::establish(
            AuthMethod::Aes,
            KeyKind::Aes128,
            SessionKey::Local(Zeroizing::new(AES_SESSION_KEY.to_vec())),
            0x00A1B2C3,
            0,
        )
    }

    fn legacy_session() -> SessionContext {
        SessionContext::establish(
            AuthMethod::Legacy,
            KeyKind::Des,
            SessionKey::Local(Zeroizing::new(DES_SESSION_KEY.to_vec())),
            0x00A1B2C3,
            0,
        )
    }

    #[test]
    fn test_plain_mode_passes_through() {
        let mut session = aes_session();
        let mut channel = SecureChannel::new(&mut session);
        let out = channel.encipher_data(CommunicationMode::Plain, b"hello", true).unwrap();
        assert_eq!(out.as_deref(), Some(&b"hello"[..]));
        let back = channel.decipher_data(CommunicationMode::Plain, b"hello").unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn test_append_crc16_wire_order() {
        // crc16([0x12, 0x34]) == 0xCF26, little-endian on the wire
        assert_eq!(append_crc16(&hex!("1234")), hex!("123426CF"));
    }

    #[test]
    fn test_aes_mac_appends_eight_bytes_and_advances_chain() {
        let mut session = aes_session();
        let mut channel = SecureChannel::new(&mut session);
        let out = channel
            .encipher_data(CommunicationMode::Maced, b"payload", true)
            .unwrap()
            .unwrap();
        assert_eq!(out.len(), 7 + 8);
        assert_eq!(&out[..7], b"payload");
        assert_ne!(session.last_iv(), &[0u8; 16]);
        assert_eq!(&out[7..], &session.last_iv()[..8]);
    }

    #[test]
    fn test_legacy_mac_is_four_bytes_and_leaves_chain() {
        let mut session = legacy_session();
        let mut channel = SecureChannel::new(&mut session);
        let out = channel
            .encipher_data(CommunicationMode::Maced, b"payload", true)
            .unwrap()
            .unwrap();
        assert_eq!(out.len(), 7 + 4);
        assert_eq!(session.last_iv(), &[0u8; 8]);
    }

    #[test]
    fn test_mac_verify_round_trip() {
        let mut sender = aes_session();
        let wire = SecureChannel::new(&mut sender)
            .encipher_data(CommunicationMode::Maced, b"status word", true)
            .unwrap()
            .unwrap();

        let mut receiver = aes_session();
        let body = SecureChannel::new(&mut receiver)
            .decipher_data(CommunicationMode::Maced, &wire)
            .unwrap();
        assert_eq!(body, b"status word");
        assert_eq!(receiver.last_iv(), sender.last_iv());
    }

    #[test]
    fn test_tampered_mac_invalidates_session() {
        let mut sender = aes_session();
        let mut wire = SecureChannel::new(&mut sender)
            .encipher_data(CommunicationMode::Maced, b"status word", true)
            .unwrap()
            .unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let mut receiver = aes_session();
        let mut channel = SecureChannel::new(&mut receiver);
        assert!(matches!(
            channel.decipher_data(CommunicationMode::Maced, &wire),
            Err(Error::MacVerificationFailed),
        ));
        assert!(matches!(
            channel.encipher_data(CommunicationMode::Plain, b"more", true),
            Err(Error::SessionState { .. }),
        ));
        assert!(!receiver.is_valid());
    }

    #[test]
    fn test_aes_encrypted_round_trip_with_chain() {
        let payload = b"enciphered file contents, unaligned";
        let mut sender = aes_session();
        let wire = SecureChannel::new(&mut sender)
            .encipher_data(CommunicationMode::Encrypted, payload, true)
            .unwrap()
            .unwrap();
        assert_eq!(wire.len() % 16, 0);

        let mut receiver = aes_session();
        let body = SecureChannel::new(&mut receiver)
            .decipher_data(CommunicationMode::Encrypted, &wire)
            .unwrap();
        assert_eq!(body, payload);
        assert_eq!(receiver.last_iv(), &wire[wire.len() - 16..]);
        assert_eq!(sender.last_iv(), receiver.last_iv());
    }

    #[test]
    fn test_multipart_equals_one_shot() {
        let mut chunked = aes_session();
        let mut channel = SecureChannel::new(&mut chunked);
        assert!(channel.encipher_data(CommunicationMode::Encrypted, b"first ", false).unwrap().is_none());
        let chunked_wire = channel
            .encipher_data(CommunicationMode::Encrypted, b"second", true)
            .unwrap()
            .unwrap();

        let mut whole = aes_session();
        let whole_wire = SecureChannel::new(&mut whole)
            .encipher_data(CommunicationMode::Encrypted, b"first second", true)
            .unwrap()
            .unwrap();
        assert_eq!(chunked_wire, whole_wire);
    }

    #[test]
    fn test_legacy_encipher_matches_send_transform_reference() {
        let payload = hex!("DEADBEEF");
        let mut session = legacy_session();
        let wire = SecureChannel::new(&mut session)
            .encipher_data(CommunicationMode::Encrypted, &payload, true)
            .unwrap()
            .unwrap();

        let mut reference = payload.to_vec();
        reference.extend_from_slice(&crc32_bytes(&payload));
        let cipher = BlockCipher::new(KeyKind::Des, &DES_SESSION_KEY).unwrap();
        let expected = cipher.legacy_send_transform(&[0u8; 8], &reference).unwrap();
        assert_eq!(wire, expected);
        assert_eq!(session.last_iv(), &expected[..]);
    }

    #[test]
    fn test_corrupt_ciphertext_yields_no_partial_data() {
        let mut sender = aes_session();
        let mut wire = SecureChannel::new(&mut sender)
            .encipher_data(CommunicationMode::Encrypted, b"secret record", true)
            .unwrap()
            .unwrap();
        wire[3] ^= 0x40;

        let mut receiver = aes_session();
        let mut channel = SecureChannel::new(&mut receiver);
        assert!(matches!(
            channel.decipher_data(CommunicationMode::Encrypted, &wire),
            Err(Error::DecryptionIntegrityFailed),
        ));
        assert!(!receiver.is_valid());
    }

    #[test]
    fn test_padding_strippers() {
        assert_eq!(strip_marker_padding(&hex!("AABB800000")), Some(hex!("AABB").to_vec()));
        assert_eq!(strip_marker_padding(&hex!("80")), Some(Vec::new()));
        assert_eq!(strip_marker_padding(&hex!("AABB0000")), None);
        assert_eq!(strip_marker_padding(&[]), None);

        let mut legacy = hex!("1234").to_vec();
        legacy.extend_from_slice(&crc32_bytes(&hex!("1234")));
        legacy.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(strip_crc32_padding(&legacy), Some(hex!("1234").to_vec()));
        legacy[0] ^= 0xFF;
        assert_eq!(strip_crc32_padding(&legacy), None);
    }

    #[test]
    fn test_change_key_cryptogram_same_key_aes() {
        use crate::key::Key;

        let mut session = aes_session();
        let new_key = Key::new(KeyKind::Aes128, &hex!("101112131415161718191A1B1C1D1E1F"))
            .unwrap()
            .with_version(0x10);
        let cryptogram = SecureChannel::new(&mut session)
            .change_key_cryptogram(0, &new_key, None)
            .unwrap();
        // 16 key bytes + version + crc32 + padding
        assert_eq!(cryptogram.len(), 32);

        let cipher = BlockCipher::new(KeyKind::Aes128, &AES_SESSION_KEY).unwrap();
        let plain = cipher.decrypt(&[0u8; 16], CipherMode::Cbc, &cryptogram).unwrap();
        assert_eq!(&plain[..16], &hex!("101112131415161718191A1B1C1D1E1F"));
        assert_eq!(plain[16], 0x10);
        let mut expected_crc_input = hex!("101112131415161718191A1B1C1D1E1F").to_vec();
        expected_crc_input.push(0x10);
        assert_eq!(&plain[17..21], &crc32_bytes(&expected_crc_input));
        assert_eq!(session.last_iv(), &cryptogram[16..]);
    }

    #[test]
    fn test_change_key_cryptogram_other_key_xors_old() {
        use crate::key::Key;

        let mut session = aes_session();
        let new_key = Key::new(KeyKind::Aes128, &[0x22; 16]).unwrap();
        let old_key = Key::new(KeyKind::Aes128, &[0x11; 16]).unwrap();
        let cryptogram = SecureChannel::new(&mut session)
            .change_key_cryptogram(3, &new_key, Some(&old_key))
            .unwrap();

        let cipher = BlockCipher::new(KeyKind::Aes128, &AES_SESSION_KEY).unwrap();
        let plain = cipher.decrypt(&[0u8; 16], CipherMode::Cbc, &cryptogram).unwrap();
        assert_eq!(&plain[..16], &[0x33; 16]);
    }
}
