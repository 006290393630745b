//! Three-pass mutual authentication.
//!
//! All three DESFire variants share one frame shape: the reader opens with
//! `[command, key_no]`, the card answers `0xAF` with its enciphered random
//! (`encRndB`), the reader answers `0xAF` with a token binding its own random
//! to the card's, and the card closes with `0x00` and a cryptogram proving it
//! recovered the reader's random. Both sides then derive the session key from
//! slices of the two randoms.
//!
//! The variants differ in cipher, random length and one wire quirk: the
//! legacy variant rotates `RndB` by one byte inside the token, enciphers
//! outgoing data by running the cipher in the decrypt direction, and expects
//! `RndA` rotated in the card's closing cryptogram.
//!
//! Every entry point has a `*_from_values` twin that takes the reader random
//! explicitly, so the handshake can be tested deterministically.


use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::instrument;
use zeroize::Zeroizing;

use crate::crypt::{BlockCipher, CipherMode};
use crate::diversify::{diversify, DiversificationInput};
use crate::error::Error;
use crate::key::{Key, KeyError, KeyKind, KeyStorage};
use crate::remote::{CipherOps, RemoteCrypto, RemoteCryptoError, RemoteKeyRef, RemoteSessionKey};
use crate::session::{AuthMethod, SessionContext, SessionKey};
use crate::transport::{CardTransport, TransportError};


pub(crate) const STATUS_OK: u8 = 0x00;
pub(crate) const STATUS_ADDITIONAL_FRAME: u8 = 0xAF;

const CMD_AUTHENTICATE_LEGACY: u8 = 0x0A;
const CMD_AUTHENTICATE_ISO: u8 = 0x1A;
const CMD_AUTHENTICATE_AES: u8 = 0xAA;


/// Native DES/2K3DES authentication (command `0x0A`).
#[instrument(skip(transport, key, diversification, delegate))]
pub fn authenticate_legacy(
    transport: &mut dyn CardTransport,
    key: &Key,
    key_no: u8,
    aid: u32,
    diversification: Option<&DiversificationInput>,
    delegate: Option<&mut dyn RemoteCrypto>,
) -> Result<SessionContext, Error> {
    let mut rnd_a = Zeroizing::new([0u8; 8]);
    OsRng.fill_bytes(&mut rnd_a[..]);
    authenticate_legacy_from_values(transport, key, key_no, aid, diversification, delegate, &rnd_a[..])
}

/// [`authenticate_legacy`] with a caller-supplied reader random.
#[instrument(skip(transport, key, diversification, delegate, rnd_a))]
pub fn authenticate_legacy_from_values(
    transport: &mut dyn CardTransport,
    key: &Key,
    key_no: u8,
    aid: u32,
    diversification: Option<&DiversificationInput>,
    delegate: Option<&mut dyn RemoteCrypto>,
    rnd_a: &[u8],
) -> Result<SessionContext, Error> {
    if !matches!(key.kind(), KeyKind::Des|KeyKind::Des3_2k) {
        return Err(KeyError::KindMismatch { expected: "DES or 2K3DES", obtained: key.kind() }.into());
    }
    check_length(rnd_a, 8)?;

    let mut resolved = None;
    let mut ops = match key.storage() {
        KeyStorage::Local => {
            let working = resolve_key(key, diversification)?;
            let cipher = BlockCipher::new(working.kind(), working.bytes()?)?;
            resolved = Some(working);
            CipherOps::Local(cipher)
        },
        KeyStorage::Remote(key_ref) => {
            if key.is_diversified() {
                return Err(RemoteCryptoError::UnsupportedOperation {
                    operation: "diversified legacy authentication",
                }.into());
            }
            let delegate = delegate.ok_or(RemoteCryptoError::DelegateUnavailable)?;
            CipherOps::Remote { delegate, key: key_ref.clone(), kind: key.kind() }
        },
    };

    let (status, enc_rnd_b) = transceive(transport, &[CMD_AUTHENTICATE_LEGACY, key_no])?;
    if status != STATUS_ADDITIONAL_FRAME {
        return Err(Error::AuthenticationFailed);
    }
    check_length(&enc_rnd_b, 8)?;

    let zero_iv = [0u8; 8];
    let rnd_b = Zeroizing::new(ops.decrypt(&zero_iv, CipherMode::Cbc, &enc_rnd_b)?);

    // token: RndA || rotl1(RndB), sent in the legacy deciphering direction
    // and chained from the ciphertext just received
    let mut token_plain = Zeroizing::new(Vec::with_capacity(16));
    token_plain.extend_from_slice(rnd_a);
    token_plain.extend_from_slice(&rnd_b);
    token_plain[8..].rotate_left(1);
    let token = ops.legacy_send_transform(&enc_rnd_b, &token_plain)?;

    let mut frame = Vec::with_capacity(1 + token.len());
    frame.push(STATUS_ADDITIONAL_FRAME);
    frame.extend_from_slice(&token);
    let (status, enc_verification) = transceive(transport, &frame)?;
    if status != STATUS_OK {
        return Err(Error::AuthenticationFailed);
    }
    check_length(&enc_verification, 8)?;

    let verification = Zeroizing::new(
        ops.decrypt(&token[token.len() - 8..], CipherMode::Cbc, &enc_verification)?
    );
    let mut expected = Zeroizing::new(rnd_a.to_vec());
    expected.rotate_left(1);
    if !bool::from(verification.as_slice().ct_eq(&expected)) {
        return Err(Error::AuthenticationFailed);
    }

    // a 2K3DES key with equal halves degenerates to single DES; with a
    // vault-held key the halves cannot be inspected, so it is taken at kind
    let halves_differ = match &resolved {
        Some(working) => {
            let bytes = working.bytes()?;
            bytes[..8] != bytes[8..]
        },
        None => true,
    };
    let (session_kind, session_bytes) = des_family_session_key(rnd_a, &rnd_b, key.kind(), halves_differ);
    Ok(SessionContext::establish(
        AuthMethod::Legacy,
        session_kind,
        SessionKey::Local(session_bytes),
        aid,
        key_no,
    ))
}


/// ISO authentication (command `0x1A`): the DES family up to 3K3DES, with
/// full CBC chaining and no rotation of the card's random in the token.
#[instrument(skip(transport, key, diversification, delegate))]
pub fn authenticate_iso(
    transport: &mut dyn CardTransport,
    key: &Key,
    key_no: u8,
    aid: u32,
    diversification: Option<&DiversificationInput>,
    delegate: Option<&mut dyn RemoteCrypto>,
) -> Result<SessionContext, Error> {
    let mut rnd_a = Zeroizing::new(vec![0u8; iso_random_len(key.kind())?]);
    OsRng.fill_bytes(&mut rnd_a);
    authenticate_iso_from_values(transport, key, key_no, aid, diversification, delegate, &rnd_a)
}

/// [`authenticate_iso`] with a caller-supplied reader random.
#[instrument(skip(transport, key, diversification, delegate, rnd_a))]
pub fn authenticate_iso_from_values(
    transport: &mut dyn CardTransport,
    key: &Key,
    key_no: u8,
    aid: u32,
    diversification: Option<&DiversificationInput>,
    delegate: Option<&mut dyn RemoteCrypto>,
    rnd_a: &[u8],
) -> Result<SessionContext, Error> {
    check_length(rnd_a, iso_random_len(key.kind())?)?;

    if let KeyStorage::Remote(key_ref) = key.storage() {
        let delegate = delegate.ok_or(RemoteCryptoError::DelegateUnavailable)?;
        let session_key = delegated_handshake(
            transport, delegate, key, key_ref.clone(), diversification,
            CMD_AUTHENTICATE_ISO, key_no, rnd_a.len(),
            |d, k, div, c| d.iso_auth_step1(k, div, c),
            |d, k, c| d.iso_auth_step2(k, c),
        )?;
        let session_kind = delegated_session_kind(key.kind(), &session_key);
        return Ok(SessionContext::establish(AuthMethod::Iso, session_kind, session_key, aid, key_no));
    }

    let working = resolve_key(key, diversification)?;
    let mut ops = CipherOps::Local(BlockCipher::new(working.kind(), working.bytes()?)?);
    let rnd_b = mutual_handshake(transport, &mut ops, CMD_AUTHENTICATE_ISO, key_no, rnd_a)?;

    let (session_kind, session_bytes) = match key.kind() {
        KeyKind::Des|KeyKind::Des3_2k => {
            let bytes = working.bytes()?;
            let halves_differ = key.kind() == KeyKind::Des || bytes[..8] != bytes[8..];
            des_family_session_key(rnd_a, &rnd_b, key.kind(), halves_differ)
        },
        KeyKind::Des3_3k => (KeyKind::Des3_3k, tdes3_session_key(rnd_a, &rnd_b)),
        KeyKind::Aes128 => unreachable!("rejected by iso_random_len"),
    };
    Ok(SessionContext::establish(
        AuthMethod::Iso,
        session_kind,
        SessionKey::Local(session_bytes),
        aid,
        key_no,
    ))
}


/// AES-128 authentication (command `0xAA`).
#[instrument(skip(transport, key, diversification, delegate))]
pub fn authenticate_aes(
    transport: &mut dyn CardTransport,
    key: &Key,
    key_no: u8,
    aid: u32,
    diversification: Option<&DiversificationInput>,
    delegate: Option<&mut dyn RemoteCrypto>,
) -> Result<SessionContext, Error> {
    let mut rnd_a = Zeroizing::new([0u8; 16]);
    OsRng.fill_bytes(&mut rnd_a[..]);
    authenticate_aes_from_values(transport, key, key_no, aid, diversification, delegate, &rnd_a[..])
}

/// [`authenticate_aes`] with a caller-supplied reader random.
#[instrument(skip(transport, key, diversification, delegate, rnd_a))]
pub fn authenticate_aes_from_values(
    transport: &mut dyn CardTransport,
    key: &Key,
    key_no: u8,
    aid: u32,
    diversification: Option<&DiversificationInput>,
    delegate: Option<&mut dyn RemoteCrypto>,
    rnd_a: &[u8],
) -> Result<SessionContext, Error> {
    if key.kind() != KeyKind::Aes128 {
        return Err(KeyError::KindMismatch { expected: "AES-128", obtained: key.kind() }.into());
    }
    check_length(rnd_a, 16)?;

    if let KeyStorage::Remote(key_ref) = key.storage() {
        let delegate = delegate.ok_or(RemoteCryptoError::DelegateUnavailable)?;
        let session_key = delegated_handshake(
            transport, delegate, key, key_ref.clone(), diversification,
            CMD_AUTHENTICATE_AES, key_no, 16,
            |d, k, div, c| d.aes_auth_step1(k, div, c),
            |d, k, c| d.aes_auth_step2(k, c),
        )?;
        return Ok(SessionContext::establish(AuthMethod::Aes, KeyKind::Aes128, session_key, aid, key_no));
    }

    let working = resolve_key(key, diversification)?;
    let mut ops = CipherOps::Local(BlockCipher::new(KeyKind::Aes128, working.bytes()?)?);
    let rnd_b = mutual_handshake(transport, &mut ops, CMD_AUTHENTICATE_AES, key_no, rnd_a)?;

    Ok(SessionContext::establish(
        AuthMethod::Aes,
        KeyKind::Aes128,
        SessionKey::Local(aes_session_key(rnd_a, &rnd_b)),
        aid,
        key_no,
    ))
}


/// One transport round trip, split into status byte and payload.
pub(crate) fn transceive(transport: &mut dyn CardTransport, frame: &[u8]) -> Result<(u8, Vec<u8>), Error> {
    let mut response = transport.transact(frame)?;
    if response.is_empty() {
        return Err(TransportError::ShortResponse.into());
    }
    let status = response.remove(0);
    Ok((status, response))
}

fn check_length(data: &[u8], expected: usize) -> Result<(), Error> {
    if data.len() != expected {
        return Err(Error::LengthMismatch { obtained: data.len(), expected });
    }
    Ok(())
}

fn resolve_key(key: &Key, diversification: Option<&DiversificationInput>) -> Result<Key, Error> {
    if key.is_diversified() {
        let input = diversification.ok_or(KeyError::DiversificationInputMissing)?;
        diversify(key, input)
    } else {
        Ok(key.clone())
    }
}

fn iso_random_len(kind: KeyKind) -> Result<usize, Error> {
    match kind {
        KeyKind::Des|KeyKind::Des3_2k => Ok(8),
        KeyKind::Des3_3k => Ok(16),
        KeyKind::Aes128 => Err(KeyError::KindMismatch { expected: "DES-family", obtained: kind }.into()),
    }
}

/// The ISO/AES wire exchange: both directions in the encrypt direction, CBC
/// chained through every ciphertext. Returns the card's random.
fn mutual_handshake(
    transport: &mut dyn CardTransport,
    ops: &mut CipherOps<'_, '_>,
    command: u8,
    key_no: u8,
    rnd_a: &[u8],
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let block_size = ops.block_size();
    let (status, enc_rnd_b) = transceive(transport, &[command, key_no])?;
    if status != STATUS_ADDITIONAL_FRAME {
        return Err(Error::AuthenticationFailed);
    }
    check_length(&enc_rnd_b, rnd_a.len())?;

    let zero_iv = vec![0u8; block_size];
    let rnd_b = Zeroizing::new(ops.decrypt(&zero_iv, CipherMode::Cbc, &enc_rnd_b)?);

    let mut token_plain = Zeroizing::new(Vec::with_capacity(2 * rnd_a.len()));
    token_plain.extend_from_slice(rnd_a);
    token_plain.extend_from_slice(&rnd_b);
    let token = ops.encrypt(&enc_rnd_b[enc_rnd_b.len() - block_size..], CipherMode::Cbc, &token_plain)?;

    let mut frame = Vec::with_capacity(1 + token.len());
    frame.push(STATUS_ADDITIONAL_FRAME);
    frame.extend_from_slice(&token);
    let (status, enc_verification) = transceive(transport, &frame)?;
    if status != STATUS_OK {
        return Err(Error::AuthenticationFailed);
    }
    check_length(&enc_verification, rnd_a.len())?;

    let verification = Zeroizing::new(
        ops.decrypt(&token[token.len() - block_size..], CipherMode::Cbc, &enc_verification)?
    );
    if !bool::from(verification.as_slice().ct_eq(rnd_a)) {
        return Err(Error::AuthenticationFailed);
    }
    Ok(rnd_b)
}

/// The same wire exchange with both cipher steps performed by a delegate
/// holding the key. The delegate verifies the card's closing cryptogram
/// itself and hands back the session key material.
#[allow(clippy::too_many_arguments)]
fn delegated_handshake<S1, S2>(
    transport: &mut dyn CardTransport,
    delegate: &mut dyn RemoteCrypto,
    key: &Key,
    key_ref: RemoteKeyRef,
    diversification: Option<&DiversificationInput>,
    command: u8,
    key_no: u8,
    rnd_len: usize,
    step1: S1,
    step2: S2,
) -> Result<SessionKey, Error>
where
    S1: FnOnce(&mut dyn RemoteCrypto, &RemoteKeyRef, Option<&[u8]>, &[u8]) -> Result<Vec<u8>, RemoteCryptoError>,
    S2: FnOnce(&mut dyn RemoteCrypto, &RemoteKeyRef, &[u8]) -> Result<RemoteSessionKey, RemoteCryptoError>,
{
    let div_input = if key.is_diversified() {
        Some(diversification.ok_or(KeyError::DiversificationInputMissing)?.data.as_slice())
    } else {
        None
    };

    let (status, enc_rnd_b) = transceive(transport, &[command, key_no])?;
    if status != STATUS_ADDITIONAL_FRAME {
        return Err(Error::AuthenticationFailed);
    }
    check_length(&enc_rnd_b, rnd_len)?;

    let token = step1(delegate, &key_ref, div_input, &enc_rnd_b)?;

    let mut frame = Vec::with_capacity(1 + token.len());
    frame.push(STATUS_ADDITIONAL_FRAME);
    frame.extend_from_slice(&token);
    let (status, enc_verification) = transceive(transport, &frame)?;
    if status != STATUS_OK {
        return Err(Error::AuthenticationFailed);
    }
    check_length(&enc_verification, rnd_len)?;

    let session_key = match step2(delegate, &key_ref, &enc_verification)? {
        RemoteSessionKey::Bytes(bytes) => SessionKey::Local(bytes),
        RemoteSessionKey::Reference(reference) => SessionKey::Remote(reference),
    };
    Ok(session_key)
}

fn delegated_session_kind(master_kind: KeyKind, session_key: &SessionKey) -> KeyKind {
    match session_key {
        SessionKey::Local(bytes) if bytes.len() == 8 => KeyKind::Des,
        _ => master_kind,
    }
}

fn des_family_session_key(
    rnd_a: &[u8],
    rnd_b: &[u8],
    kind: KeyKind,
    halves_differ: bool,
) -> (KeyKind, Zeroizing<Vec<u8>>) {
    let mut bytes = Zeroizing::new(Vec::with_capacity(16));
    bytes.extend_from_slice(&rnd_a[0..4]);
    bytes.extend_from_slice(&rnd_b[0..4]);
    if kind == KeyKind::Des3_2k && halves_differ {
        bytes.extend_from_slice(&rnd_a[4..8]);
        bytes.extend_from_slice(&rnd_b[4..8]);
        (KeyKind::Des3_2k, bytes)
    } else {
        (KeyKind::Des, bytes)
    }
}

fn tdes3_session_key(rnd_a: &[u8], rnd_b: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(Vec::with_capacity(24));
    for range in [0..4, 6..10, 12..16] {
        bytes.extend_from_slice(&rnd_a[range.clone()]);
        bytes.extend_from_slice(&rnd_b[range]);
    }
    bytes
}

fn aes_session_key(rnd_a: &[u8], rnd_b: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(Vec::with_capacity(16));
    for range in [0..4, 12..16] {
        bytes.extend_from_slice(&rnd_a[range.clone()]);
        bytes.extend_from_slice(&rnd_b[range]);
    }
    bytes
}
