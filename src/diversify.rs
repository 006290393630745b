//! Key diversification.
//!
//! Deriving a per-card key from a master key and a card-specific input, so
//! that compromise of one card's key does not compromise the master. Both
//! historic schemes are supported; neither mutates the master, and both are
//! fully deterministic.


use zeroize::Zeroizing;

use crate::crypt::cmac::Cmac;
use crate::crypt::{BlockCipher, CipherMode};
use crate::error::Error;
use crate::key::{Key, KeyError, KeyKind};
use crate::remote::CipherOps;


/// AN10922 diversification-type tag for an AES-128 master.
const AV2_AES128_TAG: u8 = 0x01;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DiversificationAlgorithm {
    /// Legacy scheme: the input is mixed into the key bytes and re-encrypted
    /// under the master. Cipher-type-specific, defined for every key kind.
    Av1,
    /// AN10922 scheme: a CMAC under the master over a tagged input message.
    /// The default for AES masters and the cryptographically stronger one.
    Av2,
}


/// A diversification input: by convention the system identifier concatenated
/// with the card UID, but any byte string the deployment settles on.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DiversificationInput {
    pub algorithm: DiversificationAlgorithm,
    pub data: Vec<u8>,
}
impl DiversificationInput {
    pub fn av1<D: Into<Vec<u8>>>(data: D) -> Self {
        Self { algorithm: DiversificationAlgorithm::Av1, data: data.into() }
    }

    pub fn av2<D: Into<Vec<u8>>>(data: D) -> Self {
        Self { algorithm: DiversificationAlgorithm::Av2, data: data.into() }
    }
}


/// Derives a card-specific key from `master` and `input`.
///
/// The derived key keeps the master's kind and version, is materialized
/// locally and is not itself flagged for further diversification.
pub fn diversify(master: &Key, input: &DiversificationInput) -> Result<Key, Error> {
    if input.data.is_empty() {
        return Err(KeyError::DiversificationInputMissing.into());
    }
    let derived_bytes = match input.algorithm {
        DiversificationAlgorithm::Av1 => diversify_av1(master, &input.data)?,
        DiversificationAlgorithm::Av2 => diversify_av2(master, &input.data)?,
    };
    let derived = Key::new(master.kind(), &derived_bytes)
        .map_err(Error::InvalidKey)?
        .with_version(master.version());
    Ok(derived)
}

fn diversify_av1(master: &Key, input: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    let master_bytes = master.bytes().map_err(Error::InvalidKey)?;
    let cipher = BlockCipher::new(master.kind(), master_bytes)?;

    // cycle the input across the key bytes, then re-encrypt under the master
    let mut mixed = Zeroizing::new(master_bytes.to_vec());
    for (index, byte) in mixed.iter_mut().enumerate() {
        *byte ^= input[index % input.len()];
    }
    let zero_iv = vec![0u8; cipher.block_size()];
    Ok(Zeroizing::new(cipher.encrypt(&zero_iv, CipherMode::Cbc, &mixed)?))
}

fn diversify_av2(master: &Key, input: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    if master.kind() != KeyKind::Aes128 {
        return Err(KeyError::DiversificationUnsupported { kind: master.kind() }.into());
    }
    let master_bytes = master.bytes().map_err(Error::InvalidKey)?;
    let mut ops = CipherOps::Local(BlockCipher::new(master.kind(), master_bytes)?);
    let cmac = Cmac::new(&mut ops)?;

    let mut message = Zeroizing::new(Vec::with_capacity(1 + input.len()));
    message.push(AV2_AES128_TAG);
    message.extend_from_slice(input);

    let zero_iv = [0u8; 16];
    let tag = cmac.compute(&mut ops, &zero_iv, &message)?;
    Ok(Zeroizing::new(tag[..master.kind().key_len()].to_vec()))
}


#[cfg(test)]
mod tests {
    use super::{diversify, DiversificationInput};
    use crate::error::Error;
    use crate::key::{Key, KeyError, KeyKind};
    use hex_literal::hex;

    #[test]
    fn test_av1_deterministic_and_kind_preserving() {
        let master = Key::new(KeyKind::Des3_2k, &hex!("0123456789ABCDEFFEDCBA9876543210")).unwrap();
        let input = DiversificationInput::av1(hex!("04DEADBEEFFEED").to_vec());
        let first = diversify(&master, &input).unwrap();
        let second = diversify(&master, &input).unwrap();
        assert_eq!(first.kind(), KeyKind::Des3_2k);
        assert_eq!(first.bytes().unwrap(), second.bytes().unwrap());
        assert_ne!(first.bytes().unwrap(), master.bytes().unwrap());
    }

    #[test]
    fn test_av2_rejects_non_aes_master() {
        let master = Key::new(KeyKind::Des, &hex!("0123456789ABCDEF")).unwrap();
        let input = DiversificationInput::av2(hex!("04DEADBEEFFEED").to_vec());
        assert!(matches!(
            diversify(&master, &input),
            Err(Error::InvalidKey(KeyError::DiversificationUnsupported { kind: KeyKind::Des })),
        ));
    }

    #[test]
    fn test_empty_input_rejected() {
        let master = Key::new(KeyKind::Aes128, &[0u8; 16]).unwrap();
        let input = DiversificationInput::av2(Vec::new());
        assert!(matches!(
            diversify(&master, &input),
            Err(Error::InvalidKey(KeyError::DiversificationInputMissing)),
        ));
    }
}
