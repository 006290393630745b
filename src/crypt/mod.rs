//! Cryptographic primitives: the block cipher provider, checksums and CMAC.


pub mod checksum;
pub mod cmac;


use std::fmt;

use aes::Aes128;
use cipher::{Block, BlockDecrypt, BlockEncrypt, KeyInit};
use des::{Des, TdesEde2, TdesEde3};

use crate::key::KeyKind;


/// Block chaining mode for a single provider call.
///
/// The initialization vector is always supplied explicitly by the caller;
/// `Ecb` ignores it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CipherMode {
    Ecb,
    Cbc,
}


#[derive(Debug)]
pub enum CryptError {
    /// Input is not a multiple of the cipher's block size, or an IV of the
    /// wrong length was supplied for CBC chaining.
    InvalidBlockSize { length: usize, block_size: usize },
    KeyLength { obtained: usize, expected: usize },
}
impl fmt::Display for CryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBlockSize { length, block_size }
                => write!(f, "input length {} is not usable with block size {}", length, block_size),
            Self::KeyLength { obtained, expected }
                => write!(f, "cipher key has {} bytes, expected {}", obtained, expected),
        }
    }
}
impl std::error::Error for CryptError {
}


/// A symmetric block cipher keyed with local key material.
///
/// The provider performs no implicit padding: callers are responsible for
/// block alignment, and ciphertext always has the same length as the input.
pub enum BlockCipher {
    Des(Des),
    Tdes2(TdesEde2),
    Tdes3(TdesEde3),
    Aes(Aes128),
}
impl BlockCipher {
    pub fn new(kind: KeyKind, key: &[u8]) -> Result<Self, CryptError> {
        let key_length = CryptError::KeyLength {
            obtained: key.len(),
            expected: kind.key_len(),
        };
        match kind {
            KeyKind::Des => Ok(Self::Des(Des::new_from_slice(key).map_err(|_| key_length)?)),
            KeyKind::Des3_2k => Ok(Self::Tdes2(TdesEde2::new_from_slice(key).map_err(|_| key_length)?)),
            KeyKind::Des3_3k => Ok(Self::Tdes3(TdesEde3::new_from_slice(key).map_err(|_| key_length)?)),
            KeyKind::Aes128 => Ok(Self::Aes(Aes128::new_from_slice(key).map_err(|_| key_length)?)),
        }
    }

    /// Block size of the cipher in bytes.
    pub fn block_size(&self) -> usize {
        match self {
            Self::Des(_)|Self::Tdes2(_)|Self::Tdes3(_) => 8,
            Self::Aes(_) => 16,
        }
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        match self {
            Self::Des(c) => c.encrypt_block(Block::<Des>::from_mut_slice(block)),
            Self::Tdes2(c) => c.encrypt_block(Block::<TdesEde2>::from_mut_slice(block)),
            Self::Tdes3(c) => c.encrypt_block(Block::<TdesEde3>::from_mut_slice(block)),
            Self::Aes(c) => c.encrypt_block(Block::<Aes128>::from_mut_slice(block)),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        match self {
            Self::Des(c) => c.decrypt_block(Block::<Des>::from_mut_slice(block)),
            Self::Tdes2(c) => c.decrypt_block(Block::<TdesEde2>::from_mut_slice(block)),
            Self::Tdes3(c) => c.decrypt_block(Block::<TdesEde3>::from_mut_slice(block)),
            Self::Aes(c) => c.decrypt_block(Block::<Aes128>::from_mut_slice(block)),
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

    pub fn encrypt(&self, iv: &[u8], mode: CipherMode, data: &[u8]) -> Result<Vec<u8>, CryptError> {
        self.check_input(iv, mode, data)?;
        let block_size = self.block_size();
        let mut out = data.to_vec();
        match mode {
            CipherMode::Ecb => {
                for block in out.chunks_mut(block_size) {
                    self.encrypt_block(block);
                }
            },
            CipherMode::Cbc => {
                let mut previous = iv.to_vec();
                for block in out.chunks_mut(block_size) {
                    xor_in_place(block, &previous);
                    self.encrypt_block(block);
                    previous.copy_from_slice(block);
                }
            },
        }
        Ok(out)
    }

    pub fn decrypt(&self, iv: &[u8], mode: CipherMode, data: &[u8]) -> Result<Vec<u8>, CryptError> {
        self.check_input(iv, mode, data)?;
        let block_size = self.block_size();
        let mut out = data.to_vec();
        match mode {
            CipherMode::Ecb => {
                for block in out.chunks_mut(block_size) {
                    self.decrypt_block(block);
                }
            },
            CipherMode::Cbc => {
                let mut previous = iv.to_vec();
                let mut ciphertext = vec![0u8; block_size];
                for block in out.chunks_mut(block_size) {
                    ciphertext.copy_from_slice(block);
                    self.decrypt_block(block);
                    xor_in_place(block, &previous);
                    previous.copy_from_slice(&ciphertext);
                }
            },
        }
        Ok(out)
    }

    /// The legacy DESFire "send" transform: the reader encrypts outgoing data
    /// by running the cipher in the decrypt direction with CBC-style
    /// chaining, `out[i] = D(in[i] ^ out[i-1])`. Required for wire
    /// compatibility on the legacy authentication and secure-messaging path.
    pub fn legacy_send_transform(&self, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptError> {
        self.check_input(iv, CipherMode::Cbc, data)?;
        let mut previous = iv.to_vec();
        let mut out = data.to_vec();
        for block in out.chunks_mut(self.block_size()) {
            xor_in_place(block, &previous);
            self.decrypt_block(block);
            previous.copy_from_slice(block);
        }
        Ok(out)
    }
}


fn xor_in_place(target: &mut [u8], mask: &[u8]) {
    for (t, m) in target.iter_mut().zip(mask.iter()) {
        *t ^= *m;
    }
}


#[cfg(test)]
mod tests {
    use super::{BlockCipher, CipherMode, CryptError};
    use crate::key::KeyKind;
    use hex_literal::hex;

    #[test]
    fn test_key_length_checked() {
        assert!(matches!(
            BlockCipher::new(KeyKind::Aes128, &[0u8; 8]),
            Err(CryptError::KeyLength { obtained: 8, expected: 16 }),
        ));
    }

    #[test]
    fn test_unaligned_input_rejected() {
        let cipher = BlockCipher::new(KeyKind::Des, &hex!("0123456789ABCDEF")).unwrap();
        assert!(matches!(
            cipher.encrypt(&[0u8; 8], CipherMode::Cbc, &[0u8; 7]),
            Err(CryptError::InvalidBlockSize { length: 7, block_size: 8 }),
        ));
        assert!(matches!(
            cipher.decrypt(&[0u8; 8], CipherMode::Cbc, &[0u8; 12]),
            Err(CryptError::InvalidBlockSize { length: 12, block_size: 8 }),
        ));
    }

    #[test]
    fn test_aes_cbc_nist_vector() {
        // NIST SP 800-38A F.2.1, first block
        let cipher = BlockCipher::new(KeyKind::Aes128, &hex!("2B7E151628AED2A6ABF7158809CF4F3C")).unwrap();
        let iv = hex!("000102030405060708090A0B0C0D0E0F");
        let plaintext = hex!("6BC1BEE22E409F96E93D7E117393172A");
        let ciphertext = cipher.encrypt(&iv, CipherMode::Cbc, &plaintext).unwrap();
        assert_eq!(ciphertext, hex!("7649ABAC8119B246CEE98E9B12E9197D"));
        let recovered = cipher.decrypt(&iv, CipherMode::Cbc, &ciphertext).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_des_cbc_fips81_vector() {
        let cipher = BlockCipher::new(KeyKind::Des, &hex!("0123456789ABCDEF")).unwrap();
        let iv = hex!("1234567890ABCDEF");
        let plaintext = b"Now is the time for all ";
        let ciphertext = cipher.encrypt(&iv, CipherMode::Cbc, plaintext).unwrap();
        assert_eq!(
            ciphertext,
            hex!("E5C7CDDE872BF27C43E934008C389C0F683788499A7C05F6"),
        );
        let recovered = cipher.decrypt(&iv, CipherMode::Cbc, &ciphertext).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_round_trips_all_kinds() {
        let keys: [(KeyKind, &[u8]); 4] = [
            (KeyKind::Des, &hex!("0123456789ABCDEF")),
            (KeyKind::Des3_2k, &hex!("0123456789ABCDEFFEDCBA9876543210")),
            (KeyKind::Des3_3k, &hex!("0123456789ABCDEFFEDCBA987654321089ABCDEF01234567")),
            (KeyKind::Aes128, &hex!("000102030405060708090A0B0C0D0E0F")),
        ];
        for (kind, key) in keys {
            let cipher = BlockCipher::new(kind, key).unwrap();
            let block_size = cipher.block_size();
            let plaintext: Vec<u8> = (0..(3 * block_size) as u8).collect();
            let iv = vec![0x5Au8; block_size];
            for mode in [CipherMode::Ecb, CipherMode::Cbc] {
                let ciphertext = cipher.encrypt(&iv, mode, &plaintext).unwrap();
                assert_eq!(ciphertext.len(), plaintext.len());
                assert_ne!(ciphertext, plaintext);
                let recovered = cipher.decrypt(&iv, mode, &ciphertext).unwrap();
                assert_eq!(recovered, plaintext, "{} round trip in {:?} mode", kind, mode);
            }
        }
    }

    #[test]
    fn test_ecb_ignores_iv() {
        let cipher = BlockCipher::new(KeyKind::Aes128, &[0x11u8; 16]).unwrap();
        let data = [0x22u8; 32];
        let one = cipher.encrypt(&[0u8; 16], CipherMode::Ecb, &data).unwrap();
        let two = cipher.encrypt(&[0xFFu8; 16], CipherMode::Ecb, &data).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn test_legacy_send_transform_inverts_with_encrypt() {
        // the card undoes the send transform by encrypting each block and
        // XORing with the previous ciphertext
        let cipher = BlockCipher::new(KeyKind::Des3_2k, &hex!("5AB7B5B41110B90273EA816751E41D88")).unwrap();
        let iv = [0u8; 8];
        let plaintext = hex!("0FD9E6F7EB7E1BD9CF62E7B53ED842CB");
        let sent = cipher.legacy_send_transform(&iv, &plaintext).unwrap();

        let mut recovered: Vec<u8> = Vec::new();
        let mut previous = iv.to_vec();
        for block in sent.chunks(8) {
            let mut undone = cipher.encrypt(&[], CipherMode::Ecb, block).unwrap();
            for (u, p) in undone.iter_mut().zip(previous.iter()) {
                *u ^= *p;
            }
            recovered.extend(&undone);
            previous = block.to_vec();
        }
        assert_eq!(recovered, plaintext);
    }
}
