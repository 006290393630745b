//! CMAC with the DESFire buffer-shifting subkey derivation.
//!
//! Subkeys are derived from the encryption of an all-zero block:
//! ```plain
//! L  = E(0^b)
//! K1 = (L  << 1) ^ (Rb if msb(L)  else 0)
//! K2 = (K1 << 1) ^ (Rb if msb(K1) else 0)
//! ```
//! with `Rb = 0x1B` for 8-byte blocks and `Rb = 0x87` for 16-byte blocks.
//! The final message block is padded with `0x80 00..` only when the message
//! is empty or not block-aligned (selecting `K2` instead of `K1`).
//!
//! Unlike a plain CMAC, computation accepts a rolling IV so that tags can be
//! chained across the buffered parts of a session's command stream; the full
//! last cipher block is both the tag and the next chain value.


use zeroize::Zeroizing;

use crate::crypt::CipherMode;
use crate::error::Error;
use crate::remote::CipherOps;


/// CMAC subkeys for one session cipher.
pub struct Cmac {
    block_size: usize,
    k1: Zeroizing<Vec<u8>>,
    k2: Zeroizing<Vec<u8>>,
}
impl Cmac {
    pub fn new(ops: &mut CipherOps<'_, '_>) -> Result<Self, Error> {
        let block_size = ops.block_size();
        let zero_iv = vec![0u8; block_size];
        let l = Zeroizing::new(ops.encrypt(&zero_iv, CipherMode::Cbc, &zero_iv)?);
        let k1 = Zeroizing::new(shifted_subkey(&l, block_size));
        let k2 = Zeroizing::new(shifted_subkey(&k1, block_size));
        Ok(Self { block_size, k1, k2 })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Computes the CMAC of `message`, chaining from `iv`.
    ///
    /// The returned tag has block-size length; callers truncate it for the
    /// wire and feed it back as the next IV to continue the chain.
    pub fn compute(&self, ops: &mut CipherOps<'_, '_>, iv: &[u8], message: &[u8]) -> Result<Vec<u8>, Error> {
        let mut buffer = Zeroizing::new(message.to_vec());
        let subkey = if buffer.is_empty() || buffer.len() % self.block_size != 0 {
            buffer.push(0x80);
            while buffer.len() % self.block_size != 0 {
                buffer.push(0x00);
            }
            &self.k2
        } else {
            &self.k1
        };
        let final_block_at = buffer.len() - self.block_size;
        for (b, k) in buffer[final_block_at..].iter_mut().zip(subkey.iter()) {
            *b ^= *k;
        }
        let ciphertext = ops.encrypt(iv, CipherMode::Cbc, &buffer)?;
        Ok(ciphertext[final_block_at..].to_vec())
    }
}


fn shifted_subkey(block: &[u8], block_size: usize) -> Vec<u8> {
    let rb = match block_size {
        8 => 0x1B,
        _ => 0x87,
    };
    let mut out = vec![0u8; block.len()];
    let mut carry = 0u8;
    for (o, b) in out.iter_mut().zip(block.iter()).rev() {
        *o = (b << 1) | carry;
        carry = b >> 7;
    }
    if block[0] & 0x80 != 0 {
        let last = out.len() - 1;
        out[last] ^= rb;
    }
    out
}


#[cfg(test)]
mod tests {
    use super::Cmac;
    use crate::crypt::BlockCipher;
    use crate::key::KeyKind;
    use crate::remote::CipherOps;
    use hex_literal::hex;

    const RFC4493_KEY: [u8; 16] = hex!("2B7E151628AED2A6ABF7158809CF4F3C");

    fn aes_ops() -> CipherOps<'static, 'static> {
        CipherOps::Local(BlockCipher::new(KeyKind::Aes128, &RFC4493_KEY).unwrap())
    }

    #[test]
    fn test_rfc4493_subkeys() {
        let mut ops = aes_ops();
        let cmac = Cmac::new(&mut ops).unwrap();
        assert_eq!(cmac.k1.as_slice(), hex!("FBEED618357133667C85E08F7236A8DE"));
        assert_eq!(cmac.k2.as_slice(), hex!("F7DDAC306AE266CCF90BC11EE46D513B"));
    }

    #[test]
    fn test_rfc4493_tags() {
        let mut ops = aes_ops();
        let cmac = Cmac::new(&mut ops).unwrap();
        let zero_iv = [0u8; 16];

        let empty = cmac.compute(&mut ops, &zero_iv, &[]).unwrap();
        assert_eq!(empty, hex!("BB1D6929E95937287FA37D129B756746"));

        let one_block = cmac.compute(&mut ops, &zero_iv, &hex!("6BC1BEE22E409F96E93D7E117393172A")).unwrap();
        assert_eq!(one_block, hex!("070A16B46B4D4144F79BDD9DD04A287C"));

        let forty = cmac.compute(&mut ops, &zero_iv, &hex!(
            "6BC1BEE22E409F96E93D7E117393172A"
            "AE2D8A571E03AC9C9EB76FAC45AF8E51"
            "30C81C46A35CE411"
        )).unwrap();
        assert_eq!(forty, hex!("DFA66747DE9AE63030CA32611497C827"));
    }

    #[test]
    fn test_tag_is_deterministic_and_bit_sensitive() {
        let mut ops = aes_ops();
        let cmac = Cmac::new(&mut ops).unwrap();
        let zero_iv = [0u8; 16];
        let message = b"READ FILE 01 OFFSET 0 LENGTH 32";

        let first = cmac.compute(&mut ops, &zero_iv, message).unwrap();
        let second = cmac.compute(&mut ops, &zero_iv, message).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);

        let mut tampered = message.to_vec();
        tampered[4] ^= 0x01;
        let third = cmac.compute(&mut ops, &zero_iv, &tampered).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_matches_cmac_crate() {
        use cmac::{Cmac as RefCmac, Mac};

        let mut ops = aes_ops();
        let engine = Cmac::new(&mut ops).unwrap();
        let zero_iv = [0u8; 16];
        let message = b"chained secure messaging reference check";

        let mut reference = <RefCmac<aes::Aes128> as Mac>::new_from_slice(&RFC4493_KEY).unwrap();
        reference.update(message);
        let expected = reference.finalize().into_bytes();

        let tag = engine.compute(&mut ops, &zero_iv, message).unwrap();
        assert_eq!(tag.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_chained_iv_differs_from_fresh() {
        let mut ops = aes_ops();
        let cmac = Cmac::new(&mut ops).unwrap();
        let zero_iv = [0u8; 16];
        let message = b"second command in the session";

        let fresh = cmac.compute(&mut ops, &zero_iv, message).unwrap();
        let chain = cmac.compute(&mut ops, &zero_iv, b"first command").unwrap();
        let chained = cmac.compute(&mut ops, &chain, message).unwrap();
        assert_ne!(fresh, chained);
    }
}
