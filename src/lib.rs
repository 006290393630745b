//! Authentication and secure messaging for MIFARE DESFire cards.
//!
//! The engine implements the card's three-pass mutual authentication in its
//! legacy (DES/2K3DES), ISO (up to 3K3DES) and AES-128 variants, derives the
//! session key, and protects subsequent traffic in the card's plain, MACed
//! and enciphered communication modes. Per-card key diversification is
//! supported in both the legacy and the AN10922 scheme.
//!
//! The engine talks to the card through the [`transport::CardTransport`]
//! boundary and never owns a reader; likewise, keys whose bytes must stay in
//! a vault or secure element are exercised through the
//! [`remote::RemoteCrypto`] delegate without ever being materialized here.
//!
//! A typical exchange:
//!
//! ```no_run
//! # fn example(transport: &mut dyn mifare_desfire::transport::CardTransport) -> Result<(), mifare_desfire::Error> {
//! use mifare_desfire::auth::authenticate_aes;
//! use mifare_desfire::key::{Key, KeyKind};
//! use mifare_desfire::secure::{CommunicationMode, SecureChannel};
//!
//! let key = Key::new(KeyKind::Aes128, &[0u8; 16])?;
//! let mut session = authenticate_aes(transport, &key, 0, 0x000000, None, None)?;
//! let mut channel = SecureChannel::new(&mut session);
//! let frame = channel.encipher_data(CommunicationMode::Encrypted, b"record", true)?;
//! # let _ = frame;
//! # Ok(())
//! # }
//! ```


pub mod access;
pub mod auth;
pub mod crypt;
pub mod diversify;
pub mod error;
pub mod key;
pub mod remote;
pub mod secure;
pub mod session;
pub mod transport;


pub use crate::error::Error;
