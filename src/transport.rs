//! The transport boundary.
//!
//! The engine produces and consumes raw DESFire command and response frames;
//! it does not frame, address or transmit them. Whatever physically carries
//! the bytes to the card (PC/SC, a serial reader, a network bridge) is
//! represented by a single synchronous exchange function.


use std::fmt;


#[derive(Debug)]
pub enum TransportError {
    /// The underlying reader failed to carry the exchange.
    Transmit { message: String },
    /// The card answered with fewer bytes than a valid frame requires.
    ShortResponse,
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transmit { message }
                => write!(f, "transport failed: {}", message),
            Self::ShortResponse
                => write!(f, "response too short"),
        }
    }
}
impl std::error::Error for TransportError {
}


/// A channel to a single card.
///
/// One round trip: the full command frame goes out, the full response frame
/// (status byte followed by payload) comes back.
pub trait CardTransport {
    fn transact(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;
}
