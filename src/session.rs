//! Per-card-session state.


use zeroize::Zeroize;

use crate::key::KeyKind;
use crate::remote::RemoteKeyRef;


/// The authentication protocol variant a session was established with.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AuthMethod {
    /// Native DES/3DES authentication with the one-byte rotation trick.
    Legacy,
    /// ISO authentication (up to three-key triple DES).
    Iso,
    /// AES-128 authentication.
    Aes,
}


/// Session key material: bytes derived locally, or a reference to material a
/// remote delegate keeps custody of.
#[derive(Debug)]
pub enum SessionKey {
    Local(zeroize::Zeroizing<Vec<u8>>),
    Remote(RemoteKeyRef),
}


/// Mutable state of one authenticated card session.
///
/// A context is created only by a successful authentication run. Its chain
/// state (`last_iv`) and key material are written exclusively by the secure
/// messaging codec, which borrows the context mutably for every operation;
/// everything else gets read-only views. The context is invalidated (and its
/// key material zeroed) when a different application is selected, when an
/// integrity check fails, on [`SessionContext::invalidate`] and on drop.
#[derive(Debug)]
pub struct SessionContext {
    auth_method: AuthMethod,
    session_kind: KeyKind,
    session_key: SessionKey,
    last_iv: Vec<u8>,
    block_size: u8,
    mac_size: u8,
    current_aid: u32,
    current_key_no: u8,
    pending: Vec<u8>,
    valid: bool,
}
impl SessionContext {
    pub(crate) fn establish(
        auth_method: AuthMethod,
        session_kind: KeyKind,
        session_key: SessionKey,
        current_aid: u32,
        current_key_no: u8,
    ) -> Self {
        let block_size = session_kind.block_size();
        let mac_size = match auth_method {
            AuthMethod::Legacy => 4,
            AuthMethod::Iso|AuthMethod::Aes => 8,
        };
        Self {
            auth_method,
            session_kind,
            session_key,
            last_iv: vec![0u8; block_size],
            block_size: block_size as u8,
            mac_size,
            current_aid,
            current_key_no,
            pending: Vec::new(),
            valid: true,
        }
    }

    pub fn auth_method(&self) -> AuthMethod { self.auth_method }
    pub fn session_kind(&self) -> KeyKind { self.session_kind }
    pub fn block_size(&self) -> u8 { self.block_size }
    pub fn mac_size(&self) -> u8 { self.mac_size }
    pub fn current_aid(&self) -> u32 { self.current_aid }
    pub fn current_key_no(&self) -> u8 { self.current_key_no }
    pub fn is_valid(&self) -> bool { self.valid }

    /// Read-only view of the current chain value.
    pub fn last_iv(&self) -> &[u8] { &self.last_iv }

    /// Locally-materialized session key bytes, if the session is not
    /// delegated to a remote custodian.
    pub fn session_key_bytes(&self) -> Option<&[u8]> {
        match &self.session_key {
            SessionKey::Local(bytes) => Some(bytes),
            SessionKey::Remote(_) => None,
        }
    }

    pub(crate) fn session_key(&self) -> &SessionKey { &self.session_key }

    pub(crate) fn set_last_iv(&mut self, iv: &[u8]) {
        self.last_iv.clear();
        self.last_iv.extend_from_slice(iv);
    }

    pub(crate) fn push_pending(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    pub(crate) fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Tells the session a `SELECT APPLICATION` completed. Selecting a
    /// different application ends the authenticated state.
    pub fn application_selected(&mut self, aid: u32) {
        if aid != self.current_aid {
            self.invalidate();
            self.current_aid = aid;
        }
    }

    /// Ends the session: zeroes the key material and chain state. The
    /// context refuses all further secure messaging until a fresh
    /// authentication replaces it.
    pub fn invalidate(&mut self) {
        if let SessionKey::Local(bytes) = &mut self.session_key {
            bytes.zeroize();
        }
        self.last_iv.zeroize();
        self.pending.zeroize();
        self.valid = false;
    }
}
impl Drop for SessionContext {
    fn drop(&mut self) {
        self.invalidate();
    }
}


#[cfg(test)]
mod tests {
    use super::{AuthMethod, SessionContext, SessionKey};
    use crate::key::KeyKind;
    use zeroize::Zeroizing;

    fn context() -> SessionContext {
        SessionContext::establish(
            AuthMethod::Aes,
            KeyKind::Aes128,
            SessionKey::Local(Zeroizing::new(vec![0xA5; 16])),
            0x00F48120,
            2,
        )
    }

    #[test]
    fn test_establish_defaults() {
        let session = context();
        assert!(session.is_valid());
        assert_eq!(session.block_size(), 16);
        assert_eq!(session.mac_size(), 8);
        assert_eq!(session.last_iv(), &[0u8; 16]);
        assert_eq!(session.current_aid(), 0x00F48120);
        assert_eq!(session.current_key_no(), 2);
    }

    #[test]
    fn test_reselecting_same_application_keeps_session() {
        let mut session = context();
        session.application_selected(0x00F48120);
        assert!(session.is_valid());
    }

    #[test]
    fn test_selecting_other_application_invalidates() {
        let mut session = context();
        session.application_selected(0x00000000);
        assert!(!session.is_valid());
        assert_eq!(session.session_key_bytes(), Some(&[][..]));
        assert_eq!(session.current_aid(), 0x00000000);
    }
}
