//! Handshake signatures.
//!
//! Both ends of a link hold the same cluster key. A handshake message is
//! authenticated by an HMAC-SHA256 over the ASCII string
//! `"{sender_id}=>{receiver_id}"`, so a captured Hello cannot be replayed
//! toward a different node or in the opposite direction.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::KeyError;

type HmacSha256 = Hmac<Sha256>;

/// Shared cluster key used to sign and verify handshakes.
#[derive(Clone)]
pub struct HandshakeKey {
    keyed: HmacSha256,
}

impl HandshakeKey {
    /// Key from raw bytes.
    pub fn new(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.is_empty() {
            return Err(KeyError::Empty);
        }
        let keyed = HmacSha256::new_from_slice(bytes).map_err(|_| KeyError::Length)?;
        Ok(Self { keyed })
    }

    /// Key from a hex string.
    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        Self::new(&hex::decode(text.trim())?)
    }

    fn mac(&self, sender: u32, receiver: u32) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(format!("{sender}=>{receiver}").as_bytes());
        mac
    }

    /// Signature over `sender => receiver`.
    pub fn sign(&self, sender: u32, receiver: u32) -> Vec<u8> {
        self.mac(sender, receiver).finalize().into_bytes().to_vec()
    }

    /// Constant-time check of a signature over `sender => receiver`.
    pub fn verify(&self, sender: u32, receiver: u32, signature: &[u8]) -> bool {
        self.mac(sender, receiver).verify_slice(signature).is_ok()
    }
}

impl fmt::Debug for HandshakeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandshakeKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_binds_direction() {
        let key = HandshakeKey::new(b"cluster secret").unwrap();
        let sig = key.sign(1, 2);
        assert_eq!(sig.len(), 32);
        assert!(key.verify(1, 2, &sig));
        assert!(!key.verify(2, 1, &sig));
        assert!(!key.verify(1, 3, &sig));
    }

    #[test]
    fn different_keys_do_not_verify() {
        let sig = HandshakeKey::new(b"a").unwrap().sign(1, 2);
        assert!(!HandshakeKey::new(b"b").unwrap().verify(1, 2, &sig));
    }

    #[test]
    fn hex_keys_parse() {
        let key = HandshakeKey::from_hex("00ff10\n").unwrap();
        let raw = HandshakeKey::new(&[0x00, 0xff, 0x10]).unwrap();
        assert_eq!(key.sign(4, 5), raw.sign(4, 5));
        assert!(matches!(HandshakeKey::from_hex("zz"), Err(KeyError::Hex(_))));
        assert!(matches!(HandshakeKey::from_hex(""), Err(KeyError::Empty)));
    }
}
