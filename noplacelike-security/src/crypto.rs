//! Optional symmetric encryption for peer channels.
//!
//! Both ends derive the same per-pair key from the shared platform secret
//! via HKDF-SHA256 over the sorted peer-id pair, then seal each frame with
//! CHACHA20-POLY1305. The random nonce travels as a prefix of the sealed
//! frame.

use ring::aead;
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::SecurityError;

const KEY_CONTEXT: &[u8] = b"noplacelike.channel.v1";

pub struct ChannelCrypto {
    secret: Vec<u8>,
    rng: SystemRandom,
}

impl ChannelCrypto {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            rng: SystemRandom::new(),
        }
    }

    /// Key for the (local, peer) pair; identical regardless of direction.
    fn key_for(&self, a: &str, b: &str) -> Result<aead::LessSafeKey, SecurityError> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let pair = format!("{lo}:{hi}");
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, KEY_CONTEXT);
        let prk = salt.extract(&self.secret);
        let info = [pair.as_bytes()];
        let okm = prk
            .expand(&info, &aead::CHACHA20_POLY1305)
            .map_err(|_| SecurityError::CryptoFailure("key derivation failed".to_string()))?;
        Ok(aead::LessSafeKey::new(aead::UnboundKey::from(okm)))
    }

    pub fn seal(&self, local: &str, peer: &str, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let key = self.key_for(local, peer)?;
        let mut nonce_bytes = [0u8; aead::NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| SecurityError::CryptoFailure("nonce generation failed".to_string()))?;
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| SecurityError::CryptoFailure("seal failed".to_string()))?;

        let mut frame = Vec::with_capacity(aead::NONCE_LEN + in_out.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&in_out);
        Ok(frame)
    }

    pub fn open(&self, local: &str, peer: &str, frame: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if frame.len() < aead::NONCE_LEN + aead::CHACHA20_POLY1305.tag_len() {
            return Err(SecurityError::CryptoFailure("frame too short".to_string()));
        }
        let key = self.key_for(local, peer)?;
        let nonce = aead::Nonce::try_assume_unique_for_key(&frame[..aead::NONCE_LEN])
            .map_err(|_| SecurityError::CryptoFailure("bad nonce".to_string()))?;
        let mut in_out = frame[aead::NONCE_LEN..].to_vec();
        let plaintext = key
            .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| SecurityError::CryptoFailure("open failed".to_string()))?;
        Ok(plaintext.to_vec())
    }
}
