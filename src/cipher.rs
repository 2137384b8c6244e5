//! Keyed stream cipher over the wire alphabet.
//!
//! The cipher first codec-encodes the plaintext, then shifts every resulting
//! symbol by the next symbol of a cyclic key stream (addition mod 64). The key
//! stream is the codec-encoded form of the raw key string, so key and data live
//! in the same 64-symbol alphabet.
//!
//! This is payload obfuscation, not cryptography: there is no integrity tag,
//! and tampering or a mismatched cursor produce garbage output rather than an
//! error. Every independently framed field (a header name, a header value, a
//! body chunk, a method, a url) must be processed from cursor position zero;
//! use [`TunnelCipher::with_fresh_cursor`] to obtain a zero-cursor copy instead
//! of sharing one mutable instance between fields.

use std::sync::Arc;

use n0_error::e;

use crate::codec::{self, ALPHABET, CodecError};

/// Stateful stream cipher: a cyclic key stream plus a cursor into it.
///
/// Cloning is cheap (the key stream is shared), and a clone carries the
/// current cursor. [`Self::with_fresh_cursor`] is the per-field entry point.
#[derive(Debug, Clone)]
pub struct TunnelCipher {
    /// Key stream symbol values (already mapped through the alphabet table).
    key: Arc<[u8]>,
    cursor: usize,
}

impl TunnelCipher {
    /// Creates a cipher keyed by `key`. The key stream is the codec-encoded
    /// form of the key bytes, cycled indefinitely.
    pub fn new(key: &str) -> Self {
        let encoded = codec::encode(key.as_bytes());
        let key: Vec<u8> = encoded
            .bytes()
            .map(|symbol| codec::REVERSE[symbol as usize])
            .collect();
        debug_assert!(!key.contains(&0xff));
        Self {
            key: key.into(),
            cursor: 0,
        }
    }

    /// Returns a copy of this cipher with the cursor rewound to the start of
    /// the key stream. Pure: `self` is left untouched.
    pub fn with_fresh_cursor(&self) -> Self {
        Self {
            key: self.key.clone(),
            cursor: 0,
        }
    }

    /// Rewinds the cursor in place.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    fn next_key_value(&mut self) -> u8 {
        let value = self.key[self.cursor];
        self.cursor = (self.cursor + 1) % self.key.len();
        value
    }

    /// Codec-encodes `data` and shifts each symbol forward by the key stream,
    /// consuming one key symbol per data symbol.
    pub fn encrypt(&mut self, data: &[u8]) -> String {
        let encoded = codec::encode(data);
        let out: Vec<u8> = encoded
            .bytes()
            .map(|symbol| {
                let value = codec::REVERSE[symbol as usize];
                ALPHABET[((value + self.next_key_value()) % 64) as usize]
            })
            .collect();
        // Every byte is an alphabet symbol, so this is always valid UTF-8.
        String::from_utf8(out).unwrap_or_default()
    }

    /// Shifts each symbol of `text` backward by the key stream and
    /// codec-decodes the result.
    pub fn decrypt(&mut self, text: &str) -> Result<Vec<u8>, CodecError> {
        let mut shifted = Vec::with_capacity(text.len());
        for byte in text.bytes() {
            let value = codec::symbol_value(byte)?;
            shifted.push(ALPHABET[((64 + value - self.next_key_value()) % 64) as usize]);
        }
        let shifted = String::from_utf8(shifted).unwrap_or_default();
        codec::decode(&shifted)
    }

    /// [`Self::encrypt`] for string plaintext.
    pub fn encrypt_str(&mut self, data: &str) -> String {
        self.encrypt(data.as_bytes())
    }

    /// [`Self::decrypt`] where the plaintext is expected to be UTF-8.
    pub fn decrypt_str(&mut self, text: &str) -> Result<String, CodecError> {
        let bytes = self.decrypt(text)?;
        String::from_utf8(bytes).map_err(|source| e!(CodecError::NotUtf8 { source }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cipher = TunnelCipher::new("some key material");
        let data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let text = cipher.with_fresh_cursor().encrypt(&data);
        assert!(text.bytes().all(|b| ALPHABET.contains(&b)));
        let back = cipher.with_fresh_cursor().decrypt(&text).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn deterministic_from_fresh_cursor() {
        let cipher = TunnelCipher::new("k");
        let a = cipher.with_fresh_cursor().encrypt(b"same field");
        let b = cipher.with_fresh_cursor().encrypt(b"same field");
        assert_eq!(a, b);
    }

    #[test]
    fn cursor_advances_across_calls() {
        let mut cipher = TunnelCipher::new("a much longer key than the data");
        let first = cipher.encrypt(b"x");
        let second = cipher.encrypt(b"x");
        // Same plaintext, different key stream position.
        assert_ne!(first, second);
        cipher.reset();
        assert_eq!(cipher.encrypt(b"x"), first);
    }

    #[test]
    fn key_shorter_than_data_cycles() {
        let cipher = TunnelCipher::new("k");
        let data = vec![0xa5u8; 4096];
        let text = cipher.with_fresh_cursor().encrypt(&data);
        assert_eq!(cipher.with_fresh_cursor().decrypt(&text).unwrap(), data);
    }

    #[test]
    fn str_round_trip() {
        let cipher = TunnelCipher::new("secret");
        let text = cipher.with_fresh_cursor().encrypt_str("Accept-Language");
        assert_eq!(
            cipher.with_fresh_cursor().decrypt_str(&text).unwrap(),
            "Accept-Language"
        );
    }

    #[test]
    fn wrong_key_is_garbage_not_error_for_aligned_lengths() {
        let good = TunnelCipher::new("right key");
        let bad = TunnelCipher::new("wrong key");
        let text = good.with_fresh_cursor().encrypt(b"abcdef");
        // 6 bytes encode to 8 symbols, decodable under any shift; the result
        // is silently wrong rather than an error.
        let out = bad.with_fresh_cursor().decrypt(&text).unwrap();
        assert_ne!(out, b"abcdef");
    }

    #[test]
    fn mismatched_cursor_corrupts_silently() {
        let cipher = TunnelCipher::new("shared secret value");
        let text = cipher.with_fresh_cursor().encrypt(b"abcdef");
        // Two symbols of skew; a skew of a whole key-stream cycle would be a
        // no-op.
        let mut skewed = cipher.with_fresh_cursor();
        let _ = skewed.encrypt(b"x");
        if let Ok(out) = skewed.decrypt(&text) {
            assert_ne!(out, b"abcdef");
        }
    }
}
