//! Printable-alphabet byte codec used as the tunnel's wire substrate.
//!
//! Standard base64 block coding (3 bytes -> 4 symbols) with the trailing `=`
//! padding stripped from the encoded form. The decoder re-derives the padding
//! from the input length, so any encoded field can travel as bare symbols.

use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use n0_error::{e, stack_error};

/// The 64-symbol wire alphabet, in value order.
pub(crate) const ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Reverse lookup from symbol byte to alphabet value; `0xff` marks bytes
/// outside the alphabet.
pub(crate) const REVERSE: [u8; 256] = build_reverse();

const fn build_reverse() -> [u8; 256] {
    let mut table = [0xff_u8; 256];
    let mut i = 0;
    while i < 64 {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
}

/// Wire text that cannot be decoded back to bytes.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum CodecError {
    /// The input length cannot be completed to a valid padded block form.
    #[error("encoded length {len} is not reconstructible to a padded form")]
    Length { len: usize },
    /// A byte outside the 64-symbol alphabet.
    #[error("byte {byte:#04x} is not a symbol of the wire alphabet")]
    Symbol { byte: u8 },
    /// Decoded plaintext was expected to be a string but is not UTF-8.
    #[error("decoded bytes are not valid utf-8")]
    NotUtf8 {
        #[error(source, std_err)]
        source: std::string::FromUtf8Error,
    },
}

/// Returns the numeric value of `symbol`, or a [`CodecError`] if the byte is
/// outside the alphabet.
pub(crate) fn symbol_value(symbol: u8) -> Result<u8, CodecError> {
    match REVERSE[symbol as usize] {
        0xff => Err(e!(CodecError::Symbol { byte: symbol })),
        value => Ok(value),
    }
}

/// Encodes arbitrary bytes into unpadded alphabet symbols.
pub fn encode(data: &[u8]) -> String {
    STANDARD_NO_PAD.encode(data)
}

/// Decodes unpadded alphabet symbols back into bytes.
///
/// Well-formed input never fails; a length of 1 (mod 4) or an out-of-alphabet
/// byte is a [`CodecError`].
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    use base64::DecodeError;
    STANDARD_NO_PAD.decode(text).map_err(|err| match err {
        DecodeError::InvalidByte(pos, _) => e!(CodecError::Symbol {
            byte: text.as_bytes()[pos],
        }),
        _ => e!(CodecError::Length { len: text.len() }),
    })
}
