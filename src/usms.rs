//! Ultra Short Message Service: 6-bit packed ASCII text codec.
//!
//! The alphabet holds 64 entries: index 0 is the null/padding code, 1..=26
//! map to `a..z`, 27..=36 to `0..9` and the remainder to a fixed set of
//! punctuation plus space. Four 6-bit codes pack into three bytes:
//!
//! ```text
//! b0 = c0 << 2 | c1 >> 4
//! b1 = c1 << 4 | c2 >> 2
//! b2 = c2 << 6 | c3
//! ```
//!
//! so an `n`-character message occupies `ceil(n * 6 / 8)` bytes, with the
//! trailing byte zero-padded in its low bits. Decoding is length-driven and
//! drops null codes, which makes the round trip exact for any message whose
//! bit length is not a multiple of 8.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::errors::UsmsError;

/// Maximum USMS message length in characters.
pub const MAX_CHARS: usize = 70;

/// 6-bit alphabet. Index 0 is reserved for padding and never decodes to a
/// character.
const ALPHABET: [char; 64] = [
    '\0', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q',
    'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8',
    '9', ',', '?', ';', '.', ':', '/', '\\', '(', ')', '[', ']', '!', '&', '|', '@', '#', '\'',
    '"', '%', '*', '-', '_', '+', '=', '<', '>', ' ',
];

static INDEX: Lazy<HashMap<char, u8>> = Lazy::new(|| {
    ALPHABET
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, &ch)| (ch, i as u8))
        .collect()
});

/// Encode an ASCII string into the packed 6-bit representation.
///
/// # Errors
/// [`UsmsError::CharacterOutOfRange`] when any character is not part of the
/// alphabet.
pub fn encode(text: &str) -> Result<Vec<u8>, UsmsError> {
    let mut codes = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let code = INDEX
            .get(&ch)
            .copied()
            .ok_or(UsmsError::CharacterOutOfRange(ch))?;
        codes.push(code);
    }

    let mut packed = Vec::with_capacity((codes.len() * 6 + 7) / 8);
    for chunk in codes.chunks(4) {
        let c0 = chunk[0];
        let c1 = chunk.get(1).copied().unwrap_or(0);
        let c2 = chunk.get(2).copied().unwrap_or(0);
        let c3 = chunk.get(3).copied().unwrap_or(0);
        packed.push(c0 << 2 | c1 >> 4);
        if chunk.len() > 1 {
            packed.push(c1 << 4 | c2 >> 2);
        }
        if chunk.len() > 2 {
            packed.push(c2 << 6 | c3);
        }
    }
    Ok(packed)
}

/// Decode a packed 6-bit buffer back into an ASCII string.
///
/// Decoding stops at buffer end; null codes (index 0) are omitted from the
/// output.
///
/// # Errors
/// [`UsmsError::IndexOutOfRange`] when a decoded index exceeds the alphabet.
pub fn decode(data: &[u8]) -> Result<String, UsmsError> {
    let mut text = String::new();
    let mut rest: u8 = 0;
    for (i, &byte) in data.iter().enumerate() {
        // 3-byte cycle: shift 2, shift 4, shift 6. The shift-6 position
        // realigns to a byte boundary and its low 6 bits are a full code.
        match i % 3 {
            0 => {
                push_code(&mut text, byte >> 2)?;
                rest = byte & 0x03;
            }
            1 => {
                push_code(&mut text, byte >> 4 | rest << 4)?;
                rest = byte & 0x0f;
            }
            _ => {
                push_code(&mut text, byte >> 6 | rest << 2)?;
                push_code(&mut text, byte & 0x3f)?;
                rest = 0;
            }
        }
    }
    Ok(text)
}

fn push_code(text: &mut String, code: u8) -> Result<(), UsmsError> {
    if code as usize >= ALPHABET.len() {
        return Err(UsmsError::IndexOutOfRange(code));
    }
    if code != 0 {
        text.push(ALPHABET[code as usize]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn alphabet_fits_six_bits() {
        assert_eq!(ALPHABET.len(), 64);
        assert_eq!(INDEX.len(), 63); // null code is not addressable
    }

    #[test]
    fn encode_known_vector() {
        // 'e' is index 5: 000101. Six of them pack into 5 bytes.
        assert_eq!(encode("eeeeee").unwrap(), vec![0x14, 0x51, 0x45, 0x14, 0x50]);
    }

    #[test]
    fn decode_known_vector() {
        assert_eq!(decode(&[0x14, 0x51, 0x45, 0x14, 0x50]).unwrap(), "eeeeee");
    }

    #[test]
    fn encode_length_is_ceil_of_six_bit_count() {
        for n in 0..=MAX_CHARS {
            let text: String = std::iter::repeat('a').take(n).collect();
            assert_eq!(encode(&text).unwrap().len(), (n * 6 + 7) / 8);
        }
    }

    #[test]
    fn encode_rejects_foreign_characters() {
        assert_eq!(
            encode("BRAINS"),
            Err(UsmsError::CharacterOutOfRange('B'))
        );
        assert_eq!(encode("caf\u{e9}"), Err(UsmsError::CharacterOutOfRange('\u{e9}')));
    }

    #[test]
    fn empty_round_trip() {
        assert_eq!(encode("").unwrap(), Vec::<u8>::new());
        assert_eq!(decode(&[]).unwrap(), "");
    }

    #[test]
    fn punctuation_round_trip() {
        let text = "all clear, sector 7 (for now)... stay sharp!";
        assert_eq!(decode(&encode(text).unwrap()).unwrap(), text);
    }

    fn alphabet_string() -> impl Strategy<Value = String> {
        let chars: Vec<char> = ALPHABET[1..].to_vec();
        proptest::collection::vec(proptest::sample::select(chars), 0..=MAX_CHARS)
            .prop_map(|cs| cs.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_round_trip(text in alphabet_string()) {
            let packed = encode(&text).unwrap();
            prop_assert_eq!(packed.len(), (text.len() * 6 + 7) / 8);
            prop_assert_eq!(decode(&packed).unwrap(), text);
        }
    }
}
