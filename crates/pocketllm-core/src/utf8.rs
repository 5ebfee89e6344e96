use encoding_rs::{Decoder, UTF_8};

/// Joins raw token pieces into text.
///
/// A multi-byte character may be split across two or more pieces; the
/// incomplete tail is held inside the decoder until the rest arrives, so only
/// whole characters are ever returned. Invalid sequences become U+FFFD.
pub struct Utf8Assembler {
    decoder: Decoder,
}

impl Default for Utf8Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self { decoder: UTF_8.new_decoder() }
    }

    /// Decode the next piece, returning every character it completes.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.decode(bytes, false)
    }

    /// Flush at end of stream. A dangling partial character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        self.decode(&[], true)
    }

    fn decode(&mut self, bytes: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() * 3 + 4);
        let mut out = String::with_capacity(capacity);
        let _ = self.decoder.decode_to_string(bytes, &mut out, last);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(b"Hello"), "Hello");
        assert_eq!(asm.finish(), "");
    }

    #[test]
    fn split_multibyte_char_is_held_until_complete() {
        // "é" is C3 A9; "€" is E2 82 AC.
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(&[b'a', 0xC3]), "a");
        assert_eq!(asm.push(&[0xA9, 0xE2]), "é");
        assert_eq!(asm.push(&[0x82]), "");
        assert_eq!(asm.push(&[0xAC, b'!']), "€!");
    }

    #[test]
    fn dangling_bytes_become_replacement_on_finish() {
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(&[0xF0, 0x9F]), "");
        assert_eq!(asm.finish(), "\u{FFFD}");
    }
}
