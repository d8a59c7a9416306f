//! Growable code buffer.
//!
//! Word-granular: every instruction and every literal-pool entry on this
//! target is one 32-bit word, little-endian when serialized. The buffer
//! enforces the configured size limit so a runaway method aborts cleanly
//! instead of exhausting memory on a small device.

use super::AsmError;

/// A buffer of instruction words being built.
pub struct CodeBuffer {
    words: Vec<u32>,
    limit_words: usize,
}

impl CodeBuffer {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            words: Vec::new(),
            limit_words: limit_bytes / 4,
        }
    }

    /// Number of words emitted so far.
    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Append one word, returning its word position.
    pub fn emit(&mut self, word: u32) -> Result<usize, AsmError> {
        if self.words.len() >= self.limit_words {
            return Err(AsmError::CodeBufferFull);
        }
        let pos = self.words.len();
        self.words.push(word);
        Ok(pos)
    }

    pub fn word_at(&self, pos: usize) -> u32 {
        self.words[pos]
    }

    pub fn set_word(&mut self, pos: usize, word: u32) {
        self.words[pos] = word;
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Serialize to bytes (little-endian words).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.words.len() * 4);
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_patch() {
        let mut buf = CodeBuffer::new(1024);
        let a = buf.emit(0xAAAA_AAAA).unwrap();
        let b = buf.emit(0xBBBB_BBBB).unwrap();
        assert_eq!((a, b), (0, 1));
        buf.set_word(0, 0x1234_5678);
        assert_eq!(buf.word_at(0), 0x1234_5678);
        assert_eq!(buf.len_bytes(), 8);
    }

    #[test]
    fn test_limit_enforced() {
        let mut buf = CodeBuffer::new(8);
        buf.emit(1).unwrap();
        buf.emit(2).unwrap();
        assert_eq!(buf.emit(3), Err(AsmError::CodeBufferFull));
    }

    #[test]
    fn test_to_bytes_little_endian() {
        let mut buf = CodeBuffer::new(64);
        buf.emit(0xDEAD_BEEF).unwrap();
        assert_eq!(buf.to_bytes(), vec![0xEF, 0xBE, 0xAD, 0xDE]);
    }
}
