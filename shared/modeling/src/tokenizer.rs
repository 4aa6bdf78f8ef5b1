//! Byte-level tokenizer.
//!
//! The trainer only consumes `vocab_size` (it feeds the text tower's
//! embedding table); encode/decode exist for the data side. 256 raw bytes
//! plus pad/start/end markers.

const PAD: i64 = 256;
const START_OF_TEXT: i64 = 257;
const END_OF_TEXT: i64 = 258;

#[derive(Debug, Default, Clone, Copy)]
pub struct Tokenizer;

impl Tokenizer {
    pub fn new() -> Self {
        Self
    }

    pub fn vocab_size(&self) -> i64 {
        259
    }

    /// Token ids and a validity mask, both exactly `seq_len` long. Text that
    /// does not fit (with its start/end markers) is truncated.
    pub fn encode(&self, text: &str, seq_len: usize) -> (Vec<i64>, Vec<bool>) {
        let mut ids = Vec::with_capacity(seq_len);
        ids.push(START_OF_TEXT);
        ids.extend(
            text.bytes()
                .take(seq_len.saturating_sub(2))
                .map(|b| b as i64),
        );
        ids.push(END_OF_TEXT);
        ids.truncate(seq_len);

        let mut mask = vec![true; ids.len()];
        mask.resize(seq_len, false);
        ids.resize(seq_len, PAD);
        (ids, mask)
    }

    pub fn decode(&self, ids: &[i64]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| (0..256).contains(&id))
            .map(|&id| id as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
