//! Space-separated tokenizer for command lines.

/// Maximum token slots per line, including the trailing remainder slot.
pub const MAX_TOKENS: usize = 4;

/// Word tokens of a line plus whatever was left unparsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokens<'a> {
    words: Vec<&'a [u8]>,
    rest: Option<&'a [u8]>,
}

impl<'a> Tokens<'a> {
    pub fn word(&self, index: usize) -> Option<&'a [u8]> {
        self.words.get(index).copied()
    }

    pub fn words(&self) -> &[&'a [u8]] {
        &self.words
    }

    /// Unparsed tail, or `None` when the whole line was consumed.
    pub fn rest(&self) -> Option<&'a [u8]> {
        self.rest
    }

    /// Number of slots used: the words plus the remainder slot.
    pub fn count(&self) -> usize {
        self.words.len() + 1
    }
}

/// Split `line` on runs of spaces into at most `MAX_TOKENS - 1` words.
pub fn tokenize(line: &[u8]) -> Tokens<'_> {
    let mut words = Vec::with_capacity(MAX_TOKENS - 1);
    let mut rest = line;

    while words.len() < MAX_TOKENS - 1 {
        let start = rest.iter().position(|&b| b != b' ').unwrap_or(rest.len());
        let trimmed = &rest[start..];
        if trimmed.is_empty() {
            rest = trimmed;
            break;
        }
        match trimmed.iter().position(|&b| b == b' ') {
            Some(end) => {
                words.push(&trimmed[..end]);
                rest = &trimmed[end + 1..];
            }
            None => {
                words.push(trimmed);
                rest = &[];
                break;
            }
        }
    }

    Tokens {
        words,
        rest: (!rest.is_empty()).then_some(rest),
    }
}
