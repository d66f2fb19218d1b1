use serde::{Deserialize, Serialize};

/// Whitespace policy applied to a text channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// CRLF to LF, runs of spaces become one space
    Collapse,
    /// CRLF to LF, spaces before a newline are dropped, a final newline is
    /// appended to non-empty text
    Preserve,
}

impl Normalization {
    /// Normalize a complete text in one go
    pub fn apply(self, text: &str) -> String {
        let mut normalizer = Normalizer::new(self);
        let mut out = normalizer.push(text);
        out.push_str(&normalizer.finish());
        out
    }
}

/// Streaming normalizer.
///
/// Chunk boundaries may split a CRLF pair or a run of spaces, so the state
/// needed to decide those cases is carried between `push` calls.
#[derive(Debug, Clone)]
pub struct Normalizer {
    policy: Normalization,
    pending_cr: bool,
    held_spaces: usize,
    last: Option<char>,
}

impl Normalizer {
    pub fn new(policy: Normalization) -> Self {
        Self {
            policy,
            pending_cr: false,
            held_spaces: 0,
            last: None,
        }
    }

    pub fn policy(&self) -> Normalization {
        self.policy
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.policy);
    }

    /// Normalize a chunk, returning the text that is final so far
    pub fn push(&mut self, chunk: &str) -> String {
        let mut out = String::with_capacity(chunk.len());
        for c in chunk.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                if c == '\n' {
                    self.emit('\n', &mut out);
                    continue;
                }
                self.emit('\r', &mut out);
            }
            if c == '\r' {
                self.pending_cr = true;
                continue;
            }
            self.emit(c, &mut out);
        }
        out
    }

    /// Flush carried state at end of stream
    pub fn finish(&mut self) -> String {
        let mut out = String::new();
        if self.pending_cr {
            self.pending_cr = false;
            self.emit('\r', &mut out);
        }
        if self.policy == Normalization::Preserve {
            self.held_spaces = 0;
            if matches!(self.last, Some(c) if c != '\n') {
                self.put('\n', &mut out);
            }
        }
        out
    }

    fn emit(&mut self, c: char, out: &mut String) {
        match self.policy {
            Normalization::Collapse => {
                if c == ' ' && self.last == Some(' ') {
                    return;
                }
                self.put(c, out);
            }
            Normalization::Preserve => match c {
                ' ' => self.held_spaces += 1,
                '\n' => {
                    self.held_spaces = 0;
                    self.put('\n', out);
                }
                _ => {
                    for _ in 0..self.held_spaces {
                        self.put(' ', out);
                    }
                    self.held_spaces = 0;
                    self.put(c, out);
                }
            },
        }
    }

    fn put(&mut self, c: char, out: &mut String) {
        out.push(c);
        self.last = Some(c);
    }
}
