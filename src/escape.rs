//! Format-specific character escaping under a fixed output budget.
//!
//! The escaper is resumable: when the output slice runs out it reports how
//! much input it consumed so the caller can continue with the remainder
//! into another chunk.

/// A single-character substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscapeRule {
    pub character: u8,
    pub replacement: &'static [u8],
}

const fn rule(character: u8, replacement: &'static [u8]) -> EscapeRule {
    EscapeRule {
        character,
        replacement,
    }
}

/// Rules shared by both XML layouts.
pub const XML_RULES: &[EscapeRule] = &[
    rule(b'<', b"&lt;"),
    rule(b'>', b"&gt;"),
    rule(b'&', b"&amp;"),
    rule(b'\r', b"&#13;"),
    rule(b'\n', b"&#10;"),
    rule(b'"', b"&quot;"),
];

pub const JSON_RULES: &[EscapeRule] = &[
    rule(b'\\', b"\\\\"),
    rule(b'"', b"\\\""),
    rule(b'\r', b"\\r"),
    rule(b'\n', b"\\n"),
];

pub const CSV_RULES: &[EscapeRule] = &[rule(b'"', b"\"\"")];

/// Size of the scratch chunk used by [`escaped_len`].
pub const ESTIMATE_CHUNK: usize = 128;

/// Result of one [`escape`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Escaped {
    /// Bytes written to the output slice.
    pub written: usize,
    /// Input bytes fully represented in the output.
    pub consumed: usize,
}

impl Escaped {
    /// Whether the whole input of length `input_len` was consumed.
    pub fn is_complete(&self, input_len: usize) -> bool {
        self.consumed == input_len
    }
}

fn find_rule(rules: &[EscapeRule], byte: u8) -> Option<&EscapeRule> {
    rules.iter().find(|r| r.character == byte)
}

/// Escape as much of `input` as fits in `out`.
///
/// Stops before a substitution that would overflow, so `consumed` may be
/// less than `input.len()`. Never writes past `out.len()`.
pub fn escape(rules: &[EscapeRule], input: &[u8], out: &mut [u8]) -> Escaped {
    let mut written = 0;
    let mut consumed = 0;

    for &byte in input {
        match find_rule(rules, byte) {
            Some(rule) => {
                let end = written + rule.replacement.len();
                if end > out.len() {
                    break;
                }
                out[written..end].copy_from_slice(rule.replacement);
                written = end;
            }
            None => {
                if written == out.len() {
                    break;
                }
                out[written] = byte;
                written += 1;
            }
        }
        consumed += 1;
    }

    Escaped { written, consumed }
}

/// Total escaped length of `input`, computed in fixed-size chunks.
pub fn escaped_len(rules: &[EscapeRule], input: &[u8]) -> usize {
    let mut scratch = [0u8; ESTIMATE_CHUNK];
    let mut rest = input;
    let mut total = 0;

    while !rest.is_empty() {
        let step = escape(rules, rest, &mut scratch);
        total += step.written;
        rest = &rest[step.consumed..];
    }

    total
}

/// Reverse the substitutions made by [`escape`].
///
/// Every special character is always replaced, so a replacement sequence in
/// the escaped text can only have come from a substitution.
pub fn unescape(rules: &[EscapeRule], input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut rest = input;

    'outer: while let Some(&first) = rest.first() {
        for rule in rules {
            if rest.starts_with(rule.replacement) {
                out.push(rule.character);
                rest = &rest[rule.replacement.len()..];
                continue 'outer;
            }
        }
        out.push(first);
        rest = &rest[1..];
    }

    out
}
