//! Minimal statement tokenization.
//!
//! Only enough to pull the database name out of a `USE` statement. This is
//! not a SQL parser.

/// Split the next word off `input`.
///
/// Leading whitespace and comments are skipped. A word is a run of
/// identifier bytes or a backtick-quoted token (quotes included). Returns
/// the word and the remaining input; the word is empty when nothing is
/// left or the next byte starts neither form.
pub fn next_word(input: &[u8]) -> (&[u8], &[u8]) {
    let rest = skip_ignorable(input);

    let ident = rest.iter().take_while(|&&b| is_ident_byte(b)).count();
    if ident > 0 {
        return rest.split_at(ident);
    }

    if rest.first() == Some(&b'`') {
        let end = match rest[1..].iter().position(|&b| b == b'`') {
            Some(close) => close + 2,
            None => rest.len(),
        };
        return rest.split_at(end);
    }

    (&rest[..0], rest)
}

/// Database named by a `USE` statement, without backticks.
///
/// The first word only has to be a case-insensitive prefix of `use`, so an
/// empty first word matches too and the name may come back empty. The
/// caller has already established that the server classified the statement
/// as a database change.
pub fn use_database(query: &[u8]) -> Option<&[u8]> {
    let (keyword, rest) = next_word(query);
    if keyword.len() > 3 || !b"use"[..keyword.len()].eq_ignore_ascii_case(keyword) {
        return None;
    }

    let (name, _) = next_word(rest);
    Some(strip_backticks(name))
}

fn strip_backticks(word: &[u8]) -> &[u8] {
    match word {
        [b'`', inner @ .., b'`'] => inner,
        [b'`', inner @ ..] => inner,
        other => other,
    }
}

/// Identifier bytes: ASCII alphanumerics, `_`, `$` and any non-ASCII byte.
pub fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn skip_ignorable(mut input: &[u8]) -> &[u8] {
    loop {
        match input {
            [b, rest @ ..] if b.is_ascii_whitespace() => input = rest,
            // version comment opener: the body is ordinary statement text
            [b'/', b'*', b'!', rest @ ..] => {
                let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
                input = &rest[digits..];
            }
            [b'/', b'*', rest @ ..] => {
                input = match rest.windows(2).position(|w| w == b"*/") {
                    Some(end) => &rest[end + 2..],
                    None => &rest[rest.len()..],
                };
            }
            [b'-', b'-', b, ..] if b.is_ascii_whitespace() => input = skip_line(input),
            [b'#', ..] => input = skip_line(input),
            _ => return input,
        }
    }
}

fn skip_line(input: &[u8]) -> &[u8] {
    match input.iter().position(|&b| b == b'\n') {
        Some(end) => &input[end + 1..],
        None => &input[input.len()..],
    }
}
