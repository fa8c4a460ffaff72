//! Statement charset handling.
//!
//! Records are always UTF-8. Statement text arrives in the client's
//! character set and is transcoded in fixed-size chunks so rendering never
//! needs a buffer proportional to the query.

use encoding_rs::{DecoderResult, Encoding, UTF_8};

/// Output chunk for streamed transcoding. Must hold at least one encoded
/// character.
pub const TRANSCODE_CHUNK: usize = 512;

/// Byte written in place of an unconvertible sequence.
pub const REPLACEMENT: &[u8] = b"?";

/// Resolve a server charset name to an encoding.
///
/// Server names come first; anything else falls back to WHATWG labels.
pub fn charset_for_name(name: &str) -> Option<&'static Encoding> {
    let name = name.trim().to_ascii_lowercase();
    let encoding = match name.as_str() {
        "utf8" | "utf8mb3" | "utf8mb4" | "ascii" => UTF_8,
        // binary widens each byte to one character, as latin1 does
        "latin1" | "binary" => encoding_rs::WINDOWS_1252,
        "latin2" => encoding_rs::ISO_8859_2,
        "cp1250" => encoding_rs::WINDOWS_1250,
        "cp1251" => encoding_rs::WINDOWS_1251,
        "cp1256" => encoding_rs::WINDOWS_1256,
        "cp1257" => encoding_rs::WINDOWS_1257,
        "greek" => encoding_rs::ISO_8859_7,
        "hebrew" => encoding_rs::ISO_8859_8,
        "koi8r" => encoding_rs::KOI8_R,
        "koi8u" => encoding_rs::KOI8_U,
        "sjis" | "cp932" => encoding_rs::SHIFT_JIS,
        "ujis" | "eucjpms" => encoding_rs::EUC_JP,
        "euckr" => encoding_rs::EUC_KR,
        "gbk" | "gb2312" => encoding_rs::GBK,
        "gb18030" => encoding_rs::GB18030,
        "big5" => encoding_rs::BIG5,
        other => return Encoding::for_label(other.as_bytes()),
    };
    Some(encoding)
}

/// Whether `text` in `encoding` can be copied into a record without
/// transcoding. Malformed UTF-8 still goes through the decoder so bad
/// sequences are replaced and counted.
pub fn is_passthrough(encoding: &'static Encoding, text: &[u8]) -> bool {
    encoding == UTF_8 && std::str::from_utf8(text).is_ok()
}

/// Transcode `input` to UTF-8, handing each converted chunk to `sink`.
///
/// Unconvertible sequences are replaced with [`REPLACEMENT`]. Returns the
/// number of replacements made.
pub fn transcode_chunks<F>(encoding: &'static Encoding, input: &[u8], mut sink: F) -> usize
where
    F: FnMut(&[u8]),
{
    let mut decoder = encoding.new_decoder_without_bom_handling();
    let mut chunk = [0u8; TRANSCODE_CHUNK];
    let mut rest = input;
    let mut errors = 0;

    loop {
        let (result, read, written) =
            decoder.decode_to_utf8_without_replacement(rest, &mut chunk, true);
        if written > 0 {
            sink(&chunk[..written]);
        }
        rest = &rest[read..];

        match result {
            DecoderResult::InputEmpty => break,
            DecoderResult::OutputFull => {}
            DecoderResult::Malformed(_, _) => {
                errors += 1;
                sink(REPLACEMENT);
            }
        }
    }

    errors
}

/// Decode a short identifier (a database name) into an owned string.
pub fn decode_identifier(encoding: &'static Encoding, input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    transcode_chunks(encoding, input, |chunk| out.extend_from_slice(chunk));
    // transcode_chunks only ever emits UTF-8
    String::from_utf8_lossy(&out).into_owned()
}

/// Cut `text` to at most `max` bytes without splitting a character.
pub fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
