//! Record layouts for the four formats (legacy XML, XML, JSON, CSV).
//!
//! Rendering walks a fixed field list through a [`Layout`] into a
//! [`RecordOut`]. The same walk drives both the sizing pass ([`Measure`])
//! and the writing pass ([`BoundedWriter`]), so the measured size and the
//! written size can never disagree.

use crate::charset;
use crate::config::FormatType;
use crate::escape::{self, EscapeRule, CSV_RULES, JSON_RULES, XML_RULES};
use crate::record_id::{RecordId, Timestamp};
use encoding_rs::Encoding;
use std::fmt::{self, Write as _};

const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<AUDIT>\n";
const XML_FOOTER: &str = "</AUDIT>\n";

impl FormatType {
    /// Text written once at the top of a log file.
    pub fn header(&self) -> &'static str {
        match self {
            Self::Old | Self::New => XML_HEADER,
            Self::Json | Self::Csv => "",
        }
    }

    /// Text written once at the end of a log file.
    pub fn footer(&self) -> &'static str {
        match self {
            Self::Old | Self::New => XML_FOOTER,
            Self::Json | Self::Csv => "",
        }
    }

    pub fn escape_rules(&self) -> &'static [EscapeRule] {
        match self {
            Self::Old | Self::New => XML_RULES,
            Self::Json => JSON_RULES,
            Self::Csv => CSV_RULES,
        }
    }

    pub(crate) fn layout(&self) -> &'static dyn Layout {
        match self {
            Self::Old => &OldXmlLayout,
            Self::New => &NewXmlLayout,
            Self::Json => &JsonLayout,
            Self::Csv => &CsvLayout,
        }
    }
}

/// Destination of a rendering pass.
pub(crate) trait RecordOut {
    /// Append bytes verbatim.
    fn raw(&mut self, bytes: &[u8]);
    /// Append bytes through the format's escape rules.
    fn escaped(&mut self, input: &[u8]);
}

struct TextOut<'o>(&'o mut dyn RecordOut);

impl fmt::Write for TextOut<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.raw(s.as_bytes());
        Ok(())
    }
}

/// A field value.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Value<'a> {
    /// Variable-length UTF-8 data, escaped
    Escaped(&'a [u8]),
    /// Text in a foreign charset, transcoded then escaped
    Transcoded {
        text: &'a [u8],
        charset: &'static Encoding,
    },
    /// Fixed text, written as is
    Verbatim(&'a str),
    Id(RecordId),
    Time(Timestamp),
    /// Unsigned number rendered inside quotes
    Unsigned(u64),
    /// Signed number rendered without quotes in JSON and CSV
    Bare(i64),
}

impl Value<'_> {
    fn is_bare(&self) -> bool {
        matches!(self, Self::Bare(_))
    }

    /// Write the value content. Returns the number of charset conversion
    /// errors.
    fn write(&self, out: &mut dyn RecordOut) -> usize {
        match *self {
            Self::Escaped(bytes) => out.escaped(bytes),
            Self::Transcoded { text, charset: encoding } => {
                return charset::transcode_chunks(encoding, text, |chunk| out.escaped(chunk));
            }
            Self::Verbatim(text) => out.raw(text.as_bytes()),
            Self::Id(id) => {
                let _ = write!(TextOut(out), "{}", id);
            }
            Self::Time(ts) => {
                let _ = write!(TextOut(out), "{}", ts);
            }
            Self::Unsigned(n) => {
                let _ = write!(TextOut(out), "{}", n);
            }
            Self::Bare(n) => {
                let _ = write!(TextOut(out), "{}", n);
            }
        }
        0
    }
}

/// One named field of a record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Field<'a> {
    /// XML attribute / element name
    pub name: &'static str,
    /// JSON key
    pub key: &'static str,
    pub value: Value<'a>,
}

impl<'a> Field<'a> {
    pub const fn new(name: &'static str, key: &'static str, value: Value<'a>) -> Self {
        Self { name, key, value }
    }
}

/// The per-format record template.
pub(crate) trait Layout: Send + Sync {
    fn begin(&self, out: &mut dyn RecordOut);
    /// Write one field; returns charset conversion errors.
    fn field(&self, out: &mut dyn RecordOut, index: usize, field: &Field<'_>) -> usize;
    fn end(&self, out: &mut dyn RecordOut);
}

/// `<AUDIT_RECORD NAME="..." ... />`
struct OldXmlLayout;

impl Layout for OldXmlLayout {
    fn begin(&self, out: &mut dyn RecordOut) {
        out.raw(b"<AUDIT_RECORD\n");
    }

    fn field(&self, out: &mut dyn RecordOut, _index: usize, field: &Field<'_>) -> usize {
        out.raw(b"  ");
        out.raw(field.name.as_bytes());
        out.raw(b"=\"");
        let errors = field.value.write(out);
        out.raw(b"\"\n");
        errors
    }

    fn end(&self, out: &mut dyn RecordOut) {
        out.raw(b"/>\n");
    }
}

/// `<AUDIT_RECORD><NAME>...</NAME>...</AUDIT_RECORD>`
struct NewXmlLayout;

impl Layout for NewXmlLayout {
    fn begin(&self, out: &mut dyn RecordOut) {
        out.raw(b"<AUDIT_RECORD>\n");
    }

    fn field(&self, out: &mut dyn RecordOut, _index: usize, field: &Field<'_>) -> usize {
        out.raw(b"  <");
        out.raw(field.name.as_bytes());
        out.raw(b">");
        let errors = field.value.write(out);
        out.raw(b"</");
        out.raw(field.name.as_bytes());
        out.raw(b">\n");
        errors
    }

    fn end(&self, out: &mut dyn RecordOut) {
        out.raw(b"</AUDIT_RECORD>\n");
    }
}

/// `{"audit_record":{"name":"...",...}}`
struct JsonLayout;

impl Layout for JsonLayout {
    fn begin(&self, out: &mut dyn RecordOut) {
        out.raw(b"{\"audit_record\":{");
    }

    fn field(&self, out: &mut dyn RecordOut, index: usize, field: &Field<'_>) -> usize {
        if index > 0 {
            out.raw(b",");
        }
        out.raw(b"\"");
        out.raw(field.key.as_bytes());
        out.raw(b"\":");
        write_quoted(out, &field.value)
    }

    fn end(&self, out: &mut dyn RecordOut) {
        out.raw(b"}}\n");
    }
}

/// `"...","...",0,...`
struct CsvLayout;

impl Layout for CsvLayout {
    fn begin(&self, _out: &mut dyn RecordOut) {}

    fn field(&self, out: &mut dyn RecordOut, index: usize, field: &Field<'_>) -> usize {
        if index > 0 {
            out.raw(b",");
        }
        write_quoted(out, &field.value)
    }

    fn end(&self, out: &mut dyn RecordOut) {
        out.raw(b"\n");
    }
}

fn write_quoted(out: &mut dyn RecordOut, value: &Value<'_>) -> usize {
    if value.is_bare() {
        return value.write(out);
    }
    out.raw(b"\"");
    let errors = value.write(out);
    out.raw(b"\"");
    errors
}

/// Render `fields` through `layout`. Returns charset conversion errors.
pub(crate) fn render(layout: &dyn Layout, out: &mut dyn RecordOut, fields: &[Field<'_>]) -> usize {
    layout.begin(out);
    let errors = fields
        .iter()
        .enumerate()
        .map(|(index, field)| layout.field(out, index, field))
        .sum();
    layout.end(out);
    errors
}

/// Sizing pass: counts bytes without writing.
pub(crate) struct Measure {
    rules: &'static [EscapeRule],
    len: usize,
}

impl Measure {
    pub fn new(rules: &'static [EscapeRule]) -> Self {
        Self { rules, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl RecordOut for Measure {
    fn raw(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }

    fn escaped(&mut self, input: &[u8]) {
        self.len += escape::escaped_len(self.rules, input);
    }
}

/// Writing pass into a fixed slice. Flags overflow instead of writing
/// past the end.
pub(crate) struct BoundedWriter<'b> {
    rules: &'static [EscapeRule],
    buf: &'b mut [u8],
    pos: usize,
    overflow: bool,
}

impl<'b> BoundedWriter<'b> {
    pub fn new(rules: &'static [EscapeRule], buf: &'b mut [u8]) -> Self {
        Self {
            rules,
            buf,
            pos: 0,
            overflow: false,
        }
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn overflowed(&self) -> bool {
        self.overflow
    }
}

impl RecordOut for BoundedWriter<'_> {
    fn raw(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        if self.overflow || end > self.buf.len() {
            self.overflow = true;
            return;
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }

    fn escaped(&mut self, input: &[u8]) {
        if self.overflow {
            return;
        }
        let step = escape::escape(self.rules, input, &mut self.buf[self.pos..]);
        self.pos += step.written;
        if !step.is_complete(input.len()) {
            self.overflow = true;
        }
    }
}
