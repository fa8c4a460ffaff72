//! Record builders with render-or-report-size negotiation.
//!
//! Every builder sizes the record first. If the caller's buffer is too
//! small it returns [`RequiredSize`] and writes nothing; the caller grows a
//! buffer to that size and calls again. No record id is consumed by a
//! failed attempt.

use crate::charset;
use crate::config::FormatType;
use crate::event::{ConnectionEvent, GeneralEvent};
use crate::format::{render, BoundedWriter, Field, Measure, Value};
use crate::record_id::{RecordId, RecordIdGenerator, Timestamp};
use std::sync::Arc;

/// Longest STARTUP_OPTIONS value; longer command lines are cut.
pub const MAX_STARTUP_OPTIONS_LEN: usize = 511;

/// A record was rendered into the front of the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Written {
    pub len: usize,
    /// Statement characters that could not be converted to UTF-8
    pub conversion_errors: usize,
}

/// The buffer was too small; a buffer of this many bytes will succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredSize(pub usize);

pub type Rendered = Result<Written, RequiredSize>;

/// Builds lifecycle, statement and connection records in one format.
#[derive(Debug)]
pub struct RecordBuilder {
    format: FormatType,
    ids: Arc<RecordIdGenerator>,
    server_version: String,
    startup_options: String,
    os_version: String,
}

impl RecordBuilder {
    /// Create a builder reporting the current process's arguments as
    /// startup options.
    pub fn new(
        format: FormatType,
        ids: Arc<RecordIdGenerator>,
        server_version: impl Into<String>,
    ) -> Self {
        Self {
            format,
            ids,
            server_version: server_version.into(),
            startup_options: String::new(),
            os_version: format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
        }
        .with_startup_options(std::env::args().skip(1))
    }

    /// Replace the startup options with `args` joined by single spaces.
    pub fn with_startup_options<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = args
            .into_iter()
            .map(|a| a.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        charset::truncate_on_char_boundary(&mut joined, MAX_STARTUP_OPTIONS_LEN);
        self.startup_options = joined;
        self
    }

    pub fn format(&self) -> FormatType {
        self.format
    }

    pub fn ids(&self) -> &RecordIdGenerator {
        &self.ids
    }

    pub fn startup_options(&self) -> &str {
        &self.startup_options
    }

    /// Size `build`'s fields, then render them if they fit.
    fn emit<'a, const N: usize>(
        &self,
        buf: &mut [u8],
        build: impl Fn(RecordId) -> [Field<'a>; N],
    ) -> Rendered {
        let rules = self.format.escape_rules();
        let layout = self.format.layout();

        let mut measure = Measure::new(rules);
        render(layout, &mut measure, &build(self.ids.widest()));
        let required = measure.len();
        if required > buf.len() {
            return Err(RequiredSize(required));
        }

        let mut writer = BoundedWriter::new(rules, buf);
        let conversion_errors = render(layout, &mut writer, &build(self.ids.next_record_id()));
        if writer.overflowed() {
            return Err(RequiredSize(required));
        }

        Ok(Written {
            len: writer.len(),
            conversion_errors,
        })
    }

    /// Lifecycle record: `Audit` on startup, `NoAudit` on shutdown.
    pub fn audit_record(&self, buf: &mut [u8], name: &str, time: Timestamp) -> Rendered {
        self.emit(buf, |id| {
            [
                Field::new("NAME", "name", Value::Verbatim(name)),
                Field::new("RECORD", "record", Value::Id(id)),
                Field::new("TIMESTAMP", "timestamp", Value::Time(time)),
                Field::new(
                    "MYSQL_VERSION",
                    "mysql_version",
                    Value::Escaped(self.server_version.as_bytes()),
                ),
                Field::new(
                    "STARTUP_OPTIONS",
                    "startup_options",
                    Value::Escaped(self.startup_options.as_bytes()),
                ),
                Field::new("OS_VERSION", "os_version", Value::Verbatim(&self.os_version)),
            ]
        })
    }

    /// Statement record. `db` is the session's current database.
    pub fn general_record(&self, buf: &mut [u8], event: &GeneralEvent<'_>, db: &str) -> Rendered {
        let sqltext = if charset::is_passthrough(event.charset, event.query) {
            Value::Escaped(event.query)
        } else {
            Value::Transcoded {
                text: event.query,
                charset: event.charset,
            }
        };

        self.emit(buf, |id| {
            [
                Field::new("NAME", "name", Value::Verbatim(event.command)),
                Field::new("RECORD", "record", Value::Id(id)),
                Field::new("TIMESTAMP", "timestamp", Value::Time(event.time)),
                Field::new("COMMAND_CLASS", "command_class", Value::Verbatim(event.sql_command)),
                Field::new("CONNECTION_ID", "connection_id", Value::Unsigned(event.thread_id)),
                Field::new("STATUS", "status", Value::Bare(event.error_code.into())),
                Field::new("SQLTEXT", "sqltext", sqltext),
                Field::new("USER", "user", Value::Escaped(event.user.as_bytes())),
                Field::new("HOST", "host", Value::Escaped(event.host.as_bytes())),
                Field::new("OS_USER", "os_user", Value::Escaped(event.external_user.as_bytes())),
                Field::new("IP", "ip", Value::Escaped(event.ip.as_bytes())),
                Field::new("DB", "db", Value::Escaped(db.as_bytes())),
            ]
        })
    }

    /// Connection record named `name` (`Connect`, `Quit`, `Change user`).
    pub fn connection_record(
        &self,
        buf: &mut [u8],
        name: &str,
        event: &ConnectionEvent<'_>,
        time: Timestamp,
    ) -> Rendered {
        self.emit(buf, |id| {
            [
                Field::new("NAME", "name", Value::Verbatim(name)),
                Field::new("RECORD", "record", Value::Id(id)),
                Field::new("TIMESTAMP", "timestamp", Value::Time(time)),
                Field::new("CONNECTION_ID", "connection_id", Value::Unsigned(event.thread_id)),
                Field::new("STATUS", "status", Value::Bare(event.status.into())),
                Field::new("USER", "user", Value::Escaped(event.user.as_bytes())),
                Field::new("PRIV_USER", "priv_user", Value::Escaped(event.priv_user.as_bytes())),
                Field::new("OS_LOGIN", "os_login", Value::Escaped(event.external_user.as_bytes())),
                Field::new("PROXY_USER", "proxy_user", Value::Escaped(event.proxy_user.as_bytes())),
                Field::new("HOST", "host", Value::Escaped(event.host.as_bytes())),
                Field::new("IP", "ip", Value::Escaped(event.ip.as_bytes())),
                Field::new("DB", "db", Value::Escaped(event.database.as_bytes())),
            ]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape;
    use crate::event::{ConnectionSubclass, GeneralSubclass};
    use chrono::{TimeZone, Utc};

    fn builder(format: FormatType) -> RecordBuilder {
        let epoch = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        RecordBuilder::new(format, Arc::new(RecordIdGenerator::new(0, epoch)), "5.7.10")
            .with_startup_options(["--port=3306", "--datadir=/var/lib/mysql"])
    }

    fn time() -> Timestamp {
        Timestamp(Utc.with_ymd_and_hms(2016, 2, 3, 4, 5, 6).unwrap())
    }

    fn query_event(query: &str) -> GeneralEvent<'_> {
        GeneralEvent {
            subclass: GeneralSubclass::Status,
            error_code: 0,
            thread_id: 42,
            time: time(),
            user: "root[root] @ localhost []",
            command: "Query",
            query: query.as_bytes(),
            charset: encoding_rs::UTF_8,
            sql_command: "select",
            host: "localhost",
            external_user: "",
            ip: "127.0.0.1",
        }
    }

    fn connect_event() -> ConnectionEvent<'static> {
        ConnectionEvent {
            subclass: ConnectionSubclass::Connect,
            status: 0,
            thread_id: 7,
            user: "alice",
            priv_user: "alice",
            external_user: "",
            proxy_user: "",
            host: "db<1>",
            ip: "10.0.0.1",
            database: "sales",
        }
    }

    fn render_general(format: FormatType, query: &str) -> String {
        let mut buf = vec![0u8; 8192];
        let written = builder(format)
            .general_record(&mut buf, &query_event(query), "test")
            .unwrap();
        String::from_utf8(buf[..written.len].to_vec()).unwrap()
    }

    #[test]
    fn test_general_record_old() {
        let record = render_general(FormatType::Old, "select 1");
        assert_eq!(
            record,
            "<AUDIT_RECORD\n  NAME=\"Query\"\n  RECORD=\"1_2016-01-01T00:00:00\"\n  \
             TIMESTAMP=\"2016-02-03T04:05:06 UTC\"\n  COMMAND_CLASS=\"select\"\n  \
             CONNECTION_ID=\"42\"\n  STATUS=\"0\"\n  SQLTEXT=\"select 1\"\n  \
             USER=\"root[root] @ localhost []\"\n  HOST=\"localhost\"\n  OS_USER=\"\"\n  \
             IP=\"127.0.0.1\"\n  DB=\"test\"\n/>\n"
        );
    }

    #[test]
    fn test_general_record_json() {
        let record = render_general(FormatType::Json, "select \"a\"");
        assert_eq!(
            record,
            "{\"audit_record\":{\"name\":\"Query\",\"record\":\"1_2016-01-01T00:00:00\",\
             \"timestamp\":\"2016-02-03T04:05:06 UTC\",\"command_class\":\"select\",\
             \"connection_id\":\"42\",\"status\":0,\"sqltext\":\"select \\\"a\\\"\",\
             \"user\":\"root[root] @ localhost []\",\"host\":\"localhost\",\"os_user\":\"\",\
             \"ip\":\"127.0.0.1\",\"db\":\"test\"}}\n"
        );
        let parsed: serde_json::Value = serde_json::from_str(&record).unwrap();
        assert_eq!(parsed["audit_record"]["sqltext"], "select \"a\"");
        assert_eq!(parsed["audit_record"]["status"], 0);
    }

    #[test]
    fn test_general_record_csv() {
        let record = render_general(FormatType::Csv, "select 'x'");
        assert_eq!(
            record,
            "\"Query\",\"1_2016-01-01T00:00:00\",\"2016-02-03T04:05:06 UTC\",\"select\",\
             \"42\",0,\"select 'x'\",\"root[root] @ localhost []\",\"localhost\",\"\",\
             \"127.0.0.1\",\"test\"\n"
        );
    }

    #[test]
    fn test_general_record_new_xml() {
        let record = render_general(FormatType::New, "select a<b");
        assert!(record.starts_with("<AUDIT_RECORD>\n  <NAME>Query</NAME>\n"));
        assert!(record.contains("  <SQLTEXT>select a&lt;b</SQLTEXT>\n"));
        assert!(record.ends_with("</AUDIT_RECORD>\n"));
    }

    #[test]
    fn test_small_buffer_reports_size_and_writes_nothing() {
        let query = "x".repeat(5000);
        let builder = builder(FormatType::Old);
        let mut small = [0u8; 16];

        let required = match builder.general_record(&mut small, &query_event(&query), "") {
            Err(RequiredSize(n)) => n,
            Ok(_) => panic!("record cannot fit 16 bytes"),
        };
        assert!(required >= 5000);
        assert_eq!(small, [0u8; 16]);

        let mut big = vec![0u8; required];
        let written = builder
            .general_record(&mut big, &query_event(&query), "")
            .unwrap();
        assert!(written.len <= required);
        let record = String::from_utf8(big[..written.len].to_vec()).unwrap();
        assert!(record.contains(&format!("SQLTEXT=\"{}\"", query)));
        // the failed attempt did not consume an id
        assert!(record.contains("RECORD=\"1_"));
    }

    #[test]
    fn test_required_size_accounts_for_escaping() {
        let query = "<".repeat(1000);
        let builder = builder(FormatType::Old);
        let Err(RequiredSize(required)) =
            builder.general_record(&mut [0u8; 64], &query_event(&query), "")
        else {
            panic!("expected RequiredSize");
        };
        assert!(required >= 4000);

        let mut buf = vec![0u8; required];
        let written = builder
            .general_record(&mut buf, &query_event(&query), "")
            .unwrap();
        let escaped = "&lt;".repeat(1000);
        let record = String::from_utf8(buf[..written.len].to_vec()).unwrap();
        assert!(record.contains(&format!("SQLTEXT=\"{}\"", escaped)));
    }

    #[test]
    fn test_latin1_query_transcoded() {
        let builder = builder(FormatType::Csv);
        let raw = b"select '\xe9\xe9'";
        let mut event = query_event("");
        event.query = &raw[..];
        event.charset = encoding_rs::WINDOWS_1252;

        let mut buf = [0u8; 512];
        let written = builder.general_record(&mut buf, &event, "").unwrap();
        let record = std::str::from_utf8(&buf[..written.len]).unwrap();
        assert!(record.contains("\"select 'éé'\""));
        assert_eq!(written.conversion_errors, 0);
    }

    #[test]
    fn test_malformed_utf8_query_replaced() {
        let builder = builder(FormatType::Json);
        let raw = b"SELECT '\xe9\xff'";
        let mut event = query_event("");
        event.query = &raw[..];

        let mut buf = [0u8; 1024];
        let written = builder.general_record(&mut buf, &event, "").unwrap();
        assert_eq!(written.conversion_errors, 2);
        let parsed: serde_json::Value = serde_json::from_slice(&buf[..written.len]).unwrap();
        assert_eq!(parsed["audit_record"]["sqltext"], "SELECT '??'");
    }

    #[test]
    fn test_binary_query_widened() {
        let builder = builder(FormatType::Json);
        let raw = b"SELECT '\xe9\xff'";
        let mut event = query_event("");
        event.query = &raw[..];
        event.charset = charset::charset_for_name("binary").unwrap();

        let mut buf = [0u8; 1024];
        let written = builder.general_record(&mut buf, &event, "").unwrap();
        assert_eq!(written.conversion_errors, 0);
        let parsed: serde_json::Value = serde_json::from_slice(&buf[..written.len]).unwrap();
        assert_eq!(parsed["audit_record"]["sqltext"], "SELECT 'éÿ'");
    }

    #[test]
    fn test_multibyte_expansion_in_required_size() {
        let builder = builder(FormatType::Json);
        let raw = vec![0xe9u8; 3000];
        let mut event = query_event("");
        event.query = &raw[..];
        event.charset = encoding_rs::WINDOWS_1252;

        let Err(RequiredSize(required)) = builder.general_record(&mut [0u8; 16], &event, "") else {
            panic!("expected RequiredSize");
        };
        // each latin1 byte becomes two UTF-8 bytes
        assert!(required >= 6000);
        let mut buf = vec![0u8; required];
        assert!(builder.general_record(&mut buf, &event, "").is_ok());
    }

    #[test]
    fn test_exact_fit_succeeds() {
        let builder = builder(FormatType::Json);
        let event = query_event("select 1");
        let Err(RequiredSize(required)) = builder.general_record(&mut [0u8; 0], &event, "") else {
            panic!("expected RequiredSize");
        };
        let mut buf = vec![0u8; required];
        let written = builder.general_record(&mut buf, &event, "").unwrap();
        assert!(written.len <= required);
    }

    #[test]
    fn test_connection_record_escapes_fields() {
        let builder = builder(FormatType::Old);
        let mut buf = [0u8; 1024];
        let written = builder
            .connection_record(&mut buf, "Connect", &connect_event(), time())
            .unwrap();
        let record = std::str::from_utf8(&buf[..written.len]).unwrap();
        assert!(record.contains("  NAME=\"Connect\"\n"));
        assert!(record.contains("  CONNECTION_ID=\"7\"\n"));
        assert!(record.contains("  HOST=\"db&lt;1&gt;\"\n"));
        assert!(record.contains("  DB=\"sales\"\n"));
    }

    #[test]
    fn test_connection_record_json_parses() {
        let builder = builder(FormatType::Json);
        let mut buf = [0u8; 1024];
        let written = builder
            .connection_record(&mut buf, "Quit", &connect_event(), time())
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf[..written.len]).unwrap();
        assert_eq!(parsed["audit_record"]["name"], "Quit");
        assert_eq!(parsed["audit_record"]["priv_user"], "alice");
        assert_eq!(parsed["audit_record"]["host"], "db<1>");
    }

    #[test]
    fn test_audit_record() {
        let builder = builder(FormatType::New);
        let mut buf = [0u8; 1024];
        let written = builder.audit_record(&mut buf, "Audit", time()).unwrap();
        let record = std::str::from_utf8(&buf[..written.len]).unwrap();
        assert!(record.contains("  <NAME>Audit</NAME>\n"));
        assert!(record.contains("  <MYSQL_VERSION>5.7.10</MYSQL_VERSION>\n"));
        assert!(record.contains(
            "  <STARTUP_OPTIONS>--port=3306 --datadir=/var/lib/mysql</STARTUP_OPTIONS>\n"
        ));
    }

    #[test]
    fn test_startup_options_truncated() {
        let long = vec!["a".repeat(300), "b".repeat(300)];
        let builder = builder(FormatType::Csv).with_startup_options(long);
        assert_eq!(builder.startup_options().len(), MAX_STARTUP_OPTIONS_LEN);
        assert!(builder.startup_options().starts_with(&"a".repeat(300)));
    }

    #[test]
    fn test_ids_increase_across_records() {
        let builder = builder(FormatType::Csv);
        let mut buf = [0u8; 1024];
        for expected in 1..=3 {
            let written = builder.audit_record(&mut buf, "Audit", time()).unwrap();
            let record = std::str::from_utf8(&buf[..written.len]).unwrap();
            assert!(record.contains(&format!("\"{}_2016-01-01T00:00:00\"", expected)));
        }
    }

    #[test]
    fn test_sqltext_matches_escaped_query_every_format() {
        let query = "a<b & \"c\"\r\n\\d";
        for format in [FormatType::Old, FormatType::New, FormatType::Json, FormatType::Csv] {
            let rules = format.escape_rules();
            let mut escaped = vec![0u8; escape::escaped_len(rules, query.as_bytes())];
            escape::escape(rules, query.as_bytes(), &mut escaped);
            let escaped = String::from_utf8(escaped).unwrap();
            assert!(render_general(format, query).contains(&escaped));
        }
    }
}
