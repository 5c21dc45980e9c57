//! Email parsing and normalization.
//!
//! Parses raw RFC 5322 bytes into a structured email suitable for storage and
//! attachment extraction. Uses the `mailparse` crate for MIME parsing, header
//! decoding (RFC 2047), transfer-encoding and charset handling, plus custom
//! logic for the cases `mailparse` does not cover:
//!
//! - **Synthetic Message-IDs**: messages without a `Message-ID` get a stable
//!   substitute derived from the content hash.
//! - **Date fallbacks**: a fixed chain of parsers (`mailparse::dateparse`,
//!   `dateparser`, a list of known-bad producer formats) before giving up and
//!   using the file mtime or the current time.
//! - **Calendar parts**: `text/calendar` parts are summarized into a readable
//!   `[Calendar Event]` block appended to the body text.
//! - **Embedded messages**: `message/rfc822` parts contribute their body text
//!   to the outer body and are also captured as attachments so the extractor
//!   can ingest them recursively.
//!
//! Parsing is total for anything `mailparse` accepts: individual part decode
//! failures and unparseable dates become warnings on the result, not errors.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail, parse_mail};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// A single address, split into display name and address proper.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EmailAddress {
    pub name: String,
    pub email: String,
}

/// An attachment lifted out of a MIME part.
#[derive(Debug, Clone)]
pub struct EmailAttachment {
    /// Decoded filename, empty when the part declared none.
    pub filename: String,
    pub mime_type: String,
    /// Size of the decoded content in bytes.
    pub size: i64,
    /// Content-ID with angle brackets stripped.
    pub content_id: Option<String>,
    pub is_inline: bool,
    /// Index in parse order across the whole message.
    pub position: i32,
    /// Decoded bytes, absent when only metadata was requested.
    pub content: Option<Vec<u8>>,
    /// Set by the classifier for `.eml`/`.msg` style parts.
    pub is_embedded_email: bool,
    /// Hex sha256 of the content, present iff `content` is.
    pub content_hash: Option<String>,
}

/// Structured representation of a parsed email.
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub message_id: String,
    pub message_id_synthetic: bool,
    /// Hex sha256 of the raw input bytes.
    pub content_hash: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub reply_to: Option<EmailAddress>,
    pub subject: String,
    pub date: DateTime<Utc>,
    /// True when the date came from the fallback (mtime or now) rather than
    /// a parseable Date header.
    pub date_fallback: bool,
    pub body_text: String,
    pub body_html: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<EmailAttachment>,
    /// A fixed set of headers preserved verbatim for the ingestion metadata.
    pub headers: HashMap<String, String>,
    pub raw: Vec<u8>,
    pub file_path: String,
    /// Non-fatal issues hit during parsing (decode failures, bad dates).
    pub warnings: Vec<String>,
}

impl ParsedEmail {
    /// All participant addresses in canonical order: From, To, Cc, Bcc.
    /// Entries with an empty address are omitted.
    pub fn all_participant_emails(&self) -> Vec<String> {
        std::iter::once(&self.from)
            .chain(self.to.iter())
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .filter(|addr| !addr.email.is_empty())
            .map(|addr| addr.email.clone())
            .collect()
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Options controlling a parse.
#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// When > 0, text and html bodies are truncated to this many bytes.
    pub max_body_size: usize,
    /// When false, attachment content is dropped after hashing and only
    /// metadata is kept.
    pub include_attachment_content: bool,
    /// Date used when the Date header is missing or unparseable. Filled from
    /// the file mtime by [`parse_email_file`]; defaults to now.
    pub fallback_date: Option<DateTime<Utc>>,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            max_body_size: 0,
            include_attachment_content: true,
            fallback_date: None,
        }
    }
}

/// Errors that fail a parse outright. Anything softer becomes a warning.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse MIME structure: {0}")]
    Mime(#[from] mailparse::MailParseError),
}

/// Charsets we know `mailparse` decodes faithfully. Anything else is passed
/// through lossily with a warning, which keeps parsing deterministic.
const KNOWN_CHARSETS: &[&str] = &[
    "us-ascii",
    "ascii",
    "utf-8",
    "utf8",
    "iso-8859-1",
    "latin1",
    "iso-8859-2",
    "iso-8859-15",
    "windows-1251",
    "windows-1252",
    "cp1251",
    "cp1252",
    "koi8-r",
    "gbk",
    "gb2312",
    "gb18030",
    "big5",
    "euc-jp",
    "iso-2022-jp",
    "shift_jis",
    "shift-jis",
    "sjis",
    "euc-kr",
];

const PRESERVED_HEADERS: &[&str] = &[
    "Message-ID",
    "From",
    "To",
    "Cc",
    "Bcc",
    "Reply-To",
    "Subject",
    "Date",
    "In-Reply-To",
    "References",
    "List-Id",
    "X-Mailer",
    "User-Agent",
];

/// Parse an email from a file on disk.
///
/// The file mtime, when available, becomes the fallback date for messages
/// with a missing or unparseable Date header.
pub fn parse_email_file(path: &Path, options: &ParserOptions) -> Result<ParsedEmail, ParseError> {
    let raw = std::fs::read(path).map_err(|source| ParseError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut options = options.clone();
    if options.fallback_date.is_none() {
        options.fallback_date = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);
    }

    parse_email_bytes(&raw, &path.display().to_string(), &options)
}

/// Parse an email from raw bytes.
pub fn parse_email_bytes(
    raw: &[u8],
    file_path: &str,
    options: &ParserOptions,
) -> Result<ParsedEmail, ParseError> {
    let content_hash = sha256_hex(raw);
    let parsed = parse_mail(raw)?;

    let mut warnings = Vec::new();

    let (message_id, message_id_synthetic) =
        match normalize_header_token(parsed.headers.get_first_value("Message-ID")) {
            Some(id) => (id, false),
            None => (format!("<synthetic-{}@local>", &content_hash[..16]), true),
        };

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|s| sanitize_text(&s))
        .unwrap_or_default();

    let fallback_date = options.fallback_date.unwrap_or_else(Utc::now);
    let (date, date_fallback) = match parsed.headers.get_first_value("Date") {
        Some(raw_date) if !raw_date.trim().is_empty() => match parse_date_value(&raw_date) {
            Some(date) => (date, false),
            None => {
                warnings.push(format!("unparseable Date header `{}`", raw_date.trim()));
                (fallback_date, true)
            }
        },
        _ => (fallback_date, true),
    };

    let from = parsed
        .headers
        .get_first_value("From")
        .map(|value| parse_address_list(&value))
        .unwrap_or_default()
        .into_iter()
        .next()
        .unwrap_or_else(|| EmailAddress {
            name: String::new(),
            email: String::new(),
        });

    let to = header_addresses(&parsed, "To");
    let cc = header_addresses(&parsed, "Cc");
    let bcc = header_addresses(&parsed, "Bcc");
    let reply_to = header_addresses(&parsed, "Reply-To").into_iter().next();

    let in_reply_to = normalize_header_token(parsed.headers.get_first_value("In-Reply-To"));
    let references = parsed
        .headers
        .get_first_value("References")
        .map(|value| {
            value
                .split_whitespace()
                .map(|token| sanitize_text(token))
                .filter(|token| !token.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut headers = HashMap::new();
    for name in PRESERVED_HEADERS {
        if let Some(value) = parsed.headers.get_first_value(name) {
            let value = sanitize_text(&value);
            if !value.is_empty() {
                headers.insert(name.to_string(), value);
            }
        }
    }

    let mut walker = PartWalker {
        options,
        body_text: String::new(),
        body_html: String::new(),
        attachments: Vec::new(),
        warnings: Vec::new(),
    };
    walker.walk(&parsed);
    warnings.extend(walker.warnings);

    let mut body_text = sanitize_text(&walker.body_text);
    let mut body_html = walker.body_html.replace('\0', "");
    if options.max_body_size > 0 {
        truncate_to_boundary(&mut body_text, options.max_body_size);
        truncate_to_boundary(&mut body_html, options.max_body_size);
    }

    log::trace!("parsed: {} - {}", message_id, subject);

    Ok(ParsedEmail {
        message_id,
        message_id_synthetic,
        content_hash,
        from,
        to,
        cc,
        bcc,
        reply_to,
        subject,
        date,
        date_fallback,
        body_text,
        body_html,
        in_reply_to,
        references,
        attachments: walker.attachments,
        headers,
        raw: raw.to_vec(),
        file_path: file_path.to_string(),
        warnings,
    })
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Remove NUL bytes that PostgreSQL cannot store and trim whitespace.
fn sanitize_text(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}

/// Normalize an id-bearing header value, keeping the angle brackets. Returns
/// None for missing or empty values.
fn normalize_header_token(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let cleaned = sanitize_text(&raw);
        if cleaned.is_empty() { None } else { Some(cleaned) }
    })
}

fn header_addresses(parsed: &ParsedMail, name: &str) -> Vec<EmailAddress> {
    parsed
        .headers
        .get_first_value(name)
        .map(|value| parse_address_list(&value))
        .unwrap_or_default()
}

/// Parse an address list header. Prefers `mailparse::addrparse`; on failure
/// falls back to splitting on commas outside quotes and angle brackets.
fn parse_address_list(value: &str) -> Vec<EmailAddress> {
    if value.trim().is_empty() {
        return Vec::new();
    }

    if let Ok(addrs) = mailparse::addrparse(value) {
        let mut out = Vec::new();
        for addr in addrs.iter() {
            match addr {
                mailparse::MailAddr::Single(info) => out.push(EmailAddress {
                    name: sanitize_text(&info.display_name.clone().unwrap_or_default()),
                    email: info.addr.trim().to_string(),
                }),
                mailparse::MailAddr::Group(group) => {
                    for info in &group.addrs {
                        out.push(EmailAddress {
                            name: sanitize_text(&info.display_name.clone().unwrap_or_default()),
                            email: info.addr.trim().to_string(),
                        });
                    }
                }
            }
        }
        if !out.is_empty() {
            return out;
        }
    }

    split_addresses_fallback(value)
}

/// Manual address splitting for headers `addrparse` rejects.
fn split_addresses_fallback(value: &str) -> Vec<EmailAddress> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angles = false;

    for ch in value.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '<' if !in_quotes => {
                in_angles = true;
                current.push(ch);
            }
            '>' if !in_quotes => {
                in_angles = false;
                current.push(ch);
            }
            ',' if !in_quotes && !in_angles => {
                tokens.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    tokens.push(current);

    tokens
        .iter()
        .map(|token| token.trim())
        .filter(|token| !token.is_empty())
        .map(|token| {
            if let (Some(open), Some(close)) = (token.find('<'), token.rfind('>')) {
                if open < close {
                    let name = token[..open].trim().trim_matches('"').to_string();
                    let email = token[open + 1..close].trim().to_string();
                    return EmailAddress {
                        name: sanitize_text(&name),
                        email,
                    };
                }
            }
            EmailAddress {
                name: String::new(),
                email: token.trim_matches('"').to_string(),
            }
        })
        .filter(|addr| !addr.email.is_empty())
        .collect()
}

/// Date parsing chain: RFC 5322 via mailparse, then `dateparser`, then a fixed
/// list of formats seen from real producers.
fn parse_date_value(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = mailparse::dateparse(raw) {
        if let Some(date) = Utc.timestamp_opt(ts, 0).single() {
            return Some(date);
        }
    }

    if let Ok(date) = dateparser::parse(raw) {
        return Some(date.with_timezone(&Utc));
    }

    const ZONED_FORMATS: &[&str] = &[
        "%a, %d %b %Y %H:%M:%S %z",
        "%a, %d %b %y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S %z",
    ];
    for format in ZONED_FORMATS {
        if let Ok(date) = DateTime::parse_from_str(raw, format) {
            return Some(date.with_timezone(&Utc));
        }
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return day.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
    }

    None
}

fn charset_is_known(charset: &str) -> bool {
    let charset = charset.to_ascii_lowercase();
    charset.is_empty() || KNOWN_CHARSETS.contains(&charset.as_str())
}

/// Truncate a string to at most `max` bytes on a char boundary.
fn truncate_to_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

struct PartWalker<'a> {
    options: &'a ParserOptions,
    body_text: String,
    body_html: String,
    attachments: Vec<EmailAttachment>,
    warnings: Vec<String>,
}

impl PartWalker<'_> {
    fn walk(&mut self, part: &ParsedMail) {
        let mime = part.ctype.mimetype.to_ascii_lowercase();

        if mime == "message/rfc822" {
            self.handle_embedded_message(part);
            return;
        }

        if mime == "text/calendar" {
            self.handle_calendar(part);
            return;
        }

        if mime.starts_with("multipart/") || !part.subparts.is_empty() {
            for sub in &part.subparts {
                self.walk(sub);
            }
            return;
        }

        if is_attachment_part(part, &mime) {
            self.push_attachment(part, &mime, false);
            return;
        }

        if mime == "text/html" {
            if self.body_html.is_empty() {
                self.body_html = self.decode_text(part);
            }
            return;
        }

        if mime.starts_with("text/") || mime.is_empty() {
            if self.body_text.is_empty() {
                self.body_text = self.decode_text(part);
            }
            return;
        }

        // Undisposed non-text part without a filename. Nothing to do with it.
        self.warnings
            .push(format!("ignoring undisposed part of type {}", mime));
    }

    /// `message/rfc822`: the embedded message's text joins the outer body and
    /// the part itself is kept as an attachment for recursive ingestion.
    fn handle_embedded_message(&mut self, part: &ParsedMail) {
        match part.get_body_raw() {
            Ok(raw) => {
                if let Some(text) = embedded_body_text(&raw) {
                    append_block(&mut self.body_text, &text);
                }
            }
            Err(err) => {
                self.warnings
                    .push(format!("failed to decode message/rfc822 part: {}", err));
            }
        }
        self.push_attachment(part, "message/rfc822", true);
    }

    fn handle_calendar(&mut self, part: &ParsedMail) {
        let text = self.decode_text(part);
        if let Some(block) = summarize_calendar(&text) {
            append_block(&mut self.body_text, &block);
        } else if self.body_text.is_empty() {
            self.body_text = text;
        }
    }

    fn decode_text(&mut self, part: &ParsedMail) -> String {
        if !charset_is_known(&part.ctype.charset) {
            self.warnings.push(format!(
                "unknown charset `{}`, passing bytes through",
                part.ctype.charset
            ));
            return match part.get_body_raw() {
                Ok(raw) => String::from_utf8_lossy(&raw).into_owned(),
                Err(err) => {
                    self.warnings.push(format!("failed to decode part: {}", err));
                    String::new()
                }
            };
        }

        match part.get_body() {
            Ok(body) => body,
            Err(err) => {
                self.warnings
                    .push(format!("failed to decode text part: {}", err));
                part.get_body_raw()
                    .map(|raw| String::from_utf8_lossy(&raw).into_owned())
                    .unwrap_or_default()
            }
        }
    }

    fn push_attachment(&mut self, part: &ParsedMail, mime: &str, force_name: bool) {
        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .or_else(|| part.ctype.params.get("name").cloned())
            .map(|name| sanitize_text(&name))
            .unwrap_or_else(|| {
                if force_name {
                    "embedded-message.eml".to_string()
                } else {
                    String::new()
                }
            });

        let content = match part.get_body_raw() {
            Ok(raw) => raw,
            Err(err) => {
                self.warnings.push(format!(
                    "failed to decode attachment `{}`: {}",
                    filename, err
                ));
                return;
            }
        };

        let content_id = part
            .headers
            .get_first_value("Content-ID")
            .map(|id| id.trim().trim_matches(&['<', '>'][..]).to_string())
            .filter(|id| !id.is_empty());

        let size = content.len() as i64;
        let content_hash = Some(sha256_hex(&content));
        let position = self.attachments.len() as i32;

        self.attachments.push(EmailAttachment {
            filename,
            mime_type: mime.to_string(),
            size,
            content_id,
            is_inline: disposition.disposition == DispositionType::Inline,
            position,
            content: self.options.include_attachment_content.then_some(content),
            is_embedded_email: false,
            content_hash,
        });
    }
}

fn is_attachment_part(part: &ParsedMail, mime: &str) -> bool {
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"));

    match disposition.disposition {
        DispositionType::Attachment => true,
        DispositionType::Inline => filename.is_some(),
        _ => filename.is_some() && !mime.starts_with("text/"),
    }
}

fn append_block(body: &mut String, block: &str) {
    let block = block.trim();
    if block.is_empty() {
        return;
    }
    if !body.is_empty() {
        body.push_str("\n\n");
    }
    body.push_str(block);
}

/// First text/plain body of an embedded message, falling back to the root.
fn embedded_body_text(raw: &[u8]) -> Option<String> {
    let parsed = parse_mail(raw).ok()?;
    fn find_text(part: &ParsedMail) -> Option<String> {
        if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            return part.get_body().ok();
        }
        for sub in &part.subparts {
            if let Some(text) = find_text(sub) {
                return Some(text);
            }
        }
        None
    }
    find_text(&parsed)
        .or_else(|| parsed.get_body().ok())
        .map(|text| sanitize_text(&text))
        .filter(|text| !text.is_empty())
}

/// Summarize the VEVENT blocks of an iCalendar body into readable text.
///
/// Properties may carry `;PARAM=...` segments before the value separator, and
/// long lines may be folded with leading whitespace.
fn summarize_calendar(calendar: &str) -> Option<String> {
    // Unfold continuation lines first.
    let mut lines: Vec<String> = Vec::new();
    for raw_line in calendar.lines() {
        let folded = raw_line.starts_with(' ') || raw_line.starts_with('\t');
        match lines.last_mut() {
            Some(last) if folded => last.push_str(raw_line.trim_start()),
            _ => lines.push(raw_line.trim_end().to_string()),
        }
    }

    let mut events = Vec::new();
    let mut current: Option<CalendarEvent> = None;

    for line in &lines {
        if line.eq_ignore_ascii_case("BEGIN:VEVENT") {
            current = Some(CalendarEvent::default());
            continue;
        }
        if line.eq_ignore_ascii_case("END:VEVENT") {
            if let Some(event) = current.take() {
                events.push(event);
            }
            continue;
        }

        let Some(event) = current.as_mut() else {
            continue;
        };
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let prop = name.split(';').next().unwrap_or(name).to_ascii_uppercase();
        let value = value.trim();

        match prop.as_str() {
            "SUMMARY" => event.summary = value.to_string(),
            "DTSTART" => event.start = value.to_string(),
            "DTEND" => event.end = value.to_string(),
            "ORGANIZER" => event.organizer = strip_mailto(value),
            "ATTENDEE" => event.attendees.push(strip_mailto(value)),
            _ => {}
        }
    }

    if events.is_empty() {
        return None;
    }

    let mut out = String::new();
    for event in events {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str("[Calendar Event]");
        if !event.summary.is_empty() {
            out.push_str(&format!("\nSummary: {}", event.summary));
        }
        if !event.start.is_empty() {
            out.push_str(&format!("\nStart: {}", event.start));
        }
        if !event.end.is_empty() {
            out.push_str(&format!("\nEnd: {}", event.end));
        }
        if !event.organizer.is_empty() {
            out.push_str(&format!("\nOrganizer: {}", event.organizer));
        }
        if !event.attendees.is_empty() {
            out.push_str(&format!("\nAttendees: {}", event.attendees.join(", ")));
        }
    }
    Some(out)
}

#[derive(Default)]
struct CalendarEvent {
    summary: String,
    start: String,
    end: String,
    organizer: String,
    attendees: Vec<String>,
}

fn strip_mailto(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix("mailto:")
        .or_else(|| value.strip_prefix("MAILTO:"))
        .unwrap_or(value)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_email() -> &'static str {
        concat!(
            "Message-ID: <a@x>\r\n",
            "From: John <john@x>\r\n",
            "To: jane@x\r\n",
            "Subject: T\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "\r\n",
            "hello\r\n"
        )
    }

    #[test]
    fn content_hash_is_stable() {
        let raw = simple_email().as_bytes();
        let first = parse_email_bytes(raw, "a.eml", &ParserOptions::default()).unwrap();
        let second = parse_email_bytes(raw, "a.eml", &ParserOptions::default()).unwrap();
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.content_hash, sha256_hex(raw));
    }

    #[test]
    fn parses_simple_headers() {
        let email =
            parse_email_bytes(simple_email().as_bytes(), "a.eml", &ParserOptions::default())
                .unwrap();
        assert_eq!(email.message_id, "<a@x>");
        assert!(!email.message_id_synthetic);
        assert_eq!(email.from.name, "John");
        assert_eq!(email.from.email, "john@x");
        assert_eq!(email.to.len(), 1);
        assert_eq!(email.to[0].email, "jane@x");
        assert_eq!(email.subject, "T");
        assert!(!email.date_fallback);
        assert_eq!(email.body_text, "hello");
    }

    #[test]
    fn synthesizes_missing_message_id() {
        let raw = concat!(
            "From: a@x\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "\r\n",
            "body\r\n"
        );
        let email =
            parse_email_bytes(raw.as_bytes(), "b.eml", &ParserOptions::default()).unwrap();
        assert!(email.message_id_synthetic);
        let expected = format!("<synthetic-{}@local>", &sha256_hex(raw.as_bytes())[..16]);
        assert_eq!(email.message_id, expected);
    }

    #[test]
    fn missing_date_uses_fallback() {
        let fallback = Utc.with_ymd_and_hms(2020, 6, 1, 12, 0, 0).unwrap();
        let raw = concat!("Message-ID: <d@x>\r\nFrom: a@x\r\n", "\r\n", "body\r\n");
        let options = ParserOptions {
            fallback_date: Some(fallback),
            ..ParserOptions::default()
        };
        let email = parse_email_bytes(raw.as_bytes(), "c.eml", &options).unwrap();
        assert!(email.date_fallback);
        assert_eq!(email.date, fallback);
    }

    #[test]
    fn unparseable_date_warns_and_falls_back() {
        let raw = concat!(
            "Message-ID: <d@x>\r\nFrom: a@x\r\nDate: not-a-date\r\n",
            "\r\n",
            "body\r\n"
        );
        let email =
            parse_email_bytes(raw.as_bytes(), "c.eml", &ParserOptions::default()).unwrap();
        assert!(email.date_fallback);
        assert!(email.warnings.iter().any(|w| w.contains("Date")));
    }

    #[test]
    fn alternate_date_formats() {
        assert!(parse_date_value("Mon, 15 Jan 2024 10:30:00 -0500").is_some());
        assert!(parse_date_value("2 Jan 2006 15:04:05 -0700").is_some());
        assert!(parse_date_value("2024-01-15 10:30:00").is_some());
        assert!(parse_date_value("garbage").is_none());
    }

    #[test]
    fn participant_order_is_from_to_cc_bcc() {
        let raw = concat!(
            "Message-ID: <p@x>\r\n",
            "From: a@x\r\n",
            "To: b@x, c@x\r\n",
            "Cc: d@x\r\n",
            "Bcc: e@x\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "\r\n",
            "body\r\n"
        );
        let email =
            parse_email_bytes(raw.as_bytes(), "p.eml", &ParserOptions::default()).unwrap();
        assert_eq!(
            email.all_participant_emails(),
            vec!["a@x", "b@x", "c@x", "d@x", "e@x"]
        );
    }

    #[test]
    fn address_fallback_splits_outside_quotes_and_angles() {
        let addrs = split_addresses_fallback(r#""Smith, Jane" <jane@x>, bob@y"#);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].name, "Smith, Jane");
        assert_eq!(addrs[0].email, "jane@x");
        assert_eq!(addrs[1].email, "bob@y");
    }

    #[test]
    fn multipart_attachment_positions() {
        let raw = concat!(
            "Message-ID: <m@x>\r\n",
            "From: a@x\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "body here\r\n",
            "--b\r\n",
            "Content-Type: application/pdf; name=\"one.pdf\"\r\n",
            "Content-Disposition: attachment; filename=\"one.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "aGVsbG8=\r\n",
            "--b\r\n",
            "Content-Type: image/png\r\n",
            "Content-Disposition: attachment; filename=\"two.png\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "d29ybGQ=\r\n",
            "--b--\r\n"
        );
        let email =
            parse_email_bytes(raw.as_bytes(), "m.eml", &ParserOptions::default()).unwrap();
        assert_eq!(email.body_text, "body here");
        assert_eq!(email.attachments.len(), 2);
        assert_eq!(email.attachments[0].position, 0);
        assert_eq!(email.attachments[0].filename, "one.pdf");
        assert_eq!(email.attachments[0].content.as_deref(), Some(&b"hello"[..]));
        assert_eq!(
            email.attachments[0].content_hash.as_deref(),
            Some(sha256_hex(b"hello").as_str())
        );
        assert_eq!(email.attachments[1].position, 1);
        assert_eq!(email.attachments[1].filename, "two.png");
    }

    #[test]
    fn inline_image_with_content_id() {
        let raw = concat!(
            "Message-ID: <i@x>\r\n",
            "From: a@x\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "Content-Type: multipart/related; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>hi</p>\r\n",
            "--b\r\n",
            "Content-Type: image/png\r\n",
            "Content-ID: <sig@x>\r\n",
            "Content-Disposition: inline; filename=\"sig.png\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "aGk=\r\n",
            "--b--\r\n"
        );
        let email =
            parse_email_bytes(raw.as_bytes(), "i.eml", &ParserOptions::default()).unwrap();
        assert!(email.body_html.contains("<p>hi</p>"));
        assert_eq!(email.attachments.len(), 1);
        let att = &email.attachments[0];
        assert!(att.is_inline);
        assert_eq!(att.content_id.as_deref(), Some("sig@x"));
    }

    #[test]
    fn embedded_message_body_is_appended() {
        let inner = concat!(
            "Message-ID: <inner@x>\r\n",
            "From: b@x\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "\r\n",
            "inner body\r\n"
        );
        let raw = format!(
            concat!(
                "Message-ID: <outer@x>\r\n",
                "From: a@x\r\n",
                "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
                "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
                "\r\n",
                "--b\r\n",
                "Content-Type: text/plain\r\n",
                "\r\n",
                "outer body\r\n",
                "--b\r\n",
                "Content-Type: message/rfc822\r\n",
                "Content-Disposition: attachment; filename=\"fwd.eml\"\r\n",
                "\r\n",
                "{}",
                "--b--\r\n"
            ),
            inner
        );
        let email =
            parse_email_bytes(raw.as_bytes(), "e.eml", &ParserOptions::default()).unwrap();
        assert!(email.body_text.starts_with("outer body"));
        assert!(email.body_text.contains("\n\ninner body"));
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].mime_type, "message/rfc822");
        assert_eq!(email.attachments[0].filename, "fwd.eml");
        assert!(email.attachments[0].content.is_some());
    }

    #[test]
    fn calendar_part_becomes_readable_block() {
        let raw = concat!(
            "Message-ID: <cal@x>\r\n",
            "From: a@x\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see invite\r\n",
            "--b\r\n",
            "Content-Type: text/calendar\r\n",
            "\r\n",
            "BEGIN:VCALENDAR\r\n",
            "BEGIN:VEVENT\r\n",
            "SUMMARY:Planning\r\n",
            "DTSTART;TZID=UTC:20240115T150000Z\r\n",
            "DTEND;TZID=UTC:20240115T160000Z\r\n",
            "ORGANIZER:mailto:host@x\r\n",
            "ATTENDEE;CN=Jane:mailto:jane@x\r\n",
            "ATTENDEE:mailto:bob@x\r\n",
            "END:VEVENT\r\n",
            "END:VCALENDAR\r\n",
            "--b--\r\n"
        );
        let email =
            parse_email_bytes(raw.as_bytes(), "cal.eml", &ParserOptions::default()).unwrap();
        assert!(email.body_text.contains("[Calendar Event]"));
        assert!(email.body_text.contains("Summary: Planning"));
        assert!(email.body_text.contains("Organizer: host@x"));
        assert!(email.body_text.contains("Attendees: jane@x, bob@x"));
    }

    #[test]
    fn unknown_charset_passes_through_with_warning() {
        let raw = concat!(
            "Message-ID: <cs@x>\r\n",
            "From: a@x\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "Content-Type: text/plain; charset=x-mystery\r\n",
            "\r\n",
            "plain enough\r\n"
        );
        let email =
            parse_email_bytes(raw.as_bytes(), "cs.eml", &ParserOptions::default()).unwrap();
        assert_eq!(email.body_text, "plain enough");
        assert!(email.warnings.iter().any(|w| w.contains("x-mystery")));
    }

    #[test]
    fn max_body_size_truncates() {
        let options = ParserOptions {
            max_body_size: 5,
            ..ParserOptions::default()
        };
        let email = parse_email_bytes(simple_email().as_bytes(), "t.eml", &options).unwrap();
        assert_eq!(email.body_text, "hello");

        let options = ParserOptions {
            max_body_size: 3,
            ..ParserOptions::default()
        };
        let email = parse_email_bytes(simple_email().as_bytes(), "t.eml", &options).unwrap();
        assert_eq!(email.body_text, "hel");
    }

    #[test]
    fn quoted_printable_body_is_decoded() {
        let raw = concat!(
            "Message-ID: <qp@x>\r\n",
            "From: a@x\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "Content-Transfer-Encoding: quoted-printable\r\n",
            "\r\n",
            "caf=C3=A9\r\n"
        );
        let email =
            parse_email_bytes(raw.as_bytes(), "qp.eml", &ParserOptions::default()).unwrap();
        assert_eq!(email.body_text, "café");
    }

    #[test]
    fn rfc2047_subject_is_decoded() {
        let raw = concat!(
            "Message-ID: <enc@x>\r\n",
            "From: =?UTF-8?B?SsO2cmc=?= <j@x>\r\n",
            "Subject: =?UTF-8?Q?caf=C3=A9?=\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "\r\n",
            "body\r\n"
        );
        let email =
            parse_email_bytes(raw.as_bytes(), "enc.eml", &ParserOptions::default()).unwrap();
        assert_eq!(email.subject, "café");
        assert_eq!(email.from.name, "Jörg");
    }
}
