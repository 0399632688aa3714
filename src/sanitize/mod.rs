//! Field extraction from raw RFC 822 messages for tabular export.
use std::collections::BTreeSet;

use chrono::DateTime;
use html2text::from_read;
use mailparse::{dateparse, DispositionType, MailHeaderMap, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{ArchiveError, ArchiveResult};

/// Longest text a spreadsheet cell accepts.
pub const CELL_CHAR_LIMIT: usize = 32_767;

static ZERO_WIDTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\u{200B}-\u{200D}\u{FEFF}]").unwrap());
static HORIZONTAL_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\x0B\x0C]+").unwrap());
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"http[s]?://(?:[a-zA-Z]|[0-9]|[$-_@.&+]|[!*\\(\\),]|(?:%[0-9a-fA-F][0-9a-fA-F]))+")
        .unwrap()
});

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageFields {
    pub sender: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub date: String,
    pub body: String,
    pub has_attachments: bool,
    pub attachment_count: usize,
    /// Distinct URLs found in the plain and HTML bodies, sorted.
    pub links: Vec<String>,
}

pub fn extract_fields(raw: &[u8]) -> ArchiveResult<MessageFields> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| ArchiveError::Export(format!("parsing MIME: {}", e)))?;

    let header = |name: &str| parsed.headers.get_first_value(name).unwrap_or_default();
    let attachment_count = count_attachments(&parsed);

    Ok(MessageFields {
        sender: header("From"),
        to: header("To"),
        cc: header("Cc"),
        subject: header("Subject"),
        date: format_date(&header("Date")),
        body: clean_body_text(&extract_text(&parsed)),
        has_attachments: attachment_count > 0,
        attachment_count,
        links: message_links(&parsed),
    })
}

/// Distinct `http(s)://` URLs in `text`, sorted.
pub fn extract_links(text: &str) -> Vec<String> {
    URL.find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn message_links(parsed: &ParsedMail) -> Vec<String> {
    let mut links = BTreeSet::new();
    for mimetype in ["text/plain", "text/html"] {
        if let Some(part) = find_part(parsed, mimetype) {
            links.extend(extract_links(&part.get_body().unwrap_or_default()));
        }
    }
    links.into_iter().collect()
}

/// Normalizes newlines, strips zero-width and non-breaking spaces, collapses
/// horizontal whitespace, and squeezes runs of blank lines to one.
pub fn clean_body_text(text: &str) -> String {
    let s = text.replace("\r\n", "\n").replace('\r', "\n");
    let s = s.replace('\u{00A0}', " ");
    let s = ZERO_WIDTH.replace_all(&s, "");
    let s = HORIZONTAL_WS.replace_all(&s, " ");
    let s = BLANK_RUNS.replace_all(&s, "\n\n");
    s.trim().to_string()
}

/// Clips `text` to fit a spreadsheet cell, marking the cut with an ellipsis.
pub fn clip_to_cell(text: &str) -> String {
    if text.chars().count() <= CELL_CHAR_LIMIT {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(CELL_CHAR_LIMIT - 7).collect();
    clipped.push('…');
    clipped
}

fn format_date(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    dateparse(raw)
        .ok()
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| raw.to_string())
}

fn count_attachments(parsed: &ParsedMail) -> usize {
    let own = (parsed.get_content_disposition().disposition == DispositionType::Attachment) as usize;
    own + parsed.subparts.iter().map(count_attachments).sum::<usize>()
}

fn extract_text(parsed: &ParsedMail) -> String {
    if let Some(part) = find_part(parsed, "text/plain") {
        return part.get_body().unwrap_or_default();
    }
    if let Some(part) = find_part(parsed, "text/html") {
        let html = part.get_body().unwrap_or_default();
        return html_to_text(html.as_bytes());
    }
    String::new()
}

fn find_part<'a>(parsed: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if parsed.subparts.is_empty() {
        let inline = parsed.get_content_disposition().disposition != DispositionType::Attachment;
        return (inline && parsed.ctype.mimetype.eq_ignore_ascii_case(mimetype)).then_some(parsed);
    }
    parsed
        .subparts
        .iter()
        .find_map(|part| find_part(part, mimetype))
}

fn html_to_text(html: &[u8]) -> String {
    from_read(html, 80).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleans_whitespace_like_a_human_would_read_it() {
        let raw = "Hello\u{00A0}there\r\n\r\n\r\n\r\nSecond\u{200B}  \t line  ";
        assert_eq!(clean_body_text(raw), "Hello there\n\nSecond line");
    }

    #[test]
    fn clips_long_cells() {
        let long = "x".repeat(CELL_CHAR_LIMIT + 10);
        let clipped = clip_to_cell(&long);
        assert!(clipped.chars().count() <= CELL_CHAR_LIMIT);
        assert!(clipped.ends_with('…'));
        assert_eq!(clip_to_cell("short"), "short");
    }

    #[test]
    fn prefers_plain_text_and_counts_attachments() {
        let raw = concat!(
            "From: Alice <alice@example.com>\r\n",
            "Subject: Report\r\n",
            "Date: Tue, 1 Jul 2025 10:20:30 +0000\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Numbers attached.\r\n",
            "--b\r\n",
            "Content-Type: application/pdf; name=\"q2.pdf\"\r\n",
            "Content-Disposition: attachment; filename=\"q2.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "SGVsbG8=\r\n",
            "--b--\r\n",
        );
        let fields = extract_fields(raw.as_bytes()).unwrap();
        assert_eq!(fields.sender, "Alice <alice@example.com>");
        assert_eq!(fields.subject, "Report");
        assert_eq!(fields.date, "2025-07-01 10:20:30");
        assert_eq!(fields.body, "Numbers attached.");
        assert!(fields.has_attachments);
        assert_eq!(fields.attachment_count, 1);
    }

    #[test]
    fn falls_back_to_rendered_html() {
        let raw = concat!(
            "Subject: =?UTF-8?Q?Caf=C3=A9?=\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<p>Hi <b>there</b></p>\r\n",
        );
        let fields = extract_fields(raw.as_bytes()).unwrap();
        assert_eq!(fields.subject, "Café");
        assert!(fields.body.contains("Hi"));
        assert!(fields.body.contains("there"));
        assert!(!fields.body.contains("<p>"));
        assert!(!fields.has_attachments);
    }

    #[test]
    fn links_are_distinct_and_sorted() {
        let text = "See https://a.example/x or http://b.example/y\nhttps://a.example/x";
        assert_eq!(
            extract_links(text),
            vec!["http://b.example/y", "https://a.example/x"]
        );
        assert!(extract_links("no urls, just ftp://c.example").is_empty());
    }

    #[test]
    fn links_come_from_both_bodies() {
        let raw = concat!(
            "Subject: Shared folder\r\n",
            "Content-Type: multipart/alternative; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Get it at https://drive.example/f/1 today\r\n",
            "--b\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<a href=\"https://drive.example/f/1\">folder</a> <a href=\"http://mirror.example/f\">mirror</a>\r\n",
            "--b--\r\n",
        );
        let fields = extract_fields(raw.as_bytes()).unwrap();
        assert_eq!(
            fields.links,
            vec!["http://mirror.example/f", "https://drive.example/f/1"]
        );
    }
}
