//! Minimal MIME header extraction feeding `batch::envelope_hash`.
//!
//! Not a full MIME parser — the fields below are exactly the ones the
//! envelope hash is defined over, parsed field-by-field the same
//! deliberate way the binary block formats in this crate are parsed,
//! just applied to a textual header block instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The seven header fields plus a canonicalized date that together
/// determine an email's envelope hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeFields {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub date_iso8601: String,
    pub subject: String,
    pub cc: String,
    pub in_reply_to: String,
    pub first_reference: String,
}

/// A parsed message: its envelope fields plus the raw bytes it was
/// parsed from (the raw byte length feeds the envelope hash directly).
#[derive(Debug, Clone)]
pub struct Message {
    pub fields: EnvelopeFields,
    pub raw: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum EmailParseError {
    #[error("message is missing a required header: {0}")]
    MissingHeader(&'static str),
}

/// Parse RFC 5322-ish headers out of a raw message. Only the headers this
/// crate's envelope hash is defined over are extracted; everything else
/// (body, other headers, MIME structure) is left in `raw` untouched.
pub fn parse_message(raw: &[u8]) -> Result<Message, EmailParseError> {
    let text = String::from_utf8_lossy(raw);
    let header_block = text.split("\r\n\r\n").next().unwrap_or(&text);
    let header_block = header_block.split("\n\n").next().unwrap_or(header_block);

    let headers = unfold_headers(header_block);

    let message_id = header(&headers, "message-id").unwrap_or_default();
    let from = header(&headers, "from").unwrap_or_default();
    let to = header(&headers, "to").unwrap_or_default();
    let subject = header(&headers, "subject").unwrap_or_default();
    let cc = header(&headers, "cc").unwrap_or_default();
    let in_reply_to = header(&headers, "in-reply-to").unwrap_or_default();
    let references = header(&headers, "references").unwrap_or_default();
    let first_reference = references
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string();

    if message_id.is_empty() {
        return Err(EmailParseError::MissingHeader("Message-Id"));
    }

    let date_raw = header(&headers, "date").unwrap_or_default();
    let date_iso8601 = canonicalize_date(&date_raw);

    Ok(Message {
        fields: EnvelopeFields {
            message_id,
            from,
            to,
            date_iso8601,
            subject,
            cc,
            in_reply_to,
            first_reference,
        },
        raw: raw.to_vec(),
    })
}

/// Joins RFC 5322 folded header continuation lines (leading whitespace)
/// back onto the previous line, then splits into `(lowercased name,
/// value)` pairs.
fn unfold_headers(block: &str) -> Vec<(String, String)> {
    let mut lines: Vec<String> = Vec::new();
    for raw_line in block.lines() {
        if (raw_line.starts_with(' ') || raw_line.starts_with('\t')) && !lines.is_empty() {
            let last = lines.last_mut().unwrap();
            last.push(' ');
            last.push_str(raw_line.trim_start());
        } else {
            lines.push(raw_line.to_string());
        }
    }

    lines
        .into_iter()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_lowercase(), value.trim().to_string()))
        })
        .collect()
}

fn header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

/// Parses an RFC 2822 date header into RFC 3339/ISO 8601 (UTC). Falls
/// back to the raw trimmed string if it cannot be parsed, so that an
/// unparseable date still participates in (and does not crash) the
/// envelope hash.
fn canonicalize_date(raw: &str) -> String {
    DateTime::parse_from_rfc2822(raw.trim())
        .map(|dt| dt.with_timezone(&Utc).to_rfc3339())
        .unwrap_or_else(|_| raw.trim().to_string())
}
