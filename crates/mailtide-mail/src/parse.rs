use crate::{MailError, RawMessage, ID_HEADER};
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{addrparse_header, parse_mail, MailAddr, MailHeaderMap, ParsedMail};
use mailtide_core::NormalizedMessage;

const UNKNOWN_SENDER: &str = "Unknown";
const NO_SUBJECT: &str = "(No Subject)";
const NO_CONTENT: &str = "(No Content)";

/// Builds the normalized envelope of one fetched message.
///
/// Only a missing identifier header is fatal; every other field falls back to a
/// placeholder so that a sloppy server does not cost the user a message.
pub fn parse_message(raw: &RawMessage) -> Result<NormalizedMessage, MailError> {
    let parsed = parse_mail(&raw.bytes)?;

    let id = parsed
        .headers
        .get_first_value(ID_HEADER)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| MailError::Parse(format!("missing {ID_HEADER} header")))?;

    let (sender_name, sender_address) = sender(&parsed);

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|subject| subject.trim().to_string())
        .filter(|subject| !subject.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());

    let body = extract_text_body(&parsed)
        .or_else(|| extract_html_body(&parsed).map(|html| html_to_text(&html)))
        .map(|body| body.trim().to_string())
        .filter(|body| !body.is_empty())
        .unwrap_or_else(|| NO_CONTENT.to_string());

    let received_at = parsed_message_date(&parsed)
        .or(raw.internal_date)
        .unwrap_or_else(Utc::now);

    Ok(NormalizedMessage {
        id,
        sender_name,
        sender_address,
        subject,
        body,
        received_at,
        is_read: raw.seen,
    })
}

fn sender(parsed: &ParsedMail<'_>) -> (String, String) {
    let Some(header) = parsed.headers.get_first_header("From") else {
        return (UNKNOWN_SENDER.to_string(), String::new());
    };

    let first = addrparse_header(header).ok().and_then(|list| {
        list.iter().find_map(|addr| match addr {
            MailAddr::Single(info) => Some(info.clone()),
            MailAddr::Group(group) => group.addrs.first().cloned(),
        })
    });

    match first {
        Some(info) => {
            let name = info
                .display_name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| info.addr.clone());
            (name, info.addr)
        }
        None => {
            let raw = header.get_value();
            let raw = raw.trim();
            if raw.is_empty() {
                (UNKNOWN_SENDER.to_string(), String::new())
            } else {
                (raw.to_string(), String::new())
            }
        }
    }
}

fn extract_text_body(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        let content_type = mail.ctype.mimetype.to_ascii_lowercase();
        if content_type == "text/plain" || content_type == "text/markdown" {
            return mail.get_body().ok();
        }
        return None;
    }

    for part in &mail.subparts {
        if let Some(text) = extract_text_body(part) {
            return Some(text);
        }
    }

    None
}

fn extract_html_body(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        let content_type = mail.ctype.mimetype.to_ascii_lowercase();
        if content_type == "text/html" {
            return mail.get_body().ok();
        }
        return None;
    }

    for part in &mail.subparts {
        if let Some(html) = extract_html_body(part) {
            return Some(html);
        }
    }

    None
}

fn html_to_text(html: &str) -> String {
    let mut builder = ammonia::Builder::empty();
    builder.clean_content_tags(["script", "style", "head"].into_iter().collect());
    let stripped = builder.clean(html).to_string();

    unescape_entities(&stripped)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescape_entities(value: &str) -> String {
    value
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn parsed_message_date(parsed: &ParsedMail<'_>) -> Option<DateTime<Utc>> {
    let raw = parsed.headers.get_first_value("Date")?;
    if let Ok(date) = DateTime::parse_from_rfc2822(raw.trim()) {
        return Some(date.with_timezone(&Utc));
    }

    // dateparse answers 0 for text it cannot read at all
    let timestamp = mailparse::dateparse(&raw).ok().filter(|timestamp| *timestamp > 0)?;
    Utc.timestamp_opt(timestamp, 0).single()
}
