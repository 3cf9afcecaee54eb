//! MIME part tree decoding
//!
//! Turns a [`RawMessage`] into a [`Message`]: text and HTML bodies are
//! concatenated from every matching part in depth-first order, and parts
//! carrying an attachment id become [`AttachmentRef`]s. Decoding never
//! fails a message; bad data leaves a placeholder and a recorded error.

use std::collections::BTreeMap;

use base64::prelude::*;

use crate::models::{AttachmentRef, DateParts, EmailAddress, Message, RawMessage, RawPart};

/// Decode Gmail body data
///
/// Accepts URL-safe and standard alphabets, with or without padding, and
/// ignores embedded whitespace.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let normalized: String = data
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    BASE64_URL_SAFE_NO_PAD.decode(normalized)
}

#[derive(Default)]
struct Bodies {
    text: String,
    html: String,
    attachments: Vec<AttachmentRef>,
    errors: Vec<String>,
}

pub struct MessageDecoder;

impl MessageDecoder {
    pub fn decode(raw: &RawMessage) -> Message {
        let mut bodies = Bodies::default();
        walk(&raw.payload, &mut bodies);

        let mut headers = BTreeMap::new();
        for header in &raw.payload.headers {
            headers
                .entry(header.name.clone())
                .or_insert_with(|| header.value.clone());
        }
        let header = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .unwrap_or_default()
        };

        let subject = header("Subject").to_string();
        let from = addresses(header("From"));
        let to = addresses(header("To"));
        let cc = addresses(header("Cc"));
        let bcc = addresses(header("Bcc"));

        Message {
            owner: raw.owner.clone(),
            id: raw.id.clone(),
            thread_id: raw.thread_id.clone(),
            history_id: raw.history_id,
            snippet: raw.snippet.clone(),
            subject,
            from,
            to,
            cc,
            bcc,
            body_text: bodies.text,
            body_html: bodies.html,
            label_ids: raw.label_ids.clone(),
            attachments: bodies.attachments,
            internal_date: raw.internal_date,
            date_parts: DateParts::from_millis(raw.internal_date),
            decode_errors: bodies.errors,
            headers,
        }
    }
}

/// Lower-cased email addresses from an address header
fn addresses(value: &str) -> Vec<String> {
    EmailAddress::parse_list(value)
        .into_iter()
        .map(|a| a.email.to_lowercase())
        .collect()
}

fn walk(part: &RawPart, out: &mut Bodies) {
    let mime = part.mime_type.to_ascii_lowercase();
    let data = part.body.data.as_deref().filter(|d| !d.is_empty());

    match (mime.as_str(), data) {
        ("text/plain", Some(data)) => append(&mut out.text, &mut out.errors, part, data),
        ("text/html", Some(data)) => append(&mut out.html, &mut out.errors, part, data),
        _ => {
            if let Some(attachment_id) = part.body.attachment_id.as_deref().filter(|id| !id.is_empty()) {
                out.attachments.push(AttachmentRef {
                    attachment_id: attachment_id.to_string(),
                    part_id: part.part_id.clone(),
                    filename: part.filename.clone(),
                    mime_type: part.mime_type.clone(),
                    size: part.body.size,
                    headers: part
                        .headers
                        .iter()
                        .map(|h| (h.name.clone(), h.value.clone()))
                        .collect(),
                });
            }
        }
    }

    for child in &part.parts {
        walk(child, out);
    }
}

fn append(body: &mut String, errors: &mut Vec<String>, part: &RawPart, data: &str) {
    match decode_base64(data) {
        Ok(bytes) => body.push_str(&String::from_utf8_lossy(&bytes)),
        Err(e) => {
            log::debug!("Undecodable part {} ({}): {}", part.part_id, part.mime_type, e);
            body.push_str(&format!("[undecodable part {}: {}]", part.part_id, e));
            errors.push(format!("part {}: {}", part.part_id, e));
        }
    }
}
