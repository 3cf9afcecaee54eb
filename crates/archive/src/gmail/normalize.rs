//! Gmail API response normalization
//!
//! Converts wire DTOs into owner-scoped domain records. Message payloads
//! are mirrored verbatim into [`RawMessage`]; decoding happens later.

use super::api::{GmailLabel, GmailMessage, MessagePart, Person};
use crate::error::RemoteError;
use crate::models::{
    Contact, Label, LabelType, MessageId, RawBody, RawHeader, RawMessage, RawPart, ThreadId,
};

/// Mirror a Gmail message into a [`RawMessage`]
///
/// Fails with [`RemoteError::Fatal`] when the message has no payload or its
/// numeric fields do not parse.
pub fn normalize_message(owner: &str, message: &GmailMessage) -> Result<RawMessage, RemoteError> {
    let internal_date: i64 = message.internal_date.parse().map_err(|_| {
        RemoteError::Fatal(format!(
            "message {} has invalid internalDate {:?}",
            message.id, message.internal_date
        ))
    })?;

    let history_id: u64 = message.history_id.parse().map_err(|_| {
        RemoteError::Fatal(format!(
            "message {} has invalid historyId {:?}",
            message.id, message.history_id
        ))
    })?;

    let payload = message
        .payload
        .as_ref()
        .ok_or_else(|| RemoteError::Fatal(format!("message {} has no payload", message.id)))?;

    Ok(RawMessage {
        owner: owner.to_string(),
        id: MessageId::new(&message.id),
        thread_id: ThreadId::new(&message.thread_id),
        history_id,
        internal_date,
        label_ids: message.label_ids.clone(),
        snippet: message.snippet.clone(),
        size_estimate: message.size_estimate,
        payload: convert_part(payload),
    })
}

fn convert_part(part: &MessagePart) -> RawPart {
    RawPart {
        part_id: part.part_id.clone(),
        mime_type: part.mime_type.clone(),
        filename: part.filename.clone(),
        headers: part
            .headers
            .iter()
            .map(|h| RawHeader {
                name: h.name.clone(),
                value: h.value.clone(),
            })
            .collect(),
        body: RawBody {
            attachment_id: part.body.attachment_id.clone(),
            size: part.body.size,
            data: part.body.data.clone(),
        },
        parts: part.parts.iter().map(convert_part).collect(),
    }
}

pub fn normalize_label(owner: &str, label: GmailLabel) -> Label {
    let mut normalized = Label::placeholder(owner, &label.id);
    if !label.name.is_empty() {
        normalized.name = label.name;
    }
    if let Some(label_type) = label.label_type {
        normalized.label_type = LabelType::parse(&label_type.to_lowercase());
    }
    normalized.message_list_visibility = label.message_list_visibility;
    normalized.label_list_visibility = label.label_list_visibility;
    normalized.messages_total = label.messages_total.unwrap_or_default();
    normalized.messages_unread = label.messages_unread.unwrap_or_default();
    normalized.threads_total = label.threads_total.unwrap_or_default();
    normalized.threads_unread = label.threads_unread.unwrap_or_default();
    if let Some(color) = label.color {
        normalized.background_color = color.background_color;
        normalized.text_color = color.text_color;
    }
    normalized
}

/// Flatten a People API person into a contact, using the first entry of each field
pub fn normalize_contact(owner: &str, person: Person) -> Contact {
    let name = person.names.into_iter().next().unwrap_or_default();
    let org = person.organizations.into_iter().next().unwrap_or_default();
    let email = person
        .email_addresses
        .into_iter()
        .find_map(|e| e.value)
        .unwrap_or_default();
    let phone = person
        .phone_numbers
        .into_iter()
        .next()
        .and_then(|p| p.canonical_form.or(p.value))
        .unwrap_or_default();

    Contact {
        owner: owner.to_string(),
        resource_name: person.resource_name,
        first_name: name.given_name.unwrap_or_default(),
        last_name: name.family_name.unwrap_or_default(),
        company: org.name.unwrap_or_default(),
        title: org.title.unwrap_or_default(),
        email,
        phone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::api::{Header, LabelColor, PartBody, PersonName, PersonPhone};

    fn wire_message() -> GmailMessage {
        GmailMessage {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            label_ids: vec!["INBOX".to_string()],
            snippet: "hello".to_string(),
            history_id: "1234".to_string(),
            internal_date: "1704459849000".to_string(),
            size_estimate: 900,
            payload: Some(MessagePart {
                mime_type: "multipart/alternative".to_string(),
                headers: vec![Header {
                    name: "Subject".to_string(),
                    value: "Hi".to_string(),
                }],
                parts: vec![MessagePart {
                    part_id: "0".to_string(),
                    mime_type: "text/plain".to_string(),
                    body: PartBody {
                        attachment_id: None,
                        size: 5,
                        data: Some("aGVsbG8".to_string()),
                    },
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_normalize_message() {
        let raw = normalize_message("me@example.com", &wire_message()).unwrap();
        assert_eq!(raw.id.as_str(), "m1");
        assert_eq!(raw.history_id, 1234);
        assert_eq!(raw.internal_date, 1_704_459_849_000);
        assert_eq!(raw.payload.headers[0].name, "Subject");
        assert_eq!(raw.payload.parts[0].body.data.as_deref(), Some("aGVsbG8"));
    }

    #[test]
    fn test_malformed_message_is_fatal() {
        let mut message = wire_message();
        message.internal_date = "yesterday".to_string();
        assert!(matches!(
            normalize_message("me@example.com", &message),
            Err(RemoteError::Fatal(_))
        ));

        let mut message = wire_message();
        message.payload = None;
        assert!(matches!(
            normalize_message("me@example.com", &message),
            Err(RemoteError::Fatal(_))
        ));
    }

    #[test]
    fn test_normalize_label() {
        let label = normalize_label(
            "me@example.com",
            GmailLabel {
                id: "Label_7".to_string(),
                name: "Receipts".to_string(),
                label_type: Some("user".to_string()),
                messages_total: Some(3),
                color: Some(LabelColor {
                    background_color: Some("#000000".to_string()),
                    text_color: Some("#ffffff".to_string()),
                }),
                ..Default::default()
            },
        );
        assert_eq!(label.name, "Receipts");
        assert_eq!(label.label_type, LabelType::User);
        assert_eq!(label.messages_total, 3);
        assert_eq!(label.text_color.as_deref(), Some("#ffffff"));
    }

    #[test]
    fn test_normalize_contact() {
        let contact = normalize_contact(
            "me@example.com",
            Person {
                resource_name: "people/c1".to_string(),
                names: vec![PersonName {
                    given_name: Some("Ada".to_string()),
                    family_name: Some("Lovelace".to_string()),
                }],
                phone_numbers: vec![PersonPhone {
                    value: Some("(555) 555-0100".to_string()),
                    canonical_form: Some("+15555550100".to_string()),
                }],
                ..Default::default()
            },
        );
        assert_eq!(contact.first_name, "Ada");
        assert_eq!(contact.phone, "+15555550100");
        assert_eq!(contact.email, "");
        assert_eq!(contact.display_name(), "Ada Lovelace");
    }
}
