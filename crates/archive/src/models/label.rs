//! Label model representing a Gmail label

use serde::{Deserialize, Serialize};

/// Unique identifier for a label (Gmail label ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub String);

impl LabelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub const INBOX: &'static str = "INBOX";
    pub const SENT: &'static str = "SENT";
    pub const UNREAD: &'static str = "UNREAD";
}

impl From<String> for LabelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for LabelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelType {
    System,
    User,
}

impl LabelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelType::System => "system",
            LabelType::User => "user",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("user") {
            LabelType::User
        } else {
            LabelType::System
        }
    }
}

/// A mailbox label, unique per (owner, label id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub owner: String,
    pub id: LabelId,
    pub name: String,
    pub label_type: LabelType,
    pub message_list_visibility: Option<String>,
    pub label_list_visibility: Option<String>,
    pub messages_total: u32,
    pub messages_unread: u32,
    pub threads_total: u32,
    pub threads_unread: u32,
    pub background_color: Option<String>,
    pub text_color: Option<String>,
}

impl Label {
    pub fn new(owner: impl Into<String>, id: impl Into<LabelId>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            id: id.into(),
            name: name.into(),
            label_type: LabelType::User,
            message_list_visibility: None,
            label_list_visibility: None,
            messages_total: 0,
            messages_unread: 0,
            threads_total: 0,
            threads_unread: 0,
            background_color: None,
            text_color: None,
        }
    }

    /// Minimal record for a label seen on a message before the labels
    /// themselves have been synced. User labels look like `Label_123`.
    pub fn placeholder(owner: &str, id: &str) -> Self {
        let mut label = Self::new(owner, id, id);
        if !id.starts_with("Label_") {
            label.label_type = LabelType::System;
        }
        label
    }
}
