//! Contact model from the Google People API

use serde::{Deserialize, Serialize};

/// A contact, unique per (owner, resource name)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub owner: String,
    /// People API resource name, e.g. `people/c123`
    pub resource_name: String,
    pub first_name: String,
    pub last_name: String,
    pub company: String,
    pub title: String,
    pub email: String,
    pub phone: String,
}

impl Contact {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}
