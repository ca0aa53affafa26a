use serde::{Deserialize, Serialize};

/// A named container for records. Server-assigned identity.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Group {
    pub id: i64,
    pub owner_user_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

impl Group {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("(unnamed)")
    }
}

/// A single stored credential.
///
/// `title`, `username` and `secret` hold Base64 ciphertext on the wire and
/// plaintext once the record has passed through the cache's decrypt step.
/// `link` and `note` are never encrypted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Record {
    pub id: i64,
    pub group_id: i64,
    pub owner_user_id: i64,
    pub title: String,
    pub username: String,
    pub secret: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

/// Plaintext user input for creating or editing a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordDraft {
    pub group_id: i64,
    pub title: String,
    pub username: String,
    pub secret: String,
    pub link: Option<String>,
    pub note: Option<String>,
}
