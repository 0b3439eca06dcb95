//! Capability surface of the remote notes service.
//!
//! The pipeline, the re-filer and the token check only talk to the service
//! through [`NoteStore`]. [`edam::EdamClient`] is the production
//! implementation; tests use the in-memory store from `testing`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub mod edam;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub guid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notebook {
    pub guid: String,
    pub name: String,
    pub stack: Option<String>,
}

/// Binary payload attached to a note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    /// MD5 of `bytes`. A content fingerprint, not a credential.
    pub content_hash: [u8; 16],
    pub mime_type: String,
    pub original_filename: String,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn hash_hex(&self) -> String {
        format!("{:x}", md5::Digest(self.content_hash))
    }
}

/// Everything needed to create one note with one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteDraft {
    pub title: String,
    pub notebook_guid: String,
    pub tag_guids: Vec<String>,
    pub body_markup: String,
    pub attachment: Attachment,
}

/// Search hit as returned by [`NoteStore::search_notes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteSummary {
    pub guid: String,
    pub title: String,
    /// Milliseconds since the Unix epoch
    pub created: i64,
    pub notebook_guid: Option<String>,
    pub tag_guids: Vec<String>,
}

/// Re-filing change for an existing note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteUpdate {
    pub guid: String,
    pub title: String,
    pub notebook_guid: String,
    pub tag_guids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i32,
    pub username: Option<String>,
}

#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn list_tags(&self) -> Result<Vec<Tag>>;

    async fn create_tag(&self, name: &str) -> Result<Tag>;

    async fn list_notebooks(&self) -> Result<Vec<Notebook>>;

    async fn create_notebook(&self, name: &str, stack: Option<&str>) -> Result<Notebook>;

    /// Returns the guid of the created note.
    async fn create_note(&self, draft: &NoteDraft) -> Result<String>;

    async fn search_notes(&self, words: &str, max_results: i32) -> Result<Vec<NoteSummary>>;

    async fn update_note(&self, update: &NoteUpdate) -> Result<()>;

    async fn current_user(&self) -> Result<User>;
}

/// Produces a connected store. Called once per pipeline run so every run
/// starts from fresh remote listings.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Store: NoteStore;

    async fn connect(&self) -> Result<Self::Store>;
}
