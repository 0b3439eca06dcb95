//! Turns a collected file plus its policy into a [`NoteDraft`].

use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::settings::ImportPolicy;
use crate::store::{Attachment, NoteDraft, NoteStore, Notebook, Tag};

const NOTE_PREAMBLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?><!DOCTYPE en-note SYSTEM "http://xml.evernote.com/pub/enml2.dtd">"#;

const FALLBACK_MIME: &str = "application/octet-stream";

/// Name → guid lookups for one run, keyed by lower-cased name.
///
/// Seeded from the remote listings and extended after every creation, so a
/// name is created at most once per run no matter how many policies ask for it.
#[derive(Debug, Clone, Default)]
pub struct ResolutionCache {
    tags: HashMap<String, String>,
    notebooks: HashMap<String, String>,
}

impl ResolutionCache {
    pub fn new(tags: &[Tag], notebooks: &[Notebook]) -> Self {
        Self {
            tags: tags
                .iter()
                .map(|t| (t.name.to_lowercase(), t.guid.clone()))
                .collect(),
            notebooks: notebooks
                .iter()
                .map(|n| (n.name.to_lowercase(), n.guid.clone()))
                .collect(),
        }
    }

    pub fn tag_guid(&self, name: &str) -> Option<&str> {
        self.tags.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn notebook_guid(&self, name: &str) -> Option<&str> {
        self.notebooks.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Tag guids for `names`, in order. Unknown names are created when
    /// `create_if_missing` is set and dropped otherwise.
    pub async fn resolve_tags<S: NoteStore + ?Sized>(
        &mut self,
        store: &S,
        names: &[String],
        create_if_missing: bool,
    ) -> Result<Vec<String>> {
        let mut guids = Vec::with_capacity(names.len());
        for name in names {
            if let Some(guid) = self.tag_guid(name) {
                guids.push(guid.to_string());
                continue;
            }
            if !create_if_missing {
                debug!(tag = %name, "tag unknown, skipped");
                continue;
            }
            info!(tag = %name, "create tag");
            let tag = store.create_tag(name).await?;
            self.tags.insert(name.to_lowercase(), tag.guid.clone());
            guids.push(tag.guid);
        }
        Ok(guids)
    }

    /// Notebook guid for the policy, creating the notebook (with its stack) if needed.
    pub async fn resolve_notebook<S: NoteStore + ?Sized>(
        &mut self,
        store: &S,
        policy: &ImportPolicy,
        create_if_missing: bool,
    ) -> Result<Option<String>> {
        let name = &policy.target_notebook;
        if let Some(guid) = self.notebook_guid(name) {
            return Ok(Some(guid.to_string()));
        }
        if !create_if_missing {
            return Ok(None);
        }
        info!(notebook = %name, stack = ?policy.stack, "create notebook");
        let notebook = store.create_notebook(name, policy.stack.as_deref()).await?;
        self.notebooks.insert(name.to_lowercase(), notebook.guid.clone());
        Ok(Some(notebook.guid))
    }

    /// Resolve everything a policy needs, creating what is missing.
    pub async fn resolve_policy<S: NoteStore + ?Sized>(
        &mut self,
        store: &S,
        key: &str,
        policy: &ImportPolicy,
    ) -> Result<ResolvedPolicy> {
        let tag_guids = self.resolve_tags(store, &policy.tags, true).await?;
        let notebook_guid = self
            .resolve_notebook(store, policy, true)
            .await?
            .ok_or_else(|| Error::RemoteStore(format!("notebook '{}' unresolved", policy.target_notebook)))?;
        Ok(ResolvedPolicy {
            subdirectory_key: key.to_string(),
            notebook_name: policy.target_notebook.clone(),
            notebook_guid,
            tag_guids,
        })
    }
}

/// An [`ImportPolicy`] with remote identifiers filled in. The configuration it
/// came from is left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub subdirectory_key: String,
    pub notebook_name: String,
    pub notebook_guid: String,
    pub tag_guids: Vec<String>,
}

/// Read `file_path` and assemble the note that carries it.
pub fn build_note(policy: &ResolvedPolicy, file_path: &Path) -> Result<NoteDraft> {
    let bytes = std::fs::read(file_path).map_err(|source| Error::FileRead {
        path: file_path.to_path_buf(),
        source,
    })?;

    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string());

    let attachment = Attachment {
        content_hash: md5::compute(&bytes).0,
        mime_type: guess_mime(&file_name, &bytes),
        original_filename: file_name.clone(),
        created_at: Utc::now(),
        bytes,
    };

    Ok(NoteDraft {
        title: file_name,
        notebook_guid: policy.notebook_guid.clone(),
        tag_guids: policy.tag_guids.clone(),
        body_markup: note_body(&attachment),
        attachment,
    })
}

/// Minimal ENML document referencing the attachment by hash.
pub fn note_body(attachment: &Attachment) -> String {
    format!(
        r#"{}<en-note><br/><en-media type="{}" hash="{}"/></en-note>"#,
        NOTE_PREAMBLE,
        attachment.mime_type,
        attachment.hash_hex()
    )
}

/// Mime type from the file name, then from magic bytes, then octet-stream.
pub fn guess_mime(file_name: &str, bytes: &[u8]) -> String {
    if let Some(mime) = mime_guess::from_path(file_name).first_raw() {
        return mime.to_string();
    }
    if let Some(kind) = infer::get(bytes) {
        return kind.mime_type().to_string();
    }
    FALLBACK_MIME.to_string()
}
