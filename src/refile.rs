//! Bulk re-filing of notes that already exist remotely.
//!
//! Every policy with a `search` phrase is applied to the notes matching that
//! phrase: new title, the policy's tags and its notebook.

use chrono::{TimeZone, Utc};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::note_builder::ResolutionCache;
use crate::settings::ImportConfiguration;
use crate::store::{NoteStore, NoteUpdate, StoreConnector};

/// Upper bound of notes touched per search phrase.
pub const MAX_SEARCH_RESULTS: i32 = 99;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefileSummary {
    pub found: usize,
    pub refiled: usize,
}

pub async fn run_refile<C: StoreConnector>(connector: &C, config_file: &Path) -> Result<RefileSummary> {
    let config = ImportConfiguration::load(config_file)?;

    let store = connector.connect().await?;
    let tags = store
        .list_tags()
        .await
        .map_err(|e| Error::RemoteConnect(e.to_string()))?;
    let notebooks = store
        .list_notebooks()
        .await
        .map_err(|e| Error::RemoteConnect(e.to_string()))?;

    let mut cache = ResolutionCache::new(&tags, &notebooks);
    refile_notes(&store, &config, &mut cache).await
}

pub async fn refile_notes<S: NoteStore + ?Sized>(
    store: &S,
    config: &ImportConfiguration,
    cache: &mut ResolutionCache,
) -> Result<RefileSummary> {
    let mut summary = RefileSummary::default();

    for (key, policy) in &config.policies {
        let Some(words) = policy.search.as_deref().filter(|w| !w.trim().is_empty()) else {
            continue;
        };

        let resolved = match cache.resolve_policy(store, key, policy).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(policy = %key, error = %e, "cannot resolve tags or notebook, skipping");
                continue;
            }
        };

        info!(search = %words, "search notes");
        let notes = match store.search_notes(words, MAX_SEARCH_RESULTS).await {
            Ok(notes) => notes,
            Err(e) => {
                warn!(policy = %key, search = %words, error = %e, "search failed, skipping");
                continue;
            }
        };
        info!(search = %words, results = notes.len(), "search finished");
        summary.found += notes.len();

        let label = policy.title.as_deref().unwrap_or(key);
        for note in notes {
            let update = NoteUpdate {
                title: refiled_title(note.created, label),
                guid: note.guid,
                notebook_guid: resolved.notebook_guid.clone(),
                tag_guids: resolved.tag_guids.clone(),
            };
            info!(note_guid = %update.guid, title = %update.title, "refile note");
            match store.update_note(&update).await {
                Ok(()) => summary.refiled += 1,
                Err(e) => warn!(note_guid = %update.guid, error = %e, "update failed"),
            }
        }
    }

    Ok(summary)
}

/// `"YYYY-MM-DD - label"` from a creation time in epoch milliseconds.
pub fn refiled_title(created_ms: i64, label: &str) -> String {
    let date = Utc
        .timestamp_millis_opt(created_ms)
        .single()
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "0000-00-00".to_string());
    format!("{} - {}", date, label)
}
