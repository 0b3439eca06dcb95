//! In-memory store for unit tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::{NoteDraft, NoteStore, NoteSummary, NoteUpdate, Notebook, StoreConnector, Tag, User};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct MemoryState {
    pub tags: Vec<Tag>,
    pub notebooks: Vec<Notebook>,
    pub notes: Vec<NoteDraft>,
    pub search_hits: Vec<NoteSummary>,
    pub updates: Vec<NoteUpdate>,
    /// Every call, in order, as "method:arg"
    pub calls: Vec<String>,
    /// Titles whose create_note call fails
    pub fail_titles: HashSet<String>,
    /// Guids whose update_note call fails
    pub fail_updates: HashSet<String>,
    /// Search phrases whose search_notes call fails
    pub fail_searches: HashSet<String>,
    pub fail_listing: bool,
    next_id: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryNoteStore {
    pub state: Arc<Mutex<MemoryState>>,
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(self, guid: &str, name: &str) -> Self {
        self.state.lock().expect("memory store").tags.push(Tag {
            guid: guid.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn with_notebook(self, guid: &str, name: &str) -> Self {
        self.state.lock().expect("memory store").notebooks.push(Notebook {
            guid: guid.to_string(),
            name: name.to_string(),
            stack: None,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("memory store").calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn notes(&self) -> Vec<NoteDraft> {
        self.state.lock().expect("memory store").notes.clone()
    }

    fn record(&self, call: String) -> std::sync::MutexGuard<'_, MemoryState> {
        let mut state = self.state.lock().expect("memory store");
        state.calls.push(call);
        state
    }
}

fn next_guid(state: &mut MemoryState, prefix: &str) -> String {
    state.next_id += 1;
    format!("{}-{}", prefix, state.next_id)
}

#[async_trait]
impl NoteStore for MemoryNoteStore {
    async fn list_tags(&self) -> Result<Vec<Tag>> {
        let state = self.record("list_tags".to_string());
        if state.fail_listing {
            return Err(Error::RemoteStore("listing refused".to_string()));
        }
        Ok(state.tags.clone())
    }

    async fn create_tag(&self, name: &str) -> Result<Tag> {
        let mut state = self.record(format!("create_tag:{}", name));
        let tag = Tag {
            guid: next_guid(&mut state, "tag"),
            name: name.to_string(),
        };
        state.tags.push(tag.clone());
        Ok(tag)
    }

    async fn list_notebooks(&self) -> Result<Vec<Notebook>> {
        let state = self.record("list_notebooks".to_string());
        Ok(state.notebooks.clone())
    }

    async fn create_notebook(&self, name: &str, stack: Option<&str>) -> Result<Notebook> {
        let mut state = self.record(format!("create_notebook:{}", name));
        let notebook = Notebook {
            guid: next_guid(&mut state, "notebook"),
            name: name.to_string(),
            stack: stack.map(str::to_string),
        };
        state.notebooks.push(notebook.clone());
        Ok(notebook)
    }

    async fn create_note(&self, draft: &NoteDraft) -> Result<String> {
        let mut state = self.record(format!("create_note:{}", draft.title));
        if state.fail_titles.contains(&draft.title) {
            return Err(Error::RemoteStore(format!("refused {}", draft.title)));
        }
        state.notes.push(draft.clone());
        Ok(next_guid(&mut state, "note"))
    }

    async fn search_notes(&self, words: &str, max_results: i32) -> Result<Vec<NoteSummary>> {
        let state = self.record(format!("search_notes:{}", words));
        if state.fail_searches.contains(words) {
            return Err(Error::RemoteStore(format!("search refused: {}", words)));
        }
        Ok(state
            .search_hits
            .iter()
            .filter(|n| n.title.to_lowercase().contains(&words.to_lowercase()))
            .take(max_results.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update_note(&self, update: &NoteUpdate) -> Result<()> {
        let mut state = self.record(format!("update_note:{}", update.guid));
        if state.fail_updates.contains(&update.guid) {
            return Err(Error::RemoteStore(format!("refused {}", update.guid)));
        }
        state.updates.push(update.clone());
        Ok(())
    }

    async fn current_user(&self) -> Result<User> {
        self.record("current_user".to_string());
        Ok(User {
            id: 1,
            username: Some("tester".to_string()),
        })
    }
}

/// Hands out clones of one shared store; counts connections.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    pub store: MemoryNoteStore,
    pub refuse: bool,
    pub connects: Arc<Mutex<usize>>,
}

impl MemoryConnector {
    pub fn new(store: MemoryNoteStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    pub fn connect_count(&self) -> usize {
        *self.connects.lock().expect("connect counter")
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    type Store = MemoryNoteStore;

    async fn connect(&self) -> Result<MemoryNoteStore> {
        *self.connects.lock().expect("connect counter") += 1;
        if self.refuse {
            return Err(Error::RemoteConnect("invalid token".to_string()));
        }
        Ok(self.store.clone())
    }
}
