//! One import run: configuration → connection → collection → per-file
//! build, submit and clean up.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::collector::{self, CollectedFiles};
use crate::error::{Error, Result};
use crate::note_builder::{self, ResolutionCache};
use crate::settings::ImportConfiguration;
use crate::store::{NoteStore, StoreConnector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    FullScan,
    SingleFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    pub created_note_guid: String,
    pub source_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportRunResult {
    pub imported: Vec<ImportResult>,
    /// Files collected for import, including the ones that were skipped
    pub considered: usize,
}

pub struct ImportPipeline<C> {
    connector: C,
    root: PathBuf,
    config_file: PathBuf,
    /// Sandbox runs keep their source files so fixtures can be re-imported
    sandbox: bool,
}

impl<C: StoreConnector> ImportPipeline<C> {
    pub fn new(
        connector: C,
        root: impl Into<PathBuf>,
        config_file: impl Into<PathBuf>,
        sandbox: bool,
    ) -> Self {
        Self {
            connector,
            root: root.into(),
            config_file: config_file.into(),
            sandbox,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn run(&self, mode: RunMode) -> Result<ImportRunResult> {
        let config = ImportConfiguration::load(&self.config_file)?;
        debug!(
            store = if self.sandbox { "sandbox" } else { "production" },
            "configuration read"
        );

        // Resolve the event path before any remote call
        let single = match &mode {
            RunMode::SingleFile(path) => Some(collector::collect_one(&self.root, path)?),
            RunMode::FullScan => None,
        };

        let store = self.connector.connect().await?;
        let tags = store
            .list_tags()
            .await
            .map_err(|e| Error::RemoteConnect(e.to_string()))?;
        let notebooks = store
            .list_notebooks()
            .await
            .map_err(|e| Error::RemoteConnect(e.to_string()))?;
        debug!(tags = tags.len(), notebooks = notebooks.len(), "connected");

        let files = match single {
            Some(files) => files,
            None => collector::collect_all(&self.root, &config)?,
        };

        let considered = collector::file_count(&files);
        if considered == 0 {
            info!("nothing to import");
            return Ok(ImportRunResult::default());
        }
        info!("{} file(s) collected", considered);

        let mut cache = ResolutionCache::new(&tags, &notebooks);
        let imported = self.import_files(&store, &config, &mut cache, files).await;
        info!("{} note(s) created", imported.len());

        Ok(ImportRunResult {
            imported,
            considered,
        })
    }

    async fn import_files<S: NoteStore>(
        &self,
        store: &S,
        config: &ImportConfiguration,
        cache: &mut ResolutionCache,
        files: CollectedFiles,
    ) -> Vec<ImportResult> {
        let mut imported = Vec::new();

        for (key, file_list) in files {
            let Some(policy) = config.policy(&key) else {
                warn!(subdirectory = %key, "no policy configured, {} file(s) left in place", file_list.len());
                continue;
            };

            let resolved = match cache.resolve_policy(store, &key, policy).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(subdirectory = %key, error = %e, "cannot resolve tags or notebook, skipping");
                    continue;
                }
            };

            for file in file_list {
                let path = file.absolute_path;
                let draft = match note_builder::build_note(&resolved, &path) {
                    Ok(draft) => draft,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping file");
                        continue;
                    }
                };

                info!(
                    path = %path.display(),
                    notebook = %resolved.notebook_name,
                    "import file"
                );
                let note_guid = match store.create_note(&draft).await {
                    Ok(guid) => guid,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "note creation failed, file kept");
                        continue;
                    }
                };

                self.delete_imported_file(&path);
                imported.push(ImportResult {
                    created_note_guid: note_guid,
                    source_path: path,
                });
            }
        }

        imported
    }

    /// Remove a source file after its note exists. Only a warning on failure.
    fn delete_imported_file(&self, path: &Path) {
        if self.sandbox {
            debug!(path = %path.display(), "sandbox run, file kept");
            return;
        }
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "cannot delete file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{MemoryConnector, MemoryNoteStore};
    use tempfile::TempDir;

    struct Fixture {
        root: TempDir,
        config_dir: TempDir,
    }

    impl Fixture {
        fn new(config_json: &str) -> Self {
            let fixture = Self {
                root: tempfile::tempdir().unwrap(),
                config_dir: tempfile::tempdir().unwrap(),
            };
            std::fs::write(fixture.config_path(), config_json).unwrap();
            fixture
        }

        fn config_path(&self) -> PathBuf {
            self.config_dir.path().join("config.json")
        }

        fn file(&self, relative: &str, content: &[u8]) -> PathBuf {
            let path = self.root.path().join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            path
        }

        fn pipeline(&self, connector: MemoryConnector, sandbox: bool) -> ImportPipeline<MemoryConnector> {
            ImportPipeline::new(connector, self.root.path(), self.config_path(), sandbox)
        }
    }

    const INVOICES: &str = r#"{ "autofile": { "invoices": { "target notebook": "Bills", "tags": ["paid"] } } }"#;

    #[tokio::test]
    async fn test_full_scan_imports_and_deletes() {
        let fixture = Fixture::new(INVOICES);
        let file = fixture.file("invoices/a.pdf", b"%PDF-1.4 invoice");
        let store = MemoryNoteStore::new();
        let pipeline = fixture.pipeline(MemoryConnector::new(store.clone()), false);

        let result = pipeline.run(RunMode::FullScan).await.unwrap();

        assert_eq!(result.considered, 1);
        assert_eq!(result.imported.len(), 1);
        assert_eq!(result.imported[0].source_path, file);
        assert!(!file.exists());

        let notes = store.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "a.pdf");
        assert_eq!(notes[0].attachment.content_hash, md5::compute(b"%PDF-1.4 invoice").0);
        assert_eq!(notes[0].tag_guids.len(), 1);
        assert_eq!(store.count_calls("create_tag:paid"), 1);
        assert_eq!(store.count_calls("create_notebook:Bills"), 1);
        let notebooks = store.state.lock().unwrap().notebooks.clone();
        assert_eq!(notes[0].notebook_guid, notebooks[0].guid);
    }

    #[tokio::test]
    async fn test_sandbox_keeps_source_files() {
        let fixture = Fixture::new(INVOICES);
        let file = fixture.file("invoices/a.pdf", b"data");
        let store = MemoryNoteStore::new();
        let pipeline = fixture.pipeline(MemoryConnector::new(store.clone()), true);

        let result = pipeline.run(RunMode::FullScan).await.unwrap();
        assert_eq!(result.imported.len(), 1);
        assert!(file.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_deletion_is_only_a_warning() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = Fixture::new(INVOICES);
        let file = fixture.file("invoices/a.pdf", b"data");
        let dir = file.parent().unwrap().to_path_buf();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o555)).unwrap();

        // privileged users can still unlink in a read-only directory
        let marker = dir.join(".writable");
        if std::fs::write(&marker, b"").is_ok() {
            std::fs::remove_file(&marker).unwrap();
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let store = MemoryNoteStore::new();
        let pipeline = fixture.pipeline(MemoryConnector::new(store.clone()), false);
        let result = pipeline.run(RunMode::FullScan).await;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        let result = result.unwrap();
        assert_eq!(result.imported.len(), 1);
        assert_eq!(result.imported[0].source_path, file);
        assert!(file.exists());
        assert_eq!(store.notes().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_note_is_kept_and_batch_continues() {
        let fixture = Fixture::new(INVOICES);
        let a = fixture.file("invoices/a.pdf", b"a");
        let b = fixture.file("invoices/b.pdf", b"b");
        let store = MemoryNoteStore::new();
        store
            .state
            .lock()
            .unwrap()
            .fail_titles
            .insert("a.pdf".to_string());
        let pipeline = fixture.pipeline(MemoryConnector::new(store.clone()), false);

        let result = pipeline.run(RunMode::FullScan).await.unwrap();
        assert_eq!(result.considered, 2);
        assert_eq!(result.imported.len(), 1);
        assert_eq!(result.imported[0].source_path, b);
        assert!(a.exists());
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn test_shared_tag_created_once_across_policies() {
        let fixture = Fixture::new(
            r#"{ "autofile": {
                "invoices": { "target notebook": "Bills", "tags": ["2024"] },
                "receipts": { "target notebook": "Bills", "tags": ["2024", "receipt"] }
            } }"#,
        );
        fixture.file("invoices/a.pdf", b"a");
        fixture.file("receipts/r.pdf", b"r");
        let store = MemoryNoteStore::new();
        let pipeline = fixture.pipeline(MemoryConnector::new(store.clone()), false);

        let result = pipeline.run(RunMode::FullScan).await.unwrap();
        assert_eq!(result.imported.len(), 2);
        assert_eq!(store.count_calls("create_tag:2024"), 1);
        assert_eq!(store.count_calls("create_notebook"), 1);
    }

    #[tokio::test]
    async fn test_single_file_mode() {
        let fixture = Fixture::new(INVOICES);
        fixture.file("invoices/other.pdf", b"untouched");
        let file = fixture.file("invoices/new.pdf", b"new");
        let store = MemoryNoteStore::new().with_tag("tag-1", "Paid").with_notebook("nb-1", "bills");
        let pipeline = fixture.pipeline(MemoryConnector::new(store.clone()), false);

        let result = pipeline.run(RunMode::SingleFile(file.clone())).await.unwrap();
        assert_eq!(result.considered, 1);
        assert_eq!(result.imported.len(), 1);
        assert_eq!(store.notes()[0].tag_guids, vec!["tag-1".to_string()]);
        assert_eq!(store.notes()[0].notebook_guid, "nb-1");
        assert_eq!(store.count_calls("create_"), 1);
        assert!(fixture.root.path().join("invoices/other.pdf").exists());
    }

    #[tokio::test]
    async fn test_single_file_outside_root_makes_no_remote_calls() {
        let fixture = Fixture::new(INVOICES);
        let elsewhere = tempfile::tempdir().unwrap();
        let stray = elsewhere.path().join("invoices/a.pdf");
        let store = MemoryNoteStore::new();
        let connector = MemoryConnector::new(store.clone());
        let pipeline = fixture.pipeline(connector.clone(), false);

        let err = pipeline.run(RunMode::SingleFile(stray)).await.unwrap_err();
        assert!(matches!(err, Error::PathResolution { .. }));
        assert_eq!(connector.connect_count(), 0);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_subdirectory_is_left_alone() {
        let fixture = Fixture::new(INVOICES);
        let file = fixture.file("letters/x.pdf", b"x");
        let store = MemoryNoteStore::new();
        let pipeline = fixture.pipeline(MemoryConnector::new(store.clone()), false);

        let result = pipeline.run(RunMode::SingleFile(file.clone())).await.unwrap();
        assert!(result.imported.is_empty());
        assert!(file.exists());
        assert_eq!(store.count_calls("create_"), 0);
    }

    #[tokio::test]
    async fn test_vanished_file_is_skipped() {
        let fixture = Fixture::new(INVOICES);
        let path = fixture.root.path().join("invoices/gone.pdf");
        let store = MemoryNoteStore::new();
        let pipeline = fixture.pipeline(MemoryConnector::new(store.clone()), false);

        let result = pipeline.run(RunMode::SingleFile(path)).await.unwrap();
        assert_eq!(result.considered, 1);
        assert!(result.imported.is_empty());
        assert_eq!(store.count_calls("create_note"), 0);
    }

    #[tokio::test]
    async fn test_empty_tree_is_normal() {
        let fixture = Fixture::new(INVOICES);
        let store = MemoryNoteStore::new();
        let pipeline = fixture.pipeline(MemoryConnector::new(store.clone()), false);

        let result = pipeline.run(RunMode::FullScan).await.unwrap();
        assert_eq!(result, ImportRunResult::default());
    }

    #[tokio::test]
    async fn test_bad_config_aborts_before_connecting() {
        let fixture = Fixture::new("{ not json");
        let connector = MemoryConnector::new(MemoryNoteStore::new());
        let pipeline = fixture.pipeline(connector.clone(), false);

        let err = pipeline.run(RunMode::FullScan).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let fixture = Fixture::new(INVOICES);
        let file = fixture.file("invoices/a.pdf", b"a");
        let mut connector = MemoryConnector::new(MemoryNoteStore::new());
        connector.refuse = true;
        let pipeline = fixture.pipeline(connector, false);

        let err = pipeline.run(RunMode::FullScan).await.unwrap_err();
        assert!(matches!(err, Error::RemoteConnect(_)));
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_listing_failure_is_connect_error() {
        let fixture = Fixture::new(INVOICES);
        let store = MemoryNoteStore::new();
        store.state.lock().unwrap().fail_listing = true;
        let pipeline = fixture.pipeline(MemoryConnector::new(store), false);

        let err = pipeline.run(RunMode::FullScan).await.unwrap_err();
        assert!(matches!(err, Error::RemoteConnect(_)));
    }
}
