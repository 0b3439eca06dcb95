//! Directory watcher feeding a single sequential import worker.
//!
//! The notify callback only filters and enqueues; the worker owns the
//! pipeline and runs one import at a time in arrival order.

use notify::event::CreateKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::pipeline::{ImportPipeline, RunMode};
use crate::store::StoreConnector;

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
const DEBOUNCE_RETENTION: Duration = Duration::from_secs(5);

/// Keeps the subscription alive. Dropping it unsubscribes and closes the
/// queue once the callback's sender goes away.
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl DirectoryWatcher {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Canonical form of the configured root. Event paths are absolute and
/// symlink-free on some platforms, so the watch and the pipeline both use it.
pub fn watch_root(root: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(root)
        .map_err(|e| Error::Config(format!("cannot resolve DIRECTORY {}: {}", root.display(), e)))
}

/// Subscribe to creation events under `root`, recursively. Every new
/// non-directory path is sent to `queue`.
pub fn start(root: &Path, queue: UnboundedSender<PathBuf>) -> Result<DirectoryWatcher> {
    let mut debouncer = Debouncer::default();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in created_file_paths(&event) {
                    if !debouncer.admit(&path, Instant::now()) {
                        debug!(path = %path.display(), "duplicate event dropped");
                        continue;
                    }
                    if queue.send(path).is_err() {
                        debug!("import queue closed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "watch error"),
        },
        Config::default(),
    )?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    info!(root = %root.display(), "watching for new files");

    Ok(DirectoryWatcher {
        _watcher: watcher,
        root: root.to_path_buf(),
    })
}

/// Paths of the files (not directories) an event reports as created.
pub fn created_file_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter(|path| !path.is_dir())
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

/// Drops repeat events for one path inside [`DEBOUNCE_WINDOW`].
#[derive(Debug, Default)]
struct Debouncer {
    seen: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn admit(&mut self, path: &Path, now: Instant) -> bool {
        if self.seen.len() > 100 {
            self.seen
                .retain(|_, last| now.duration_since(*last) < DEBOUNCE_RETENTION);
        }

        if let Some(last) = self.seen.get(path) {
            if now.duration_since(*last) < DEBOUNCE_WINDOW {
                return false;
            }
        }
        self.seen.insert(path.to_path_buf(), now);
        true
    }
}

pub fn import_queue() -> (UnboundedSender<PathBuf>, UnboundedReceiver<PathBuf>) {
    mpsc::unbounded_channel()
}

/// Consume the queue until every sender is gone, one single-file run per
/// path. Resolves to the number of runs that completed without a fatal error.
pub fn spawn_import_worker<C>(
    pipeline: Arc<ImportPipeline<C>>,
    mut queue: UnboundedReceiver<PathBuf>,
) -> JoinHandle<usize>
where
    C: StoreConnector + 'static,
{
    tokio::spawn(async move {
        let mut succeeded = 0;
        while let Some(path) = queue.recv().await {
            info!(path = %path.display(), "import started");
            match pipeline.run(RunMode::SingleFile(path.clone())).await {
                Ok(result) => {
                    succeeded += 1;
                    info!(
                        path = %path.display(),
                        created = result.imported.len(),
                        "import ended"
                    );
                }
                Err(e) => error!(path = %path.display(), error = %e, "import ended with error"),
            }
        }
        debug!("import queue drained");
        succeeded
    })
}
