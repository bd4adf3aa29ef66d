//! Filesystem watcher
//!
//! One native watcher per library. Video events become `CompanionEvent`s on the
//! activity bus; new files get an `insight` once they have had time to settle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::activity::{ActivityBus, CompanionEvent, CompanionEventKind};
use crate::config::WatcherSettings;
use crate::database::{Database, DatabaseError};

pub const WATCHER_SOURCE: &str = "file_watcher";
pub const ANALYSIS_SOURCE: &str = "analysis_engine";

/// How long a `From` rename half waits for its `To` half.
const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Library path does not exist: {0}")]
    MissingPath(PathBuf),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

pub type WatcherResult<T> = Result<T, WatcherError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedLibrary {
    pub id: i64,
    pub name: String,
    pub path: PathBuf,
}

struct WatchHandle {
    generation: u64,
    library: WatchedLibrary,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

enum WatchMessage {
    Event(Event),
    Error(notify::Error),
}

pub struct LibraryWatcher {
    bus: Arc<ActivityBus>,
    settings: WatcherSettings,
    watchers: DashMap<i64, WatchHandle>,
    generations: AtomicU64,
    shutdown: CancellationToken,
}

impl LibraryWatcher {
    pub fn new(bus: Arc<ActivityBus>, settings: WatcherSettings, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            bus,
            settings,
            watchers: DashMap::new(),
            generations: AtomicU64::new(1),
            shutdown,
        })
    }

    /// Open a watcher for every library in storage. Missing paths are skipped.
    pub async fn start(self: &Arc<Self>) -> WatcherResult<usize> {
        let libraries = load_libraries(self.bus.database()).await?;
        for library in libraries {
            let name = library.name.clone();
            match self.watch(library) {
                Ok(()) => {}
                Err(WatcherError::MissingPath(path)) => {
                    warn!(library = %name, "Library path no longer exists, skipping: {}", path.display())
                }
                Err(e) => warn!(library = %name, "Failed to watch library: {}", e),
            }
        }
        Ok(self.watchers.len())
    }

    pub fn watch(self: &Arc<Self>, library: WatchedLibrary) -> WatcherResult<()> {
        if !library.path.is_dir() {
            return Err(WatcherError::MissingPath(library.path));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let message = match res {
                    Ok(event) => WatchMessage::Event(event),
                    Err(e) => WatchMessage::Error(e),
                };
                let _ = tx.send(message);
            },
            Config::default(),
        )?;
        watcher.watch(&library.path, RecursiveMode::Recursive)?;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("library_watcher", library = %library.name, library_id = library.id);
        let task = tokio::spawn(self.clone().run(library.clone(), generation, rx).instrument(span));

        info!(library = %library.name, "📂 Watching library: {}", library.path.display());
        if let Some(previous) = self.watchers.insert(
            library.id,
            WatchHandle {
                generation,
                library,
                _watcher: watcher,
                task,
            },
        ) {
            previous.task.abort();
        }
        Ok(())
    }

    pub fn unwatch(&self, library_id: i64) -> bool {
        match self.watchers.remove(&library_id) {
            Some((_, handle)) => {
                handle.task.abort();
                info!(library = %handle.library.name, "Stopped watching library");
                true
            }
            None => false,
        }
    }

    pub fn active_watchers(&self) -> usize {
        self.watchers.len()
    }

    pub fn watched(&self) -> Vec<WatchedLibrary> {
        let mut libraries: Vec<_> = self.watchers.iter().map(|entry| entry.library.clone()).collect();
        libraries.sort_by_key(|library| library.id);
        libraries
    }

    /// Drop the registration made by watcher `generation`, unless the library
    /// has been re-watched since.
    fn release(&self, library_id: i64, generation: u64) -> bool {
        self.watchers
            .remove_if(&library_id, |_, handle| handle.generation == generation)
            .is_some()
    }

    pub fn stop_all(&self) {
        let ids: Vec<i64> = self.watchers.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.unwatch(id);
        }
    }

    async fn run(
        self: Arc<Self>,
        library: WatchedLibrary,
        generation: u64,
        mut rx: mpsc::UnboundedReceiver<WatchMessage>,
    ) {
        let mut renames = RenamePairing::default();
        let mut flush = tokio::time::interval(RENAME_PAIR_WINDOW);
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = flush.tick() => {
                    for (kind, event) in renames.expire(Instant::now()) {
                        self.handle_event(&library, kind, event);
                    }
                    continue;
                }
                message = rx.recv() => message,
            };

            match message {
                Some(WatchMessage::Event(event)) => {
                    if is_root_removal(&event, &library.path) {
                        warn!("Library root was removed, no longer watching");
                        self.release(library.id, generation);
                        break;
                    }
                    for (kind, event) in renames.accept(event, Instant::now()) {
                        self.handle_event(&library, kind, event);
                    }
                }
                Some(WatchMessage::Error(e)) => {
                    if is_fatal(&e) {
                        warn!("Watcher closed: {}", e);
                        self.release(library.id, generation);
                        break;
                    }
                    warn!("Watcher error: {}", e);
                }
                None => {
                    self.release(library.id, generation);
                    break;
                }
            }
        }
        debug!("Library watcher task finished");
    }

    fn handle_event(&self, library: &WatchedLibrary, kind: CompanionEventKind, event: Event) {
        // For renames the last path is the new name.
        let Some(path) = event
            .paths
            .iter()
            .rev()
            .find(|path| is_video(path, &self.settings.video_extensions))
            .cloned()
        else {
            return;
        };

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let message = match kind {
            CompanionEventKind::FileAdded => format!("New video detected: {}", file_name),
            CompanionEventKind::FileRemoved => format!("Video removed: {}", file_name),
            CompanionEventKind::FileModified => format!("Video modified: {}", file_name),
            _ => format!("Video renamed: {}", file_name),
        };

        let mut companion = CompanionEvent::new(kind, WATCHER_SOURCE, message)
            .with("library", library.name.as_str())
            .with("library_id", library.id)
            .with("file_path", path.to_string_lossy().into_owned())
            .with("operation", format!("{:?}", event.kind));
        if kind == CompanionEventKind::FileRenamed && event.paths.len() > 1 {
            companion = companion.with("previous_path", event.paths[0].to_string_lossy().into_owned());
        }
        self.bus.emit_companion(companion);

        if kind == CompanionEventKind::FileAdded {
            self.schedule_analysis(library.name.clone(), path);
        }
    }

    /// Emit the analysis insight after the settle delay, so readers see a complete file.
    fn schedule_analysis(&self, library: String, path: PathBuf) {
        let bus = self.bus.clone();
        let shutdown = self.shutdown.clone();
        let settle = Duration::from_millis(self.settings.settle_delay_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(settle) => {}
            }
            bus.emit_companion(
                CompanionEvent::new(
                    CompanionEventKind::Insight,
                    ANALYSIS_SOURCE,
                    format!("Analyzing new video in {}", library),
                )
                .with("library", library.as_str())
                .with("file_path", path.to_string_lossy().into_owned()),
            );
        });
    }
}

/// Map a native event to a companion event kind.
///
/// A lone rename half means the file crossed the library boundary: `To` is a
/// move in, `From` a move out.
pub fn classify(kind: &EventKind) -> Option<CompanionEventKind> {
    match kind {
        EventKind::Create(_) => Some(CompanionEventKind::FileAdded),
        EventKind::Remove(_) => Some(CompanionEventKind::FileRemoved),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both | RenameMode::Any)) => {
            Some(CompanionEventKind::FileRenamed)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(CompanionEventKind::FileAdded),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(CompanionEventKind::FileRemoved),
        EventKind::Modify(ModifyKind::Name(RenameMode::Other)) => None,
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(CompanionEventKind::FileModified),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

/// Pairs rename halves that share a tracker so a move inside the library is
/// reported once. Backends that also send a combined `Both` event for a
/// paired move get it swallowed.
#[derive(Default)]
struct RenamePairing {
    pending: HashMap<usize, (Event, Instant)>,
    reported: HashMap<usize, Instant>,
}

impl RenamePairing {
    fn accept(&mut self, event: Event, at: Instant) -> Vec<(CompanionEventKind, Event)> {
        let mut changes = self.expire(at);
        let name_change = match &event.kind {
            EventKind::Modify(ModifyKind::Name(mode)) => event.tracker().map(|tracker| (*mode, tracker)),
            _ => None,
        };

        match name_change {
            Some((RenameMode::From, tracker)) => {
                self.pending.insert(tracker, (event, at));
            }
            Some((RenameMode::To, tracker)) => match self.pending.remove(&tracker) {
                Some((from, _)) => {
                    self.reported.insert(tracker, at);
                    let mut renamed =
                        Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both))).set_tracker(tracker);
                    renamed.paths = from.paths.into_iter().chain(event.paths).collect();
                    changes.push((CompanionEventKind::FileRenamed, renamed));
                }
                None => changes.push((CompanionEventKind::FileAdded, event)),
            },
            Some((RenameMode::Both, tracker)) if self.reported.remove(&tracker).is_some() => {}
            _ => {
                if let Some(kind) = classify(&event.kind) {
                    changes.push((kind, event));
                }
            }
        }
        changes
    }

    /// `From` halves whose partner never arrived: the file left the library.
    fn expire(&mut self, at: Instant) -> Vec<(CompanionEventKind, Event)> {
        let stale = |since: &Instant| at.saturating_duration_since(*since) >= RENAME_PAIR_WINDOW;
        self.reported.retain(|_, since| !stale(since));
        let expired: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, (_, since))| stale(since))
            .map(|(tracker, _)| *tracker)
            .collect();
        expired
            .into_iter()
            .filter_map(|tracker| self.pending.remove(&tracker))
            .map(|(event, _)| (CompanionEventKind::FileRemoved, event))
            .collect()
    }
}

pub fn is_video(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|known| known.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        })
}

fn is_root_removal(event: &Event, root: &Path) -> bool {
    matches!(event.kind, EventKind::Remove(_)) && event.paths.iter().any(|path| path == root)
}

fn is_fatal(error: &notify::Error) -> bool {
    matches!(
        error.kind,
        notify::ErrorKind::PathNotFound | notify::ErrorKind::WatchNotFound
    )
}

pub async fn load_libraries(db: &Database) -> WatcherResult<Vec<WatchedLibrary>> {
    Ok(db
        .read(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, path FROM libraries ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(WatchedLibrary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    path: PathBuf::from(row.get::<_, String>(2)?),
                })
            })?;
            rows.collect()
        })
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Subscription;
    use crate::database::{now, test_database};
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use rusqlite::params;
    use tempfile::tempdir;

    fn settings(settle_ms: u64) -> WatcherSettings {
        WatcherSettings {
            settle_delay_ms: settle_ms,
            ..WatcherSettings::default()
        }
    }

    async fn collect_for(sub: &Subscription<CompanionEvent>, window: Duration) -> Vec<CompanionEvent> {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, sub.recv()).await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_classify_native_events() {
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            Some(CompanionEventKind::FileAdded)
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            Some(CompanionEventKind::FileRemoved)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(CompanionEventKind::FileModified)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            Some(CompanionEventKind::FileRenamed)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some(CompanionEventKind::FileAdded)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            Some(CompanionEventKind::FileRemoved)
        );
        assert_eq!(classify(&EventKind::Modify(ModifyKind::Name(RenameMode::Other))), None);
    }

    fn half(mode: RenameMode, path: &str, tracker: Option<usize>) -> Event {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(mode))).add_path(PathBuf::from(path));
        match tracker {
            Some(tracker) => event.set_tracker(tracker),
            None => event,
        }
    }

    fn kinds(changes: &[(CompanionEventKind, Event)]) -> Vec<CompanionEventKind> {
        changes.iter().map(|(kind, _)| *kind).collect()
    }

    #[test]
    fn test_rename_halves_inside_library_report_one_rename() {
        let mut renames = RenamePairing::default();
        let t0 = Instant::now();

        assert!(renames.accept(half(RenameMode::From, "/lib/a.mp4", Some(7)), t0).is_empty());
        let changes = renames.accept(half(RenameMode::To, "/lib/b.mp4", Some(7)), t0);
        assert_eq!(kinds(&changes), vec![CompanionEventKind::FileRenamed]);
        assert_eq!(changes[0].1.paths, vec![PathBuf::from("/lib/a.mp4"), PathBuf::from("/lib/b.mp4")]);

        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/lib/a.mp4"))
            .add_path(PathBuf::from("/lib/b.mp4"))
            .set_tracker(7);
        assert!(renames.accept(both, t0).is_empty());
        assert!(renames.expire(t0 + RENAME_PAIR_WINDOW * 2).is_empty());
    }

    #[test]
    fn test_moves_across_library_boundary() {
        let mut renames = RenamePairing::default();
        let t0 = Instant::now();

        // Moved in from outside: only the `To` half is seen.
        let changes = renames.accept(half(RenameMode::To, "/lib/in.mp4", Some(3)), t0);
        assert_eq!(kinds(&changes), vec![CompanionEventKind::FileAdded]);

        // Moved out: the `From` half waits out the window, then reads as a removal.
        assert!(renames.accept(half(RenameMode::From, "/lib/out.mp4", Some(4)), t0).is_empty());
        assert!(renames.expire(t0 + RENAME_PAIR_WINDOW / 2).is_empty());
        let changes = renames.expire(t0 + RENAME_PAIR_WINDOW);
        assert_eq!(kinds(&changes), vec![CompanionEventKind::FileRemoved]);
        assert_eq!(changes[0].1.paths, vec![PathBuf::from("/lib/out.mp4")]);

        // Halves without a tracker cannot be paired and are reported as they come.
        let changes = renames.accept(half(RenameMode::To, "/lib/loose.mp4", None), t0);
        assert_eq!(kinds(&changes), vec![CompanionEventKind::FileAdded]);
    }

    #[test]
    fn test_video_extension_filter() {
        let exts = WatcherSettings::default().video_extensions;
        assert!(is_video(Path::new("/lib/a.MP4"), &exts));
        assert!(is_video(Path::new("/lib/b.webm"), &exts));
        assert!(!is_video(Path::new("/lib/c.txt"), &exts));
        assert!(!is_video(Path::new("/lib/noext"), &exts));
    }

    #[tokio::test]
    async fn test_missing_library_is_skipped() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        let existing = dir.path().join("library");
        std::fs::create_dir(&existing).unwrap();
        let existing_path = existing.to_string_lossy().into_owned();
        let missing_path = dir.path().join("gone").to_string_lossy().into_owned();
        db.write(move |conn| {
            conn.execute(
                "INSERT INTO libraries (name, path, created_at) VALUES ('Main', ?1, ?3), ('Gone', ?2, ?3)",
                params![existing_path, missing_path, now()],
            )
        })
        .await
        .unwrap();

        let token = CancellationToken::new();
        let bus = ActivityBus::new(db, token.clone());
        let watcher = LibraryWatcher::new(bus, settings(10), token.clone());

        assert_eq!(watcher.start().await.unwrap(), 1);
        assert_eq!(watcher.watched()[0].name, "Main");
        token.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_file_rename_and_delete() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        let library_dir = dir.path().join("library");
        std::fs::create_dir(&library_dir).unwrap();

        let token = CancellationToken::new();
        let bus = ActivityBus::with_buffer(db, 64, token.clone());
        let sub = bus.subscribe_companion();
        let watcher = LibraryWatcher::new(bus, settings(300), token.clone());
        watcher
            .watch(WatchedLibrary {
                id: 1,
                name: "Main".to_string(),
                path: library_dir.clone(),
            })
            .unwrap();

        std::fs::write(library_dir.join("a.mp4"), b"video").unwrap();
        std::fs::write(library_dir.join("notes.txt"), b"text").unwrap();
        let events = collect_for(&sub, Duration::from_millis(1200)).await;
        let added: Vec<_> = events.iter().filter(|e| e.kind == CompanionEventKind::FileAdded).collect();
        let insights: Vec<_> = events.iter().filter(|e| e.kind == CompanionEventKind::Insight).collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].data["library"], "Main");
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].message, "Analyzing new video in Main");
        assert!(events.iter().all(|e| !e.message.contains("notes.txt")));

        std::fs::rename(library_dir.join("a.mp4"), library_dir.join("b.mp4")).unwrap();
        let events = collect_for(&sub, Duration::from_millis(800)).await;
        let renamed: Vec<_> = events.iter().filter(|e| e.kind == CompanionEventKind::FileRenamed).collect();
        assert_eq!(renamed.len(), 1);
        assert_eq!(renamed[0].message, "Video renamed: b.mp4");

        std::fs::remove_file(library_dir.join("b.mp4")).unwrap();
        let events = collect_for(&sub, Duration::from_millis(800)).await;
        let removed: Vec<_> = events.iter().filter(|e| e.kind == CompanionEventKind::FileRemoved).collect();
        assert_eq!(removed.len(), 1);

        watcher.stop_all();
        assert_eq!(watcher.active_watchers(), 0);
        token.cancel();
    }

    #[tokio::test]
    async fn test_stale_watcher_cannot_evict_its_replacement() {
        let dir = tempdir().unwrap();
        let db = test_database(dir.path()).await;
        let library_dir = dir.path().join("library");
        std::fs::create_dir(&library_dir).unwrap();
        let library = WatchedLibrary {
            id: 1,
            name: "Main".to_string(),
            path: library_dir,
        };

        let token = CancellationToken::new();
        let bus = ActivityBus::new(db, token.clone());
        let watcher = LibraryWatcher::new(bus, settings(10), token.clone());
        watcher.watch(library.clone()).unwrap();
        let first = watcher.watchers.get(&1).unwrap().generation;
        watcher.watch(library).unwrap();
        let second = watcher.watchers.get(&1).unwrap().generation;
        assert_ne!(first, second);

        assert!(!watcher.release(1, first));
        assert_eq!(watcher.active_watchers(), 1);
        assert!(watcher.release(1, second));
        assert_eq!(watcher.active_watchers(), 0);
        token.cancel();
    }
}
