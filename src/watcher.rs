//! File change watching: kernel notifications or a polling stat loop.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Consecutive stat failures tolerated by the polling watcher before it
/// gives up on the file.
const STAT_RETRIES: u32 = 3;

/// Change notifications delivered from a watcher to the engine.
///
/// Each channel holds at most one pending token; senders drop the
/// notification when one is already queued, so bursts coalesce into a single
/// hint to re-check the file.
pub(crate) struct FileChanges {
    pub modified: mpsc::Receiver<()>,
    pub truncated: mpsc::Receiver<()>,
    pub deleted: mpsc::Receiver<()>,
}

#[derive(Clone)]
pub(crate) struct ChangeNotifier {
    modified: mpsc::Sender<()>,
    truncated: mpsc::Sender<()>,
    deleted: mpsc::Sender<()>,
}

impl FileChanges {
    pub fn channel() -> (ChangeNotifier, FileChanges) {
        let (modified_tx, modified) = mpsc::channel(1);
        let (truncated_tx, truncated) = mpsc::channel(1);
        let (deleted_tx, deleted) = mpsc::channel(1);

        (
            ChangeNotifier {
                modified: modified_tx,
                truncated: truncated_tx,
                deleted: deleted_tx,
            },
            FileChanges {
                modified,
                truncated,
                deleted,
            },
        )
    }
}

impl ChangeNotifier {
    pub fn notify_modified(&self) {
        let _ = self.modified.try_send(());
    }

    pub fn notify_truncated(&self) {
        let _ = self.truncated.try_send(());
    }

    pub fn notify_deleted(&self) {
        let _ = self.deleted.try_send(());
    }
}

/// Strategy for observing a single file.
#[async_trait]
pub(crate) trait FileWatcher: Send {
    /// Blocks until the target file exists or the token fires.
    async fn block_until_exists(&mut self, token: &CancellationToken) -> Result<()>;

    /// Starts observing changes. `starting_size` seeds the size baseline so
    /// the first shrink registers as a truncation.
    fn change_events(
        &mut self,
        token: &CancellationToken,
        starting_size: u64,
    ) -> Result<FileChanges>;

    /// Stops the background task and releases filesystem handles.
    async fn close(&mut self);
}

/// Selects the watching strategy for `path`.
pub(crate) fn new_watcher(
    path: &Path,
    poll: bool,
    poll_interval: Duration,
) -> Box<dyn FileWatcher> {
    if poll {
        Box::new(PollWatcher::new(path, poll_interval))
    } else {
        Box::new(NotifyWatcher::new(path))
    }
}

/// Watcher backed by kernel notifications (inotify on Linux) through the
/// notify crate.
///
/// The parent directory is watched rather than the file itself, so creations,
/// renames and deletions of the target name are all visible.
pub(crate) struct NotifyWatcher {
    path: PathBuf,
    stop: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl NotifyWatcher {
    fn new(path: &Path) -> Self {
        NotifyWatcher {
            path: clean_path(path),
            stop: None,
            task: None,
        }
    }

    fn watch_parent(
        &self,
    ) -> Result<(
        RecommendedWatcher,
        mpsc::UnboundedReceiver<notify::Result<Event>>,
    )> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(parent_dir(&self.path), RecursiveMode::NonRecursive)?;

        Ok((watcher, rx))
    }
}

#[async_trait]
impl FileWatcher for NotifyWatcher {
    async fn block_until_exists(&mut self, token: &CancellationToken) -> Result<()> {
        // Register the directory watch before the existence check so a
        // creation between the two cannot be missed.
        let (watcher, mut events) = self.watch_parent()?;

        if self.path.exists() {
            return Ok(());
        }

        let target = file_name(&self.path);
        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Stopped),
                event = events.recv() => match event {
                    Some(Ok(event)) => {
                        if is_relevant(&event, &target) && self.path.exists() {
                            drop(watcher);
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(notify::Error::generic("event stream closed").into()),
                },
            }
        }
    }

    fn change_events(
        &mut self,
        token: &CancellationToken,
        starting_size: u64,
    ) -> Result<FileChanges> {
        let (watcher, events) = self.watch_parent()?;
        let (notifier, changes) = FileChanges::channel();

        let stop = token.child_token();
        self.stop = Some(stop.clone());
        self.task = Some(tokio::spawn(translate_events(
            watcher,
            events,
            self.path.clone(),
            notifier,
            stop,
            starting_size,
        )));

        Ok(changes)
    }

    async fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(message = "notify watcher task failed", ?err);
            }
        }
    }
}

/// Turns raw filesystem events into the engine's change notifications.
async fn translate_events(
    watcher: RecommendedWatcher,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    path: PathBuf,
    notifier: ChangeNotifier,
    stop: CancellationToken,
    starting_size: u64,
) {
    // Held for the task's lifetime; dropping it unregisters the watch.
    let _watcher = watcher;
    let target = file_name(&path);
    let mut last_size = starting_size;

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => return,
            event = events.recv() => match event {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    warn!(message = "watch error", %err);
                    continue;
                }
                None => return,
            },
        };

        if !is_relevant(&event, &target) {
            continue;
        }

        match event.kind {
            EventKind::Remove(_) => notifier.notify_deleted(),
            // A fresh file appearing under the watched name, or the name
            // being renamed either way, means the open inode was rotated
            // away. The kernel does not always report the deletion of an
            // open file, so the create is the reliable signal.
            EventKind::Create(_) => notifier.notify_deleted(),
            EventKind::Modify(ModifyKind::Name(_)) => notifier.notify_deleted(),
            _ => match tokio::fs::metadata(&path).await {
                Err(err) if err.kind() == io::ErrorKind::NotFound => notifier.notify_deleted(),
                Err(err) => warn!(message = "stat failed", path = %path.display(), %err),
                Ok(meta) => {
                    let size = meta.len();
                    if size < last_size {
                        debug!(message = "file shrank", path = %path.display(), size);
                        notifier.notify_truncated();
                    } else {
                        notifier.notify_modified();
                    }
                    last_size = size;
                }
            },
        }
    }
}

/// Stat-loop watcher used where kernel notifications are unavailable or
/// unwanted.
pub(crate) struct PollWatcher {
    path: PathBuf,
    interval: Duration,
    stop: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl PollWatcher {
    fn new(path: &Path, interval: Duration) -> Self {
        PollWatcher {
            path: clean_path(path),
            interval,
            stop: None,
            task: None,
        }
    }
}

#[async_trait]
impl FileWatcher for PollWatcher {
    async fn block_until_exists(&mut self, token: &CancellationToken) -> Result<()> {
        loop {
            if self.path.exists() {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Stopped),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn change_events(
        &mut self,
        token: &CancellationToken,
        starting_size: u64,
    ) -> Result<FileChanges> {
        let (notifier, changes) = FileChanges::channel();

        let stop = token.child_token();
        self.stop = Some(stop.clone());
        self.task = Some(tokio::spawn(poll_file(
            self.path.clone(),
            self.interval,
            notifier,
            stop,
            starting_size,
        )));

        Ok(changes)
    }

    async fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(message = "polling watcher task failed", ?err);
            }
        }
    }
}

async fn poll_file(
    path: PathBuf,
    interval: Duration,
    notifier: ChangeNotifier,
    stop: CancellationToken,
    starting_size: u64,
) {
    let mut last_size = starting_size;
    let mut last_mtime: Option<SystemTime> = None;
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match tokio::fs::metadata(&path).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(message = "polled file is gone", path = %path.display());
                notifier.notify_deleted();
                return;
            }
            Err(err) => {
                failures += 1;
                if failures >= STAT_RETRIES {
                    warn!(
                        message = "giving up after repeated stat failures",
                        path = %path.display(),
                        %err
                    );
                    notifier.notify_deleted();
                    return;
                }
            }
            Ok(meta) => {
                failures = 0;
                let size = meta.len();
                let mtime = meta.modified().ok();

                if size > last_size {
                    notifier.notify_modified();
                } else if size < last_size {
                    notifier.notify_truncated();
                } else if last_mtime.is_some() && mtime != last_mtime {
                    // Same length but rewritten in place.
                    notifier.notify_modified();
                }

                last_size = size;
                last_mtime = mtime;
            }
        }
    }
}

fn clean_path(path: &Path) -> PathBuf {
    path.components().collect()
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// True when any path in the event refers to the watched file name.
fn is_relevant(event: &Event, target: &str) -> bool {
    event.paths.iter().any(|path| {
        path.file_name()
            .map(|name| name.to_string_lossy() == target)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TempLogFile;
    use notify::event::{CreateKind, DataChange};
    use std::time::Duration;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(5);
    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn notifications_coalesce() {
        let (notifier, mut changes) = FileChanges::channel();

        notifier.notify_modified();
        notifier.notify_modified();
        notifier.notify_modified();

        assert!(changes.modified.try_recv().is_ok());
        assert!(changes.modified.try_recv().is_err());
    }

    #[test]
    fn channels_are_independent() {
        let (notifier, mut changes) = FileChanges::channel();

        notifier.notify_truncated();
        notifier.notify_deleted();

        assert!(changes.modified.try_recv().is_err());
        assert!(changes.truncated.try_recv().is_ok());
        assert!(changes.deleted.try_recv().is_ok());
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event {
            kind,
            paths: vec![PathBuf::from(path)],
            attrs: Default::default(),
        }
    }

    #[test]
    fn relevance_matches_on_file_name() {
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));

        assert!(is_relevant(&event(modify, "/tmp/test.log"), "test.log"));
        assert!(!is_relevant(&event(modify, "/tmp/other.log"), "test.log"));
        assert!(is_relevant(
            &event(EventKind::Create(CreateKind::File), "/var/log/test.log"),
            "test.log"
        ));
        assert!(!is_relevant(&event(modify, "/"), "test.log"));
    }

    #[test]
    fn parent_dir_of_bare_file_name_is_cwd() {
        assert_eq!(parent_dir(Path::new("test.log")), Path::new("."));
        assert_eq!(parent_dir(Path::new("/var/log/test.log")), Path::new("/var/log"));
    }

    #[tokio::test]
    async fn poll_watcher_reports_appends() {
        let temp = TempLogFile::with_content("hello\n").unwrap();
        let mut watcher = PollWatcher::new(temp.path(), TICK);
        let token = CancellationToken::new();

        let mut changes = watcher.change_events(&token, 6).unwrap();

        temp.append("more\n").unwrap();
        timeout(WAIT, changes.modified.recv())
            .await
            .expect("no modified notification")
            .unwrap();

        watcher.close().await;
    }

    #[tokio::test]
    async fn poll_watcher_reports_truncation() {
        let temp = TempLogFile::with_content("a long first version\n").unwrap();
        let mut watcher = PollWatcher::new(temp.path(), TICK);
        let token = CancellationToken::new();

        let mut changes = watcher.change_events(&token, 21).unwrap();

        temp.truncate("short\n").unwrap();
        timeout(WAIT, changes.truncated.recv())
            .await
            .expect("no truncated notification")
            .unwrap();

        watcher.close().await;
    }

    #[tokio::test]
    async fn poll_watcher_reports_deletion() {
        let temp = TempLogFile::with_content("hello\n").unwrap();
        let mut watcher = PollWatcher::new(temp.path(), TICK);
        let token = CancellationToken::new();

        let mut changes = watcher.change_events(&token, 6).unwrap();

        std::fs::remove_file(temp.path()).unwrap();
        timeout(WAIT, changes.deleted.recv())
            .await
            .expect("no deleted notification")
            .unwrap();

        watcher.close().await;
    }

    #[tokio::test]
    async fn poll_block_until_exists_sees_late_creation() {
        let temp = TempLogFile::new().unwrap();
        let missing = temp.path().with_file_name("late.log");

        let mut watcher = PollWatcher::new(&missing, TICK);
        let token = CancellationToken::new();

        let path = missing.clone();
        let create = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&path, "hi\n").unwrap();
        });

        timeout(WAIT, watcher.block_until_exists(&token))
            .await
            .expect("timed out")
            .unwrap();
        create.await.unwrap();
    }

    #[tokio::test]
    async fn notify_block_until_exists_sees_late_creation() {
        let temp = TempLogFile::new().unwrap();
        let missing = temp.path().with_file_name("late.log");

        let mut watcher = NotifyWatcher::new(&missing);
        let token = CancellationToken::new();

        let path = missing.clone();
        let create = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&path, "hi\n").unwrap();
        });

        timeout(WAIT, watcher.block_until_exists(&token))
            .await
            .expect("timed out")
            .unwrap();
        create.await.unwrap();
    }

    #[tokio::test]
    async fn block_until_exists_returns_immediately_for_existing_file() {
        let temp = TempLogFile::with_content("hello\n").unwrap();
        let token = CancellationToken::new();

        let mut watcher = NotifyWatcher::new(temp.path());
        watcher.block_until_exists(&token).await.unwrap();

        let mut watcher = PollWatcher::new(temp.path(), TICK);
        watcher.block_until_exists(&token).await.unwrap();
    }

    #[tokio::test]
    async fn block_until_exists_is_cancellable() {
        let temp = TempLogFile::new().unwrap();
        let missing = temp.path().with_file_name("never.log");

        let mut watcher = PollWatcher::new(&missing, TICK);
        let token = CancellationToken::new();
        token.cancel();

        let result = timeout(WAIT, watcher.block_until_exists(&token))
            .await
            .expect("timed out");
        assert!(matches!(result, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn notify_watcher_reports_rename_as_deletion() {
        let temp = TempLogFile::with_content("hello\n").unwrap();
        let mut watcher = NotifyWatcher::new(temp.path());
        let token = CancellationToken::new();

        let mut changes = watcher.change_events(&token, 6).unwrap();

        temp.rename("rotated.log").unwrap();
        timeout(WAIT, changes.deleted.recv())
            .await
            .expect("no deleted notification")
            .unwrap();

        watcher.close().await;
    }
}
