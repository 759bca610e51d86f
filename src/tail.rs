//! The tailing engine and its consumer-facing handle.
//!
//! One background task per tail drives an explicit state machine that owns
//! the file handle, assembles lines, reacts to watcher notifications and
//! publishes records onto a bounded channel.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use futures::Stream;
use tokio::fs::File;
use tokio::io::AsyncSeekExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result, RATE_LIMIT_MESSAGE};
use crate::line::Line;
use crate::ratelimiter::LeakyBucket;
use crate::reader::{Chunk, LineReader};
use crate::util::partition_string;
use crate::watcher::{new_watcher, FileChanges, FileWatcher};

/// Output channel depth; a slow consumer exerts backpressure once this many
/// records are queued.
const LINES_CAPACITY: usize = 100;

/// Begins tailing `path` with the given options.
///
/// Configuration errors and, with `must_exist`, the initial open failure are
/// reported synchronously. Every later failure arrives as the final [`Line`]
/// on the stream and through [`Tail::err`].
pub async fn tail_file(path: impl AsRef<Path>, mut config: Config) -> Result<Tail> {
    config.validate()?;

    let path = path.as_ref().to_path_buf();
    let file = if config.must_exist {
        Some(File::open(&path).await?)
    } else {
        None
    };

    let (tx, rx) = mpsc::channel(LINES_CAPACITY);
    let (seal_tx, seal_rx) = watch::channel(false);
    let token = CancellationToken::new();
    let shared = Arc::new(Shared::default());
    let limiter = config.rate_limiter.take();

    let engine = TailEngine {
        path: path.clone(),
        config,
        tx,
        token: token.clone(),
        seal: seal_rx,
        shared: Arc::clone(&shared),
        limiter,
        file,
        reader: None,
        watcher: None,
        changes: None,
        pending: None,
        line_num: 0,
        offset: 0,
        first_open: true,
    };

    let task = tokio::spawn(engine.run());

    Ok(Tail {
        filename: path,
        rx,
        token,
        seal: seal_tx,
        shared,
        task: Some(task),
    })
}

#[derive(Default)]
struct Shared {
    /// Byte offset of the next unread byte in the current file.
    offset: AtomicU64,
    /// True while the producer holds an open, seekable file.
    open: AtomicBool,
    /// Terminal error recorded by the producer.
    err: Mutex<Option<Error>>,
}

/// Consumer handle for a running tail.
///
/// Records are taken with [`recv`](Tail::recv) or through the
/// [`futures::Stream`] impl; the stream ends once the engine terminates.
pub struct Tail {
    pub filename: PathBuf,
    rx: mpsc::Receiver<Line>,
    token: CancellationToken,
    seal: watch::Sender<bool>,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl Tail {
    /// Receives the next record; `None` once the engine has terminated.
    pub async fn recv(&mut self) -> Option<Line> {
        self.rx.recv().await
    }

    /// Requests an immediate stop. The producer observes it at its next
    /// suspension point; await [`wait`](Tail::wait) to join it.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Seals the tail: once the current file is at EOF the engine terminates
    /// instead of waiting for more data.
    pub fn stop_at_eof(&self) {
        let _ = self.seal.send(true);
    }

    /// Waits for the producer task to finish and returns its terminal error,
    /// with the cooperative-stop sentinel folded to `Ok`.
    pub async fn wait(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(message = "tail task failed", ?err);
            }
        }
        match self.err() {
            None | Some(Error::Stopped) => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// The error the engine terminated with, if any. [`Error::Stopped`]
    /// indicates a cooperative stop, not a failure.
    pub fn err(&self) -> Option<Error> {
        self.shared.err.lock().unwrap().clone()
    }

    /// Byte offset of the next unread byte in the current file.
    ///
    /// Only meaningful once the producer has quiesced (it is blocked at EOF,
    /// or [`wait`](Tail::wait) returned); concurrent calls race with the
    /// reader. Errors once the file is closed, and always for pipes.
    pub fn tell(&self) -> Result<u64> {
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(self.shared.offset.load(Ordering::Acquire))
    }

    /// Stops the tail and detaches from it without waiting.
    pub fn cleanup(&mut self) {
        self.token.cancel();
        self.task = None;
    }
}

impl Stream for Tail {
    type Item = Line;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Line>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

/// Engine states; [`TailEngine::drive`] handles exactly one per iteration.
enum State {
    Starting,
    Opening,
    Reading,
    Waiting,
    Rotating,
    Stopping,
}

/// What woke the engine out of the Waiting state.
enum Wake {
    Stop,
    Sealed,
    Deleted,
    Truncated,
    Modified,
    WatcherGone,
}

/// Buffered fragments of a not-yet-terminated line (`complete_lines` mode).
struct Pending {
    start_offset: u64,
    bytes: Vec<u8>,
}

struct TailEngine {
    path: PathBuf,
    config: Config,
    tx: mpsc::Sender<Line>,
    token: CancellationToken,
    seal: watch::Receiver<bool>,
    shared: Arc<Shared>,
    limiter: Option<LeakyBucket>,

    file: Option<File>,
    reader: Option<LineReader>,
    watcher: Option<Box<dyn FileWatcher>>,
    changes: Option<FileChanges>,
    pending: Option<Pending>,
    line_num: u64,
    /// Next unread byte in the current file.
    offset: u64,
    first_open: bool,
}

impl TailEngine {
    async fn run(mut self) {
        let result = self.drive().await;

        match &result {
            Ok(()) => debug!(message = "tail finished", path = %self.path.display()),
            Err(Error::Stopped) => debug!(message = "tail stopped", path = %self.path.display()),
            Err(err) => {
                warn!(message = "tail terminated", path = %self.path.display(), %err);
                let line = Line {
                    text: String::new(),
                    num: self.line_num,
                    offset: self.offset,
                    time: SystemTime::now(),
                    err: Some(err.clone()),
                };
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = self.tx.send(line) => {}
                }
            }
        }

        if let Err(err) = result {
            *self.shared.err.lock().unwrap() = Some(err);
        }

        self.reader = None;
        self.file = None;
        self.shared.open.store(false, Ordering::Release);
        if let Some(mut watcher) = self.watcher.take() {
            watcher.close().await;
        }
        // Dropping the engine drops `tx`, which closes the stream.
    }

    async fn drive(&mut self) -> Result<()> {
        let mut state = State::Starting;

        loop {
            state = match state {
                State::Starting => State::Opening,
                State::Opening => self.open_file().await?,
                State::Reading => self.read_lines().await?,
                State::Waiting => self.wait_for_changes().await?,
                State::Rotating => self.rotate().await?,
                State::Stopping => return Ok(()),
            };
        }
    }

    /// Opens the target file (waiting for it to appear when allowed), applies
    /// the initial location and arms change notifications.
    async fn open_file(&mut self) -> Result<State> {
        let mut file = match self.file.take() {
            Some(file) => file,
            None => loop {
                match File::open(&self.path).await {
                    Ok(file) => break file,
                    Err(err)
                        if err.kind() == ErrorKind::NotFound
                            && !self.config.must_exist
                            && !self.config.pipe =>
                    {
                        info!(message = "waiting for file to appear", path = %self.path.display());
                        let token = self.token.clone();
                        self.watcher_mut().block_until_exists(&token).await?;
                    }
                    Err(err) => return Err(err.into()),
                }
            },
        };

        self.offset = 0;
        if !self.config.pipe {
            if self.first_open {
                if let Some(location) = self.config.location {
                    self.offset = file.seek(location).await?;
                }
            }
            self.shared.open.store(true, Ordering::Release);
        }
        self.shared.offset.store(self.offset, Ordering::Release);

        if self.config.follow && !self.config.pipe {
            let size = file.metadata().await?.len();
            let token = self.token.clone();
            let changes = self.watcher_mut().change_events(&token, size)?;
            self.changes = Some(changes);
        }

        self.reader = Some(LineReader::new(file, self.config.max_line_size));
        self.pending = None;
        self.first_open = false;

        Ok(State::Reading)
    }

    /// Reads and emits records until EOF.
    async fn read_lines(&mut self) -> Result<State> {
        loop {
            if self.token.is_cancelled() {
                return Err(Error::Stopped);
            }

            let Some(reader) = self.reader.as_mut() else {
                return Ok(State::Stopping);
            };

            match reader.read_line().await? {
                Some(chunk) => {
                    let line_start = self.offset;
                    self.offset += chunk.consumed();
                    self.shared.offset.store(self.offset, Ordering::Release);
                    self.emit(chunk, line_start).await?;
                }
                None => return self.at_eof().await,
            }
        }
    }

    async fn at_eof(&mut self) -> Result<State> {
        if *self.seal.borrow() {
            self.flush_pending().await?;
            return Err(Error::Stopped);
        }

        if !self.config.follow || self.config.pipe {
            self.flush_pending().await?;
            return Ok(State::Stopping);
        }

        Ok(State::Waiting)
    }

    /// Blocks at EOF until the watcher reports a change, the tail is sealed,
    /// or stop is requested.
    async fn wait_for_changes(&mut self) -> Result<State> {
        let wake = {
            let Self {
                token,
                seal,
                changes,
                ..
            } = self;
            let Some(changes) = changes.as_mut() else {
                return Ok(State::Stopping);
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => Wake::Stop,
                changed = seal.changed() => match changed {
                    Ok(()) => Wake::Sealed,
                    Err(_) => Wake::Stop,
                },
                event = changes.deleted.recv() => match event {
                    Some(()) => Wake::Deleted,
                    None => Wake::WatcherGone,
                },
                event = changes.truncated.recv() => match event {
                    Some(()) => Wake::Truncated,
                    None => Wake::WatcherGone,
                },
                event = changes.modified.recv() => match event {
                    Some(()) => Wake::Modified,
                    None => Wake::WatcherGone,
                },
            }
        };

        match wake {
            Wake::Stop => Err(Error::Stopped),
            Wake::Sealed => {
                if *self.seal.borrow() {
                    self.flush_pending().await?;
                    Err(Error::Stopped)
                } else {
                    Ok(State::Waiting)
                }
            }
            Wake::Deleted => {
                if self.config.re_open {
                    info!(
                        message = "re-opening moved or deleted file",
                        path = %self.path.display()
                    );
                    Ok(State::Rotating)
                } else {
                    info!(
                        message = "stopping tail as file no longer exists",
                        path = %self.path.display()
                    );
                    Ok(State::Stopping)
                }
            }
            Wake::Truncated => {
                debug!(message = "file truncated, seeking to start", path = %self.path.display());
                if let Some(reader) = self.reader.as_mut() {
                    reader.rewind().await?;
                }
                self.offset = 0;
                self.shared.offset.store(0, Ordering::Release);
                self.pending = None;
                Ok(State::Reading)
            }
            Wake::Modified => Ok(State::Reading),
            Wake::WatcherGone => {
                warn!(message = "watcher stopped unexpectedly", path = %self.path.display());
                Ok(State::Stopping)
            }
        }
    }

    /// Replaces a rotated file: drains the old handle, then waits for a new
    /// file to appear under the watched name.
    async fn rotate(&mut self) -> Result<State> {
        // The old inode stays readable until the handle is closed; pick up
        // whatever the writer appended before the rename.
        if let Some(mut reader) = self.reader.take() {
            loop {
                if self.token.is_cancelled() {
                    return Err(Error::Stopped);
                }
                let Some(chunk) = reader.read_line().await? else {
                    break;
                };
                let line_start = self.offset;
                self.offset += chunk.consumed();
                self.shared.offset.store(self.offset, Ordering::Release);
                self.emit(chunk, line_start).await?;
            }
        }

        // A fragment interrupted by rotation was never a complete line.
        self.pending = None;
        self.shared.open.store(false, Ordering::Release);

        if let Some(mut watcher) = self.watcher.take() {
            watcher.close().await;
        }
        self.changes = None;

        let token = self.token.clone();
        self.watcher_mut().block_until_exists(&token).await?;

        Ok(State::Opening)
    }

    /// Routes one chunk through line assembly and on to the consumer.
    async fn emit(&mut self, chunk: Chunk, line_start: u64) -> Result<()> {
        if self.config.complete_lines {
            let mut pending = self.pending.take().unwrap_or(Pending {
                start_offset: line_start,
                bytes: Vec::new(),
            });
            pending.bytes.extend_from_slice(&chunk.bytes);

            if !chunk.ended_with_newline {
                self.pending = Some(pending);
                return Ok(());
            }

            self.send_text(&pending.bytes, pending.start_offset).await
        } else {
            self.send_text(&chunk.bytes, line_start).await
        }
    }

    async fn flush_pending(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            if !pending.bytes.is_empty() {
                self.send_text(&pending.bytes, pending.start_offset).await?;
            }
        }
        Ok(())
    }

    /// Emits `bytes` as one record, or several when it exceeds the size cap,
    /// pouring one rate-limiter unit per record.
    async fn send_text(&mut self, bytes: &[u8], start_offset: u64) -> Result<()> {
        let text = String::from_utf8_lossy(bytes);
        let max = self.config.max_line_size;

        let parts: Vec<String> = if max > 0 && text.chars().count() > max {
            partition_string(&text, max)
        } else {
            vec![text.into_owned()]
        };

        let mut offset = start_offset;
        for part in parts {
            let len = part.len() as u64;
            self.line_num += 1;
            self.send(Line {
                text: part,
                num: self.line_num,
                offset,
                time: SystemTime::now(),
                err: None,
            })
            .await?;
            offset += len;

            self.pour_one(offset).await?;
        }

        Ok(())
    }

    /// Pours one unit, stalling until the bucket drains when it is full. The
    /// stall is announced with a single in-band diagnostic record.
    async fn pour_one(&mut self, offset: u64) -> Result<()> {
        let accepted = match self.limiter.as_mut() {
            None => return Ok(()),
            Some(bucket) => bucket.pour(1),
        };
        if accepted {
            return Ok(());
        }

        warn!(message = "leaky bucket full", path = %self.path.display());
        self.send(Line {
            text: RATE_LIMIT_MESSAGE.to_string(),
            num: self.line_num,
            offset,
            time: SystemTime::now(),
            err: Some(Error::RateLimited),
        })
        .await?;

        let stall = match self.limiter.as_mut() {
            Some(bucket) => {
                let drained_at = bucket.drained_at();
                drained_at
                    .duration_since((bucket.now)())
                    .unwrap_or_default()
            }
            None => Duration::ZERO,
        };
        tokio::select! {
            _ = self.token.cancelled() => return Err(Error::Stopped),
            _ = tokio::time::sleep(stall) => {}
        }

        // The bucket has fully drained, so this pour accounts for the record
        // that triggered the stall.
        if let Some(bucket) = self.limiter.as_mut() {
            bucket.pour(1);
        }
        debug!(message = "resuming tailing", path = %self.path.display());

        Ok(())
    }

    async fn send(&mut self, line: Line) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Stopped),
            sent = self.tx.send(line) => sent.map_err(|_| Error::Stopped),
        }
    }

    fn watcher_mut(&mut self) -> &mut Box<dyn FileWatcher> {
        self.watcher.get_or_insert_with(|| {
            new_watcher(&self.path, self.config.poll, self.config.poll_interval)
        })
    }
}
