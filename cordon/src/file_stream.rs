// SPDX-License-Identifier: AGPL-3.0-only

//! A blocking byte reader over a file that may still be growing, with
//! three cancellation edges (explicit close, writer-done, external
//! context) that collapse into a single "stop reading" decision.

use {
    crate::error::{Error, ResultExt},
    cordon_os as os,
    nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify},
    std::{
        fs::File,
        io::Read as _,
        os::unix::io::AsRawFd,
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        time::{Duration, Instant},
    },
};

/// How often [`FileStream`] wakes up on its own to re-check cancellation
/// flags that have no associated file descriptor. Bounds the latency of
/// `Close`/`DisableTail`/context-cancel without needing an eventfd per edge.
const POLL_QUANTUM: Duration = Duration::from_millis(200);

/// A one-shot, level-triggered cancellation flag, shared by whoever fires
/// it and whoever waits on it.
#[derive(Default)]
struct Edge(AtomicBool);

impl Edge
{
    fn fire(&self)
    {
        self.0.store(true, Ordering::Release);
    }

    fn is_fired(&self) -> bool
    {
        self.0.load(Ordering::Acquire)
    }
}

struct ContextInner
{
    cancelled: Edge,
    deadline: Option<Instant>,
}

/// An externally observable cancellation source, with an optional deadline.
///
/// Cloning shares the same underlying flag: cancelling any clone cancels
/// every clone.
#[derive(Clone)]
pub struct Context
{
    inner: Arc<ContextInner>,
}

impl Context
{
    /// A context that is never cancelled on its own.
    pub fn background() -> Self
    {
        Self{inner: Arc::new(ContextInner{cancelled: Edge::default(), deadline: None})}
    }

    /// A context that is automatically cancelled after `timeout` elapses.
    pub fn with_timeout(timeout: Duration) -> Self
    {
        Self{inner: Arc::new(ContextInner{
            cancelled: Edge::default(),
            deadline: Some(Instant::now() + timeout),
        })}
    }

    /// Cancel this context, and every clone of it.
    pub fn cancel(&self)
    {
        self.inner.cancelled.fire();
    }

    /// Whether this context has been cancelled, explicitly or by deadline.
    pub fn is_cancelled(&self) -> bool
    {
        self.inner.cancelled.is_fired()
            || self.inner.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn poll_timeout(&self, quantum: Duration) -> Duration
    {
        match self.inner.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                remaining.min(quantum)
            },
            None => quantum,
        }
    }
}

/// A blocking, cancellable reader over a (possibly still-growing) file.
pub struct FileStream
{
    file: Mutex<Option<File>>,
    inotify: Inotify,
    tail: AtomicBool,
    done: Edge,
    log_complete: Edge,
    context: Context,
    closed: AtomicBool,
}

impl FileStream
{
    /// Open `path` for reading from byte zero, registering it with the
    /// kernel's file-change watcher. `tail` selects the initial posture.
    pub fn open(path: &Path, tail: bool, context: Context) -> Result<Self, Error>
    {
        let file = File::open(path).context(format!("opening capture file {}", path.display()))?;

        let inotify = Inotify::init(InitFlags::IN_CLOEXEC)
            .context("initializing inotify")?;
        inotify.add_watch(path, AddWatchFlags::IN_MODIFY)
            .context(format!("watching {}", path.display()))?;

        Ok(Self{
            file: Mutex::new(Some(file)),
            inotify,
            tail: AtomicBool::new(tail),
            done: Edge::default(),
            log_complete: Edge::default(),
            context,
            closed: AtomicBool::new(false),
        })
    }

    /// Whether this stream is presently in tail mode.
    pub fn tail_enabled(&self) -> bool
    {
        self.tail.load(Ordering::Acquire)
    }

    /// Attempt to fill `buf`. Returns the number of bytes read and whether
    /// the stream has reached end-of-stream (distinct from a transient
    /// empty read, which never happens here: this call blocks instead).
    pub fn read(&self, buf: &mut [u8]) -> Result<(usize, bool), Error>
    {
        loop {
            if self.should_stop() {
                return Ok((0, true));
            }

            let n = {
                let mut guard = self.file.lock().unwrap();
                match guard.as_mut() {
                    Some(file) => file.read(buf).context("reading capture file")?,
                    None => return Ok((0, true)),
                }
            };

            if n > 0 {
                return Ok((n, false));
            }

            // EOF.
            if self.tail_enabled() {
                self.wait_for_changes()?;
                continue;
            }

            self.close()?;
            return Ok((0, true));
        }
    }

    fn should_stop(&self) -> bool
    {
        self.done.is_fired() || self.context.is_cancelled()
    }

    /// Block until a write is observed on the file, or any cancellation
    /// edge fires. Wakes periodically on its own so that edges without a
    /// file descriptor (`done`, `log_complete`, an externally-cancelled
    /// context) are still noticed promptly.
    fn wait_for_changes(&self) -> Result<(), Error>
    {
        loop {
            if self.should_stop() || self.log_complete.is_fired() {
                return Ok(());
            }

            let timeout = self.context.poll_timeout(POLL_QUANTUM);
            let mut fds = [libc::pollfd{
                fd: self.inotify.as_raw_fd(),
                events: os::POLLIN,
                revents: 0,
            }];
            let ready = os::poll(&mut fds, timeout.as_millis() as libc::c_int)
                .context("polling inotify watch")?;

            if ready > 0 {
                // Drain the queue; we only care that *something* happened.
                let _ = self.inotify.read_events();
                return Ok(());
            }
        }
    }

    /// One-shot: stop tailing and unblock any in-flight wait so it can
    /// drain the remaining bytes and return EOF.
    pub fn disable_tail(&self)
    {
        self.tail.store(false, Ordering::Release);
        self.log_complete.fire();
    }

    /// Idempotent. Fires `done`, then closes the watcher and file handle.
    /// Errors closing the file handle are returned; errors closing the
    /// watcher are discarded, per the design's cleanup-ordering contract.
    pub fn close(&self) -> Result<(), Error>
    {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.done.fire();

        let file = self.file.lock().unwrap().take();
        if let Some(file) = file {
            let fd = std::os::unix::io::OwnedFd::from(file);
            nix::unistd::close(std::os::unix::io::IntoRawFd::into_raw_fd(fd))
                .context("closing capture file handle")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use std::io::Write;

    #[test]
    fn non_tail_stream_auto_closes_at_eof()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.out");
        std::fs::write(&path, b"banana").unwrap();

        let stream = FileStream::open(&path, false, Context::background()).unwrap();
        let mut buf = [0u8; 100];
        let (n, eof) = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"banana");
        assert!(!eof);

        let (n, eof) = stream.read(&mut buf).unwrap();
        assert_eq!(n, 0);
        assert!(eof);
    }

    #[test]
    fn tail_stream_unblocks_on_log_complete()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.out");
        std::fs::write(&path, b"banana").unwrap();

        let stream = Arc::new(FileStream::open(&path, true, Context::background()).unwrap());
        let mut buf = [0u8; 100];
        let (n, eof) = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"banana");
        assert!(!eof);

        let waiter = {
            let stream = Arc::clone(&stream);
            std::thread::spawn(move || {
                let mut buf = [0u8; 100];
                stream.read(&mut buf).unwrap()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        stream.disable_tail();

        let (n, eof) = waiter.join().unwrap();
        assert_eq!(n, 0);
        assert!(eof);
    }

    #[test]
    fn context_deadline_unblocks_idle_tail_stream()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.out");
        File::create(&path).unwrap();

        let context = Context::with_timeout(Duration::from_millis(300));
        let stream = FileStream::open(&path, true, context).unwrap();

        let mut buf = [0u8; 16];
        let started = Instant::now();
        let (n, eof) = stream.read(&mut buf).unwrap();
        assert_eq!(n, 0);
        assert!(eof);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn read_after_close_is_always_eof()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.out");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"x").unwrap();

        let stream = FileStream::open(&path, true, Context::background()).unwrap();
        stream.close().unwrap();

        let mut buf = [0u8; 8];
        let (n, eof) = stream.read(&mut buf).unwrap();
        assert_eq!(n, 0);
        assert!(eof);
    }
}
