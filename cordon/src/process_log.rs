// SPDX-License-Identifier: AGPL-3.0-only

//! Owns one command's capture file and the set of readers tailing it.

use {
    crate::{
        error::{Error, ResultExt},
        file_stream::{Context, FileStream},
    },
    std::{
        collections::HashMap,
        fs::{self, File, OpenOptions},
        os::unix::io::AsRawFd,
        path::{Path, PathBuf},
        sync::{atomic::{AtomicU64, Ordering}, Arc, Mutex},
    },
    tracing::debug,
};

/// A reader handle returned by [`ProcessLog::new_log_stream`].
///
/// Holding this keeps the underlying [`FileStream`] alive; pass it back to
/// [`ProcessLog::close_log_stream`] to unregister and close it explicitly.
pub struct LogStreamHandle
{
    id: u64,
    stream: Arc<FileStream>,
}

impl LogStreamHandle
{
    /// Borrow the underlying stream.
    pub fn stream(&self) -> &FileStream
    {
        &self.stream
    }
}

/// One command's capture file and its live readers.
pub struct ProcessLog
{
    command_id: String,
    path: PathBuf,
    write_handle: File,
    readers: Mutex<HashMap<u64, std::sync::Weak<FileStream>>>,
    next_reader_id: AtomicU64,
    closed: Mutex<bool>,
}

impl ProcessLog
{
    /// Create a fresh, empty capture file under `capture_dir`, named to
    /// include `command_id`.
    pub fn new(capture_dir: &Path, command_id: &str) -> Result<Self, Error>
    {
        let path = capture_dir.join(format!("cordon-command-{command_id}.out"));
        let write_handle = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .context(format!("creating capture file {}", path.display()))?;

        debug!(%command_id, path = %path.display(), "process log created");

        Ok(Self{
            command_id: command_id.to_owned(),
            path,
            write_handle,
            readers: Mutex::new(HashMap::new()),
            next_reader_id: AtomicU64::new(0),
            closed: Mutex::new(false),
        })
    }

    /// Path to the capture file.
    pub fn path(&self) -> &Path
    {
        &self.path
    }

    /// Raw file descriptor the launcher should dup2 the child's stdout and
    /// stderr onto.
    pub fn write_fd(&self) -> std::os::unix::io::RawFd
    {
        self.write_handle.as_raw_fd()
    }

    /// Open a new, independent reader positioned at the start of the file.
    pub fn new_log_stream(&self, context: Context, tail: bool) -> Result<LogStreamHandle, Error>
    {
        let stream = Arc::new(FileStream::open(&self.path, tail, context)?);
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        self.readers.lock().unwrap().insert(id, Arc::downgrade(&stream));
        debug!(command_id = %self.command_id, reader_id = id, tail, "log stream opened");
        Ok(LogStreamHandle{id, stream})
    }

    /// Remove `handle` from the reader set and close its stream.
    pub fn close_log_stream(&self, handle: LogStreamHandle) -> Result<(), Error>
    {
        let removed = self.readers.lock().unwrap().remove(&handle.id);
        if removed.is_none() {
            return Err(Error::other(
                "unknown log stream reader",
                std::io::Error::new(std::io::ErrorKind::NotFound, handle.id.to_string()),
            ));
        }
        handle.stream.close()
    }

    /// Tell every currently-registered reader that the writer is done:
    /// disables tailing so in-flight reads drain and then return EOF.
    pub fn log_complete(&self)
    {
        let readers = self.readers.lock().unwrap();
        for weak in readers.values() {
            if let Some(stream) = weak.upgrade() {
                stream.disable_tail();
            }
        }
        debug!(command_id = %self.command_id, "log complete signaled");
    }

    /// Idempotent. Closes the write handle, deletes the capture file,
    /// closes every reader, and aggregates any errors.
    pub fn close(&self) -> Result<(), Error>
    {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return Ok(());
        }
        *closed = true;

        let mut first_error = None;

        let readers = std::mem::take(&mut *self.readers.lock().unwrap());
        for weak in readers.into_values() {
            if let Some(stream) = weak.upgrade() {
                if let Err(err) = stream.close() {
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                first_error.get_or_insert(Error::other(
                    format!("removing capture file {}", self.path.display()),
                    err,
                ));
            }
        }

        debug!(command_id = %self.command_id, "process log closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::file_stream::Context;

    #[test]
    fn tail_reader_drains_and_signals_eof_after_log_complete()
    {
        let dir = tempfile::tempdir().unwrap();
        let log = ProcessLog::new(dir.path(), "cmd-1").unwrap();
        fs::write(log.path(), b"hello").unwrap();

        let handle = log.new_log_stream(Context::background(), true).unwrap();
        let mut buf = [0u8; 32];
        let (n, eof) = handle.stream().read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(!eof);

        log.log_complete();

        let (n, eof) = handle.stream().read(&mut buf).unwrap();
        assert_eq!(n, 0);
        assert!(eof);
    }

    #[test]
    fn close_log_stream_rejects_a_handle_from_another_log()
    {
        let dir = tempfile::tempdir().unwrap();
        let log_a = ProcessLog::new(dir.path(), "cmd-a").unwrap();
        let log_b = ProcessLog::new(dir.path(), "cmd-b").unwrap();

        let handle = log_a.new_log_stream(Context::background(), false).unwrap();
        let err = log_b.close_log_stream(handle).unwrap_err();
        assert!(err.to_string().contains("unknown log stream reader"));
    }

    #[test]
    fn close_removes_capture_file_and_is_idempotent()
    {
        let dir = tempfile::tempdir().unwrap();
        let log = ProcessLog::new(dir.path(), "cmd-1").unwrap();
        let path = log.path().to_path_buf();
        assert!(path.exists());

        log.close().unwrap();
        assert!(!path.exists());
        log.close().unwrap();
    }
}
