use core::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hash::{ContentDigest, ContentHasher, HashAlgorithm};

/// Identifies an upload: the resolved target directory plus the file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub directory: PathBuf,
    pub name: String,
}

impl SessionKey {
    pub fn new(directory: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Receiving = 0,
    Finalizing = 1,
    Committed = 2,
    Rejected = 3,
    Cancelled = 4,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Receiving,
            1 => Self::Finalizing,
            2 => Self::Committed,
            3 => Self::Rejected,
            _ => Self::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Rejected | Self::Cancelled)
    }
}

/// One in-flight upload.
///
/// Every state change goes through a compare-and-swap on `state`, so of the
/// finalize, timeout and cancel paths exactly one gets to tear a session down.
/// Sink and hasher live behind a single async lock and are only touched in
/// chunk order.
pub struct UploadSession {
    id: Uuid,
    key: SessionKey,
    path: PathBuf,
    chunks_needed: u64,
    state: AtomicU8,
    io: Mutex<SessionIo>,
    activity: Arc<Notify>,
    cancel: CancellationToken,
}

struct SessionIo {
    sink: Option<tokio::fs::File>,
    hasher: Option<ContentHasher>,
    /// Set once this session created the destination file.
    created_file: bool,
    next_chunk: u64,
    bytes_written: u64,
}

impl UploadSession {
    pub fn new(key: SessionKey, chunks_needed: u64, algorithm: HashAlgorithm) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: key.path(),
            key,
            chunks_needed,
            state: AtomicU8::new(SessionState::Receiving as u8),
            io: Mutex::new(SessionIo {
                sink: None,
                hasher: Some(ContentHasher::new(algorithm)),
                created_file: false,
                next_chunk: 0,
                bytes_written: 0,
            }),
            activity: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunks_needed(&self) -> u64 {
        self.chunks_needed
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `from -> to` only if the session is still in `from`.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves a receiving or finalizing session to `Cancelled`.
    pub fn abort(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match SessionState::from_u8(raw) {
                    SessionState::Receiving | SessionState::Finalizing => {
                        Some(SessionState::Cancelled as u8)
                    }
                    _ => None,
                }
            })
            .is_ok()
    }

    /// Stops the inactivity timer for good once it resolves.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn activity(&self) -> Arc<Notify> {
        Arc::clone(&self.activity)
    }

    /// Rearms the inactivity timer.
    pub fn touch(&self) {
        self.activity.notify_one();
    }

    pub async fn bytes_written(&self) -> u64 {
        self.io.lock().await.bytes_written
    }

    /// Writes chunk `index` to the sink and folds it into the running hash.
    pub async fn append(&self, index: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.io.lock().await;
        let inner = &mut *guard;

        if self.state() != SessionState::Receiving {
            return Err(Error::SessionUnavailable(self.key.to_string()));
        }
        if index != inner.next_chunk {
            // a second chunk 0 means someone else already started this upload
            if index == 0 {
                return Err(Error::NameConflict(self.key.name.clone()));
            }
            return Err(Error::OutOfSequence {
                expected: inner.next_chunk,
                received: index,
            });
        }

        if inner.sink.is_none() {
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .await;
            match opened {
                Ok(file) => {
                    inner.created_file = true;
                    inner.sink = Some(file);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    self.transition(SessionState::Receiving, SessionState::Cancelled);
                    self.cancel.cancel();
                    return Err(Error::NameConflict(self.key.name.clone()));
                }
                Err(err) => return Err(err.into()),
            }
        }

        let (Some(sink), Some(hasher)) = (inner.sink.as_mut(), inner.hasher.as_mut()) else {
            return Err(Error::SessionUnavailable(self.key.to_string()));
        };
        sink.write_all(data).await?;
        hasher.update(data);

        inner.next_chunk += 1;
        inner.bytes_written += data.len() as u64;
        self.touch();
        Ok(())
    }

    /// Enters `Finalizing`: stops the timer, closes the sink and returns the digest.
    pub async fn seal(&self) -> Result<ContentDigest> {
        let mut inner = self.io.lock().await;

        if !self.transition(SessionState::Receiving, SessionState::Finalizing) {
            return Err(Error::SessionUnavailable(self.key.to_string()));
        }
        self.cancel.cancel();

        if let Some(mut sink) = inner.sink.take() {
            sink.flush().await?;
        }
        let hasher = inner
            .hasher
            .take()
            .ok_or_else(|| Error::SessionUnavailable(self.key.to_string()))?;
        Ok(hasher.finalize())
    }

    /// Marks a finalizing session as `Committed` or `Rejected`.
    pub fn finish(&self, outcome: SessionState) -> bool {
        self.transition(SessionState::Finalizing, outcome)
    }

    /// Drops the sink unflushed and deletes the partial file, if this session made one.
    pub async fn discard(&self) -> Result<()> {
        self.cancel.cancel();

        let mut inner = self.io.lock().await;
        drop(inner.sink.take());
        inner.hasher.take();

        if std::mem::take(&mut inner.created_file) {
            match tokio::fs::remove_file(&self.path).await {
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                other => other?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("chunks_needed", &self.chunks_needed)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_in(dir: &Path, name: &str, chunks: u64) -> UploadSession {
        UploadSession::new(SessionKey::new(dir, name), chunks, HashAlgorithm::Sha1)
    }

    #[tokio::test]
    async fn appends_in_order_and_seals() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session_in(tmp.path(), "out.bin", 2);

        session.append(0, b"Hello").await.unwrap();
        session.append(1, b" World").await.unwrap();
        assert_eq!(session.bytes_written().await, 11);

        let digest = session.seal().await.unwrap();
        assert_eq!(digest, ContentDigest::of(HashAlgorithm::Sha1, b"Hello World"));
        assert_eq!(session.state(), SessionState::Finalizing);
        assert!(session.cancel_token().is_cancelled());

        let written = tokio::fs::read(tmp.path().join("out.bin")).await.unwrap();
        assert_eq!(written, b"Hello World");

        assert!(session.finish(SessionState::Committed));
        assert_eq!(session.state(), SessionState::Committed);
    }

    #[tokio::test]
    async fn rejects_out_of_sequence_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session_in(tmp.path(), "out.bin", 3);

        session.append(0, b"a").await.unwrap();
        assert!(matches!(
            session.append(2, b"c").await,
            Err(Error::OutOfSequence { expected: 1, received: 2 })
        ));
        assert!(matches!(
            session.append(0, b"a").await,
            Err(Error::NameConflict(_))
        ));
        session.append(1, b"b").await.unwrap();
        assert_eq!(session.state(), SessionState::Receiving);
    }

    #[tokio::test]
    async fn existing_file_is_never_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("taken.txt"), "original").unwrap();
        let session = session_in(tmp.path(), "taken.txt", 1);

        assert!(matches!(
            session.append(0, b"intruder").await,
            Err(Error::NameConflict(_))
        ));
        assert_eq!(session.state(), SessionState::Cancelled);

        session.discard().await.unwrap();
        let kept = std::fs::read_to_string(tmp.path().join("taken.txt")).unwrap();
        assert_eq!(kept, "original");
    }

    #[tokio::test]
    async fn only_one_terminal_transition_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session_in(tmp.path(), "race.bin", 2);
        session.append(0, b"partial").await.unwrap();

        assert!(session.transition(SessionState::Receiving, SessionState::Cancelled));
        assert!(matches!(session.seal().await, Err(Error::SessionUnavailable(_))));
        assert!(!session.abort());
        assert!(matches!(
            session.append(1, b"late").await,
            Err(Error::SessionUnavailable(_))
        ));

        session.discard().await.unwrap();
        assert!(!tmp.path().join("race.bin").exists());
    }

    #[tokio::test]
    async fn abort_covers_finalizing_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session_in(tmp.path(), "f.bin", 1);
        session.append(0, b"x").await.unwrap();
        session.seal().await.unwrap();

        assert!(session.abort());
        assert!(!session.finish(SessionState::Committed));
        assert_eq!(session.state(), SessionState::Cancelled);
    }
}
