//! Process-wide table of live upload sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::session::{SessionKey, SessionState, UploadSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// No chunk arrived within the inactivity window.
    Timeout,
    /// The client asked for the upload to be dropped.
    Requested,
}

/// At most one live [`UploadSession`] per [`SessionKey`].
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Arc<UploadSession>>>,
    inactivity_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(inactivity_timeout: Duration) -> Self {
        Self {
            sessions: Default::default(),
            inactivity_timeout,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<UploadSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// Returns the live session for `key`, starting one if `chunk_index` is 0.
    ///
    /// A later chunk with no live session belongs to an upload that timed out
    /// or was cancelled, and is refused.
    pub fn acquire_or_create(
        self: &Arc<Self>,
        key: SessionKey,
        chunk_index: u64,
        chunks_needed: u64,
        algorithm: HashAlgorithm,
    ) -> Result<Arc<UploadSession>> {
        let session = {
            let mut sessions = self.sessions();
            if let Some(session) = sessions.get(&key) {
                return Ok(Arc::clone(session));
            }
            if chunk_index != 0 {
                return Err(Error::SessionUnavailable(key.to_string()));
            }

            let session = Arc::new(UploadSession::new(key.clone(), chunks_needed, algorithm));
            sessions.insert(key, Arc::clone(&session));
            session
        };

        info!(
            upload_id = %session.id(),
            file = %session.key(),
            chunks_needed,
            "upload session created"
        );
        tokio::spawn(Arc::clone(self).watch(Arc::downgrade(&session)));

        Ok(session)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<UploadSession>> {
        self.sessions().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Frees the slot held by `session`.
    ///
    /// Only removes the entry if it is still this very session, so a late
    /// release never evicts a newer upload under the same key.
    pub fn release(&self, session: &Arc<UploadSession>) -> bool {
        let mut sessions = self.sessions();
        let is_current = sessions
            .get(session.key())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if is_current {
            sessions.remove(session.key());
        }
        is_current
    }

    /// Cancels a receiving session, deleting its partial file.
    ///
    /// Returns `false` if another path (finalize, timeout, an earlier cancel)
    /// already owns the session.
    pub async fn cancel(&self, session: &Arc<UploadSession>, reason: CancelReason) -> Result<bool> {
        if !session.transition(SessionState::Receiving, SessionState::Cancelled) {
            debug!(upload_id = %session.id(), ?reason, "cancel lost to another path");
            return Ok(false);
        }
        info!(upload_id = %session.id(), file = %session.key(), ?reason, "upload cancelled");

        // the CAS above made this path the sole owner, so a new upload may take the slot now
        self.release(session);
        session.discard().await.map(|()| true)
    }

    /// Tears a session down after a failure, from either `Receiving` or `Finalizing`.
    pub async fn abandon(&self, session: &Arc<UploadSession>) -> Result<()> {
        self.release(session);
        if session.abort() {
            warn!(upload_id = %session.id(), file = %session.key(), "upload abandoned");
            session.discard().await?;
        }
        Ok(())
    }

    /// Cancels the session once it sees no activity for the inactivity window.
    async fn watch(self: Arc<Self>, session: Weak<UploadSession>) {
        let Some((token, activity)) = session
            .upgrade()
            .map(|session| (session.cancel_token(), session.activity()))
        else {
            return;
        };

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = activity.notified() => continue,
                _ = tokio::time::sleep(self.inactivity_timeout) => break,
            }
        }

        let Some(session) = session.upgrade() else {
            return;
        };
        warn!(
            upload_id = %session.id(),
            file = %session.key(),
            timeout = ?self.inactivity_timeout,
            "upload timed out"
        );
        if let Err(err) = self.cancel(&session, CancelReason::Timeout).await {
            error!(upload_id = %session.id(), "failed to clean up timed out upload: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn key(dir: &Path, name: &str) -> SessionKey {
        SessionKey::new(dir, name)
    }

    fn registry(timeout: Duration) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(timeout))
    }

    #[tokio::test]
    async fn later_chunks_need_a_live_session() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(Duration::from_secs(60));

        let err = registry
            .acquire_or_create(key(tmp.path(), "a.bin"), 3, 5, HashAlgorithm::Sha1)
            .unwrap_err();
        assert!(matches!(err, Error::SessionUnavailable(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn existing_session_is_shared() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(Duration::from_secs(60));

        let first = registry
            .acquire_or_create(key(tmp.path(), "a.bin"), 0, 2, HashAlgorithm::Sha1)
            .unwrap();
        let again = registry
            .acquire_or_create(key(tmp.path(), "a.bin"), 0, 2, HashAlgorithm::Sha1)
            .unwrap();
        let later = registry
            .acquire_or_create(key(tmp.path(), "a.bin"), 1, 2, HashAlgorithm::Sha1)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(Arc::ptr_eq(&first, &later));
        assert_eq!(registry.len(), 1);

        // same name, different directory
        let other_dir = tmp.path().join("other");
        registry
            .acquire_or_create(key(&other_dir, "a.bin"), 0, 2, HashAlgorithm::Sha1)
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn release_ignores_stale_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(Duration::from_secs(60));

        let stale = registry
            .acquire_or_create(key(tmp.path(), "a.bin"), 0, 2, HashAlgorithm::Sha1)
            .unwrap();
        assert!(registry.release(&stale));
        assert!(!registry.release(&stale));

        let fresh = registry
            .acquire_or_create(key(tmp.path(), "a.bin"), 0, 2, HashAlgorithm::Sha1)
            .unwrap();
        assert!(!registry.release(&stale));
        assert!(registry.get(fresh.key()).is_some());
    }

    #[tokio::test]
    async fn cancel_has_a_single_winner() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(Duration::from_secs(60));

        let session = registry
            .acquire_or_create(key(tmp.path(), "a.bin"), 0, 2, HashAlgorithm::Sha1)
            .unwrap();
        session.append(0, b"partial").await.unwrap();
        assert!(tmp.path().join("a.bin").exists());

        let (first, second) = tokio::join!(
            registry.cancel(&session, CancelReason::Requested),
            registry.cancel(&session, CancelReason::Timeout),
        );
        assert_ne!(first.unwrap(), second.unwrap());
        assert!(!tmp.path().join("a.bin").exists());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancelled_slot_is_free_before_cleanup_finishes() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(Duration::from_secs(60));

        let old = registry
            .acquire_or_create(key(tmp.path(), "a.bin"), 0, 2, HashAlgorithm::Sha1)
            .unwrap();
        old.append(0, b"partial").await.unwrap();

        // the restart runs while the cancel is still deleting the partial file
        let (cancelled, fresh) = tokio::join!(
            registry.cancel(&old, CancelReason::Requested),
            async { registry.acquire_or_create(key(tmp.path(), "a.bin"), 0, 2, HashAlgorithm::Sha1) },
        );
        assert!(cancelled.unwrap());

        let fresh = fresh.unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.state(), SessionState::Receiving);
        assert!(Arc::ptr_eq(&registry.get(fresh.key()).unwrap(), &fresh));
        assert!(!tmp.path().join("a.bin").exists());
    }

    #[tokio::test]
    async fn idle_session_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(Duration::from_millis(100));

        let session = registry
            .acquire_or_create(key(tmp.path(), "idle.bin"), 0, 3, HashAlgorithm::Sha1)
            .unwrap();
        session.append(0, b"partial").await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(registry.is_empty());
        assert!(!tmp.path().join("idle.bin").exists());
    }

    #[tokio::test]
    async fn sealed_session_is_not_timed_out() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(Duration::from_millis(100));

        let session = registry
            .acquire_or_create(key(tmp.path(), "done.bin"), 0, 1, HashAlgorithm::Sha1)
            .unwrap();
        session.append(0, b"all of it").await.unwrap();
        session.seal().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(session.state(), SessionState::Finalizing);
        assert!(tmp.path().join("done.bin").exists());
        assert!(!registry
            .cancel(&session, CancelReason::Requested)
            .await
            .unwrap());
    }
}
