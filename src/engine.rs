//! Chunked upload orchestration.
//!
//! Each chunk runs through [`UploadEngine::submit_chunk`]: the first chunk is
//! checked against the directory listing, every chunk goes to the live
//! session from the [`SessionRegistry`], and the last one finalizes the
//! upload against the directory's [`HashLedger`].

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;
use crate::directory::{resolve_directory, validate_file_name, DirectoryLister};
use crate::error::{Error, Result};
use crate::ledger::{HashLedger, LedgerLocks};
use crate::registry::{CancelReason, SessionRegistry};
use crate::session::{SessionKey, SessionState, UploadSession};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Metadata accompanying one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Directory relative to the repository root.
    pub directory: String,
    pub file_name: String,
    /// Zero-based.
    pub chunk_index: u64,
    pub chunks_needed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The chunk was written; more are expected.
    Accepted,
    /// The last chunk was written and the file recorded under `digest`.
    Committed { digest: String },
}

pub struct UploadEngine {
    root: PathBuf,
    lister: Arc<dyn DirectoryLister>,
    registry: Arc<SessionRegistry>,
    ledger_locks: LedgerLocks,
    config: UploadConfig,
}

impl UploadEngine {
    pub fn new(
        root: impl Into<PathBuf>,
        lister: Arc<dyn DirectoryLister>,
        registry: Arc<SessionRegistry>,
        config: UploadConfig,
    ) -> Self {
        Self {
            root: root.into(),
            lister,
            registry,
            ledger_locks: LedgerLocks::default(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub async fn submit_chunk(
        &self,
        request: ChunkRequest,
        data: impl AsyncRead + Unpin,
    ) -> Result<ChunkOutcome> {
        validate_file_name(&request.file_name)?;
        if request.chunk_index >= request.chunks_needed {
            return Err(Error::InvalidChunk(format!(
                "chunk {} of {}",
                request.chunk_index, request.chunks_needed
            )));
        }
        let directory = resolve_directory(&self.root, &request.directory)?;

        if request.chunk_index == 0 {
            let listing = match self.lister.list_directory(&directory).await {
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::NotFound(request.directory));
                }
                other => other?,
            };
            if listing.contains_file(&request.file_name) {
                debug!(file = %request.file_name, "name already taken");
                return Err(Error::NameConflict(request.file_name));
            }
        }

        let key = SessionKey::new(directory, request.file_name);
        let session = self.registry.acquire_or_create(
            key,
            request.chunk_index,
            request.chunks_needed,
            self.config.hash_algorithm,
        )?;
        if session.chunks_needed() != request.chunks_needed {
            return Err(Error::InvalidChunk(format!(
                "upload expects {} chunks, request says {}",
                session.chunks_needed(),
                request.chunks_needed
            )));
        }
        session.touch();

        let result = self.apply_chunk(&session, request.chunk_index, data).await;
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(upload_id = %session.id(), file = %session.key(), "upload failed: {err}");
                if let Err(cleanup) = self.registry.abandon(&session).await {
                    error!(upload_id = %session.id(), "failed to clean up upload: {cleanup}");
                }
            } else if session.state().is_terminal() {
                self.registry.release(&session);
            }
        }
        result
    }

    async fn apply_chunk(
        &self,
        session: &Arc<UploadSession>,
        chunk_index: u64,
        data: impl AsyncRead + Unpin,
    ) -> Result<ChunkOutcome> {
        let data = drain_chunk(session, data, self.config.max_chunk_size).await?;
        session.append(chunk_index, &data).await?;

        debug!(
            upload_id = %session.id(),
            chunk = chunk_index,
            len = data.len(),
            "chunk accepted"
        );

        if chunk_index + 1 < session.chunks_needed() {
            return Ok(ChunkOutcome::Accepted);
        }
        self.finalize(session).await
    }

    async fn finalize(&self, session: &Arc<UploadSession>) -> Result<ChunkOutcome> {
        let digest = session.seal().await?.to_hex();
        let key = session.key();

        let ledger = HashLedger::new(&key.directory);
        let _guard = self.ledger_locks.lock(&key.directory).await;
        let records = ledger.load_all().await?;

        match records.get(&digest) {
            Some(existing) if *existing != key.name => {
                session.finish(SessionState::Rejected);
                let discarded = session.discard().await;
                self.registry.release(session);
                discarded?;

                info!(
                    upload_id = %session.id(),
                    file = %key,
                    %digest,
                    existing = %existing,
                    "duplicate content rejected"
                );
                return Err(Error::ContentDuplicate {
                    name: key.name.clone(),
                    existing: existing.clone(),
                });
            }
            // left behind by a file removed outside the repository
            Some(_) => debug!(file = %key, %digest, "ledger already records this file"),
            None => ledger.append(&digest, &key.name).await?,
        }

        session.finish(SessionState::Committed);
        self.registry.release(session);

        info!(upload_id = %session.id(), file = %key, %digest, "upload committed");
        Ok(ChunkOutcome::Committed { digest })
    }

    /// Drops the live upload of `name`, deleting its partial file.
    ///
    /// Returns `false` when no such upload is in progress.
    pub async fn cancel(&self, directory: &str, name: &str) -> Result<bool> {
        validate_file_name(name)?;
        let key = SessionKey::new(resolve_directory(&self.root, directory)?, name);

        let Some(session) = self.registry.get(&key) else {
            debug!(file = %key, "no upload to cancel");
            return Ok(false);
        };
        self.registry.cancel(&session, CancelReason::Requested).await
    }

    /// Deletes a committed file together with its ledger record.
    pub async fn delete_file(&self, directory: &str, name: &str) -> Result<()> {
        validate_file_name(name)?;
        let resolved = resolve_directory(&self.root, directory)?;

        let key = SessionKey::new(resolved.clone(), name);
        if self.registry.get(&key).is_some() {
            return Err(Error::Busy(name.into()));
        }

        let _guard = self.ledger_locks.lock(&resolved).await;

        // unlink before dropping the record, so a file that stays keeps its record
        let file_missing = match tokio::fs::remove_file(key.path()).await {
            Ok(()) => false,
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => return Err(err.into()),
        };

        let ledger = HashLedger::new(&resolved);
        let had_record = match ledger.remove(name).await {
            Err(Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(directory.into()));
            }
            other => other?,
        };

        if file_missing {
            if had_record {
                debug!(file = %key, "dropped record of a file already gone");
            }
            return Err(Error::NotFound(name.into()));
        }

        info!(file = %key, had_record, "file deleted");
        Ok(())
    }
}

/// Reads the whole chunk body, rearming the session timer as bytes arrive.
async fn drain_chunk(
    session: &UploadSession,
    data: impl AsyncRead + Unpin,
    limit: u64,
) -> Result<Vec<u8>> {
    let mut reader = data.take(limit.saturating_add(1));
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut chunk = Vec::new();

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        chunk.extend_from_slice(&buf[..n]);
        if chunk.len() as u64 > limit {
            return Err(Error::ChunkTooLarge { limit });
        }
        session.touch();
    }
    Ok(chunk)
}
