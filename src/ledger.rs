//! Per-directory record of content hashes.
//!
//! Each directory holds a `hashDB.txt` with one `<hexHash>{#-#}<fileName>`
//! record per line. Records are appended when an upload commits and removed
//! when the file is deleted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;

use crate::error::Result;

pub const LEDGER_FILE_NAME: &str = "hashDB.txt";
pub const HASH_DELIMITER: &str = "{#-#}";

/// Whether `name` is the ledger itself or its rewrite scratch file.
pub fn is_ledger_file(name: &str) -> bool {
    name.strip_prefix(LEDGER_FILE_NAME)
        .is_some_and(|rest| rest.is_empty() || rest == ".tmp")
}

#[derive(Debug, Clone)]
pub struct HashLedger {
    path: PathBuf,
}

impl HashLedger {
    pub fn new(directory: &Path) -> Self {
        Self {
            path: directory.join(LEDGER_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes an empty ledger, replacing any existing one.
    pub async fn create_empty(&self) -> Result<()> {
        tokio::fs::write(&self.path, b"").await?;
        Ok(())
    }

    /// Reads every record into a `hash -> name` map.
    pub async fn load_all(&self) -> Result<HashMap<String, String>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;

        let mut records = HashMap::new();
        for line in contents.lines() {
            // names may carry meaningful whitespace, so only blank lines are skipped
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let Some((hash, name)) = line.split_once(HASH_DELIMITER) else {
                tracing::warn!(ledger = %self.path.display(), line, "skipping malformed ledger record");
                continue;
            };
            records.insert(hash.to_owned(), name.to_owned());
        }
        Ok(records)
    }

    pub async fn append(&self, hash: &str, name: &str) -> Result<()> {
        let record = format!("{hash}{HASH_DELIMITER}{name}\n");

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(record.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Drops the first record naming `name`. Returns whether one was found.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let contents = tokio::fs::read_to_string(&self.path).await?;

        let mut lines: Vec<&str> = contents.lines().collect();
        let position = lines.iter().position(|line| {
            line.trim_end_matches('\r')
                .split_once(HASH_DELIMITER)
                .is_some_and(|(_, recorded)| recorded == name)
        });
        let Some(position) = position else {
            return Ok(false);
        };
        lines.remove(position);

        let mut rewritten = String::with_capacity(contents.len());
        for line in lines.iter().filter(|line| !line.trim().is_empty()) {
            rewritten.push_str(line);
            rewritten.push('\n');
        }

        // rename over the old ledger so readers never see a half-written file
        let scratch = self.path.with_extension("txt.tmp");
        tokio::fs::write(&scratch, rewritten).await?;
        tokio::fs::rename(&scratch, &self.path).await?;
        Ok(true)
    }
}

/// One async lock per directory, serializing read-modify-write of its ledger.
#[derive(Debug, Default)]
pub struct LedgerLocks {
    locks: Mutex<HashMap<PathBuf, Weak<tokio::sync::Mutex<()>>>>,
}

impl LedgerLocks {
    pub async fn lock(&self, directory: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, lock| lock.strong_count() > 0);

            match locks.get(directory).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(directory.to_owned(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger_with(contents: &str) -> (tempfile::TempDir, HashLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HashLedger::new(dir.path());
        tokio::fs::write(ledger.path(), contents).await.unwrap();
        (dir, ledger)
    }

    #[tokio::test]
    async fn load_skips_blank_and_malformed_lines() {
        let (_dir, ledger) = ledger_with("aa{#-#}one.txt\n\n  \nnot a record\nbb{#-#}two.txt\n\n").await;

        let records = ledger.load_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records["aa"], "one.txt");
        assert_eq!(records["bb"], "two.txt");
    }

    #[tokio::test]
    async fn load_fails_without_ledger_file() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HashLedger::new(dir.path());

        let err = ledger.load_all().await.unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }

    #[tokio::test]
    async fn append_then_load() {
        let (_dir, ledger) = ledger_with("").await;
        ledger.append("aa", "one.txt").await.unwrap();
        ledger.append("bb", "two words.txt").await.unwrap();

        let raw = tokio::fs::read_to_string(ledger.path()).await.unwrap();
        assert_eq!(raw, "aa{#-#}one.txt\nbb{#-#}two words.txt\n");

        let records = ledger.load_all().await.unwrap();
        assert_eq!(records["bb"], "two words.txt");
    }

    #[tokio::test]
    async fn remove_drops_first_match_only() {
        let (_dir, ledger) = ledger_with("aa{#-#}one.txt\nbb{#-#}two.txt\ncc{#-#}two.txt\n").await;

        assert!(ledger.remove("two.txt").await.unwrap());

        let raw = tokio::fs::read_to_string(ledger.path()).await.unwrap();
        assert_eq!(raw, "aa{#-#}one.txt\ncc{#-#}two.txt\n");
    }

    #[tokio::test]
    async fn remove_without_match_leaves_ledger_alone() {
        let (_dir, ledger) = ledger_with("aa{#-#}one.txt\n").await;

        assert!(!ledger.remove("missing.txt").await.unwrap());
        let records = ledger.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn whitespace_in_names_survives_load_and_remove() {
        let (_dir, ledger) = ledger_with("aa{#-#} padded.txt \r\nbb{#-#}plain.txt\n").await;

        let records = ledger.load_all().await.unwrap();
        assert_eq!(records["aa"], " padded.txt ");

        assert!(ledger.remove(" padded.txt ").await.unwrap());
        let records = ledger.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records["bb"], "plain.txt");
    }

    #[tokio::test]
    async fn ledger_locks_are_per_directory() {
        let locks = LedgerLocks::default();
        let first = locks.lock(Path::new("/a")).await;

        // another directory is not blocked
        let _other = locks.lock(Path::new("/b")).await;

        // the same directory is
        let same = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            locks.lock(Path::new("/a")),
        )
        .await;
        assert!(same.is_err());

        drop(first);
        let _again = locks.lock(Path::new("/a")).await;
    }
}
