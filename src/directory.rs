//! Repository directories on the local filesystem.

use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::ledger::{self, HashLedger, HASH_DELIMITER};

/// Files and subdirectories present in one repository directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryListing {
    #[serde(rename = "filesPresent")]
    pub files: Vec<String>,
    #[serde(rename = "directoriesPresent")]
    pub directories: Vec<String>,
}

impl DirectoryListing {
    pub fn contains_file(&self, name: &str) -> bool {
        self.files.iter().any(|file| file == name)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }
}

/// Lists directory contents for the upload engine's name check.
#[async_trait::async_trait]
pub trait DirectoryLister: Send + Sync {
    async fn list_directory(&self, path: &Path) -> io::Result<DirectoryListing>;
}

/// Maps a client-supplied directory onto `root`.
///
/// Only plain relative components are accepted; an empty path is the root.
pub fn resolve_directory(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = relative.trim_start_matches(['/', '\\']);
    let mut resolved = root.to_path_buf();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::InvalidPath(format!(
                    "parent directory traversal not allowed: {relative}"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath(format!(
                    "absolute path not allowed: {relative}"
                )));
            }
        }
    }
    Ok(resolved)
}

/// Checks that `name` is a single path component that is safe to record in a ledger.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidPath(format!("invalid name: {name:?}")));
    }
    if name.contains(['/', '\\', '\0', '\n', '\r']) || name.contains(HASH_DELIMITER) {
        return Err(Error::InvalidPath(format!(
            "name contains reserved characters: {name:?}"
        )));
    }
    if name.trim() != name {
        return Err(Error::InvalidPath(format!(
            "name has leading or trailing whitespace: {name:?}"
        )));
    }
    if ledger::is_ledger_file(name) {
        return Err(Error::InvalidPath(format!("reserved name: {name}")));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FsDirectories {
    root: PathBuf,
}

impl FsDirectories {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the repository root and its ledger if they are missing.
    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let ledger = HashLedger::new(&self.root);
        if !tokio::fs::try_exists(ledger.path()).await? {
            ledger.create_empty().await?;
            tracing::info!(root = %self.root.display(), "initialized repository root");
        }
        Ok(())
    }

    pub async fn directory_info(&self, relative: &str) -> Result<DirectoryListing> {
        let path = resolve_directory(&self.root, relative)?;
        match self.list_directory(&path).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Error::NotFound(relative.into())),
            other => Ok(other?),
        }
    }

    pub async fn create_directory(&self, parent: &str, name: &str) -> Result<()> {
        validate_file_name(name)?;
        let parent_path = resolve_directory(&self.root, parent)?;

        let listing = self.list_directory(&parent_path).await?;
        if listing.directories.iter().any(|dir| dir == name) {
            return Err(Error::NameConflict(name.into()));
        }

        let path = parent_path.join(name);
        match tokio::fs::create_dir(&path).await {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::NameConflict(name.into()));
            }
            other => other?,
        }
        HashLedger::new(&path).create_empty().await?;

        tracing::info!(directory = %path.display(), "created directory");
        Ok(())
    }

    pub async fn delete_directory(&self, parent: &str, name: &str) -> Result<()> {
        validate_file_name(name)?;
        let path = resolve_directory(&self.root, parent)?.join(name);

        let listing = match self.list_directory(&path).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(name.into()));
            }
            other => other?,
        };
        if !listing.is_empty() {
            return Err(Error::DirectoryNotEmpty(name.into()));
        }

        match tokio::fs::remove_file(HashLedger::new(&path).path()).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            other => other?,
        }
        tokio::fs::remove_dir(&path).await?;

        tracing::info!(directory = %path.display(), "deleted directory");
        Ok(())
    }

    /// Opens a stored file for download.
    pub async fn open_file(&self, relative: &str) -> Result<(String, tokio::fs::File)> {
        let relative = relative.trim_matches(['/', '\\']);
        let (parent, name) = match relative.rsplit_once(['/', '\\']) {
            Some((parent, name)) => (parent, name),
            None => ("", relative),
        };
        validate_file_name(name)?;
        let path = resolve_directory(&self.root, parent)?.join(name);

        let file = match tokio::fs::File::open(&path).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(relative.into()));
            }
            other => other?,
        };
        if !file.metadata().await?.is_file() {
            return Err(Error::NotFound(relative.into()));
        }
        Ok((name.to_owned(), file))
    }
}

#[async_trait::async_trait]
impl DirectoryLister for FsDirectories {
    async fn list_directory(&self, path: &Path) -> io::Result<DirectoryListing> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut listing = DirectoryListing::default();

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_dir() {
                listing.directories.push(name);
            } else if file_type.is_file() && !ledger::is_ledger_file(&name) {
                listing.files.push(name);
            }
        }

        listing.files.sort_unstable();
        listing.directories.sort_unstable();
        Ok(listing)
    }
}
