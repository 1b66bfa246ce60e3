//! In-memory remote file server
//!
//! Behaves like a strict FTP server: moving needs an existing source and an
//! existing destination folder, folders are created one level at a time.
//! Faults can be injected for tests and dry runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{RemoteClient, RemoteError, RemoteResult};

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    folders: BTreeSet<String>,
    failing_moves: HashSet<String>,
    lost_move_replies: HashSet<String>,
    failing_listings: HashSet<String>,
    reject_existing_folders: bool,
    transient_failures: usize,
    operations: Vec<String>,
}

impl State {
    fn add_parents(&mut self, path: &str) {
        let mut current = parent_of(path);
        while let Some(folder) = current {
            if !self.folders.insert(folder.to_string()) {
                break;
            }
            current = parent_of(folder);
        }
    }

    fn folder_exists(&self, folder: &str) -> bool {
        folder == "/" || self.folders.contains(folder)
    }

    fn take_transient_failure(&mut self, operation: &'static str, path: &str) -> RemoteResult<()> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(RemoteError::transport(operation, path, "injected transient failure"));
        }
        Ok(())
    }
}

/// Parent folder of an absolute path; `None` for the root
fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(i) => Some(&trimmed[..i]),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Remote server kept in process memory
#[derive(Debug, Default)]
pub struct MemoryRemoteClient {
    state: Mutex<State>,
}

impl MemoryRemoteClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`put_file`](Self::put_file)
    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.put_file(path, content);
        self
    }

    pub fn with_folder(self, folder: &str) -> Self {
        {
            let mut state = self.lock();
            state.add_parents(folder);
            state.folders.insert(folder.trim_end_matches('/').to_string());
        }
        self
    }

    /// Create or replace a file, creating its folders
    pub fn put_file(&self, path: &str, content: &[u8]) {
        let mut state = self.lock();
        state.add_parents(path);
        state.files.insert(path.to_string(), content.to_vec());
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    /// Every file path on the server, sorted
    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Moves whose source is `path` fail with a transport error until
    /// [`clear_failures`](Self::clear_failures)
    pub fn fail_moves_from(&self, path: &str) {
        self.lock().failing_moves.insert(path.to_string());
    }

    /// The next move from `path` is carried out but reported as a transport
    /// error, like a rename whose reply was lost
    pub fn lose_move_reply_from(&self, path: &str) {
        self.lock().lost_move_replies.insert(path.to_string());
    }

    /// Listings of `folder` fail with a transport error until
    /// [`clear_failures`](Self::clear_failures)
    pub fn fail_listings_of(&self, folder: &str) {
        self.lock().failing_listings.insert(folder.to_string());
    }

    /// Creating a folder that already exists fails with `NotFound`, as an FTP
    /// `MKD` does when another session created the folder first
    pub fn reject_existing_folders(&self) {
        self.lock().reject_existing_folders = true;
    }

    /// The next `calls` operations of any kind fail with a transport error
    pub fn fail_next_calls(&self, calls: usize) {
        self.lock().transient_failures = calls;
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_moves.clear();
        state.lost_move_replies.clear();
        state.failing_listings.clear();
        state.reject_existing_folders = false;
        state.transient_failures = 0;
    }

    /// Mutating operations performed so far, as `MOVE a -> b`, `MKD d`, `DELE f`
    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemoteClient {
    async fn list_folder(&self, folder: &str) -> RemoteResult<Vec<String>> {
        let mut state = self.lock();
        state.take_transient_failure("LIST", folder)?;

        let folder = folder.trim_end_matches('/');
        let folder = if folder.is_empty() { "/" } else { folder };
        if state.failing_listings.contains(folder) {
            return Err(RemoteError::transport("LIST", folder, "injected listing failure"));
        }
        if !state.folder_exists(folder) {
            return Err(RemoteError::not_found(folder));
        }

        let mut names: Vec<String> = state
            .files
            .keys()
            .map(String::as_str)
            .chain(state.folders.iter().map(String::as_str))
            .filter(|path| parent_of(path) == Some(folder))
            .map(|path| name_of(path).to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn download_file(&self, path: &str) -> RemoteResult<Vec<u8>> {
        let mut state = self.lock();
        state.take_transient_failure("RETR", path)?;
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(path))
    }

    async fn move_file(&self, from: &str, to: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        state.take_transient_failure("RNFR", from)?;

        if state.failing_moves.contains(from) {
            return Err(RemoteError::transport("RNFR", from, "injected move failure"));
        }
        if !state.files.contains_key(from) {
            return Err(RemoteError::not_found(from));
        }
        let parent = parent_of(to).unwrap_or("/");
        if !state.folder_exists(parent) {
            return Err(RemoteError::not_found(parent));
        }

        if let Some(content) = state.files.remove(from) {
            state.files.insert(to.to_string(), content);
        }
        state.operations.push(format!("MOVE {} -> {}", from, to));
        if state.lost_move_replies.remove(from) {
            return Err(RemoteError::transport("RNTO", to, "injected lost reply"));
        }
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        state.take_transient_failure("DELE", path)?;

        if state.files.remove(path).is_none() {
            return Err(RemoteError::not_found(path));
        }
        state.operations.push(format!("DELE {}", path));
        Ok(())
    }

    async fn create_folder_if_not_exist(&self, folder: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        state.take_transient_failure("MKD", folder)?;

        let folder = folder.trim_end_matches('/');
        if folder.is_empty() || state.folder_exists(folder) {
            if state.reject_existing_folders && !folder.is_empty() {
                return Err(RemoteError::not_found(folder));
            }
            return Ok(());
        }
        let parent = parent_of(folder).unwrap_or("/");
        if !state.folder_exists(parent) {
            return Err(RemoteError::not_found(parent));
        }

        state.folders.insert(folder.to_string());
        state.operations.push(format!("MKD {}", folder));
        Ok(())
    }
}
