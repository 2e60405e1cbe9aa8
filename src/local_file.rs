use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::coordinator::{FetchOutcome, SnapshotStore};
use crate::error::{Result, SyncError};
use crate::snapshot::{Snapshot, SyncSource};

/// An OS-level reference to the user-picked data file. Acquired once via
/// an [`AccessBroker`] picker and held for the session; rebinding requires
/// a new picker interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    path: PathBuf,
}

impl FileHandle {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
}

/// The OS/UI collaborator that owns file choosing and permission grants.
/// The embedding shell implements this with its native dialogs, filtering
/// the chooser to the JSON data file type; [`FsAccessBroker`] is the
/// headless default that consults filesystem metadata. Picker cancellation
/// is `Ok(None)`, never an error.
pub trait AccessBroker {
    fn pick_file(&self) -> impl std::future::Future<Output = Result<Option<FileHandle>>>;

    fn query_permission(
        &self,
        handle: &FileHandle,
        mode: PermissionMode,
    ) -> impl std::future::Future<Output = PermissionState>;

    /// The single user prompt issued when the current grant is
    /// insufficient.
    fn request_permission(
        &self,
        handle: &FileHandle,
        mode: PermissionMode,
    ) -> impl std::future::Future<Output = PermissionState>;
}

/// Broker backed by plain filesystem metadata. There is no chooser to
/// show and no prompt to raise, so picking always cancels and requesting
/// a permission re-checks the current grant.
#[derive(Debug, Default)]
pub struct FsAccessBroker;

impl AccessBroker for FsAccessBroker {
    async fn pick_file(&self) -> Result<Option<FileHandle>> {
        Ok(None)
    }

    async fn query_permission(&self, handle: &FileHandle, mode: PermissionMode) -> PermissionState {
        match tokio::fs::metadata(handle.path()).await {
            Ok(meta) => {
                if mode == PermissionMode::ReadWrite && meta.permissions().readonly() {
                    PermissionState::Denied
                } else {
                    PermissionState::Granted
                }
            }
            // A not-yet-created file is writable if its directory is.
            Err(_) => PermissionState::Granted,
        }
    }

    async fn request_permission(
        &self,
        handle: &FileHandle,
        mode: PermissionMode,
    ) -> PermissionState {
        self.query_permission(handle, mode).await
    }
}

/// Picks, verifies permission for, reads and writes the single local data
/// file. Permission is re-verified before every read and every write; the
/// OS can revoke a grant between calls.
pub struct LocalFileClient<B: AccessBroker> {
    broker: B,
    handle: Option<FileHandle>,
}

impl<B: AccessBroker> LocalFileClient<B> {
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            handle: None,
        }
    }

    /// Opens the broker's file chooser and binds the picked handle,
    /// replacing any previous binding. Cancellation yields `None`.
    pub async fn pick_handle(&mut self) -> Result<Option<FileHandle>> {
        match self.broker.pick_file().await? {
            Some(handle) => {
                log::info!("local file bound: {}", handle.name());
                self.handle = Some(handle.clone());
                Ok(Some(handle))
            }
            None => {
                log::debug!("local file picker cancelled");
                Ok(None)
            }
        }
    }

    /// Explicit binding for embedders without a picker.
    pub fn bind_path(&mut self, path: PathBuf) {
        self.handle = Some(FileHandle::new(path));
    }

    pub fn handle(&self) -> Option<&FileHandle> {
        self.handle.as_ref()
    }

    /// Checks the current grant for the bound handle; prompts once via the
    /// broker when it is insufficient. Returns the final grant state.
    pub async fn verify_permission(&self, mode: PermissionMode) -> bool {
        let Some(handle) = self.handle.as_ref() else {
            return false;
        };
        if self.broker.query_permission(handle, mode).await == PermissionState::Granted {
            return true;
        }
        self.broker.request_permission(handle, mode).await == PermissionState::Granted
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| SyncError::Read("no file handle bound".to_string()))?;
        if !self.verify_permission(PermissionMode::Read).await {
            return Err(SyncError::PermissionDenied(format!(
                "read access to {} was not granted",
                handle.name()
            )));
        }
        tokio::fs::read(handle.path())
            .await
            .map_err(|e| SyncError::Read(e.to_string()))
    }

    /// Writes the full content through a scoped writable stream that
    /// commits on close: bytes land in a temp file next to the target and
    /// an atomic rename publishes them. A failure at any point, the commit
    /// step included, leaves the original file untouched.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| SyncError::Write("no file handle bound".to_string()))?;
        if !self.verify_permission(PermissionMode::ReadWrite).await {
            return Err(SyncError::PermissionDenied(format!(
                "write access to {} was not granted",
                handle.name()
            )));
        }

        let target = handle.path().to_path_buf();
        let dir = target
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| SyncError::Write("handle has no parent directory".to_string()))?;
        let bytes = bytes.to_vec();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .map_err(|e| SyncError::Write(e.to_string()))?;
            tmp.write_all(&bytes)
                .map_err(|e| SyncError::Write(e.to_string()))?;
            tmp.as_file()
                .sync_all()
                .map_err(|e| SyncError::Write(e.to_string()))?;
            tmp.persist(&target)
                .map_err(|e| SyncError::Write(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| SyncError::Write(e.to_string()))??;

        log::debug!("local file written: {}", handle.name());
        Ok(())
    }
}

impl<B: AccessBroker> SnapshotStore for LocalFileClient<B> {
    fn source(&self) -> SyncSource {
        SyncSource::LocalFile
    }

    async fn fetch(&mut self) -> Result<FetchOutcome> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(FetchOutcome::Unbound);
        };
        if tokio::fs::metadata(handle.path()).await.is_err() {
            return Ok(FetchOutcome::Missing);
        }
        let bytes = self.read().await?;
        let snapshot = Snapshot::from_slice(&bytes)?;
        log::debug!("local snapshot loaded ({})", snapshot.digest());
        Ok(FetchOutcome::Loaded(snapshot))
    }

    async fn store(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.write(&snapshot.to_bytes()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Broker with scripted pick results and permission grants.
    struct ScriptedBroker {
        pick: Option<FileHandle>,
        query: PermissionState,
        request: PermissionState,
        prompts: AtomicUsize,
    }

    impl ScriptedBroker {
        fn granting(pick: Option<FileHandle>) -> Self {
            Self {
                pick,
                query: PermissionState::Granted,
                request: PermissionState::Granted,
                prompts: AtomicUsize::new(0),
            }
        }
    }

    impl AccessBroker for ScriptedBroker {
        async fn pick_file(&self) -> Result<Option<FileHandle>> {
            Ok(self.pick.clone())
        }

        async fn query_permission(
            &self,
            _handle: &FileHandle,
            _mode: PermissionMode,
        ) -> PermissionState {
            self.query
        }

        async fn request_permission(
            &self,
            _handle: &FileHandle,
            _mode: PermissionMode,
        ) -> PermissionState {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            self.request
        }
    }

    #[tokio::test]
    async fn picker_cancel_is_not_an_error() {
        let mut client = LocalFileClient::new(ScriptedBroker::granting(None));
        assert_eq!(client.pick_handle().await.unwrap(), None);
        assert!(client.handle().is_none());
    }

    #[tokio::test]
    async fn pick_binds_the_handle() {
        let handle = FileHandle::new(PathBuf::from("/tmp/data.json"));
        let mut client = LocalFileClient::new(ScriptedBroker::granting(Some(handle.clone())));
        assert_eq!(client.pick_handle().await.unwrap(), Some(handle.clone()));
        assert_eq!(client.handle(), Some(&handle));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");

        let mut client = LocalFileClient::new(FsAccessBroker);
        client.bind_path(path.clone());
        client.write(b"{\"projects\":[]}").await.unwrap();
        assert_eq!(client.read().await.unwrap(), b"{\"projects\":[]}");
    }

    #[tokio::test]
    async fn denied_permission_blocks_the_write_and_prompts_once() {
        let broker = ScriptedBroker {
            pick: None,
            query: PermissionState::Prompt,
            request: PermissionState::Denied,
            prompts: AtomicUsize::new(0),
        };
        let mut client = LocalFileClient::new(broker);
        client.bind_path(PathBuf::from("/tmp/data.json"));

        let err = client.write(b"{}").await.unwrap_err();
        assert!(matches!(err, SyncError::PermissionDenied(_)));
        assert_eq!(client.broker.prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn insufficient_grant_retries_via_prompt() {
        let broker = ScriptedBroker {
            pick: None,
            query: PermissionState::Prompt,
            request: PermissionState::Granted,
            prompts: AtomicUsize::new(0),
        };
        let client = LocalFileClient {
            broker,
            handle: Some(FileHandle::new(PathBuf::from("/tmp/data.json"))),
        };
        assert!(client.verify_permission(PermissionMode::ReadWrite).await);
        assert_eq!(client.broker.prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_commit_leaves_the_target_untouched() {
        // Binding a path that is actually a directory makes the final
        // rename fail, which is the closest portable stand-in for a
        // failure during the close/commit step.
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("data.json");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("inner.txt"), b"keep me").unwrap();

        let mut client = LocalFileClient::new(FsAccessBroker);
        client.bind_path(target.clone());

        let err = client.write(b"{}").await.unwrap_err();
        assert!(matches!(err, SyncError::Write(_)));
        assert_eq!(
            std::fs::read(target.join("inner.txt")).unwrap(),
            b"keep me"
        );
    }

    #[tokio::test]
    async fn fetch_reports_unbound_and_missing() {
        let dir = TempDir::new().unwrap();

        let mut client = LocalFileClient::new(FsAccessBroker);
        assert!(matches!(
            client.fetch().await.unwrap(),
            FetchOutcome::Unbound
        ));

        client.bind_path(dir.path().join("data.json"));
        assert!(matches!(
            client.fetch().await.unwrap(),
            FetchOutcome::Missing
        ));
    }

    #[tokio::test]
    async fn fetch_decodes_the_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, b"{\"projects\": [1]}").unwrap();

        let mut client = LocalFileClient::new(FsAccessBroker);
        client.bind_path(path);
        match client.fetch().await.unwrap() {
            FetchOutcome::Loaded(snap) => {
                assert_eq!(snap, Snapshot::from_str("{\"projects\":[1]}").unwrap())
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
