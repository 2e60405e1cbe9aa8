use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::coordinator::{FetchOutcome, SnapshotStore};
use crate::error::{Result, SyncError};
use crate::session::{CloudSessionManager, ConsentFlow};
use crate::snapshot::{Snapshot, SyncSource};

// The backing store accepts any boundary string as long as body and header
// agree; this one matches the classic Drive multipart samples.
const MULTIPART_BOUNDARY: &str = "-------314159265358979323846";
const SNAPSHOT_MIME: &str = "application/json";

/// A user-chosen remote folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRef {
    pub id: String,
    pub name: String,
}

/// The UI collaborator presenting the folder-only chooser.
/// Cancellation is `Ok(None)`, never an error.
pub trait FolderPicker {
    fn pick_folder(&self) -> impl std::future::Future<Output = Result<Option<FolderRef>>>;
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileMeta>,
}

#[derive(Deserialize)]
struct FileMeta {
    id: String,
    #[allow(dead_code)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct UploadedFile {
    id: String,
}

/// Folder picker, canonical-file lookup, content read, and multipart
/// create/update against the cloud file API.
///
/// The store permits duplicate names, so a save never inserts without a
/// prior lookup; once a file id is cached for the bound folder, updates go
/// to that id and no second canonical file can appear.
pub struct RemoteStoreClient<C: ConsentFlow, P: FolderPicker> {
    http: reqwest::Client,
    cfg: SyncConfig,
    session: Arc<CloudSessionManager<C>>,
    picker: P,
    folder: Option<FolderRef>,
    file_id: Option<String>,
}

impl<C: ConsentFlow, P: FolderPicker> RemoteStoreClient<C, P> {
    pub fn new(cfg: SyncConfig, session: Arc<CloudSessionManager<C>>, picker: P) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
            session,
            picker,
            folder: None,
            file_id: None,
        }
    }

    /// Presents the folder chooser and binds the picked folder, dropping
    /// any cached file mapping. Requires an authenticated session;
    /// cancellation yields `None`.
    pub async fn pick_folder(&mut self) -> Result<Option<FolderRef>> {
        if !self.session.is_authenticated() {
            return Err(SyncError::AuthRequired);
        }
        match self.picker.pick_folder().await? {
            Some(folder) => {
                log::info!("remote folder bound: {} ({})", folder.name, folder.id);
                self.bind_folder(folder.clone());
                Ok(Some(folder))
            }
            None => {
                log::debug!("remote folder picker cancelled");
                Ok(None)
            }
        }
    }

    /// Explicit binding for embedders that restore a known folder id.
    pub fn bind_folder(&mut self, folder: FolderRef) {
        self.folder = Some(folder);
        self.file_id = None;
    }

    pub fn folder(&self) -> Option<&FolderRef> {
        self.folder.as_ref()
    }

    pub fn cached_file_id(&self) -> Option<&str> {
        self.file_id.as_deref()
    }

    /// Looks up the canonical data file inside a folder: exact name, the
    /// folder as parent, not trashed. First match wins.
    pub async fn find_canonical_file(&self, folder_id: &str) -> Result<Option<String>> {
        let token = self.session.bearer_token()?;
        let url = format!("{}/drive/v3/files", self.cfg.api_base_url);
        let query = canonical_query(&self.cfg.canonical_file_name, folder_id);

        let res = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("q", query.as_str()), ("fields", "files(id, name)")])
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let res = self.reject_auth_failure(res)?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_else(|_| "no body".to_string());
            return Err(SyncError::Network(format!(
                "file lookup failed: HTTP {status}. Body: {body}"
            )));
        }

        let list: FileList = res
            .json()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    /// Resolves the canonical file and fetches its content.
    pub async fn load(&self, folder_id: &str) -> Result<(String, Snapshot)> {
        let file_id = self.find_canonical_file(folder_id).await?.ok_or_else(|| {
            SyncError::NotFound(format!(
                "no {} in folder {folder_id}",
                self.cfg.canonical_file_name
            ))
        })?;

        let token = self.session.bearer_token()?;
        let url = format!(
            "{}/drive/v3/files/{}",
            self.cfg.api_base_url,
            urlencoding::encode(&file_id)
        );
        let res = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let res = self.reject_auth_failure(res)?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_else(|_| "no body".to_string());
            return Err(SyncError::Network(format!(
                "content fetch failed: HTTP {status}. Body: {body}"
            )));
        }

        let bytes = res
            .bytes()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let snapshot = Snapshot::from_slice(&bytes)?;
        log::debug!("remote snapshot loaded ({})", snapshot.digest());
        Ok((file_id, snapshot))
    }

    /// Uploads the snapshot as a two-part multipart body: a metadata part
    /// (with `parents` only on insert) and the content part, joined and
    /// closed by the literal boundary markers. Update verb when a file id
    /// is given, insert otherwise. Returns the file id for caching.
    pub async fn save(
        &self,
        snapshot: &Snapshot,
        folder_id: &str,
        existing_file_id: Option<&str>,
    ) -> Result<String> {
        let token = self.session.bearer_token()?;
        let metadata = upload_metadata(&self.cfg.canonical_file_name, folder_id, existing_file_id);
        let content = String::from_utf8(snapshot.to_bytes()?)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        let body = multipart_body(&metadata, &content);

        let request = match existing_file_id {
            Some(id) => self.http.patch(format!(
                "{}/upload/drive/v3/files/{}",
                self.cfg.api_base_url,
                urlencoding::encode(id)
            )),
            None => self
                .http
                .post(format!("{}/upload/drive/v3/files", self.cfg.api_base_url)),
        };

        let res = request
            .bearer_auth(token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(
                "Content-Type",
                format!("multipart/related; boundary=\"{MULTIPART_BOUNDARY}\""),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let res = self.reject_auth_failure(res)?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_else(|_| "no body".to_string());
            return Err(SyncError::Network(format!(
                "upload failed: HTTP {status}. Body: {body}"
            )));
        }

        let uploaded: UploadedFile = res
            .json()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        log::info!(
            "remote snapshot saved ({}) as file {}",
            snapshot.digest(),
            uploaded.id
        );
        Ok(uploaded.id)
    }

    /// Expired tokens surface reactively: the rejected call drops the
    /// session back to `Ready` and the caller must sign in again.
    fn reject_auth_failure(&self, res: reqwest::Response) -> Result<reqwest::Response> {
        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.session.invalidate();
            return Err(SyncError::AuthRequired);
        }
        Ok(res)
    }
}

fn canonical_query(file_name: &str, folder_id: &str) -> String {
    format!("name = '{file_name}' and '{folder_id}' in parents and trashed = false")
}

fn upload_metadata(file_name: &str, folder_id: &str, existing_file_id: Option<&str>) -> Value {
    match existing_file_id {
        Some(_) => json!({ "name": file_name, "mimeType": SNAPSHOT_MIME }),
        None => json!({
            "name": file_name,
            "mimeType": SNAPSHOT_MIME,
            "parents": [folder_id],
        }),
    }
}

fn multipart_body(metadata: &Value, content: &str) -> String {
    let delimiter = format!("\r\n--{MULTIPART_BOUNDARY}\r\n");
    let close_delim = format!("\r\n--{MULTIPART_BOUNDARY}--");
    format!(
        "{delimiter}Content-Type: {SNAPSHOT_MIME}; charset=UTF-8\r\n\r\n{metadata}\
         {delimiter}Content-Type: {SNAPSHOT_MIME}\r\n\r\n{content}{close_delim}"
    )
}

impl<C: ConsentFlow, P: FolderPicker> SnapshotStore for RemoteStoreClient<C, P> {
    fn source(&self) -> SyncSource {
        SyncSource::RemoteDrive
    }

    async fn fetch(&mut self) -> Result<FetchOutcome> {
        let Some(folder) = self.folder.clone() else {
            return Ok(FetchOutcome::Unbound);
        };
        if !self.session.is_authenticated() {
            log::debug!("remote folder bound but session not authenticated; skipping");
            return Ok(FetchOutcome::Unbound);
        }
        match self.load(&folder.id).await {
            Ok((file_id, snapshot)) => {
                self.file_id = Some(file_id);
                Ok(FetchOutcome::Loaded(snapshot))
            }
            Err(SyncError::NotFound(_)) => {
                self.file_id = None;
                Ok(FetchOutcome::Missing)
            }
            Err(e) => Err(e),
        }
    }

    async fn store(&mut self, snapshot: &Snapshot) -> Result<()> {
        let folder = self
            .folder
            .clone()
            .ok_or_else(|| SyncError::NotReady("no remote folder bound".to_string()))?;

        // Never insert blind: with no cached mapping, the lookup runs
        // first so an existing canonical file is updated, not duplicated.
        let existing = match self.file_id.clone() {
            Some(id) => Some(id),
            None => self.find_canonical_file(&folder.id).await?,
        };

        let file_id = self.save(snapshot, &folder.id, existing.as_deref()).await?;
        self.file_id = Some(file_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::session::SessionState;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::Mutex;

    #[test]
    fn lookup_query_matches_the_store_grammar() {
        assert_eq!(
            canonical_query("teamtrack-data.json", "folder-9"),
            "name = 'teamtrack-data.json' and 'folder-9' in parents and trashed = false"
        );
    }

    #[test]
    fn insert_metadata_carries_parents() {
        let meta = upload_metadata("teamtrack-data.json", "folder-9", None);
        assert_eq!(meta["parents"], json!(["folder-9"]));
        assert_eq!(meta["name"], "teamtrack-data.json");
        assert_eq!(meta["mimeType"], "application/json");
    }

    #[test]
    fn update_metadata_omits_parents() {
        let meta = upload_metadata("teamtrack-data.json", "folder-9", Some("file-3"));
        assert!(meta.get("parents").is_none());
        assert_eq!(meta["name"], "teamtrack-data.json");
    }

    #[test]
    fn multipart_body_uses_the_literal_boundary() {
        let meta = upload_metadata("teamtrack-data.json", "folder-9", None);
        let body = multipart_body(&meta, "{\"projects\":[]}");

        let delimiter = format!("\r\n--{MULTIPART_BOUNDARY}\r\n");
        let close_delim = format!("\r\n--{MULTIPART_BOUNDARY}--");

        assert!(body.starts_with(&delimiter));
        assert!(body.ends_with(&close_delim));
        assert_eq!(body.matches(&delimiter).count(), 2);
        assert!(body.contains("Content-Type: application/json; charset=UTF-8\r\n\r\n{"));
        assert!(body.contains("Content-Type: application/json\r\n\r\n{\"projects\":[]}"));
    }

    #[test]
    fn body_parts_are_metadata_then_content() {
        let meta = upload_metadata("teamtrack-data.json", "folder-9", None);
        let body = multipart_body(&meta, "{\"x\":1}");

        let meta_pos = body.find("teamtrack-data.json").unwrap();
        let content_pos = body.find("{\"x\":1}").unwrap();
        assert!(meta_pos < content_pos);
    }

    struct AutoConsent;

    impl ConsentFlow for AutoConsent {
        async fn request_access(
            &self,
            _client_id: &str,
            _scope: &str,
        ) -> Result<Option<crate::session::TokenGrant>> {
            Ok(Some(crate::session::TokenGrant {
                access_token: "tok-1".to_string(),
                scope: "drive.file".to_string(),
                expires_in: Some(3600),
            }))
        }
    }

    struct NoPicker;

    impl FolderPicker for NoPicker {
        async fn pick_folder(&self) -> Result<Option<FolderRef>> {
            Ok(None)
        }
    }

    /// Minimal loopback HTTP responder: one scripted (status, body) per
    /// request, connections closed after each response so requests arrive
    /// sequentially. Records the full request text for assertions.
    struct TestServer {
        base_url: String,
        requests: std::sync::Arc<Mutex<Vec<String>>>,
    }

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut buf).unwrap_or(0);
            if n == 0 {
                return String::from_utf8_lossy(&data).to_string();
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&data[..header_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|line| {
                line.to_ascii_lowercase()
                    .strip_prefix("content-length:")
                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
            })
            .unwrap_or(0);
        while data.len() < header_end + content_length {
            let n = stream.read(&mut buf).unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&data).to_string()
    }

    fn spawn_server(responses: Vec<(u16, String)>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        std::thread::spawn(move || {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let request = read_request(&mut stream);
                seen.lock().unwrap().push(request);

                let reason = if status == 200 { "OK" } else { "Unauthorized" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        TestServer { base_url, requests }
    }

    async fn authenticated_client(
        base_url: &str,
    ) -> RemoteStoreClient<AutoConsent, NoPicker> {
        let mut cfg = SyncConfig::default();
        cfg.api_base_url = base_url.to_string();
        cfg.oauth_client_id = "client-123".to_string();
        // Unreachable on purpose; the profile fetch failure is ignored.
        cfg.userinfo_url = "http://127.0.0.1:1/userinfo".to_string();
        cfg.revoke_url = "http://127.0.0.1:1/revoke".to_string();

        let session = Arc::new(CloudSessionManager::new(cfg.clone(), AutoConsent));
        session.initialize().await.unwrap();
        assert_eq!(session.sign_in().await.unwrap(), SessionState::Authenticated);

        let mut client = RemoteStoreClient::new(cfg, session, NoPicker);
        client.bind_folder(FolderRef {
            id: "folder-9".to_string(),
            name: "TeamTrack".to_string(),
        });
        client
    }

    #[tokio::test]
    async fn store_looks_up_before_updating_an_existing_file() {
        let server = spawn_server(vec![
            (
                200,
                "{\"files\": [{\"id\": \"f-existing\", \"name\": \"teamtrack-data.json\"}]}"
                    .to_string(),
            ),
            (200, "{\"id\": \"f-existing\"}".to_string()),
        ]);
        let mut client = authenticated_client(&server.base_url).await;

        client
            .store(&Snapshot::from_str("{\"projects\":[]}").unwrap())
            .await
            .unwrap();

        let requests = server.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].starts_with("GET /drive/v3/files?"));
        assert!(requests[0].contains("q=name"));
        assert!(requests[0].contains("trashed"));
        assert!(requests[1].starts_with("PATCH /upload/drive/v3/files/f-existing?"));
        assert!(requests[1].contains("uploadType=multipart"));
        // Updates never re-parent the file.
        assert!(!requests[1].contains("parents"));
        assert_eq!(client.cached_file_id(), Some("f-existing"));
    }

    #[tokio::test]
    async fn store_inserts_only_when_the_lookup_comes_back_empty() {
        let server = spawn_server(vec![
            (200, "{\"files\": []}".to_string()),
            (200, "{\"id\": \"f-new\"}".to_string()),
            (200, "{\"id\": \"f-new\"}".to_string()),
        ]);
        let mut client = authenticated_client(&server.base_url).await;
        let snapshot = Snapshot::from_str("{\"projects\":[1]}").unwrap();

        client.store(&snapshot).await.unwrap();
        // Second save goes straight to the cached id; no second insert,
        // no second lookup.
        client.store(&snapshot).await.unwrap();

        let requests = server.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].starts_with("GET /drive/v3/files?"));
        assert!(requests[1].starts_with("POST /upload/drive/v3/files?"));
        assert!(requests[1].contains("\"parents\""));
        assert!(requests[2].starts_with("PATCH /upload/drive/v3/files/f-new?"));
    }

    #[tokio::test]
    async fn load_without_a_canonical_file_is_not_found() {
        let server = spawn_server(vec![(200, "{\"files\": []}".to_string())]);
        let client = authenticated_client(&server.base_url).await;

        let err = client.load("folder-9").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn fetch_maps_a_missing_canonical_file_to_missing() {
        let server = spawn_server(vec![(200, "{\"files\": []}".to_string())]);
        let mut client = authenticated_client(&server.base_url).await;

        assert_eq!(client.fetch().await.unwrap(), FetchOutcome::Missing);
        assert_eq!(client.cached_file_id(), None);
    }

    #[tokio::test]
    async fn fetch_loads_and_caches_the_canonical_file() {
        let server = spawn_server(vec![
            (
                200,
                "{\"files\": [{\"id\": \"f-7\", \"name\": \"teamtrack-data.json\"}]}".to_string(),
            ),
            (200, "{\"projects\": [42]}".to_string()),
        ]);
        let mut client = authenticated_client(&server.base_url).await;

        match client.fetch().await.unwrap() {
            FetchOutcome::Loaded(snapshot) => {
                assert_eq!(snapshot, Snapshot::from_str("{\"projects\":[42]}").unwrap());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(client.cached_file_id(), Some("f-7"));

        let requests = server.requests.lock().unwrap();
        assert!(requests[1].contains("alt=media"));
    }

    #[tokio::test]
    async fn unauthorized_response_invalidates_the_session() {
        let server = spawn_server(vec![(401, "{}".to_string())]);
        let client = authenticated_client(&server.base_url).await;
        let session = client.session.clone();

        let err = client.find_canonical_file("folder-9").await.unwrap_err();
        assert_eq!(err, SyncError::AuthRequired);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn fetch_without_a_bound_folder_is_unbound() {
        let mut cfg = SyncConfig::default();
        cfg.oauth_client_id = "client-123".to_string();
        let session = Arc::new(CloudSessionManager::new(cfg.clone(), AutoConsent));
        let mut client = RemoteStoreClient::new(cfg, session, NoPicker);

        assert_eq!(client.fetch().await.unwrap(), FetchOutcome::Unbound);
    }

    #[tokio::test]
    async fn picking_a_folder_requires_authentication() {
        let mut cfg = SyncConfig::default();
        cfg.oauth_client_id = "client-123".to_string();
        let session = Arc::new(CloudSessionManager::new(cfg.clone(), AutoConsent));
        let mut client = RemoteStoreClient::new(cfg, session, NoPicker);

        assert_eq!(
            client.pick_folder().await.unwrap_err(),
            SyncError::AuthRequired
        );
    }
}
