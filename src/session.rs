use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Mutex;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// What a completed consent popup hands back.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub scope: String,
    pub expires_in: Option<u64>,
}

/// Bearer credential for the cloud API. Lives only in memory for the
/// session; there is no refresh token, expiry is detected reactively when
/// a dependent call fails with an auth error.
#[derive(Clone)]
pub struct SessionToken {
    access_token: String,
    scope: String,
    expires_at: Option<DateTime<Utc>>,
}

impl SessionToken {
    fn from_grant(grant: TokenGrant) -> Self {
        Self {
            access_token: grant.access_token,
            scope: grant.scope,
            expires_at: grant
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs as i64)),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("access_token", &"<redacted>")
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Signed-in profile from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub picture: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Authenticating,
    Authenticated,
    /// Bootstrap failed; terminal until the process restarts.
    Error(String),
}

/// The UI collaborator that runs the interactive consent popup.
/// `Ok(None)` is user denial/cancellation and is not a failure.
pub trait ConsentFlow {
    fn request_access(
        &self,
        client_id: &str,
        scope: &str,
    ) -> impl std::future::Future<Output = Result<Option<TokenGrant>>>;
}

struct ApiClients {
    http: reqwest::Client,
    userinfo_url: reqwest::Url,
    revoke_url: reqwest::Url,
}

struct SessionInner {
    state: SessionState,
    api: Option<ApiClients>,
    token: Option<SessionToken>,
    profile: Option<UserProfile>,
}

/// Bootstraps the two API clients and manages the consent/token lifecycle.
///
/// All methods take `&self`; state lives behind a mutex that is never held
/// across an await. The consent popup itself is guarded by a separate
/// async mutex so concurrent `sign_in` calls coalesce into one popup.
pub struct CloudSessionManager<C: ConsentFlow> {
    cfg: SyncConfig,
    consent: C,
    inner: Mutex<SessionInner>,
    consent_gate: tokio::sync::Mutex<()>,
}

impl<C: ConsentFlow> CloudSessionManager<C> {
    pub fn new(cfg: SyncConfig, consent: C) -> Self {
        Self {
            cfg,
            consent,
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                api: None,
                token: None,
                profile: None,
            }),
            consent_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Explicit two-phase bootstrap: the data-API client and the identity
    /// client are both prepared before either result is inspected. Either
    /// failure leaves the session in a terminal `Error` state.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Uninitialized => inner.state = SessionState::Initializing,
                SessionState::Error(ref msg) => return Err(SyncError::NotReady(msg.clone())),
                // Already bootstrapped; nothing to redo.
                _ => return Ok(()),
            }
        }

        let data_api = async {
            reqwest::Url::parse(&self.cfg.api_base_url)
                .map_err(|e| format!("bad api_base_url: {e}"))?;
            reqwest::Client::builder()
                .build()
                .map_err(|e| format!("http client: {e}"))
        };
        let identity = async {
            if self.cfg.oauth_client_id.trim().is_empty() {
                return Err("oauth_client_id is not configured".to_string());
            }
            let userinfo = reqwest::Url::parse(&self.cfg.userinfo_url)
                .map_err(|e| format!("bad userinfo_url: {e}"))?;
            let revoke = reqwest::Url::parse(&self.cfg.revoke_url)
                .map_err(|e| format!("bad revoke_url: {e}"))?;
            Ok((userinfo, revoke))
        };
        let (data_api, identity) = tokio::join!(data_api, identity);

        let mut inner = self.lock();
        match (data_api, identity) {
            (Ok(http), Ok((userinfo_url, revoke_url))) => {
                inner.api = Some(ApiClients {
                    http,
                    userinfo_url,
                    revoke_url,
                });
                inner.state = SessionState::Ready;
                log::info!("cloud session ready");
                Ok(())
            }
            (data_api, identity) => {
                let msg = data_api
                    .err()
                    .or_else(|| identity.err())
                    .unwrap_or_else(|| "initialization failed".to_string());
                log::error!("cloud session bootstrap failed: {msg}");
                inner.state = SessionState::Error(msg.clone());
                Err(SyncError::NotReady(msg))
            }
        }
    }

    /// Runs the interactive consent flow and, on success, fetches the
    /// signed-in profile. Returns the resulting session state:
    /// `Authenticated` on success, `Ready` when the user dismissed the
    /// popup. Concurrent calls share one popup; late arrivals observe the
    /// first flight's outcome.
    pub async fn sign_in(&self) -> Result<SessionState> {
        let _gate = self.consent_gate.lock().await;

        {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Authenticated => return Ok(SessionState::Authenticated),
                SessionState::Ready => inner.state = SessionState::Authenticating,
                SessionState::Error(ref msg) => return Err(SyncError::NotReady(msg.clone())),
                ref other => {
                    return Err(SyncError::NotReady(format!(
                        "sign-in requires a ready session (state: {other:?})"
                    )))
                }
            }
        }

        match self
            .consent
            .request_access(&self.cfg.oauth_client_id, &self.cfg.oauth_scope)
            .await
        {
            Ok(Some(grant)) => {
                let token = SessionToken::from_grant(grant);
                {
                    let mut inner = self.lock();
                    inner.token = Some(token);
                    inner.state = SessionState::Authenticated;
                }
                match self.fetch_profile().await {
                    Ok(profile) => {
                        log::info!("signed in as {}", profile.email);
                        self.lock().profile = Some(profile);
                    }
                    // The consent succeeded; a failed profile fetch does
                    // not undo the sign-in.
                    Err(e) => log::warn!("profile fetch failed: {e}"),
                }
                Ok(SessionState::Authenticated)
            }
            Ok(None) => {
                log::debug!("consent popup dismissed");
                self.lock().state = SessionState::Ready;
                Ok(SessionState::Ready)
            }
            Err(e) => {
                self.lock().state = SessionState::Ready;
                Err(e)
            }
        }
    }

    /// Revokes the token (best effort) and clears the cached profile.
    pub async fn sign_out(&self) {
        let (token, revoke) = {
            let mut inner = self.lock();
            let token = inner.token.take();
            inner.profile = None;
            if matches!(
                inner.state,
                SessionState::Authenticated | SessionState::Authenticating
            ) {
                inner.state = SessionState::Ready;
            }
            let revoke = inner
                .api
                .as_ref()
                .map(|api| (api.http.clone(), api.revoke_url.clone()));
            (token, revoke)
        };

        if let (Some(token), Some((http, url))) = (token, revoke) {
            let result = http
                .post(url)
                .query(&[("token", token.access_token())])
                .send()
                .await;
            if let Err(e) = result {
                log::debug!("token revocation failed (ignored): {e}");
            }
        }
        log::info!("signed out");
    }

    /// Reactive expiry: drops the rejected token so the caller can
    /// re-invoke `sign_in`. Called by dependent clients on an auth error.
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        inner.token = None;
        inner.profile = None;
        if inner.state == SessionState::Authenticated {
            inner.state = SessionState::Ready;
        }
        log::debug!("session token invalidated");
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock().state == SessionState::Authenticated
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.lock().profile.clone()
    }

    pub fn bearer_token(&self) -> Result<String> {
        self.lock()
            .token
            .as_ref()
            .map(|t| t.access_token().to_string())
            .ok_or(SyncError::AuthRequired)
    }

    async fn fetch_profile(&self) -> Result<UserProfile> {
        let (http, url) = {
            let inner = self.lock();
            let api = inner
                .api
                .as_ref()
                .ok_or_else(|| SyncError::NotReady("session not initialized".to_string()))?;
            (api.http.clone(), api.userinfo_url.clone())
        };
        let token = self.bearer_token()?;

        let res = http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        if !res.status().is_success() {
            return Err(SyncError::Network(format!(
                "userinfo fetch failed: HTTP {}",
                res.status()
            )));
        }
        res.json::<UserProfile>()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
