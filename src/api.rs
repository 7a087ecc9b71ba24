use crate::models::{
    ActionBody, ActionKind, AuthCheckResponse, Credentials, Email, EmailId, Folder,
    OutgoingEmail, PasswordChange, Registration, SentEmailResponse, User, UserResponse,
    UsersResponse,
};
use anyhow::Context;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::{self, HeaderMap};
use hyper::{Body, Client, Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure taxonomy shared by every request the client issues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Connectivity failure, timeout, or a response we could not read.
    #[error("Network error: {0}")]
    Transport(String),
    /// The server no longer accepts the session cookie.
    #[error("{0}")]
    AuthRejected(String),
    /// The server refused the request (unknown email, forbidden action, duplicate user...).
    #[error("{0}")]
    Conflict(String),
    /// Local input was rejected before any request went out.
    #[error("{0}")]
    Validation(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }

    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, ApiError::AuthRejected(_))
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[async_trait]
pub trait MailApi: Send + Sync {
    /// `Ok(None)` means the server answered but does not recognise the session.
    async fn check_auth(&self) -> ApiResult<Option<User>>;
    async fn login(&self, credentials: &Credentials) -> ApiResult<User>;
    async fn register(&self, registration: &Registration) -> ApiResult<User>;
    async fn logout(&self) -> ApiResult<()>;
    async fn list_folder(&self, folder: Folder) -> ApiResult<Vec<Email>>;
    async fn get_email(&self, id: EmailId) -> ApiResult<Email>;
    async fn email_action(&self, id: EmailId, action: ActionKind) -> ApiResult<()>;
    async fn send_email(&self, email: &OutgoingEmail) -> ApiResult<Email>;
    async fn list_users(&self) -> ApiResult<Vec<User>>;
    async fn change_password(&self, change: &PasswordChange) -> ApiResult<()>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

fn error_for_status(status: StatusCode, body: &[u8]) -> ApiError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        });

    if status == StatusCode::UNAUTHORIZED {
        ApiError::AuthRejected(message)
    } else {
        ApiError::Conflict(message)
    }
}

fn decode<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError::Transport(format!("Unreadable response from {}: {}", path, e)))
}

fn encode<B: serde::Serialize>(body: &B) -> ApiResult<Vec<u8>> {
    serde_json::to_vec(body).map_err(|e| ApiError::Validation(format!("Invalid request: {}", e)))
}

/// Session cookies issued by the server, replayed on every request.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn absorb(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(header::SET_COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            let mut parts = raw.split(';');
            let Some((name, value)) = parts.next().and_then(|p| p.split_once('=')) else {
                continue;
            };
            let name = name.trim().to_string();
            let value = value.trim().to_string();

            // Flask clears a session with an empty value, Max-Age=0 and a 1970 expiry
            let expired = parts.any(|attr| {
                let attr = attr.trim().to_ascii_lowercase();
                attr == "max-age=0" || attr.starts_with("expires=thu, 01 jan 1970")
            });

            if expired || value.is_empty() {
                self.cookies.remove(&name);
            } else {
                self.cookies.insert(name, value);
            }
        }
    }

    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }
}

pub struct HttpApi {
    client: Client<HttpsConnector<HttpConnector>>,
    base_url: String,
    timeout: Duration,
    cookies: Mutex<CookieJar>,
}

impl HttpApi {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("Failed to load native roots")?
            .https_or_http()
            .enable_http1()
            .build();

        Ok(Self {
            client: Client::builder().build(connector),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            cookies: Mutex::new(CookieJar::default()),
        })
    }

    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> ApiResult<Vec<u8>> {
        let uri = format!("{}{}", self.base_url, path);
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(header::ACCEPT, "application/json");

        if let Some(cookie) = self.cookies.lock().ok().and_then(|jar| jar.header_value()) {
            builder = builder.header(header::COOKIE, cookie);
        }

        let request = match body {
            Some(bytes) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(bytes)),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| ApiError::Transport(format!("Invalid request to {}: {}", path, e)))?;

        debug!(%method, path, "sending request");

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ApiError::Transport(format!("Request to {} timed out", path)))?
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        if let Ok(mut jar) = self.cookies.lock() {
            jar.absorb(response.headers());
        }

        let status = response.status();
        let bytes = tokio::time::timeout(self.timeout, hyper::body::to_bytes(response.into_body()))
            .await
            .map_err(|_| ApiError::Transport(format!("Response from {} timed out", path)))?
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        debug!(%method, path, status = status.as_u16(), "response received");

        if status.is_success() {
            Ok(bytes.to_vec())
        } else {
            Err(error_for_status(status, &bytes))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let bytes = self.send(Method::GET, path, None).await?;
        decode(path, &bytes)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let bytes = self.send(Method::POST, path, Some(encode(body)?)).await?;
        decode(path, &bytes)
    }
}

#[async_trait]
impl MailApi for HttpApi {
    async fn check_auth(&self) -> ApiResult<Option<User>> {
        let status: AuthCheckResponse = self.get_json("/check_auth").await?;
        Ok(match status {
            AuthCheckResponse {
                authenticated: true,
                user: Some(user),
            } => Some(user),
            _ => None,
        })
    }

    async fn login(&self, credentials: &Credentials) -> ApiResult<User> {
        let response: UserResponse = self.post_json("/login", credentials).await?;
        Ok(response.user)
    }

    async fn register(&self, registration: &Registration) -> ApiResult<User> {
        let response: UserResponse = self.post_json("/register", registration).await?;
        Ok(response.user)
    }

    async fn logout(&self) -> ApiResult<()> {
        let result = self.send(Method::POST, "/logout", None).await.map(|_| ());
        // Whatever the server said, this client no longer holds a session
        if let Ok(mut jar) = self.cookies.lock() {
            jar.clear();
        }
        result
    }

    async fn list_folder(&self, folder: Folder) -> ApiResult<Vec<Email>> {
        let path = folder.endpoint();
        let mut payload: serde_json::Map<String, serde_json::Value> = self.get_json(&path).await?;

        match payload.remove(&folder.response_key()) {
            Some(list) => serde_json::from_value(list).map_err(|e| {
                ApiError::Transport(format!("Unreadable response from {}: {}", path, e))
            }),
            None => {
                warn!(%folder, "folder response without a collection, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    async fn get_email(&self, id: EmailId) -> ApiResult<Email> {
        self.get_json(&format!("/emails/{}", id)).await
    }

    async fn email_action(&self, id: EmailId, action: ActionKind) -> ApiResult<()> {
        let path = format!("/email/{}/action", id);
        self.send(Method::POST, &path, Some(encode(&ActionBody { action })?))
            .await
            .map(|_| ())
    }

    async fn send_email(&self, email: &OutgoingEmail) -> ApiResult<Email> {
        let response: SentEmailResponse = self.post_json("/send_email", email).await?;
        Ok(response.email)
    }

    async fn list_users(&self) -> ApiResult<Vec<User>> {
        let response: UsersResponse = self.get_json("/users").await?;
        Ok(response.users)
    }

    async fn change_password(&self, change: &PasswordChange) -> ApiResult<()> {
        self.send(Method::POST, "/change-password", Some(encode(change)?))
            .await
            .map(|_| ())
    }
}

/// Scripted in-memory server for tests. Folder fetches and action confirmations
/// can be held open with `hold_*` and released in any order.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::oneshot;

    pub struct Script {
        pub check_auth: ApiResult<Option<User>>,
        pub login: ApiResult<User>,
        pub register: ApiResult<User>,
        pub logout: ApiResult<()>,
        pub folders: HashMap<Folder, ApiResult<Vec<Email>>>,
        pub details: HashMap<EmailId, Email>,
        pub action_results: VecDeque<ApiResult<()>>,
        pub send: Option<ApiResult<Email>>,
        pub users: ApiResult<Vec<User>>,
        pub change_password: ApiResult<()>,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                check_auth: Ok(None),
                login: Err(ApiError::AuthRejected("Invalid username or password".into())),
                register: Err(ApiError::Conflict("Registration failed".into())),
                logout: Ok(()),
                folders: HashMap::new(),
                details: HashMap::new(),
                action_results: VecDeque::new(),
                send: None,
                users: Ok(Vec::new()),
                change_password: Ok(()),
            }
        }
    }

    #[derive(Default)]
    pub struct FakeApi {
        pub script: Mutex<Script>,
        pub calls: Mutex<Vec<String>>,
        folder_gates: Mutex<HashMap<Folder, VecDeque<oneshot::Receiver<()>>>>,
        action_gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
    }

    impl FakeApi {
        pub fn with_script(script: Script) -> Self {
            Self {
                script: Mutex::new(script),
                ..Self::default()
            }
        }

        /// The next fetch of `folder` waits until the returned sender fires (or is dropped).
        pub fn hold_folder(&self, folder: Folder) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.folder_gates
                .lock()
                .unwrap()
                .entry(folder)
                .or_default()
                .push_back(rx);
            tx
        }

        pub fn hold_action(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.action_gates.lock().unwrap().push_back(rx);
            tx
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl MailApi for FakeApi {
        async fn check_auth(&self) -> ApiResult<Option<User>> {
            self.record("check_auth".into());
            self.script.lock().unwrap().check_auth.clone()
        }

        async fn login(&self, credentials: &Credentials) -> ApiResult<User> {
            self.record(format!("login {}", credentials.username));
            self.script.lock().unwrap().login.clone()
        }

        async fn register(&self, registration: &Registration) -> ApiResult<User> {
            self.record(format!("register {}", registration.username));
            self.script.lock().unwrap().register.clone()
        }

        async fn logout(&self) -> ApiResult<()> {
            self.record("logout".into());
            self.script.lock().unwrap().logout.clone()
        }

        async fn list_folder(&self, folder: Folder) -> ApiResult<Vec<Email>> {
            self.record(format!("list {}", folder.collection()));
            let gate = self
                .folder_gates
                .lock()
                .unwrap()
                .get_mut(&folder)
                .and_then(|q| q.pop_front());
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            self.script
                .lock()
                .unwrap()
                .folders
                .get(&folder)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn get_email(&self, id: EmailId) -> ApiResult<Email> {
            self.record(format!("detail {}", id));
            self.script
                .lock()
                .unwrap()
                .details
                .get(&id)
                .cloned()
                .ok_or_else(|| ApiError::Conflict("Email not found".into()))
        }

        async fn email_action(&self, id: EmailId, action: ActionKind) -> ApiResult<()> {
            self.record(format!("action {} {}", id, action));
            // Result is chosen at issue time, the gate only delays delivery
            let result = self
                .script
                .lock()
                .unwrap()
                .action_results
                .pop_front()
                .unwrap_or(Ok(()));
            let gate = self.action_gates.lock().unwrap().pop_front();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            result
        }

        async fn send_email(&self, email: &OutgoingEmail) -> ApiResult<Email> {
            self.record(format!("send {}", email.recipient_id));
            self.script
                .lock()
                .unwrap()
                .send
                .clone()
                .unwrap_or_else(|| Err(ApiError::Conflict("Invalid recipient".into())))
        }

        async fn list_users(&self) -> ApiResult<Vec<User>> {
            self.record("users".into());
            self.script.lock().unwrap().users.clone()
        }

        async fn change_password(&self, _change: &PasswordChange) -> ApiResult<()> {
            self.record("change_password".into());
            self.script.lock().unwrap().change_password.clone()
        }
    }
}
