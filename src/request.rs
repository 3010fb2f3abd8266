//! Wire payload types and request validation.
//!
//! Control frames carry JSON payloads. On the way in they are decoded into
//! the raw serde records below and then validated into strongly-typed
//! requests; unknown fields are ignored, missing required fields and
//! out-of-range values are fatal protocol violations (the peer gets an
//! `EXCEPTION` frame, not a recoverable failure).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Largest accepted terminal dimension on either axis.
pub const MAX_WINDOW_DIM: u16 = 512;

/// Default terminal dimensions (rows, cols).
pub const DEFAULT_WINDOW: (u16, u16) = (24, 80);

/// Identity of a remote endpoint for caching purposes:
/// (username, lowercased hostname, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub username: String,
    pub hostname: String,
    pub port: u16,
}

impl CacheKey {
    /// Build a key, normalizing the hostname to lowercase.
    pub fn new(username: impl Into<String>, hostname: &str, port: u16) -> Self {
        Self {
            username: username.into(),
            hostname: hostname.to_lowercase(),
            port,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// Authentication inputs of a connect attempt.
///
/// Cached copies are sanitized: `try_keyboard` is never cached.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub private_key: Option<Vec<u8>>,
    pub passphrase: Option<String>,
    pub password: Option<String>,
    pub try_keyboard: bool,
}

impl Credentials {
    /// Whether the record carries no usable authentication input.
    pub fn is_empty(&self) -> bool {
        self.private_key.is_none() && self.password.is_none() && !self.try_keyboard
    }

    /// Copy suitable for the credential cache.
    pub fn sanitized(&self) -> Self {
        Self {
            try_keyboard: false,
            ..self.clone()
        }
    }

    /// Drop the private key (and its passphrase), keeping the rest.
    pub fn without_key(&self) -> Self {
        Self {
            private_key: None,
            passphrase: None,
            ..self.clone()
        }
    }
}

/// Validated REUSE request.
#[derive(Debug, Clone)]
pub struct ReuseRequest {
    pub key: CacheKey,
    pub share_key: Option<String>,
}

/// Validated CONNECT request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub key: CacheKey,
    pub fingerprint: Option<String>,
    pub reusable: bool,
    pub credentials: Credentials,
}

/// Raw REUSE payload as it appears on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReuseParams {
    pub username: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_key: Option<String>,
}

/// Raw CONNECT payload as it appears on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub username: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reusable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub private_key_encoded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub try_keyboard: bool,
}

/// CHALLENGE_RESPONSE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponseParams {
    pub responses: Vec<String>,
}

/// RESIZE payload. Values may be out of range; clamping happens when the
/// size is applied to a window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeParams {
    pub rows: i64,
    pub cols: i64,
}

/// CHALLENGE payload forwarded to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub title: String,
    pub instructions: String,
    pub language: String,
    pub prompts: Vec<ChallengePrompt>,
}

/// One prompt of a keyboard-interactive challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePrompt {
    pub prompt: String,
    pub echo: bool,
}

/// CONNECTED payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub fingerprint: String,
    pub banner: Option<String>,
}

/// UNCONNECTED / DISCONNECTED / EXCEPTION payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonPayload {
    pub reason: String,
}

/// RESULT payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// SHARED payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedPayload {
    pub share_key: String,
}

fn validate_host(username: &str, hostname: &str, port: Option<i64>) -> Result<CacheKey, String> {
    if username.is_empty() {
        return Err("username must not be empty".to_string());
    }
    if hostname.is_empty() {
        return Err("hostname must not be empty".to_string());
    }
    let port = match port {
        None => 22,
        Some(p) if (1..=65535).contains(&p) => p as u16,
        Some(p) => return Err(format!("port {} is out of range", p)),
    };
    Ok(CacheKey::new(username, hostname, port))
}

/// Decode and validate a REUSE payload.
pub fn parse_reuse(payload: &[u8]) -> Result<ReuseRequest, String> {
    let params: ReuseParams =
        serde_json::from_slice(payload).map_err(|e| format!("invalid REUSE payload: {}", e))?;
    let key = validate_host(&params.username, &params.hostname, params.port)?;
    Ok(ReuseRequest {
        key,
        share_key: params.share_key,
    })
}

/// Decode and validate a CONNECT payload.
pub fn parse_connect(payload: &[u8]) -> Result<ConnectRequest, String> {
    let params: ConnectParams =
        serde_json::from_slice(payload).map_err(|e| format!("invalid CONNECT payload: {}", e))?;
    let key = validate_host(&params.username, &params.hostname, params.port)?;

    if params.passphrase.is_some() && params.private_key.is_none() {
        return Err("passphrase requires a private key".to_string());
    }
    if params.private_key_encoded && params.private_key.is_none() {
        return Err("privateKeyEncoded requires a private key".to_string());
    }

    let private_key = match params.private_key {
        None => None,
        Some(text) if params.private_key_encoded => Some(
            BASE64
                .decode(text.as_bytes())
                .map_err(|e| format!("private key is not valid base64: {}", e))?,
        ),
        Some(text) => Some(text.into_bytes()),
    };

    Ok(ConnectRequest {
        key,
        fingerprint: params.fingerprint,
        reusable: params.reusable,
        credentials: Credentials {
            private_key,
            passphrase: params.passphrase,
            password: params.password,
            try_keyboard: params.try_keyboard,
        },
    })
}

/// Decode a CHALLENGE_RESPONSE payload.
pub fn parse_challenge_response(payload: &[u8]) -> Result<Vec<String>, String> {
    let params: ChallengeResponseParams = serde_json::from_slice(payload)
        .map_err(|e| format!("invalid CHALLENGE_RESPONSE payload: {}", e))?;
    Ok(params.responses)
}

/// Decode a RESIZE payload.
pub fn parse_resize(payload: &[u8]) -> Result<ResizeParams, String> {
    serde_json::from_slice(payload).map_err(|e| format!("invalid RESIZE payload: {}", e))
}

/// Validate a command payload: non-empty UTF-8 with no control characters.
pub fn parse_command(payload: &[u8]) -> Result<String, String> {
    let command =
        std::str::from_utf8(payload).map_err(|_| "command is not valid UTF-8".to_string())?;
    if command.is_empty() {
        return Err("command must not be empty".to_string());
    }
    if command
        .chars()
        .any(|c| matches!(c, '\u{0000}'..='\u{001f}' | '\u{007f}'..='\u{009f}'))
    {
        return Err("command must not contain control characters".to_string());
    }
    Ok(command.to_string())
}

/// Terminal dimensions, clamped to `[1, 512]` on both axes.
///
/// A resize with a non-positive value leaves that axis unchanged; the upper
/// bound is applied afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        let (rows, cols) = DEFAULT_WINDOW;
        Self { rows, cols }
    }
}

impl WindowSize {
    pub fn apply(&mut self, resize: ResizeParams) {
        if resize.rows > 0 {
            self.rows = resize.rows.min(MAX_WINDOW_DIM as i64) as u16;
        }
        if resize.cols > 0 {
            self.cols = resize.cols.min(MAX_WINDOW_DIM as i64) as u16;
        }
    }
}
