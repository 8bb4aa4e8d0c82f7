//! §4.5 RelayHTTP — the three bulk-transfer endpoints on the Controller.
//!
//! Header/credential checking follows `mosaicfs-server/src/auth/hmac_auth.rs`'s
//! shape (parse header, look up the principal, recompute and compare), and
//! the streaming-body handling follows `mosaicfs-server/src/handlers/files.rs`'s
//! Range-aware file serving, generalized from "read a local file" to
//! "forward an inbound/outbound HTTP body without buffering it".

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path as AxumPath, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use relay_common::credential::validate as validate_credential;
use relay_common::{RelayError, RelayMode, RelayResult, TokenPurpose};

use crate::agent_registry::AgentCatalog;
use crate::relay_service::StreamOutcome;
use crate::state::{AppState, SharedState};

const HDR_API_KEY: &str = "x-api-key";
const HDR_AGENT: &str = "x-relay-agent";
const HDR_CREDENTIAL: &str = "x-relay-credential";
const HDR_FILENAME_B64: &str = "x-relay-filename-base64";

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/shares/{token}", post(upload_shares))
        .route("/files/{token}", post(upload_file))
        .route("/downloads/{token}", get(download_file))
        .with_state(state)
}

fn require_mode(state: &AppState) -> RelayResult<()> {
    if matches!(state.mode, RelayMode::Controller | RelayMode::Debug) {
        Ok(())
    } else {
        Err(RelayError::ModeMismatch)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> RelayResult<&'a str> {
    headers
        .get(name)
        .ok_or_else(|| RelayError::Unauthorized(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| RelayError::Unauthorized(format!("malformed {name} header")))
}

fn require_api_key(state: &AppState, headers: &HeaderMap) -> RelayResult<()> {
    let presented = header_str(headers, HDR_API_KEY)?;
    if presented == state.api_key {
        Ok(())
    } else {
        Err(RelayError::Unauthorized("invalid api key".into()))
    }
}

fn parse_token(raw: &str) -> RelayResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| RelayError::BadRequest("malformed token".into()))
}

/// §6 upload-endpoint status contract: a non-multipart body is `415`, distinct
/// from the `400`/`401` a well-formed-but-invalid multipart request gets.
/// Checked before the `Multipart` extractor runs, since its own rejection on
/// the wrong content type is a `400`.
fn require_multipart_content_type(headers: &HeaderMap) -> RelayResult<()> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("multipart/form-data") {
        Ok(())
    } else {
        Err(RelayError::UnsupportedMediaType(format!(
            "expected multipart/form-data, got {content_type:?}"
        )))
    }
}

/// Verify `X-Relay-Agent`/`X-Relay-Credential` against the Controller's
/// configured secret for that Agent, recomputing `credential(secret,
/// agentName, token)` and comparing in constant time (§4.1).
fn authenticate_request(state: &AppState, headers: &HeaderMap, token: Uuid) -> RelayResult<String> {
    let agent_name = header_str(headers, HDR_AGENT)?.to_string();
    let presented = header_str(headers, HDR_CREDENTIAL)?;

    let config = state
        .agents
        .get(&agent_name)
        .ok_or_else(|| RelayError::Unauthorized("unknown agent".into()))?;

    if !validate_credential(config.secret.as_bytes(), &agent_name, &token.to_string(), presented) {
        warn!(agent = %agent_name, token_prefix = %token.to_string().chars().take(8).collect::<String>(), "credential validation failed");
        return Err(RelayError::Unauthorized("credential mismatch".into()));
    }

    Ok(agent_name)
}

/// §4.5.1 agent-name sanitization: accept only `[A-Za-z0-9_-]` in full, else
/// substitute the literal `"unknown"` — defends the temp-file path against
/// traversal from a compromised/misconfigured Agent name.
fn sanitize_agent_name(name: &str) -> String {
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
        name.to_string()
    } else {
        "unknown".to_string()
    }
}

/// Translate a virtual filename's separators to the host's own path join
/// rules, rejecting any component that could escape `base` (Open Question
/// #3 resolution in DESIGN.md: wire format is forward-slash, traversal is
/// always rejected regardless of separator style).
fn resolve_under(base: &Path, virtual_filename: &str) -> RelayResult<PathBuf> {
    let mut path = base.to_path_buf();
    for component in virtual_filename.split(['/', '\\']) {
        if component.is_empty() || component == "." || component == ".." {
            return Err(RelayError::BadRequest("invalid path component in filename".into()));
        }
        path.push(component);
    }
    Ok(path)
}

#[derive(serde::Deserialize)]
struct ShareDescriptor {
    virtual_filename: String,
    size: u64,
}

/// §4.5.1 `POST /shares/{token}`.
async fn upload_shares(
    State(state): State<SharedState>,
    AxumPath(token): AxumPath<String>,
    request: Request,
) -> Response {
    match upload_shares_inner(&state, &token, request).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn upload_shares_inner(state: &SharedState, token: &str, request: Request) -> RelayResult<()> {
    require_mode(state)?;
    let headers = request.headers().clone();
    require_api_key(state, &headers)?;
    let token = parse_token(token)?;
    let agent_name = authenticate_request(state, &headers, token)?;

    state
        .tokens
        .validate(token, TokenPurpose::ShareUpload, &agent_name, "", true)
        .map_err(|e| RelayError::Unauthorized(e.to_string()))?;

    require_multipart_content_type(&headers)?;
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| RelayError::BadRequest(format!("malformed multipart: {e}")))?;

    let sanitized = sanitize_agent_name(&agent_name);
    let mut shares_json: Option<String> = None;
    let mut database_path: Option<PathBuf> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::BadRequest(format!("malformed multipart: {e}")))?
    {
        match field.name() {
            Some("shares") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| RelayError::BadRequest(format!("bad shares part: {e}")))?;
                shares_json = Some(text);
            }
            Some("database") => {
                let random = Uuid::new_v4().simple().to_string();
                let path = state.share_temp_dir.join(format!("share_{sanitized}_{random}.db"));
                tokio::fs::create_dir_all(&state.share_temp_dir)
                    .await
                    .map_err(|e| RelayError::Internal(e.to_string()))?;
                let mut file = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| RelayError::Internal(e.to_string()))?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| RelayError::BadRequest(format!("bad database part: {e}")))?
                {
                    file.write_all(&chunk).await.map_err(|e| RelayError::Internal(e.to_string()))?;
                }
                database_path = Some(path);
            }
            _ => {}
        }
    }

    let shares_json = shares_json.ok_or_else(|| RelayError::BadRequest("missing 'shares' part".into()))?;
    let database_path = database_path.ok_or_else(|| RelayError::BadRequest("missing 'database' part".into()))?;

    let descriptors: Vec<ShareDescriptor> = serde_json::from_str(&shares_json)
        .map_err(|e| RelayError::BadRequest(format!("invalid shares JSON: {e}")))?;

    let files = descriptors.into_iter().map(|d| (d.virtual_filename, d.size)).collect();
    state.agents.set_catalog(&agent_name, AgentCatalog {
        files,
        database_path,
        registered_at: Instant::now(),
    });

    info!(agent = %agent_name, "share catalog installed");
    Ok(())
}

/// §4.5.2 `POST /files/{token}`.
async fn upload_file(
    State(state): State<SharedState>,
    AxumPath(token): AxumPath<String>,
    request: Request,
) -> Response {
    match upload_file_inner(&state, &token, request).await {
        Ok(outcome) => match outcome {
            StreamOutcome::Completed => StatusCode::OK.into_response(),
            StreamOutcome::Cancelled => StatusCode::from_u16(499).unwrap().into_response(),
            StreamOutcome::Failed => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
        Err(e) => e.into_response(),
    }
}

async fn upload_file_inner(
    state: &SharedState,
    token: &str,
    request: Request,
) -> RelayResult<StreamOutcome> {
    require_mode(state)?;
    let headers = request.headers().clone();
    require_api_key(state, &headers)?;
    let token = parse_token(token)?;
    let agent_name = authenticate_request(state, &headers, token)?;

    require_multipart_content_type(&headers)?;
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| RelayError::BadRequest(format!("malformed multipart: {e}")))?;

    let field = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::BadRequest(format!("malformed multipart: {e}")))?
        .ok_or_else(|| RelayError::BadRequest("missing file part".into()))?;

    let filename = field
        .file_name()
        .map(|s| s.to_string())
        .ok_or_else(|| RelayError::BadRequest("file part missing filename".into()))?;

    state
        .tokens
        .validate(token, TokenPurpose::FileUpload, &agent_name, &filename, true)
        .map_err(|e| RelayError::Unauthorized(e.to_string()))?;

    let started = Instant::now();
    info!(agent = %agent_name, %token, filename = %filename, "file upload beginning");

    // `Field` is itself a `Stream<Item = Result<Bytes, MultipartError>>`, so
    // the body forwards straight through to the Agent's HTTP client without
    // ever buffering the file in memory (§4.5.2 "streams the body directly").
    let body = Body::from_stream(field);

    let outcome = state.service.handle_stream_arrival(&agent_name, token, body).await?;

    info!(
        agent = %agent_name, %token, filename = %filename,
        elapsed_ms = started.elapsed().as_millis(),
        outcome = ?outcome,
        "file upload handler returning"
    );
    Ok(outcome)
}

/// §4.5.3 `GET /downloads/{token}`.
async fn download_file(
    State(state): State<SharedState>,
    AxumPath(token): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    match download_file_inner(&state, &token, &headers).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn download_file_inner(state: &AppState, token: &str, headers: &HeaderMap) -> RelayResult<Response> {
    require_mode(state)?;
    require_api_key(state, headers)?;
    let token = parse_token(token)?;
    let agent_name = authenticate_request(state, headers, token)?;

    let filename_b64 = header_str(headers, HDR_FILENAME_B64)?;
    let filename_bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, filename_b64)
        .map_err(|_| RelayError::BadRequest("malformed X-Relay-Filename-Base64".into()))?;
    let filename = String::from_utf8(filename_bytes)
        .map_err(|_| RelayError::BadRequest("X-Relay-Filename-Base64 is not valid UTF-8".into()))?;

    // Not single-use: the Agent may retry a failed HTTP pull (§4.5.3, §9).
    state
        .tokens
        .validate(token, TokenPurpose::FileDownload, &agent_name, &filename, false)
        .map_err(|e| RelayError::Unauthorized(e.to_string()))?;

    let path = resolve_under(state.service.downloads_dir(), &filename)?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| RelayError::NotFound(format!("local file missing: {filename}")))?;

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    info!(agent = %agent_name, %token, filename = %filename, "serving pushed-download pull");
    Ok((StatusCode::OK, body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_rejects_path_traversal_names() {
        assert_eq!(sanitize_agent_name("../../etc"), "unknown");
        assert_eq!(sanitize_agent_name("a1"), "a1");
        assert_eq!(sanitize_agent_name("a_1-2"), "a_1-2");
        assert_eq!(sanitize_agent_name(""), "unknown");
    }

    #[test]
    fn resolve_under_rejects_dotdot() {
        let base = Path::new("/var/lib/relay/downloads");
        assert!(resolve_under(base, "Music/../../../etc/passwd").is_err());
        assert!(resolve_under(base, "Music\\..\\secrets").is_err());
    }

    #[test]
    fn resolve_under_translates_backslashes() {
        let base = Path::new("/var/lib/relay/downloads");
        let resolved = resolve_under(base, "Music\\song.mp3").unwrap();
        assert_eq!(resolved, base.join("Music").join("song.mp3"));
    }
}
