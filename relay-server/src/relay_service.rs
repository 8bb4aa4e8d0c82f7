//! §4.7 RelayService — Controller-side orchestrator used by the (external,
//! out-of-scope per §1) Transfer subsystem: resolve a virtual filename to its
//! owning Agent, round-trip the `RequestFileInfo`/`RequestFileUpload` RPCs,
//! and hand back a `StreamHandle` wrapping the Agent's HTTP upload body.
//!
//! Grounded in `mosaicfs-server/src/handlers/agent.rs`'s `replicate_proxy`
//! shape (resolve a target, call out, map the result to this crate's error
//! vocabulary) generalized from a synchronous HTTP proxy to an
//! RPC-then-await-a-promise orchestration, since there is no teacher
//! counterpart for the duplex half.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use relay_common::wire::ServerCommand;
use relay_common::{RelayError, RelayResult, TokenPurpose};

use crate::agent_registry::{AgentRegistry, Awaiter};
use crate::token_registry::TokenRegistry;

/// §5 timeouts, "indicative; implementers may tune".
pub const FILE_INFO_TIMEOUT: Duration = Duration::from_secs(30);
pub const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(120);

/// How the body stream ended, reported back by the Transfer subsystem once
/// it is done draining it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// The awaitable handed to the Transfer subsystem by `ObtainStream`, and the
/// same value handed to the `/files/{token}` handler once it arrives — both
/// sides see the same body/release pair, just from opposite ends.
pub struct StreamHandle {
    pub body: Body,
    release: oneshot::Sender<StreamOutcome>,
}

impl StreamHandle {
    /// Signal the HTTP handler that the body has been fully drained (or
    /// abandoned), letting its `POST /files` request complete.
    pub fn release(self, outcome: StreamOutcome) {
        let _ = self.release.send(outcome);
    }
}

struct PendingStream {
    agent_name: String,
    arrival: oneshot::Sender<RelayResult<StreamHandle>>,
}

pub struct RelayService {
    agents: Arc<AgentRegistry>,
    tokens: Arc<TokenRegistry>,
    /// Local directory pushed-download files are read from when serving
    /// `GET /downloads/{token}` (§4.5.3) — the Controller's own downloads dir.
    downloads_dir: PathBuf,
    streams: Mutex<HashMap<Uuid, PendingStream>>,
}

impl RelayService {
    pub fn new(agents: Arc<AgentRegistry>, tokens: Arc<TokenRegistry>, downloads_dir: PathBuf) -> Self {
        Self {
            agents,
            tokens,
            downloads_dir,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// `ObtainFileInfo(virtualFilename) → (exists, size) | NotFound`.
    pub async fn obtain_file_info(&self, virtual_filename: &str) -> RelayResult<(bool, u64)> {
        let owner = self
            .agents
            .resolve_owner(virtual_filename)
            .ok_or_else(|| RelayError::NotFound(virtual_filename.to_string()))?;

        let session = self
            .agents
            .current_session(&owner)
            .ok_or(RelayError::AgentDisconnected)?;

        let token = self.tokens.issue(TokenPurpose::FileUpload, &owner, virtual_filename);
        // FileInfo is a pure query, not an upload — the token only serves to
        // correlate this RPC's reply; it is never presented over HTTP, so we
        // never hand it to TokenRegistry.validate. Recorded here so both
        // RPCs share the same correlation mechanism described in §4.4.
        let (tx, rx) = oneshot::channel();
        {
            let mut outstanding = session.outstanding.lock().unwrap();
            outstanding.insert(token, Awaiter::FileInfo(tx));
        }

        if session.invoke(ServerCommand::RequestFileInfo { filename: virtual_filename.to_string(), token }).is_err() {
            session.outstanding.lock().unwrap().remove(&token);
            return Err(RelayError::AgentDisconnected);
        }

        match tokio::time::timeout(FILE_INFO_TIMEOUT, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(RelayError::AgentDisconnected),
            Err(_) => {
                session.outstanding.lock().unwrap().remove(&token);
                Err(RelayError::Timeout("FileInfo RPC".into()))
            }
        }
    }

    /// `ObtainStream(virtualFilename, startOffset, cancelToken) → StreamHandle`.
    pub async fn obtain_stream(
        &self,
        virtual_filename: &str,
        start_offset: u64,
        cancel: &CancellationToken,
    ) -> RelayResult<StreamHandle> {
        let owner = self
            .agents
            .resolve_owner(virtual_filename)
            .ok_or_else(|| RelayError::NotFound(virtual_filename.to_string()))?;

        let session = self
            .agents
            .current_session(&owner)
            .ok_or(RelayError::AgentDisconnected)?;

        let token = self.tokens.issue(TokenPurpose::FileUpload, &owner, virtual_filename);

        let (arrival_tx, arrival_rx) = oneshot::channel();
        {
            let mut streams = self.streams.lock().unwrap();
            streams.insert(token, PendingStream { agent_name: owner.clone(), arrival: arrival_tx });
        }

        if session
            .invoke(ServerCommand::RequestFileUpload {
                filename: virtual_filename.to_string(),
                start_offset,
                token,
            })
            .is_err()
        {
            self.streams.lock().unwrap().remove(&token);
            return Err(RelayError::AgentDisconnected);
        }

        info!(agent = %owner, %token, filename = virtual_filename, "requested file upload from agent");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.streams.lock().unwrap().remove(&token);
                Err(RelayError::Cancelled)
            }
            res = tokio::time::timeout(FIRST_BYTE_TIMEOUT, arrival_rx) => {
                match res {
                    Ok(Ok(arrived)) => arrived,
                    Ok(Err(_)) => Err(RelayError::AgentDisconnected),
                    Err(_) => {
                        self.streams.lock().unwrap().remove(&token);
                        Err(RelayError::Timeout("stream first byte".into()))
                    }
                }
            }
        };
        result
    }

    /// Called by the `/files/{token}` handler (§4.5.2) after it has already
    /// consumed the token and is positioned at the start of the file part's
    /// body. Resolves the matching `StreamHandle` for the waiting caller,
    /// then blocks until that caller calls `release()` — the handler must
    /// not return before that, per §9's async-control-flow note.
    pub async fn handle_stream_arrival(&self, agent_name: &str, token: Uuid, body: Body) -> RelayResult<StreamOutcome> {
        let pending = {
            let mut streams = self.streams.lock().unwrap();
            streams.remove(&token)
        };
        let Some(pending) = pending else {
            return Err(RelayError::NotFound("no pending stream for token".into()));
        };
        if pending.agent_name != agent_name {
            return Err(RelayError::Unauthorized("agent name does not match pending stream".into()));
        }

        let (release_tx, release_rx) = oneshot::channel();
        let handle = StreamHandle { body, release: release_tx };
        if pending.arrival.send(Ok(handle)).is_err() {
            // The waiting caller gave up (e.g. timed out) between the token
            // validating and this arrival — nothing left to block on.
            return Err(RelayError::Cancelled);
        }

        release_rx.await.map_err(|_| RelayError::Internal("release signal dropped".into()))
    }

    /// `PushCompletedDownload(virtualFilename, toAgent)`.
    pub fn push_completed_download(&self, virtual_filename: &str, to_agent: &str) -> RelayResult<()> {
        let session = self
            .agents
            .current_session(to_agent)
            .ok_or(RelayError::AgentDisconnected)?;
        let token = self.tokens.issue(TokenPurpose::FileDownload, to_agent, virtual_filename);
        session
            .invoke(ServerCommand::NotifyFileDownloadCompleted {
                filename: virtual_filename.to_string(),
                token,
            })
            .map_err(|_| RelayError::AgentDisconnected)
    }

    /// §4.4 "On channel close for any reason: ... cancel every outstanding
    /// `StreamPromise` owned by this session with `AgentDisconnected`."
    /// FileInfo awaiters live on the `AgentSession` itself and are cancelled
    /// automatically when the session `Arc` drops; `StreamPromise`s live
    /// here, keyed only by token, so the Hub calls this explicitly.
    pub fn handle_session_ended(&self, agent_name: &str) {
        let mut streams = self.streams.lock().unwrap();
        let stale: Vec<Uuid> = streams
            .iter()
            .filter(|(_, p)| p.agent_name == agent_name)
            .map(|(token, _)| *token)
            .collect();
        for token in stale {
            if let Some(pending) = streams.remove(&token) {
                if pending.arrival.send(Err(RelayError::AgentDisconnected)).is_err() {
                    warn!(agent = agent_name, %token, "stream promise already claimed at disconnect");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_registry::{AgentCatalog, AgentSession};
    use relay_common::AgentConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn registry_with(name: &str) -> Arc<AgentRegistry> {
        let registry = Arc::new(AgentRegistry::new());
        registry.replace_all(vec![AgentConfig {
            name: name.to_string(),
            secret: "0123456789abcdef".into(),
            allowed_cidrs: vec![],
        }]);
        registry
    }

    fn bind_session(registry: &AgentRegistry, name: &str) -> (Arc<AgentSession>, mpsc::UnboundedReceiver<ServerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(AgentSession {
            connection_id: Uuid::new_v4(),
            agent_name: name.to_string(),
            remote_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            login_time: Instant::now(),
            outstanding: Mutex::new(HashMap::new()),
            outgoing: tx,
            cancel: tokio_util::sync::CancellationToken::new(),
        });
        registry.bind(name, session.clone());
        (session, rx)
    }

    #[tokio::test]
    async fn obtain_file_info_without_owner_is_not_found() {
        let registry = Arc::new(AgentRegistry::new());
        let tokens = Arc::new(TokenRegistry::default());
        let service = RelayService::new(registry, tokens, PathBuf::from("/tmp"));
        let err = service.obtain_file_info("Music/missing.mp3").await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn obtain_stream_resolves_when_agent_posts() {
        let registry = registry_with("a1");
        let (session, mut rx) = bind_session(&registry, "a1");

        let mut files = HashMap::new();
        files.insert("Music/song.mp3".to_string(), 1024u64);
        registry.set_catalog("a1", AgentCatalog { files, database_path: "/tmp/a1.db".into(), registered_at: Instant::now() });

        let tokens = Arc::new(TokenRegistry::default());
        let service = Arc::new(RelayService::new(registry.clone(), tokens, PathBuf::from("/tmp")));

        let svc = service.clone();
        let obtain = tokio::spawn(async move {
            let cancel = tokio_util::sync::CancellationToken::new();
            svc.obtain_stream("Music/song.mp3", 0, &cancel).await
        });

        let cmd = rx.recv().await.expect("expected RequestFileUpload");
        let token = match cmd {
            ServerCommand::RequestFileUpload { token, .. } => token,
            other => panic!("unexpected command {other:?}"),
        };
        drop(session);

        // `handle_stream_arrival` blocks on `release`, so it must run
        // concurrently with the `obtain` task rather than being awaited here.
        let arrival = tokio::spawn({
            let service = service.clone();
            async move { service.handle_stream_arrival("a1", token, Body::empty()).await }
        });

        let stream_handle = obtain.await.unwrap().expect("stream should resolve");
        stream_handle.release(StreamOutcome::Completed);
        let outcome = arrival.await.unwrap();
        assert!(matches!(outcome, Ok(StreamOutcome::Completed)));
    }

    #[tokio::test]
    async fn session_ended_cancels_pending_stream() {
        let registry = registry_with("a1");
        let (_session, mut rx) = bind_session(&registry, "a1");
        let mut files = HashMap::new();
        files.insert("Music/song.mp3".to_string(), 1024u64);
        registry.set_catalog("a1", AgentCatalog { files, database_path: "/tmp/a1.db".into(), registered_at: Instant::now() });

        let tokens = Arc::new(TokenRegistry::default());
        let service = Arc::new(RelayService::new(registry.clone(), tokens, PathBuf::from("/tmp")));

        let svc = service.clone();
        let obtain = tokio::spawn(async move {
            let cancel = tokio_util::sync::CancellationToken::new();
            svc.obtain_stream("Music/song.mp3", 0, &cancel).await
        });

        let _ = rx.recv().await.expect("expected RequestFileUpload");
        service.handle_session_ended("a1");

        let result = obtain.await.unwrap();
        assert!(matches!(result, Err(RelayError::AgentDisconnected)));
    }

    #[tokio::test]
    async fn obtain_stream_cancel_token_rejects_waiter() {
        let registry = registry_with("a1");
        let (_session, _rx) = bind_session(&registry, "a1");
        let mut files = HashMap::new();
        files.insert("Music/song.mp3".to_string(), 1024u64);
        registry.set_catalog("a1", AgentCatalog { files, database_path: "/tmp/a1.db".into(), registered_at: Instant::now() });

        let tokens = Arc::new(TokenRegistry::default());
        let service = RelayService::new(registry, tokens, PathBuf::from("/tmp"));
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let result = service.obtain_stream("Music/song.mp3", 0, &cancel).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }
}
