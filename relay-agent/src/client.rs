//! §4.6 RelayClient — the Agent's persistent duplex session to the
//! Controller: connect, authenticate, serve server-invoked methods,
//! reconnect with backoff. Bridges JSON-tagged frames over
//! `tokio-tungstenite` the way `sven-mcp/src/node_proxy.rs` bridges its own
//! control protocol, generalized from per-call connections to one
//! long-lived session with a background writer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use relay_common::credential::credential;
use relay_common::wire::{ClientCommand, ServerCommand};

use crate::config::AgentConfig;
use crate::http::ControllerClient;
use crate::local_share::LocalCatalog;

/// §5 "reconnect backoff 0/1/3/10/30/60 s then 60 s".
const BACKOFF_SCHEDULE: &[u64] = &[0, 1, 3, 10, 30, 60];

pub struct RelayClient {
    config: AgentConfig,
    controller: Arc<ControllerClient>,
    catalog: RwLock<LocalCatalog>,
    cancel: CancellationToken,
    fatal: AtomicBool,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl RelayClient {
    pub fn new(config: AgentConfig) -> anyhow::Result<Arc<Self>> {
        let controller = Arc::new(ControllerClient::new(config.relay.controller.clone(), config.instance_name.clone())?);
        let catalog = LocalCatalog::scan(&config.relay.share_paths);
        Ok(Arc::new(Self {
            config,
            controller,
            catalog: RwLock::new(catalog),
            cancel: CancellationToken::new(),
            fatal: AtomicBool::new(false),
            handle: StdMutex::new(None),
        }))
    }

    /// Idempotent. A concurrent `start`/`stop` loses the race silently — the
    /// non-blocking try-lock is the mutual-exclusion mechanism §4.6 calls for.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut handle) = self.handle.try_lock() else {
            warn!("start() raced with stop(), ignoring");
            return;
        };
        if handle.is_some() {
            return;
        }
        let client = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { client.run().await }));
    }

    pub fn stop(&self) {
        let Ok(mut handle) = self.handle.try_lock() else {
            warn!("stop() raced with start(), ignoring");
            return;
        };
        self.cancel.cancel();
        if let Some(h) = handle.take() {
            h.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempt = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            info!(attempt, "connecting to relay controller");
            match self.connect_and_serve().await {
                Ok(()) => {
                    info!("relay session ended cleanly");
                    attempt = 0;
                }
                Err(e) => {
                    warn!(error = %e, "relay session failed");
                    attempt += 1;
                }
            }
            if self.fatal.load(Ordering::SeqCst) {
                warn!("relay client stopping permanently: unauthorized, fix configuration");
                break;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            let delay = BACKOFF_SCHEDULE[attempt.min(BACKOFF_SCHEDULE.len() - 1)];
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    async fn connect_and_serve(&self) -> anyhow::Result<()> {
        let scheme_url = format!("wss://{}/ws", self.config.relay.controller.address);
        let request = scheme_url.into_client_request()?;

        // Accept self-signed certs only when the operator opted in (§9 TLS
        // note); the credential exchange is the real auth mechanism either way.
        let connector = if self.config.relay.controller.ignore_certificate_errors {
            let tls_config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth();
            Some(Connector::Rustls(Arc::new(tls_config)))
        } else {
            None
        };

        let (ws_stream, _response) = connect_async_tls_with_config(request, None, false, connector).await?;
        let (mut sink, mut stream) = ws_stream.split();

        let challenge = match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerCommand>(&text) {
                Ok(ServerCommand::Challenge { challenge }) => challenge,
                Ok(other) => anyhow::bail!("expected Challenge, got {other:?}"),
                Err(e) => anyhow::bail!("unparseable first frame: {e}"),
            },
            other => anyhow::bail!("connection closed before challenge: {other:?}"),
        };

        let response = credential(self.config.relay.controller.secret.as_bytes(), &self.config.instance_name, &challenge);
        send(&mut sink, &ClientCommand::Login { agent_name: self.config.instance_name.clone(), credential: response }).await?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerCommand>(&text) {
                Ok(ServerCommand::LoginResult { ok: true, .. }) => {}
                Ok(ServerCommand::LoginResult { ok: false, reason }) => {
                    self.fatal.store(true, Ordering::SeqCst);
                    anyhow::bail!("login rejected: {}", reason.unwrap_or_default());
                }
                Ok(other) => anyhow::bail!("expected LoginResult, got {other:?}"),
                Err(e) => anyhow::bail!("unparseable login reply: {e}"),
            },
            other => anyhow::bail!("connection closed before login result: {other:?}"),
        }

        info!(agent = %self.config.instance_name, "authenticated with relay controller");

        let request_id = Uuid::new_v4();
        send(&mut sink, &ClientCommand::BeginShareUpload { request_id }).await?;
        let share_token = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerCommand>(&text) {
                    Ok(ServerCommand::ShareUploadToken { request_id: got, token }) if got == request_id => break token,
                    Ok(other) => warn!("ignoring {other:?} while awaiting share upload token"),
                    Err(e) => anyhow::bail!("unparseable frame while awaiting share upload token: {e}"),
                },
                other => anyhow::bail!("connection closed before share upload token: {other:?}"),
            }
        };

        let shares_json = self.catalog.read().unwrap().to_shares_json();
        let database_path = self.config.relay.share_paths.first().map(|p| p.join(".relay-catalog-placeholder"));
        // §1 Non-goals leave catalog persistence to the external Share
        // subsystem; here we ship the in-memory scan as both the manifest and
        // a throwaway sidecar so the wire contract with upload_shares holds.
        let database_path = database_path.unwrap_or_else(|| std::env::temp_dir().join("relay-empty-catalog.db"));
        if !database_path.exists() {
            let _ = tokio::fs::write(&database_path, b"").await;
        }
        self.controller.upload_shares(share_token, shares_json, &database_path).await?;
        info!(entries = self.catalog.read().unwrap().len(), "share catalog uploaded, session ready");

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientCommand>();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                outgoing = outgoing_rx.recv() => {
                    match outgoing {
                        Some(cmd) => {
                            if send(&mut sink, &cmd).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_server_command(&text, &outgoing_tx);
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            anyhow::bail!("websocket read error: {e}");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_server_command(&self, text: &str, outgoing_tx: &mpsc::UnboundedSender<ClientCommand>) {
        let cmd: ServerCommand = match serde_json::from_str(text) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "unparseable server command");
                return;
            }
        };

        match cmd {
            ServerCommand::Challenge { .. } | ServerCommand::LoginResult { .. } | ServerCommand::ShareUploadToken { .. } => {
                // Only meaningful during the handshake/upload sequence already
                // handled synchronously above; anything arriving later is stale.
                warn!("ignoring out-of-sequence {cmd:?}");
            }
            ServerCommand::RequestFileInfo { filename, token } => {
                self.handle_request_file_info(filename, token, outgoing_tx.clone());
            }
            ServerCommand::RequestFileUpload { filename, start_offset, token } => {
                self.handle_request_file_upload(filename, start_offset, token, outgoing_tx.clone());
            }
            ServerCommand::NotifyFileDownloadCompleted { filename, token } => {
                self.handle_notify_download_completed(filename, token);
            }
        }
    }

    fn handle_request_file_info(&self, filename: String, token: Uuid, outgoing_tx: mpsc::UnboundedSender<ClientCommand>) {
        let catalog = self.catalog.read().unwrap();
        let (exists, size) = match catalog.resolve(&filename) {
            Some(path) => match std::fs::metadata(path) {
                Ok(m) => (true, m.len()),
                Err(_) => (false, 0),
            },
            None => (false, 0),
        };
        let _ = outgoing_tx.send(ClientCommand::ReturnFileInfo { token, exists, size });
    }

    fn handle_request_file_upload(&self, filename: String, start_offset: u64, token: Uuid, outgoing_tx: mpsc::UnboundedSender<ClientCommand>) {
        let local_path = self.catalog.read().unwrap().resolve(&filename).map(|p| p.to_path_buf());
        let controller = Arc::clone(&self.controller);

        tokio::spawn(async move {
            let Some(local_path) = local_path else {
                warn!(filename = %filename, "file not in local catalog, failing upload request");
                let _ = outgoing_tx.send(ClientCommand::NotifyFileUploadFailed { token });
                return;
            };
            if let Err(e) = controller.upload_file(token, &filename, &local_path, start_offset).await {
                warn!(filename = %filename, error = %e, "file upload to controller failed");
                let _ = outgoing_tx.send(ClientCommand::NotifyFileUploadFailed { token });
            }
        });
    }

    fn handle_notify_download_completed(&self, filename: String, token: Uuid) {
        let controller = Arc::clone(&self.controller);
        let downloads_dir = self.config.relay.controller.downloads.clone();
        tokio::spawn(async move {
            let dest = localize_download_path(&downloads_dir, &filename);
            const MAX_ATTEMPTS: u32 = 3;
            for attempt in 1..=MAX_ATTEMPTS {
                match controller.download_file(token, &filename, &dest).await {
                    Ok(()) => return,
                    Err(e) if attempt < MAX_ATTEMPTS => {
                        warn!(filename = %filename, attempt, error = %e, "download pull failed, retrying");
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                    Err(e) => {
                        warn!(filename = %filename, error = %e, "download pull failed, giving up");
                    }
                }
            }
        });
    }

}

fn localize_download_path(downloads_dir: &PathBuf, virtual_filename: &str) -> PathBuf {
    let mut path = downloads_dir.clone();
    for component in virtual_filename.split(['/', '\\']) {
        if !component.is_empty() && component != "." && component != ".." {
            path.push(component);
        }
    }
    path
}

async fn send<S>(sink: &mut S, cmd: &ClientCommand) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(cmd)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Backs `ignore_certificate_errors` (§9 TLS note) — skips certificate
/// validation entirely; the credential handshake is the real auth mechanism.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localize_download_path_rejects_traversal_components() {
        let base = PathBuf::from("/var/lib/relay/agent/downloads");
        let path = localize_download_path(&base, "Music/../../../etc/passwd");
        assert_eq!(path, base.join("Music").join("etc").join("passwd"));
    }

    #[test]
    fn localize_download_path_translates_backslashes() {
        let base = PathBuf::from("/var/lib/relay/agent/downloads");
        let path = localize_download_path(&base, "Music\\song.mp3");
        assert_eq!(path, base.join("Music").join("song.mp3"));
    }
}
