//! §4.4 RelayHub — server endpoint of the persistent duplex channel.
//!
//! One `axum::extract::ws` socket per Agent, bridging JSON-tagged
//! `ServerCommand`/`ClientCommand` frames (`relay_common::wire`) the same way
//! `sven-node`'s `/ws` control bridge bridges `ControlCommand`/`ControlEvent`:
//! a writer task draining an mpsc channel into the socket, a reader loop
//! dispatching parsed frames, `tokio::select!` between the two.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use relay_common::credential::validate as validate_credential;
use relay_common::wire::{ClientCommand, ServerCommand};

use crate::agent_registry::{AgentRegistry, AgentSession, BindOutcome};
use crate::relay_service::RelayService;
use crate::token_registry::TokenRegistry;

/// How long a freshly-connected socket has to present a valid `Login` after
/// its `Challenge` before the Hub gives up on it (§4.4 AwaitingAuth/Authenticating).
const LOGIN_GRACE: Duration = Duration::from_secs(15);
const CHALLENGE_LEN: usize = 32;

pub struct RelayHub {
    agents: Arc<AgentRegistry>,
    tokens: Arc<TokenRegistry>,
    service: Arc<RelayService>,
}

impl RelayHub {
    pub fn new(agents: Arc<AgentRegistry>, tokens: Arc<TokenRegistry>, service: Arc<RelayService>) -> Self {
        Self { agents, tokens, service }
    }

    /// Drive one Agent connection end to end: Challenge, Login, then the
    /// `Authenticated` request loop, until the socket closes or is displaced.
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket, remote_addr: IpAddr) {
        let connection_id = Uuid::new_v4();
        let challenge = random_challenge();

        if send(&mut socket, &ServerCommand::Challenge { challenge: challenge.clone() })
            .await
            .is_err()
        {
            return;
        }

        let login = match tokio::time::timeout(LOGIN_GRACE, await_login(&mut socket)).await {
            Ok(Some(login)) => login,
            Ok(None) => {
                info!(%connection_id, %remote_addr, "socket closed before login");
                return;
            }
            Err(_) => {
                warn!(%connection_id, %remote_addr, "login grace period expired, closing");
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };

        let (agent_name, credential) = login;

        let Some(config) = self.agents.get(&agent_name) else {
            warn!(%connection_id, %remote_addr, agent = %agent_name, "login for unknown agent");
            let _ = send(&mut socket, &ServerCommand::LoginResult {
                ok: false,
                reason: Some("unknown agent".into()),
            })
            .await;
            return;
        };

        if !self.agents.ip_allowed(&agent_name, remote_addr) {
            warn!(%connection_id, %remote_addr, agent = %agent_name, "login from disallowed address");
            let _ = send(&mut socket, &ServerCommand::LoginResult {
                ok: false,
                reason: Some("address not allowed".into()),
            })
            .await;
            return;
        }

        if !validate_credential(config.secret.as_bytes(), &agent_name, &challenge, &credential) {
            warn!(
                %connection_id, %remote_addr, agent = %agent_name,
                credential_prefix = %credential.chars().take(8).collect::<String>(),
                "login credential mismatch"
            );
            let _ = send(&mut socket, &ServerCommand::LoginResult {
                ok: false,
                reason: Some("unauthorized".into()),
            })
            .await;
            return;
        }

        if send(&mut socket, &ServerCommand::LoginResult { ok: true, reason: None })
            .await
            .is_err()
        {
            return;
        }

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ServerCommand>();
        let cancel = CancellationToken::new();
        let session = Arc::new(AgentSession {
            connection_id,
            agent_name: agent_name.clone(),
            remote_addr,
            login_time: Instant::now(),
            outstanding: Mutex::new(std::collections::HashMap::new()),
            outgoing: outgoing_tx,
            cancel: cancel.clone(),
        });

        match self.agents.bind(&agent_name, Arc::clone(&session)) {
            BindOutcome::Bound { replaced: Some(old) } => {
                info!(%connection_id, agent = %agent_name, "new login displaces prior session");
                old.close();
                self.service.handle_session_ended(&agent_name);
            }
            BindOutcome::Bound { replaced: None } => {}
            BindOutcome::UnknownAgent => {
                // Raced with a config reload between `get` and `bind`; treat
                // the same as unknown-agent.
                return;
            }
        }

        info!(%connection_id, %remote_addr, agent = %agent_name, "agent session authenticated");

        let (mut ws_sink, mut ws_stream) = socket.split();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
                outgoing = outgoing_rx.recv() => {
                    match outgoing {
                        Some(cmd) => {
                            if send_sink(&mut ws_sink, &cmd).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = ws_stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_client_command(&session, &text);
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(%connection_id, agent = %agent_name, error = %e, "websocket read error");
                            break;
                        }
                    }
                }
            }
        }

        self.agents.unbind(&agent_name, &session);
        self.service.handle_session_ended(&agent_name);
        info!(%connection_id, agent = %agent_name, "agent session closed");
    }

    fn handle_client_command(&self, session: &Arc<AgentSession>, text: &str) {
        let cmd: ClientCommand = match serde_json::from_str(text) {
            Ok(c) => c,
            Err(e) => {
                warn!(agent = %session.agent_name, error = %e, "unparseable client command");
                return;
            }
        };

        match cmd {
            ClientCommand::Login { .. } => {
                // §9 Open Question: a re-login on an already-authenticated
                // session is treated identically to a fresh one — Bind is
                // the single source of truth for "which session is live",
                // so a second Login here would only matter if it carried a
                // different agent_name, which the wire protocol does not
                // allow mid-session. Nothing to do.
                warn!(agent = %session.agent_name, "ignoring Login on an already-authenticated session");
            }
            ClientCommand::BeginShareUpload { request_id } => {
                let token = self.tokens.issue(relay_common::TokenPurpose::ShareUpload, &session.agent_name, "");
                let _ = session.invoke(ServerCommand::ShareUploadToken { request_id, token });
            }
            ClientCommand::ReturnFileInfo { token, exists, size } => {
                session.resolve_file_info(token, exists, size);
            }
            ClientCommand::NotifyFileUploadFailed { token } => {
                session.reject_file_upload(token);
            }
        }
    }
}

fn random_challenge() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..CHALLENGE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

async fn send(socket: &mut WebSocket, cmd: &ServerCommand) -> Result<(), ()> {
    let json = serde_json::to_string(cmd).map_err(|_| ())?;
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn send_sink<S>(sink: &mut S, cmd: &ServerCommand) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let json = serde_json::to_string(cmd).map_err(|_| ())?;
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Read frames until a `Login` arrives, ignoring anything else per §4.4
/// ("the *only* method accepted from the client is `Login`").
async fn await_login(socket: &mut WebSocket) -> Option<(String, String)> {
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(ClientCommand::Login { agent_name, credential }) => {
                    return Some((agent_name, credential));
                }
                Ok(_) => {
                    warn!("rejected non-Login method before authentication");
                }
                Err(e) => {
                    warn!(error = %e, "unparseable frame before authentication");
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_challenge_has_expected_length() {
        let c = random_challenge();
        assert_eq!(c.chars().count(), CHALLENGE_LEN);
    }

    #[test]
    fn random_challenge_is_not_constant() {
        assert_ne!(random_challenge(), random_challenge());
    }
}
