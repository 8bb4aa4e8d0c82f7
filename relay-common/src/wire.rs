//! Wire protocol for the duplex RPC channel between RelayHub (Controller) and
//! RelayClient (Agent), §4.4/§4.6/§6. JSON-tagged frames over a WebSocket text
//! stream, the same shape `sven-node`'s control bridge uses for its
//! `ControlCommand`/`ControlEvent` pair, adapted to this subsystem's method
//! names and carrying the login handshake as the first frame rather than an
//! HTTP upgrade header (the challenge is per-connection, so it can't be
//! pre-computed before the socket exists).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server → Client invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ServerCommand {
    /// Sent immediately after the channel is established.
    Challenge { challenge: String },
    /// Reply to a `Login` attempt. Not itself a method in §6's table, but
    /// wire framing needs some way to tell the client whether to stop
    /// retrying (an `Unauthorized` login is fatal per §4.6) or proceed.
    LoginResult { ok: bool, reason: Option<String> },
    /// Reply to `BeginShareUpload`, correlated by `request_id`.
    ShareUploadToken { request_id: Uuid, token: Uuid },
    RequestFileInfo { filename: String, token: Uuid },
    RequestFileUpload {
        filename: String,
        start_offset: u64,
        token: Uuid,
    },
    NotifyFileDownloadCompleted { filename: String, token: Uuid },
}

/// Client → Server invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ClientCommand {
    Login { agent_name: String, credential: String },
    BeginShareUpload { request_id: Uuid },
    ReturnFileInfo { token: Uuid, exists: bool, size: u64 },
    NotifyFileUploadFailed { token: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_command_json_round_trip() {
        let cmd = ServerCommand::RequestFileUpload {
            filename: "Music\\song.mp3".into(),
            start_offset: 0,
            token: Uuid::nil(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: ServerCommand = serde_json::from_str(&json).unwrap();
        match back {
            ServerCommand::RequestFileUpload { filename, .. } => {
                assert_eq!(filename, "Music\\song.mp3");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn client_command_tags_as_snake_case() {
        let cmd = ClientCommand::NotifyFileUploadFailed { token: Uuid::nil() };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"method\":\"notify_file_upload_failed\""));
    }
}
