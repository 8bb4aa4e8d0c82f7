//! §4.2 TokenRegistry — short-lived expected tokens, each scoped to
//! (Agent, purpose, expected arguments).
//!
//! Modeled the way `mosaicfs-server/src/state.rs` keeps its short-lived
//! keyed state (`login_attempts`, `revoked_tokens`): a single `Mutex` around
//! a `HashMap`, no separate background actor.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use relay_common::TokenPurpose;
use uuid::Uuid;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    Pending,
    Consumed,
    Expired,
}

#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub token: Uuid,
    pub purpose: TokenPurpose,
    pub agent_name: String,
    pub args: String,
    pub created_at: Instant,
    pub single_use: bool,
    pub state: TokenState,
}

pub struct TokenRegistry {
    records: Mutex<HashMap<Uuid, TokenRecord>>,
    ttl: Duration,
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl TokenRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Allocate a fresh 128-bit token, record a `TokenRecord`, return it.
    pub fn issue(&self, purpose: TokenPurpose, agent_name: &str, args: &str) -> Uuid {
        let token = Uuid::new_v4();
        let record = TokenRecord {
            token,
            purpose,
            agent_name: agent_name.to_string(),
            args: args.to_string(),
            created_at: Instant::now(),
            single_use: purpose.is_single_use(),
            state: TokenState::Pending,
        };
        self.records.lock().unwrap().insert(token, record);
        token
    }

    /// Validate `token` against the expected purpose/agent/args, optionally
    /// consuming it. Args must match *exactly*, byte-for-byte — invariant 3.
    pub fn validate(
        &self,
        token: Uuid,
        expected_purpose: TokenPurpose,
        caller_agent_name: &str,
        expected_args: &str,
        consume: bool,
    ) -> Result<TokenRecord, &'static str> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&token).ok_or("unknown token")?;

        if record.created_at.elapsed() > self.ttl {
            records.remove(&token);
            return Err("token expired");
        }
        if record.state == TokenState::Consumed {
            return Err("token already consumed");
        }
        if record.purpose != expected_purpose {
            return Err("purpose mismatch");
        }
        if record.agent_name != caller_agent_name {
            return Err("agent name mismatch");
        }
        if record.args != expected_args {
            return Err("args mismatch");
        }

        let snapshot = record.clone();
        if consume {
            if record.single_use {
                record.state = TokenState::Consumed;
            }
        }
        Ok(snapshot)
    }

    /// Background sweep: move records older than TTL to terminal state and
    /// drop them. Intended to run on a `tokio::time::interval` in `main`.
    pub fn expire(&self) {
        let mut records = self.records.lock().unwrap();
        records.retain(|_, r| r.created_at.elapsed() <= self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_validate_consume_succeeds_once() {
        let reg = TokenRegistry::default();
        let token = reg.issue(TokenPurpose::FileUpload, "a1", "Music/song.mp3");

        assert!(reg
            .validate(token, TokenPurpose::FileUpload, "a1", "Music/song.mp3", true)
            .is_ok());

        // Invariant 2: a second consume attempt fails.
        assert!(reg
            .validate(token, TokenPurpose::FileUpload, "a1", "Music/song.mp3", true)
            .is_err());
    }

    #[test]
    fn file_download_tokens_are_multi_use() {
        let reg = TokenRegistry::default();
        let token = reg.issue(TokenPurpose::FileDownload, "a1", "Music/song.mp3");

        assert!(reg
            .validate(token, TokenPurpose::FileDownload, "a1", "Music/song.mp3", false)
            .is_ok());
        assert!(reg
            .validate(token, TokenPurpose::FileDownload, "a1", "Music/song.mp3", false)
            .is_ok());
    }

    #[test]
    fn rejects_args_mismatch() {
        let reg = TokenRegistry::default();
        let token = reg.issue(TokenPurpose::FileUpload, "a1", "Music/song.mp3");
        assert!(reg
            .validate(token, TokenPurpose::FileUpload, "a1", "Music/other.mp3", true)
            .is_err());
    }

    #[test]
    fn rejects_purpose_mismatch() {
        let reg = TokenRegistry::default();
        let token = reg.issue(TokenPurpose::ShareUpload, "a1", "");
        assert!(reg
            .validate(token, TokenPurpose::FileUpload, "a1", "", true)
            .is_err());
    }

    #[test]
    fn expire_sweeps_stale_records() {
        let reg = TokenRegistry::new(Duration::from_millis(0));
        let token = reg.issue(TokenPurpose::FileUpload, "a1", "f");
        std::thread::sleep(Duration::from_millis(5));
        reg.expire();
        assert!(reg.validate(token, TokenPurpose::FileUpload, "a1", "f", true).is_err());
    }
}
