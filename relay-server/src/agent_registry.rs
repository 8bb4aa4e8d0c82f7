//! §4.3 AgentRegistry — process-wide mutable set of configured Agents.
//!
//! Modeled after `mosaicfs-server/src/label_cache.rs`/`access_cache.rs`'s
//! materialized-cache shape (`RwLock<HashMap<...>>`, readers lock-free,
//! writers serialized), generalized here to also hold the single live
//! `AgentSession` per Agent name instead of a read replica of CouchDB.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use relay_common::cidr::ip_allowed;
use relay_common::AgentConfig;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use relay_common::wire::ServerCommand;

/// The Agent's uploaded share catalog: virtual filename → byte size, plus
/// the temp path of the uploaded database. This is the minimal in-process
/// stand-in for the external Share subsystem (§4.5.1) — enough to exercise
/// `ResolveOwner` and the end-to-end scenarios in SPEC_FULL.md §8.
#[derive(Debug)]
pub struct AgentCatalog {
    pub files: HashMap<String, u64>,
    pub database_path: std::path::PathBuf,
    pub registered_at: Instant,
}

/// A pending server-originated RPC awaiting its client-side reply,
/// correlated by token (§4.4 "Request correlation").
pub enum Awaiter {
    FileInfo(oneshot::Sender<(bool, u64)>),
    /// `NotifyFileUploadFailed` rejects this; successful delivery is
    /// observed by the RelayHTTP `/files/{token}` handler itself, not here.
    FileUploadFailure(oneshot::Sender<()>),
}

/// A live, authenticated duplex session, owned jointly by `RelayHub` (which
/// drives its socket) and `AgentRegistry` (which is the single source of
/// truth for "is this the currently bound session").
pub struct AgentSession {
    pub connection_id: Uuid,
    pub agent_name: String,
    pub remote_addr: IpAddr,
    pub login_time: Instant,
    pub outstanding: Mutex<HashMap<Uuid, Awaiter>>,
    /// Channel into the socket-writer half of this session's WebSocket task.
    pub outgoing: mpsc::UnboundedSender<ServerCommand>,
    /// Signaled to tear down this session's socket task, e.g. when a
    /// fresh login for the same Agent name force-replaces it (§4.3 Bind).
    pub cancel: CancellationToken,
}

impl AgentSession {
    pub fn invoke(&self, cmd: ServerCommand) -> Result<(), &'static str> {
        self.outgoing.send(cmd).map_err(|_| "session channel closed")
    }

    /// Force this session's socket task to close. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolve the awaiter for `token` with a successful `ReturnFileInfo`.
    pub fn resolve_file_info(&self, token: Uuid, exists: bool, size: u64) {
        let mut outstanding = self.outstanding.lock().unwrap();
        match outstanding.remove(&token) {
            Some(Awaiter::FileInfo(tx)) => {
                let _ = tx.send((exists, size));
            }
            Some(other) => {
                tracing::warn!(%token, "ReturnFileInfo for token registered as a different awaiter kind");
                outstanding.insert(token, other);
            }
            None => tracing::warn!(%token, "ReturnFileInfo for unknown token, dropped"),
        }
    }

    pub fn reject_file_upload(&self, token: Uuid) {
        let mut outstanding = self.outstanding.lock().unwrap();
        match outstanding.remove(&token) {
            Some(Awaiter::FileUploadFailure(tx)) => {
                let _ = tx.send(());
            }
            Some(other) => {
                outstanding.insert(token, other);
            }
            None => tracing::warn!(%token, "NotifyFileUploadFailed for unknown token, dropped"),
        }
    }
}

struct BoundAgent {
    config: AgentConfig,
    session: Mutex<Option<Arc<AgentSession>>>,
    catalog: RwLock<Option<Arc<AgentCatalog>>>,
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<BoundAgent>>>,
}

pub enum BindOutcome {
    Bound { replaced: Option<Arc<AgentSession>> },
    UnknownAgent,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<AgentConfig> {
        self.agents.read().unwrap().values().map(|a| a.config.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<AgentConfig> {
        self.agents.read().unwrap().get(name).map(|a| a.config.clone())
    }

    /// Replace the entire configured-Agent set, e.g. on config reload.
    /// Agents removed from the new set keep any currently-bound session
    /// (a reload does not itself disconnect anyone) but lose future lookups.
    pub fn replace_all(&self, configs: Vec<AgentConfig>) {
        let mut agents = self.agents.write().unwrap();
        let mut next = HashMap::new();
        for config in configs {
            let existing = agents.remove(&config.name);
            let bound = match existing {
                Some(prev) => {
                    // Keep session/catalog state, swap the config snapshot.
                    Arc::new(BoundAgent {
                        config,
                        session: Mutex::new(prev.session.lock().unwrap().clone()),
                        catalog: RwLock::new(prev.catalog.read().unwrap().clone()),
                    })
                }
                None => Arc::new(BoundAgent {
                    config,
                    session: Mutex::new(None),
                    catalog: RwLock::new(None),
                }),
            };
            next.insert(bound.config.name.clone(), bound);
        }
        *agents = next;
    }

    /// §4.3 Bind — force-replace: a new authenticated login for an existing
    /// name displaces the prior connection. Returns the session that was
    /// displaced, if any, so the caller (RelayHub) can close it.
    pub fn bind(&self, name: &str, session: Arc<AgentSession>) -> BindOutcome {
        let agents = self.agents.read().unwrap();
        let Some(bound) = agents.get(name) else {
            return BindOutcome::UnknownAgent;
        };
        let mut slot = bound.session.lock().unwrap();
        let replaced = slot.replace(session);
        BindOutcome::Bound { replaced }
    }

    /// §4.3 Unbind — idempotent; removes only if `session` is still the
    /// bound one, guarding against a TOCTOU race with a concurrent
    /// force-replace.
    pub fn unbind(&self, name: &str, session: &Arc<AgentSession>) {
        let agents = self.agents.read().unwrap();
        if let Some(bound) = agents.get(name) {
            let mut slot = bound.session.lock().unwrap();
            if matches!(&*slot, Some(current) if Arc::ptr_eq(current, session)) {
                *slot = None;
            }
        }
    }

    pub fn current_session(&self, name: &str) -> Option<Arc<AgentSession>> {
        let agents = self.agents.read().unwrap();
        agents.get(name)?.session.lock().unwrap().clone()
    }

    pub fn ip_allowed(&self, name: &str, addr: IpAddr) -> bool {
        let agents = self.agents.read().unwrap();
        match agents.get(name) {
            Some(bound) => ip_allowed(addr, &bound.config.allowed_cidrs),
            None => false,
        }
    }

    pub fn set_catalog(&self, name: &str, catalog: AgentCatalog) {
        let agents = self.agents.read().unwrap();
        if let Some(bound) = agents.get(name) {
            *bound.catalog.write().unwrap() = Some(Arc::new(catalog));
        }
    }

    /// §4.3 ResolveOwner — a file is owned by the Agent whose catalog
    /// contains it. On a tie (two Agents advertise the same virtual path),
    /// prefer the most-recently-registered catalog and log a warning.
    pub fn resolve_owner(&self, virtual_filename: &str) -> Option<String> {
        let agents = self.agents.read().unwrap();
        let mut candidates: Vec<(&str, Instant)> = Vec::new();
        for (name, bound) in agents.iter() {
            if let Some(catalog) = bound.catalog.read().unwrap().as_ref() {
                if catalog.files.contains_key(virtual_filename) {
                    candidates.push((name.as_str(), catalog.registered_at));
                }
            }
        }
        if candidates.len() > 1 {
            tracing::warn!(
                filename = virtual_filename,
                candidates = candidates.len(),
                "multiple agents advertise the same virtual filename, preferring most recent"
            );
        }
        candidates
            .into_iter()
            .max_by_key(|(_, registered_at)| *registered_at)
            .map(|(name, _)| name.to_string())
    }
}

impl Clone for AgentCatalog {
    fn clone(&self) -> Self {
        Self {
            files: self.files.clone(),
            database_path: self.database_path.clone(),
            registered_at: self.registered_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_session(name: &str) -> Arc<AgentSession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(AgentSession {
            connection_id: Uuid::new_v4(),
            agent_name: name.to_string(),
            remote_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            login_time: Instant::now(),
            outstanding: Mutex::new(HashMap::new()),
            outgoing: tx,
            cancel: CancellationToken::new(),
        })
    }

    #[test]
    fn bind_force_replaces_prior_session() {
        let registry = AgentRegistry::new();
        registry.replace_all(vec![AgentConfig {
            name: "a1".into(),
            secret: "0123456789abcdef".into(),
            allowed_cidrs: vec![],
        }]);

        let s1 = test_session("a1");
        match registry.bind("a1", s1.clone()) {
            BindOutcome::Bound { replaced } => assert!(replaced.is_none()),
            _ => panic!("expected Bound"),
        }

        let s2 = test_session("a1");
        match registry.bind("a1", s2.clone()) {
            BindOutcome::Bound { replaced } => assert!(Arc::ptr_eq(&replaced.unwrap(), &s1)),
            _ => panic!("expected Bound"),
        }

        assert!(Arc::ptr_eq(&registry.current_session("a1").unwrap(), &s2));
    }

    #[test]
    fn unbind_is_toctou_safe() {
        let registry = AgentRegistry::new();
        registry.replace_all(vec![AgentConfig {
            name: "a1".into(),
            secret: "0123456789abcdef".into(),
            allowed_cidrs: vec![],
        }]);
        let s1 = test_session("a1");
        registry.bind("a1", s1.clone());
        let s2 = test_session("a1");
        registry.bind("a1", s2.clone());

        // s1 is stale now; unbinding it must not clear s2's binding.
        registry.unbind("a1", &s1);
        assert!(registry.current_session("a1").is_some());

        registry.unbind("a1", &s2);
        assert!(registry.current_session("a1").is_none());
    }

    #[test]
    fn bind_unknown_agent_rejected() {
        let registry = AgentRegistry::new();
        let s1 = test_session("ghost");
        assert!(matches!(registry.bind("ghost", s1), BindOutcome::UnknownAgent));
    }

    #[test]
    fn resolve_owner_prefers_most_recent_on_tie() {
        let registry = AgentRegistry::new();
        registry.replace_all(vec![
            AgentConfig { name: "a1".into(), secret: "0123456789abcdef".into(), allowed_cidrs: vec![] },
            AgentConfig { name: "a2".into(), secret: "fedcba9876543210".into(), allowed_cidrs: vec![] },
        ]);

        let mut f1 = HashMap::new();
        f1.insert("Music/song.mp3".to_string(), 100u64);
        registry.set_catalog("a1", AgentCatalog {
            files: f1,
            database_path: "/tmp/a1.db".into(),
            registered_at: Instant::now(),
        });

        std::thread::sleep(std::time::Duration::from_millis(5));

        let mut f2 = HashMap::new();
        f2.insert("Music/song.mp3".to_string(), 100u64);
        registry.set_catalog("a2", AgentCatalog {
            files: f2,
            database_path: "/tmp/a2.db".into(),
            registered_at: Instant::now(),
        });

        assert_eq!(registry.resolve_owner("Music/song.mp3").as_deref(), Some("a2"));
    }

    #[test]
    fn ip_allowed_checks_configured_cidrs() {
        let registry = AgentRegistry::new();
        registry.replace_all(vec![AgentConfig {
            name: "a1".into(),
            secret: "0123456789abcdef".into(),
            allowed_cidrs: vec!["10.0.0.0/8".into()],
        }]);
        assert!(registry.ip_allowed("a1", IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1))));
        assert!(!registry.ip_allowed("a1", IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))));
    }
}
