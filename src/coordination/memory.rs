//! In-Memory Coordination Backend
//!
//! A single-process store with etcd-like semantics: a global revision,
//! leases that own keys, campaign-by-lowest-create-revision elections and
//! prefix watches. Every participant gets its own `MemoryConnector`; all
//! connectors of one `MemoryBackend` see the same store.
//!
//! Session loss can be simulated with `lose_session` (connection drop, keys
//! survive for the TTL) and `expire_session` (immediate revocation).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
    Client, Connector, Election, EventKind, KeyValue, LeaderRecord, LeaderStream, WatchEvent,
    WatchStream,
};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::lifecycle::Done;

/// Capacity of the change feed
const EVENT_CAPACITY: usize = 1024;

/// Capacity of per-stream buffers
const STREAM_CAPACITY: usize = 64;

/// Shared in-process store
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

struct State {
    /// Last assigned revision
    revision: i64,
    /// Next lease id
    next_lease: i64,
    /// Whether new sessions can be opened
    available: bool,
    /// Stored keys
    kvs: BTreeMap<String, KeyValue>,
    /// Live leases
    leases: HashMap<i64, Lease>,
}

struct Lease {
    ttl: Duration,
    /// Fired when the session holding this lease is lost
    session: CancellationToken,
}

impl MemoryBackend {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    revision: 0,
                    next_lease: 1,
                    available: true,
                    kvs: BTreeMap::new(),
                    leases: HashMap::new(),
                }),
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.shared.events.subscribe()
    }

    /// Create a connector for one participant
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            backend: self.clone(),
            session: Mutex::new(None),
        }
    }

    /// Make new sessions fail (`false`) or succeed (`true`)
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.state().revision
    }

    /// Write `key`, optionally attached to a lease (0 = none)
    pub fn put(&self, key: &str, value: &[u8], lease: i64) -> KeyValue {
        let mut state = self.state();
        self.put_locked(&mut state, key, value, lease)
    }

    /// Delete `key`; returns whether it existed
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state();
        self.delete_locked(&mut state, key)
    }

    /// Snapshot of every key under `prefix`
    pub fn get_prefix(&self, prefix: &str) -> Vec<KeyValue> {
        self.state()
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect()
    }

    /// Current leader of `election`
    pub fn leader(&self, election: &str) -> Option<LeaderRecord> {
        leader_locked(&self.state(), election).map(LeaderRecord::from)
    }

    /// Ids of every live lease
    pub fn leases(&self) -> Vec<i64> {
        let mut leases: Vec<i64> = self.state().leases.keys().copied().collect();
        leases.sort_unstable();
        leases
    }

    /// Simulate a dropped connection: the session is reported lost at once,
    /// its keys are revoked when the TTL runs out unless rebound before.
    pub fn lose_session(&self, lease: i64) {
        let ttl = {
            let state = self.state();
            match state.leases.get(&lease) {
                Some(l) => {
                    l.session.cancel();
                    l.ttl
                }
                None => return,
            }
        };

        tracing::debug!("session {:x} lost, revoking in {:?}", lease, ttl);
        let backend = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            backend.revoke(lease);
        });
    }

    /// Simulate TTL expiry: the lease and every key it owns go away now
    pub fn expire_session(&self, lease: i64) {
        self.revoke(lease);
    }

    fn grant(&self, ttl: Duration) -> Option<(i64, CancellationToken)> {
        let mut state = self.state();
        if !state.available {
            return None;
        }
        let lease = state.next_lease;
        state.next_lease += 1;
        let session = CancellationToken::new();
        state.leases.insert(
            lease,
            Lease {
                ttl,
                session: session.clone(),
            },
        );
        Some((lease, session))
    }

    fn revoke(&self, lease: i64) {
        let mut state = self.state();
        if let Some(l) = state.leases.remove(&lease) {
            l.session.cancel();
        }

        let owned: Vec<String> = state
            .kvs
            .values()
            .filter(|kv| kv.lease == lease)
            .map(|kv| kv.key.clone())
            .collect();
        for key in owned {
            self.delete_locked(&mut state, &key);
        }
    }

    fn put_locked(&self, state: &mut State, key: &str, value: &[u8], lease: i64) -> KeyValue {
        state.revision += 1;
        let revision = state.revision;
        let kv = state
            .kvs
            .entry(key.to_string())
            .and_modify(|kv| {
                kv.value = value.to_vec();
                kv.mod_revision = revision;
                kv.lease = lease;
            })
            .or_insert_with(|| KeyValue {
                key: key.to_string(),
                value: value.to_vec(),
                create_revision: revision,
                mod_revision: revision,
                lease,
            })
            .clone();

        let _ = self.shared.events.send(WatchEvent {
            kind: EventKind::Put,
            kv: kv.clone(),
        });
        kv
    }

    fn delete_locked(&self, state: &mut State, key: &str) -> bool {
        let Some(removed) = state.kvs.remove(key) else {
            return false;
        };
        state.revision += 1;
        let _ = self.shared.events.send(WatchEvent {
            kind: EventKind::Delete,
            kv: KeyValue {
                key: removed.key,
                value: Vec::new(),
                create_revision: removed.create_revision,
                mod_revision: state.revision,
                lease: removed.lease,
            },
        });
        true
    }

    /// Register a candidate key for `lease`, returns the key campaigned with
    fn enter(
        &self,
        election: &str,
        lease: i64,
        value: &[u8],
        resume: Option<&LeaderRecord>,
    ) -> Result<String> {
        let mut state = self.state();
        if !state.leases.contains_key(&lease) {
            return Err(Error::SessionLost);
        }

        if let Some(record) = resume {
            match state.kvs.get_mut(&record.key) {
                Some(kv) if kv.create_revision == record.create_revision && kv.value == value => {
                    kv.lease = lease;
                    tracing::info!(
                        "resumed candidacy {} at revision {}",
                        record.key,
                        record.create_revision
                    );
                    return Ok(record.key.clone());
                }
                Some(kv) if kv.create_revision != record.create_revision => {
                    tracing::warn!(
                        "stale leader record for {} (revision {} != {}), campaigning afresh",
                        record.key,
                        record.create_revision,
                        kv.create_revision
                    );
                }
                _ => {}
            }
        }

        let key = format!("{}/{:x}", election, lease);
        if state.kvs.get(&key).map(|kv| kv.value.as_slice()) != Some(value) {
            self.put_locked(&mut state, &key, value, lease);
        }
        Ok(key)
    }

    /// Remove a candidate key still owned by `lease`
    fn withdraw(&self, key: &str, lease: i64) {
        let mut state = self.state();
        if state.kvs.get(key).map(|kv| kv.lease) == Some(lease) {
            self.delete_locked(&mut state, key);
        }
    }

    /// `None` if the candidate key is gone
    fn is_leader(&self, election: &str, key: &str) -> Option<bool> {
        let state = self.state();
        if !state.kvs.contains_key(key) {
            return None;
        }
        Some(leader_locked(&state, election).map(|kv| kv.key == key).unwrap_or(false))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Oldest candidate under `election`
fn leader_locked(state: &State, election: &str) -> Option<KeyValue> {
    let prefix = format!("{}/", election);
    state
        .kvs
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(_, kv)| kv)
        .min_by_key(|kv| kv.create_revision)
        .cloned()
}

#[derive(Clone)]
struct Session {
    lease: i64,
    done: CancellationToken,
}

/// One participant's connection to a `MemoryBackend`
pub struct MemoryConnector {
    backend: MemoryBackend,
    session: Mutex<Option<Session>>,
}

impl MemoryConnector {
    fn session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_session(&self) -> Result<Session> {
        self.session()
            .ok_or_else(|| Error::Election("no session, connect first".into()))
    }

    /// Lease of the current session
    pub fn lease_id(&self) -> Option<i64> {
        self.session().map(|s| s.lease)
    }

    /// Store this connector talks to
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, ctx: &CancellationToken, config: &BackendConfig) -> Result<Arc<dyn Client>> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tracing::info!("create new session. Endpoints {}", config.endpoints_display());
        let (lease, done) = self
            .backend
            .grant(config.session_ttl())
            .ok_or_else(|| Error::ConnectionFailed {
                endpoints: config.endpoints_display(),
                reason: "backend unavailable".into(),
            })?;

        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(Session { lease, done });
        Ok(Arc::new(MemoryClient {
            backend: self.backend.clone(),
        }))
    }

    async fn new_election(&self, _ctx: &CancellationToken, key: &str) -> Result<Arc<dyn Election>> {
        Ok(Arc::new(MemoryElection {
            backend: self.backend.clone(),
            election: key.to_string(),
            session: self.require_session()?,
            resume: None,
        }))
    }

    async fn resume_election(
        &self,
        _ctx: &CancellationToken,
        key: &str,
        leader: &LeaderRecord,
    ) -> Result<Arc<dyn Election>> {
        if !leader.key.starts_with(&format!("{}/", key)) {
            return Err(Error::Election(format!(
                "leader record {} does not belong to election {}",
                leader.key, key
            )));
        }

        Ok(Arc::new(MemoryElection {
            backend: self.backend.clone(),
            election: key.to_string(),
            session: self.require_session()?,
            resume: Some(leader.clone()),
        }))
    }

    fn session_done(&self) -> Done {
        self.session()
            .map(|s| Done::from(s.done))
            .unwrap_or_else(Done::never)
    }

    async fn cleanup(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            self.backend.revoke(session.lease);
        }
    }
}

struct MemoryClient {
    backend: MemoryBackend,
}

#[async_trait]
impl Client for MemoryClient {
    async fn get_prefix(&self, ctx: &CancellationToken, prefix: &str) -> Result<Vec<KeyValue>> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.backend.get_prefix(prefix))
    }

    fn watch_prefix(&self, ctx: CancellationToken, prefix: &str) -> WatchStream {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let mut events = self.backend.subscribe();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    recv = events.recv() => match recv {
                        Ok(event) if event.kv.key.starts_with(&prefix) => {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!("watch on {} lagged, {} events missed", prefix, missed);
                        }
                        Err(RecvError::Closed) => return,
                    },
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

struct MemoryElection {
    backend: MemoryBackend,
    election: String,
    session: Session,
    resume: Option<LeaderRecord>,
}

#[async_trait]
impl Election for MemoryElection {
    async fn campaign(&self, ctx: CancellationToken, value: String) -> Result<()> {
        let mut events = self.backend.subscribe();
        let key = self.backend.enter(
            &self.election,
            self.session.lease,
            value.as_bytes(),
            self.resume.as_ref(),
        )?;

        loop {
            if self.session.done.is_cancelled() {
                return Err(Error::SessionLost);
            }

            match self.backend.is_leader(&self.election, &key) {
                Some(true) => return Ok(()),
                Some(false) => {}
                None => {
                    return Err(Error::Campaign(format!("candidate key {} vanished", key)));
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => {
                    self.backend.withdraw(&key, self.session.lease);
                    return Err(Error::Cancelled);
                }
                _ = self.session.done.cancelled() => return Err(Error::SessionLost),
                recv = events.recv() => {
                    if let Err(RecvError::Closed) = recv {
                        return Err(Error::Internal("change feed closed".into()));
                    }
                }
            }
        }
    }

    fn observe(&self, ctx: CancellationToken) -> LeaderStream {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let mut events = self.backend.subscribe();
        let backend = self.backend.clone();
        let election = self.election.clone();

        tokio::spawn(async move {
            let mut last: Option<(String, i64)> = None;
            loop {
                if let Some(record) = backend.leader(&election) {
                    let marker = (record.key.clone(), record.mod_revision);
                    if last.as_ref() != Some(&marker) {
                        last = Some(marker);
                        if tx.send(record).await.is_err() {
                            return;
                        }
                    }
                }

                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tx.closed() => return,
                    recv = events.recv() => {
                        if let Err(RecvError::Closed) = recv {
                            return;
                        }
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}
