//! Elector
//!
//! Campaigns for leadership on behalf of one managed node and drives the
//! node through Lead / Follow / Stonith as the observed leader changes.
//!
//! The last observed leader record survives session loss. Reconnecting with
//! a known record resumes the election instead of starting a new race, so a
//! shared session blip does not reshuffle leadership.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::reconnect;
use crate::config::NomineeConfig;
use crate::coordination::{Connector, Election, LeaderRecord};
use crate::error::{Error, Result};
use crate::lifecycle::{Done, Stonither};
use crate::node::{Node, NodeSpec};

/// Campaign failures waiting for the supervisor
const ERROR_CHANNEL_SIZE: usize = 16;

/// What a leader change did to the managed node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Leading before and after
    Stay,
    /// Promoted to leader
    Lead,
    /// Following the new leader
    Follow,
    /// Lost leadership while leading; node and elector stonithed
    Superseded,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Stay => write!(f, "STAY"),
            Transition::Lead => write!(f, "LEAD"),
            Transition::Follow => write!(f, "FOLLOW"),
            Transition::Superseded => write!(f, "SUPERSEDED"),
        }
    }
}

/// Last leader seen by the observe activity
#[derive(Debug, Default)]
struct LastLeader {
    record: Option<LeaderRecord>,
    name: Option<String>,
}

/// Leader elector for one managed node
#[derive(Clone)]
pub struct Elector {
    inner: Arc<ElectorInner>,
}

struct ElectorInner {
    /// Configuration
    config: NomineeConfig,
    /// Election identifier
    key: String,
    /// Coordination backend
    connector: Arc<dyn Connector>,
    /// Fail-stop lifecycle
    lifecycle: Stonither,
    /// Managed node, set once by `run`
    node: OnceLock<Arc<dyn Node>>,
    /// Last known leader
    last: Mutex<LastLeader>,
    /// Campaign failures
    errors_tx: mpsc::Sender<Error>,
    errors_rx: Mutex<Option<mpsc::Receiver<Error>>>,
    /// Log context
    span: tracing::Span,
    /// Set by `run`
    running: AtomicBool,
}

impl Elector {
    /// Create an elector for the configured election
    pub fn new(config: NomineeConfig, connector: Arc<dyn Connector>) -> Self {
        let key = config.election_key();
        let span = tracing::info_span!(
            "elector",
            domain = %config.election.domain,
            cluster = %config.election.cluster,
            node = tracing::field::Empty,
            daemon = tracing::field::Empty,
        );
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_SIZE);

        Self {
            inner: Arc::new(ElectorInner {
                config,
                key,
                connector,
                lifecycle: Stonither::new(),
                node: OnceLock::new(),
                last: Mutex::new(LastLeader::default()),
                errors_tx,
                errors_rx: Mutex::new(Some(errors_rx)),
                span,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Election identifier this elector races under
    pub fn election_key(&self) -> &str {
        &self.inner.key
    }

    /// Fail-stop lifecycle of this elector
    pub fn lifecycle(&self) -> &Stonither {
        &self.inner.lifecycle
    }

    /// Fires once the elector has stopped
    pub fn done(&self) -> Done {
        self.inner.lifecycle.done()
    }

    /// Stop the elector
    pub fn stonith(&self) {
        let _enter = self.inner.span.enter();
        self.inner.lifecycle.stonith();
    }

    /// Last leader record observed
    pub async fn last_leader(&self) -> Option<LeaderRecord> {
        self.inner.last.lock().await.record.clone()
    }

    /// Release the coordination session
    pub async fn cleanup(&self) {
        self.inner.connector.cleanup().await;
    }

    fn node(&self) -> Result<&Arc<dyn Node>> {
        self.inner
            .node
            .get()
            .ok_or_else(|| Error::Internal("elector has no managed node".into()))
    }

    /// Start campaigning for `node`.
    ///
    /// Returns once the first session is established and the campaign and
    /// observe activities are running. Later failures surface through `done`.
    pub async fn run(&self, node: Arc<dyn Node>) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let span = self.inner.span.clone();
        span.record("node", node.name());
        span.record("daemon", node.daemon());

        let errors = self
            .inner
            .errors_rx
            .lock()
            .await
            .take()
            .ok_or(Error::AlreadyRunning)?;
        let stop = node.stop();
        if self.inner.node.set(node).is_err() {
            return Err(Error::AlreadyRunning);
        }

        self.watch_node_stop(stop);

        if self.inner.config.lifecycle.handle_signals {
            self.inner.lifecycle.install_os_signals()?;
        }

        if let Err(e) = self.connect(false).instrument(span.clone()).await {
            span.in_scope(|| tracing::error!("Failed to start elector: {}", e));
            self.stonith();
            return Err(e);
        }

        let elector = self.clone();
        tokio::spawn(async move { elector.supervise(errors).await }.instrument(span));
        Ok(())
    }

    fn watch_node_stop(&self, stop: Done) {
        let elector = self.clone();
        let done = self.done();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = stop.wait() => {
                        tracing::warn!("managed node stopped, stopping elector");
                        elector.stonith();
                    }
                    _ = done.wait() => {}
                }
            }
            .instrument(self.inner.span.clone()),
        );
    }

    /// Open a session and launch campaign and observe activities
    async fn connect(&self, reconnect: bool) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;
        let ctx = if reconnect {
            lifecycle.reset()
        } else {
            lifecycle.context()
        };
        if ctx.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let connector = &self.inner.connector;
        connector.connect(&ctx, &self.inner.config.backend).await?;

        let last = self.last_leader().await;
        let election = match &last {
            Some(record) => {
                tracing::info!(
                    "resuming election {} (leader key {}, revision {})",
                    self.inner.key,
                    record.key,
                    record.create_revision
                );
                connector.resume_election(&ctx, &self.inner.key, record).await?
            }
            None => {
                tracing::info!("starting new election {}", self.inner.key);
                connector.new_election(&ctx, &self.inner.key).await?
            }
        };

        let value = self.node()?.spec().marshal()?;
        self.spawn_campaign(ctx.clone(), election.clone(), value);
        self.spawn_observe(ctx, election);
        Ok(())
    }

    fn spawn_campaign(&self, ctx: CancellationToken, election: Arc<dyn Election>, value: String) {
        let errors = self.inner.errors_tx.clone();
        tokio::spawn(
            async move {
                tracing::info!("campaigning");
                match election.campaign(ctx.clone(), value).await {
                    Ok(()) => tracing::info!("campaign won"),
                    Err(e) if ctx.is_cancelled() || matches!(e, Error::SessionLost) => {
                        tracing::debug!("campaign ended: {}", e);
                    }
                    Err(e) => {
                        let _ = errors.send(e).await;
                    }
                }
            }
            .instrument(self.inner.span.clone()),
        );
    }

    fn spawn_observe(&self, ctx: CancellationToken, election: Arc<dyn Election>) {
        let elector = self.clone();
        tokio::spawn(
            async move {
                let mut leaders = election.observe(ctx.clone());
                loop {
                    let record = tokio::select! {
                        _ = ctx.cancelled() => break,
                        next = leaders.next() => match next {
                            Some(record) => record,
                            None => break,
                        },
                    };

                    match elector.update_leader(ctx.clone(), record).await {
                        Ok(_) => {}
                        Err(Error::Codec(e)) => {
                            tracing::warn!("skipping malformed leader record: {}", e);
                        }
                        Err(_) => break,
                    }
                }
                tracing::debug!("observe activity finished");
            }
            .instrument(self.inner.span.clone()),
        );
    }

    /// React to a new leader record.
    ///
    /// The record is stored before the node is acted upon. Node failures
    /// stonith the elector and are returned; a record that cannot be decoded
    /// is rejected without being stored.
    pub async fn update_leader(&self, ctx: CancellationToken, record: LeaderRecord) -> Result<Transition> {
        let node = self.node()?.clone();
        let leader: NodeSpec = record.decode()?;

        let was_leader = {
            let mut last = self.inner.last.lock().await;
            let was_leader = last.name.as_deref() == Some(node.name());
            last.name = Some(leader.name.clone());
            last.record = Some(record);
            was_leader
        };
        let is_leader = leader.name == node.name();

        let transition = match (is_leader, was_leader) {
            (true, true) => Transition::Stay,
            (true, false) => {
                tracing::info!("elected leader, promoting {}", node.name());
                if let Err(e) = node.lead(ctx, leader).await {
                    tracing::error!("promotion failed: {}", e);
                    self.stonith();
                    return Err(e);
                }
                Transition::Lead
            }
            (false, true) => {
                tracing::error!("superseded by {} while leading, fencing node", leader);
                if let Err(e) = node.stonith(ctx).await {
                    tracing::error!("node stonith failed: {}", e);
                }
                self.stonith();
                Transition::Superseded
            }
            (false, false) => {
                tracing::info!("following {}", leader);
                if let Err(e) = node.follow(ctx, leader).await {
                    tracing::error!("follow failed: {}", e);
                    self.stonith();
                    return Err(e);
                }
                Transition::Follow
            }
        };
        tracing::debug!("leader update applied: {}", transition);
        Ok(transition)
    }

    /// Stop on campaign failure, reconnect on session loss
    async fn supervise(self, mut errors: mpsc::Receiver<Error>) {
        let done = self.done();
        let reconnect_config = self.inner.config.reconnect.clone();

        loop {
            let session = self.inner.connector.session_done();
            tokio::select! {
                _ = done.wait() => break,
                Some(err) = errors.recv() => {
                    tracing::error!("campaign failed: {}", err);
                    self.stonith();
                    break;
                }
                _ = session.wait() => {
                    if done.is_done() {
                        break;
                    }
                    tracing::warn!("coordination session lost, reconnecting");
                    let result = reconnect::with_backoff(&reconnect_config, &done, "elector reconnect", |attempt| {
                        let elector = self.clone();
                        async move {
                            tracing::info!("reconnect attempt {}", attempt);
                            elector.connect(true).await
                        }
                    })
                    .await;

                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            tracing::error!("reconnect failed: {}", e);
                        }
                        self.stonith();
                        break;
                    }
                }
            }
        }
        tracing::info!("elector stopped");
    }
}
