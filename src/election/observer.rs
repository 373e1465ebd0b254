//! Membership Observer
//!
//! Watches every participant of an election without campaigning and keeps
//! a proxy's view of the cluster (leader plus followers) up to date.
//!
//! Three activities share one membership set: the leader stream decides
//! who leads, the prefix watch tracks everybody else, and the publish loop
//! pushes the settled state to the proxy at most once per interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::membership::{MembershipSet, MembershipSummary};
use super::reconnect;
use crate::config::NomineeConfig;
use crate::coordination::{Connector, EventKind, LeaderStream, WatchEvent, WatchStream};
use crate::error::{Error, Result};
use crate::lifecycle::{Done, Stonither};
use crate::node::NodeSpec;
use crate::proxy::Proxy;

/// Cluster membership observer
#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    /// Configuration
    config: NomineeConfig,
    /// Election identifier
    key: String,
    /// Coordination backend
    connector: Arc<dyn Connector>,
    /// Fail-stop lifecycle
    lifecycle: Stonither,
    /// Managed proxy, set once by `observe`
    proxy: OnceLock<Arc<dyn Proxy>>,
    /// Leader and followers
    members: Mutex<MembershipSet>,
    /// Log context
    span: tracing::Span,
    /// Set by `observe`
    running: AtomicBool,
}

impl Observer {
    /// Create an observer for the configured election
    pub fn new(config: NomineeConfig, connector: Arc<dyn Connector>) -> Self {
        let key = config.election_key();
        let span = tracing::info_span!(
            "observer",
            domain = %config.election.domain,
            cluster = %config.election.cluster,
        );

        Self {
            inner: Arc::new(ObserverInner {
                config,
                key,
                connector,
                lifecycle: Stonither::new(),
                proxy: OnceLock::new(),
                members: Mutex::new(MembershipSet::new()),
                span,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Election identifier being observed
    pub fn election_key(&self) -> &str {
        &self.inner.key
    }

    /// Fail-stop lifecycle of this observer
    pub fn lifecycle(&self) -> &Stonither {
        &self.inner.lifecycle
    }

    /// Fires once the observer has stopped
    pub fn done(&self) -> Done {
        self.inner.lifecycle.done()
    }

    /// Stop the observer
    pub fn stonith(&self) {
        let _enter = self.inner.span.enter();
        self.inner.lifecycle.stonith();
    }

    /// Release the coordination session
    pub async fn cleanup(&self) {
        self.inner.connector.cleanup().await;
    }

    /// Current leader
    pub async fn leader(&self) -> Option<NodeSpec> {
        self.inner.members.lock().await.leader().cloned()
    }

    /// Current followers ordered by election key
    pub async fn followers(&self) -> Vec<NodeSpec> {
        self.inner.members.lock().await.followers()
    }

    /// Membership counters
    pub async fn summary(&self) -> MembershipSummary {
        self.inner.members.lock().await.summary()
    }

    /// Start observing and publishing to `proxy`.
    ///
    /// Returns once the first subscription is established. Later failures
    /// surface through `done`.
    pub async fn observe(&self, proxy: Arc<dyn Proxy>) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let proxy_done = proxy.done();
        if self.inner.proxy.set(proxy).is_err() {
            return Err(Error::AlreadyRunning);
        }
        self.watch_proxy_done(proxy_done);

        if self.inner.config.lifecycle.handle_signals {
            self.inner.lifecycle.install_os_signals()?;
        }

        let span = self.inner.span.clone();
        if let Err(e) = self.subscribe(false).instrument(span.clone()).await {
            span.in_scope(|| tracing::error!("Failed to start observer: {}", e));
            self.stonith();
            return Err(e);
        }

        let observer = self.clone();
        tokio::spawn(async move { observer.publish_loop().await }.instrument(span.clone()));
        let observer = self.clone();
        tokio::spawn(async move { observer.supervise().await }.instrument(span));
        Ok(())
    }

    fn watch_proxy_done(&self, proxy_done: Done) {
        let observer = self.clone();
        let done = self.done();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = proxy_done.wait() => {
                        tracing::warn!("proxy stopped, stopping observer");
                        observer.stonith();
                    }
                    _ = done.wait() => {}
                }
            }
            .instrument(self.inner.span.clone()),
        );
    }

    /// Open a session, seed followers from a snapshot and start watching
    async fn subscribe(&self, reconnect: bool) -> Result<()> {
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
        let client = connector.connect(&ctx, &self.inner.config.backend).await?;
        let election = connector.new_election(&ctx, &self.inner.key).await?;
        tracing::info!("observing election {}", self.inner.key);

        let prefix = format!("{}/", self.inner.key);
        let watch = client.watch_prefix(ctx.clone(), &prefix);
        let leaders = election.observe(ctx.clone());

        let snapshot = client.get_prefix(&ctx, &prefix).await?;
        let specs: Vec<NodeSpec> = snapshot
            .into_iter()
            .filter_map(|kv| match NodeSpec::from_record(&kv.key, &kv.value) {
                Ok(spec) => Some(spec),
                Err(e) => {
                    tracing::warn!("skipping malformed record {}: {}", kv.key, e);
                    None
                }
            })
            .collect();
        tracing::info!("seeded {} members from snapshot", specs.len());
        self.inner.members.lock().await.replace_followers(specs);

        self.spawn_leader_watch(ctx.clone(), leaders);
        self.spawn_member_watch(ctx, watch);
        Ok(())
    }

    fn spawn_leader_watch(&self, ctx: CancellationToken, mut leaders: LeaderStream) {
        let observer = self.clone();
        tokio::spawn(
            async move {
                loop {
                    let record = tokio::select! {
                        _ = ctx.cancelled() => break,
                        next = leaders.next() => match next {
                            Some(record) => record,
                            None => break,
                        },
                    };

                    match record.decode() {
                        Ok(leader) => {
                            tracing::info!("leader is {}", leader);
                            observer.inner.members.lock().await.set_leader(leader);
                        }
                        Err(e) => tracing::warn!("skipping malformed leader record {}: {}", record.key, e),
                    }
                }
            }
            .instrument(self.inner.span.clone()),
        );
    }

    fn spawn_member_watch(&self, ctx: CancellationToken, mut watch: WatchStream) {
        let observer = self.clone();
        tokio::spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        _ = ctx.cancelled() => break,
                        next = watch.next() => match next {
                            Some(event) => event,
                            None => break,
                        },
                    };

                    match event {
                        Ok(event) => observer.apply(event).await,
                        Err(e) if e.is_retryable() => {
                            tracing::warn!("membership watch interrupted: {}", e);
                            break;
                        }
                        Err(e) => {
                            tracing::error!("membership watch failed: {}", e);
                            observer.stonith();
                            break;
                        }
                    }
                }
            }
            .instrument(self.inner.span.clone()),
        );
    }

    /// Apply one membership change
    async fn apply(&self, event: WatchEvent) {
        let mut members = self.inner.members.lock().await;
        match event.kind {
            EventKind::Put => match NodeSpec::from_record(&event.kv.key, &event.kv.value) {
                Ok(spec) => {
                    tracing::debug!("member {} joined or changed", spec);
                    members.put(spec);
                }
                Err(e) => tracing::warn!("skipping malformed record {}: {}", event.kv.key, e),
            },
            EventKind::Delete => {
                tracing::debug!("member {} left", event.kv.key);
                members.delete(&event.kv.key);
            }
        }
    }

    /// Publish pending membership once; returns whether anything was published
    pub async fn publish_pending(&self) -> Result<bool> {
        let proxy = self
            .inner
            .proxy
            .get()
            .ok_or_else(|| Error::Internal("observer has no proxy".into()))?;

        let Some(snapshot) = self.inner.members.lock().await.pending() else {
            return Ok(false);
        };

        proxy.publish(snapshot.leader, snapshot.followers).await?;
        self.inner.members.lock().await.mark_published(snapshot.version);
        Ok(true)
    }

    async fn publish_loop(self) {
        let done = self.done();
        let mut ticker = tokio::time::interval(self.inner.config.observer.publish_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = done.wait() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.publish_pending().await {
                        tracing::warn!("publish failed, retrying next cycle: {}", e);
                    }
                }
            }
        }
    }

    /// Re-subscribe on session loss
    async fn supervise(self) {
        let done = self.done();
        let reconnect_config = self.inner.config.reconnect.clone();

        loop {
            let session = self.inner.connector.session_done();
            tokio::select! {
                _ = done.wait() => break,
                _ = session.wait() => {
                    if done.is_done() {
                        break;
                    }
                    tracing::warn!("coordination session lost, re-subscribing");
                    let result = reconnect::with_backoff(&reconnect_config, &done, "observer reconnect", |attempt| {
                        let observer = self.clone();
                        async move {
                            tracing::info!("re-subscribe attempt {}", attempt);
                            observer.subscribe(true).await
                        }
                    })
                    .await;

                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            tracing::error!("re-subscribe failed: {}", e);
                        }
                        self.stonith();
                        break;
                    }
                }
            }
        }
        tracing::info!("observer stopped");
    }
}
