//! Test Helpers
//!
//! Recording doubles for the managed node, the proxy and the connector,
//! plus async assertions on done signals.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{
    BackendConfig, ElectionConfig, LifecycleConfig, NomineeConfig, ObserverConfig,
    ReconnectConfig,
};
use crate::coordination::{Client, Connector, Election, LeaderRecord, MemoryConnector};
use crate::error::{Error, Result};
use crate::lifecycle::Done;
use crate::node::{Node, NodeSpec};
use crate::proxy::Proxy;

/// Configuration for the `test`/`unit` election with fast timings
pub fn test_config() -> NomineeConfig {
    NomineeConfig {
        election: ElectionConfig {
            domain: "test".into(),
            cluster: "unit".into(),
        },
        backend: BackendConfig {
            endpoints: vec!["memory".into()],
            ..BackendConfig::default()
        },
        reconnect: ReconnectConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            max_retries: 5,
        },
        observer: ObserverConfig {
            publish_interval_ms: 20,
        },
        lifecycle: LifecycleConfig {
            handle_signals: false,
        },
        ..NomineeConfig::default()
    }
}

/// Call received by a `MockNode`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCall {
    /// Lead with the named leader
    Lead(String),
    /// Follow the named leader
    Follow(String),
    /// Stonith
    Stonith,
}

/// Node that records every call
pub struct MockNode {
    spec: NodeSpec,
    calls: Mutex<Vec<NodeCall>>,
    fail_lead: bool,
    fail_follow: bool,
    stop: CancellationToken,
}

impl MockNode {
    pub fn new(name: &str) -> Self {
        Self {
            spec: NodeSpec::new(name, "127.0.0.1", 5432),
            calls: Mutex::new(Vec::new()),
            fail_lead: false,
            fail_follow: false,
            stop: CancellationToken::new(),
        }
    }

    pub fn failing_lead(mut self) -> Self {
        self.fail_lead = true;
        self
    }

    pub fn failing_follow(mut self) -> Self {
        self.fail_follow = true;
        self
    }

    pub fn calls(&self) -> Vec<NodeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    fn record(&self, call: NodeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Node for MockNode {
    fn daemon(&self) -> &str {
        "mock"
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn spec(&self) -> NodeSpec {
        self.spec.clone()
    }

    async fn lead(&self, _ctx: CancellationToken, leader: NodeSpec) -> Result<()> {
        self.record(NodeCall::Lead(leader.name));
        if self.fail_lead {
            return Err(Error::Node("promotion refused".into()));
        }
        Ok(())
    }

    async fn follow(&self, _ctx: CancellationToken, leader: NodeSpec) -> Result<()> {
        self.record(NodeCall::Follow(leader.name));
        if self.fail_follow {
            return Err(Error::Node("replication refused".into()));
        }
        Ok(())
    }

    async fn stonith(&self, _ctx: CancellationToken) -> Result<()> {
        self.record(NodeCall::Stonith);
        Ok(())
    }

    fn stop(&self) -> Done {
        self.stop.clone().into()
    }
}

/// Proxy that records every publish
pub struct MockProxy {
    published: Mutex<Vec<(Option<NodeSpec>, Vec<NodeSpec>)>>,
    failing: AtomicBool,
    done: CancellationToken,
}

impl MockProxy {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            done: CancellationToken::new(),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful publishes
    pub fn publishes(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<(Option<NodeSpec>, Vec<NodeSpec>)> {
        self.published.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Proxy for MockProxy {
    async fn publish(&self, leader: Option<NodeSpec>, followers: Vec<NodeSpec>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Proxy("transaction rejected".into()));
        }
        self.published.lock().unwrap().push((leader, followers));
        Ok(())
    }

    fn done(&self) -> Done {
        self.done.clone().into()
    }
}

/// Connector wrapper counting calls into a `MemoryConnector`
pub struct RecordingConnector {
    inner: MemoryConnector,
    connects: AtomicUsize,
    new_elections: AtomicUsize,
    resumed: Mutex<Vec<LeaderRecord>>,
}

impl RecordingConnector {
    pub fn new(inner: MemoryConnector) -> Self {
        Self {
            inner,
            connects: AtomicUsize::new(0),
            new_elections: AtomicUsize::new(0),
            resumed: Mutex::new(Vec::new()),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn new_elections(&self) -> usize {
        self.new_elections.load(Ordering::SeqCst)
    }

    pub fn resume_elections(&self) -> usize {
        self.resumed.lock().unwrap().len()
    }

    /// Records passed to `resume_election`, in call order
    pub fn resumed_with(&self) -> Vec<LeaderRecord> {
        self.resumed.lock().unwrap().clone()
    }

    pub fn lease_id(&self) -> Option<i64> {
        self.inner.lease_id()
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self, ctx: &CancellationToken, config: &BackendConfig) -> Result<Arc<dyn Client>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(ctx, config).await
    }

    async fn new_election(&self, ctx: &CancellationToken, key: &str) -> Result<Arc<dyn Election>> {
        self.new_elections.fetch_add(1, Ordering::SeqCst);
        self.inner.new_election(ctx, key).await
    }

    async fn resume_election(
        &self,
        ctx: &CancellationToken,
        key: &str,
        leader: &LeaderRecord,
    ) -> Result<Arc<dyn Election>> {
        self.resumed.lock().unwrap().push(leader.clone());
        self.inner.resume_election(ctx, key, leader).await
    }

    fn session_done(&self) -> Done {
        self.inner.session_done()
    }

    async fn cleanup(&self) {
        self.inner.cleanup().await
    }
}

/// Assert that `done` fires within `timeout`
pub async fn must_be_stopped(done: &Done, timeout: Duration) {
    if tokio::time::timeout(timeout, done.wait()).await.is_err() {
        panic!("expected to be stopped within {:?}", timeout);
    }
}

/// Assert that `done` does not fire for `period`
pub async fn must_keep_running(done: &Done, period: Duration) {
    if tokio::time::timeout(period, done.wait()).await.is_ok() {
        panic!("expected to keep running for {:?}", period);
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, check: F)
where
    F: Fn() -> bool,
{
    eventually_async(timeout, || {
        let ok = check();
        async move { ok }
    })
    .await
}

/// Poll an async `check` until it holds or `timeout` elapses
pub async fn eventually_async<F, Fut>(timeout: Duration, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
