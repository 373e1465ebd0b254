//! Component Runner
//!
//! Wires an elector to a managed node or an observer to a proxy and blocks
//! until the component stops. The connector is always cleaned up.

use std::sync::Arc;

use crate::election::{Elector, Observer};
use crate::error::Result;
use crate::node::Node;
use crate::proxy::Proxy;

/// Run `elector` for `node` until it is stonithed
pub async fn run_elector(elector: &Elector, node: Arc<dyn Node>) -> Result<()> {
    let name = node.name().to_string();
    tracing::info!("Starting elector for {} on {}", name, elector.election_key());

    let result = elector.run(node).await;
    if result.is_ok() {
        elector.done().wait().await;
    }

    elector.cleanup().await;
    tracing::info!("Elector for {} stopped", name);
    result
}

/// Run `observer` publishing to `proxy` until it is stonithed
pub async fn run_observer(observer: &Observer, proxy: Arc<dyn Proxy>) -> Result<()> {
    tracing::info!("Starting observer on {}", observer.election_key());

    let result = observer.observe(proxy).await;
    if result.is_ok() {
        observer.done().wait().await;
    }

    observer.cleanup().await;
    tracing::info!("Observer stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::coordination::MemoryBackend;
    use crate::error::Error;
    use crate::testing::{eventually, test_config, MockNode, MockProxy};

    #[tokio::test]
    async fn test_run_elector_blocks_until_stonith() {
        let backend = MemoryBackend::new();
        let elector = Elector::new(test_config(), Arc::new(backend.connector()));
        let node = Arc::new(MockNode::new("pg-1"));

        let task = tokio::spawn({
            let elector = elector.clone();
            let node = node.clone();
            async move { run_elector(&elector, node).await }
        });

        eventually(Duration::from_secs(2), || !node.calls().is_empty()).await;
        assert!(!task.is_finished());

        elector.stonith();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(backend.leases().is_empty());
    }

    #[tokio::test]
    async fn test_run_observer_returns_startup_error() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        let observer = Observer::new(test_config(), Arc::new(backend.connector()));

        let result = run_observer(&observer, Arc::new(MockProxy::new())).await;
        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
        assert!(observer.done().is_done());
    }
}
