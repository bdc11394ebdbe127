//! Process shell: runs the arbitration loop until a shutdown trigger fires,
//! then unwatches and waits for the loop to drain.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::arbiter::ArbitrationLoop;

pub struct OracleShell {
    arbiter: Arc<ArbitrationLoop>,
}

impl OracleShell {
    pub fn new(arbiter: Arc<ArbitrationLoop>) -> Self {
        Self { arbiter }
    }

    pub fn arbiter(&self) -> &Arc<ArbitrationLoop> {
        &self.arbiter
    }

    /// Run until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut task = {
            let arbiter = self.arbiter.clone();
            tokio::spawn(async move { arbiter.run().await })
        };

        tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested, draining arbitration loop");
            }
            result = &mut task => {
                // run() only returns once unwatched
                return result.map_err(|e| anyhow!("Arbitration loop task failed: {}", e));
            }
        }

        self.arbiter.unwatch();
        task.await
            .map_err(|e| anyhow!("Arbitration loop task failed: {}", e))?;
        info!("Oracle stopped");
        Ok(())
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to register signal handlers ({}), using ctrl-c", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received ctrl-c");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OracleConfig;
    use crate::ledger::InMemoryLedger;
    use crate::provider::{Backend, ProviderDescriptor, ProviderRouter};
    use crate::types::Address;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Never;

    #[async_trait]
    impl Backend for Never {
        async fn complete(&self, _: &str, _: &str, _: &str) -> anyhow::Result<String> {
            Ok("false".into())
        }
    }

    fn arbiter() -> Arc<ArbitrationLoop> {
        let mut router = ProviderRouter::new(Duration::from_secs(1));
        router
            .add_backend(ProviderDescriptor::new("stub"), Arc::new(Never))
            .unwrap();
        let config = OracleConfig {
            poll_interval_ms: 10,
            ..OracleConfig::new(Address([2; 20]))
        };
        Arc::new(
            ArbitrationLoop::new(Arc::new(InMemoryLedger::new()), Arc::new(router), config).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_run_until_immediate_shutdown() {
        let arbiter = arbiter();
        let shell = OracleShell::new(arbiter.clone());
        tokio::time::timeout(Duration::from_secs(1), shell.run_until(async {}))
            .await
            .expect("shell did not stop")
            .unwrap();
        assert!(!arbiter.is_watching());
    }

    #[tokio::test]
    async fn test_run_until_after_cycles() {
        let arbiter = arbiter();
        let shell = OracleShell::new(arbiter.clone());
        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        shell.run_until(shutdown).await.unwrap();
        assert!(!arbiter.is_watching());
    }
}
