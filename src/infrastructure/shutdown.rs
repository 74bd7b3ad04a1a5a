use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

#[async_trait]
pub trait Shutdown: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
}

/// Stops components in the order they were added. A failing step is logged
/// and the remaining steps still run.
#[derive(Default)]
pub struct ShutdownSequence {
    steps: Vec<(&'static str, Arc<dyn Shutdown>)>,
}

impl ShutdownSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, name: &'static str, component: Arc<dyn Shutdown>) -> Self {
        self.steps.push((name, component));
        self
    }

    /// Returns the number of steps that failed.
    pub async fn run(&self) -> usize {
        let mut failures = 0;
        for (name, component) in &self.steps {
            info!("🛑 Shutting down {}", name);
            if let Err(e) = component.shutdown().await {
                failures += 1;
                error!("Shutdown of {} failed: {:?}", name, e);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Step {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Shutdown for Step {
        async fn shutdown(&self) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("{} refused to stop", self.name);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_order_past_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = |name, fail| -> Arc<dyn Shutdown> {
            Arc::new(Step {
                name,
                fail,
                log: log.clone(),
            })
        };

        let failures = ShutdownSequence::new()
            .then("source", step("source", false))
            .then("ingest", step("ingest", true))
            .then("dispatcher", step("dispatcher", false))
            .run()
            .await;

        assert_eq!(failures, 1);
        assert_eq!(*log.lock().unwrap(), vec!["source", "ingest", "dispatcher"]);
    }
}
