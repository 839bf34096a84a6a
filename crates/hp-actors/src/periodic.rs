use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A named background job re-run on a fixed interval until stopped.
pub struct PeriodicTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str) -> Self {
        Self { name, handle: None }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Run `job` now and then every `interval`. Restarts the loop when
    /// already running.
    pub fn start<F, Fut>(&mut self, interval: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        let name = self.name;

        let handle = tokio::spawn(async move {
            loop {
                debug!(task = name, "Running periodic task");
                job().await;
                tokio::time::sleep(interval).await;
            }
        });

        self.handle = Some(handle);
        info!("Periodic task {} started with {:?} interval", name, interval);
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Periodic task {} stopped", self.name);
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_repeatedly_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut task = PeriodicTask::new("counter");
        let counter = runs.clone();
        task.start(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(55)).await;
        task.stop();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {} times", seen);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
        assert!(!task.is_running());
    }
}
