//! Periodic background task scheduler.
//!
//! The server registers its maintenance work (engine flush/compaction
//! ticks, heartbeat, cache GC, scan-session sweeps) as [`BackgroundTask`]s;
//! each runs on its own interval until shutdown. Task bodies that do
//! blocking I/O hop onto the blocking pool so the timer loops stay
//! responsive.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Execution context handed to each task run.
pub struct TaskContext {
    pub task_name: &'static str,
    pub run: u64,
    pub shutdown: broadcast::Receiver<()>,
}

#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run.
    fn interval(&self) -> Duration;

    async fn execute(&self, ctx: TaskContext) -> Result<()>;
}

/// Owns the timer loops and shuts them down together.
pub struct Scheduler {
    handles: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            handles: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.handles.write().unwrap().push(handle);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run += 1;
                        let ctx = TaskContext {
                            task_name: task.name(),
                            run,
                            shutdown: shutdown_rx.resubscribe(),
                        };
                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(task = task.name(), error = %e, "background task failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "background task stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Signal every task and wait for the loops to exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).ok();
        let handles: Vec<JoinHandle<()>> = self.handles.write().unwrap().drain(..).collect();
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn execute(&self, _ctx: TaskContext) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_task_runs_until_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        scheduler.register(Arc::new(CountingTask { ticks: ticks.clone() }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.shutdown().await?;
        let after_shutdown = ticks.load(Ordering::SeqCst);
        assert!(after_shutdown > 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_shutdown);
        Ok(())
    }
}
