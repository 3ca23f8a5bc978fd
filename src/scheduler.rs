//! Drain timer.
//!
//! A [`FlushTimer`] is a background tokio task that runs a [`DrainJob`]
//! after a delay, re-arms itself with the delay the job returns, and can be
//! woken early, re-armed or stopped. The job is held weakly so dropping its
//! owner ends the task.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Work performed on every timer expiry.
#[async_trait]
pub trait DrainJob: Send + Sync + 'static {
    /// Run once and return the delay before the next run.
    async fn run(&self) -> Duration;
}

#[derive(Debug)]
enum TimerCommand {
    Rearm(Duration),
    Shutdown,
}

/// Handle on a running drain timer.
#[derive(Debug)]
pub struct FlushTimer {
    commands: mpsc::UnboundedSender<TimerCommand>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    /// Spawn the timer on the current tokio runtime.
    ///
    /// The first run happens after `initial_delay`, or earlier if `wake`
    /// is notified.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<J: DrainJob>(job: Weak<J>, initial_delay: Duration, wake: Arc<Notify>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(timer_loop(job, initial_delay, wake.clone(), rx));

        Self {
            commands,
            wake,
            handle,
        }
    }

    /// Run the job as soon as possible. Requests made while a run is in
    /// progress collapse into a single follow-up run.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Restart the countdown with `delay`, replacing the pending one.
    pub fn rearm(&self, delay: Duration) {
        if self.commands.send(TimerCommand::Rearm(delay)).is_err() {
            debug!("Flush timer already stopped, ignoring re-arm");
        }
    }

    /// Stop the timer and wait for an in-progress run to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(TimerCommand::Shutdown);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Flush timer task panicked");
        }
    }
}

async fn timer_loop<J: DrainJob>(
    job: Weak<J>,
    mut delay: Duration,
    wake: Arc<Notify>,
    mut commands: mpsc::UnboundedReceiver<TimerCommand>,
) {
    loop {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        tokio::select! {
            biased;

            cmd = commands.recv() => match cmd {
                Some(TimerCommand::Rearm(next)) => {
                    delay = next;
                    continue;
                }
                Some(TimerCommand::Shutdown) | None => break,
            },

            _ = wake.notified() => {}

            _ = &mut sleep => {}
        }

        let Some(job) = job.upgrade() else {
            break;
        };
        delay = job.run().await;
    }

    debug!("Flush timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: AtomicUsize,
        next: Duration,
    }

    impl CountingJob {
        fn new(next: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                next,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DrainJob for CountingJob {
        async fn run(&self) -> Duration {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.next
        }
    }

    fn spawn(job: &Arc<CountingJob>, initial: Duration) -> FlushTimer {
        FlushTimer::spawn(Arc::downgrade(job), initial, Arc::new(Notify::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_after_initial_delay_then_rearms() {
        let job = CountingJob::new(Duration::from_millis(1000));
        let timer = spawn(&job, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.runs(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(job.runs(), 1);

        // Next run is 1000ms after the first one
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(job.runs(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(job.runs(), 2);

        timer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_runs_immediately() {
        let job = CountingJob::new(Duration::from_secs(60));
        let timer = spawn(&job, Duration::from_secs(60));

        timer.wake();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(job.runs(), 1);

        timer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_pending_delay() {
        let job = CountingJob::new(Duration::from_secs(60));
        let timer = spawn(&job, Duration::from_millis(100));

        timer.rearm(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(job.runs(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(job.runs(), 1);

        timer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_runs() {
        let job = CountingJob::new(Duration::from_millis(10));
        let timer = spawn(&job, Duration::from_millis(10));

        timer.shutdown().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(job.runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_job_ends_task() {
        let job = CountingJob::new(Duration::from_millis(10));
        let timer = spawn(&job, Duration::from_millis(10));
        drop(job);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(timer.handle.is_finished());
    }
}
