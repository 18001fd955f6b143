//! Heartbeat scheduler
//!
//! Sleeps a random 50%..150% of the ping rate between pings. Changing the
//! rate wakes the current sleep; a rate of zero stops the task.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Random delay before the next ping, uniform in `[rate/2, 3*rate/2]` seconds
pub fn ping_delay(rate_secs: u64) -> Duration {
    let rate_ms = rate_secs.saturating_mul(1000);
    let low = rate_ms / 2;
    Duration::from_millis(rand::rng().random_range(low..=low + rate_ms))
}

pub struct Heartbeat {
    rate: watch::Sender<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        let (rate, _) = watch::channel(0);
        Self {
            rate,
            task: Mutex::new(None),
        }
    }

    /// Current rate in seconds; zero when disabled
    pub fn rate(&self) -> u64 {
        *self.rate.borrow()
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Set the rate. With zero, the task is stopped before this returns.
    /// `ping` returns false once its owner is gone, which ends the task.
    pub async fn set_rate<F, Fut>(&self, rate_secs: u64, ping: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut task = self.task.lock().await;
        self.rate.send_replace(rate_secs);

        if rate_secs == 0 {
            if let Some(handle) = task.take() {
                handle.abort();
                let _ = handle.await;
                debug!("Heartbeat stopped");
            }
            return;
        }

        let running = task.as_ref().map(|t| !t.is_finished()).unwrap_or(false);
        if !running {
            let rx = self.rate.subscribe();
            *task = Some(tokio::spawn(run(rx, ping)));
            debug!(rate_secs, "Heartbeat started");
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run<F, Fut>(mut rate: watch::Receiver<u64>, ping: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        let rate_secs = *rate.borrow_and_update();
        if rate_secs == 0 {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(ping_delay(rate_secs)) => {
                if !ping().await {
                    break;
                }
            }
            changed = rate.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
