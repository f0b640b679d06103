use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One-shot latch. Closing is idempotent and observable from any clone.
#[derive(Clone, Default)]
pub struct Done {
    token: CancellationToken,
}

impl Done {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

/// Cancels `token` once no activity has been stamped for the current
/// timeout. The timeout can be tightened mid-flight (half-close phases).
#[derive(Clone)]
pub struct ActivityTimer {
    last: Arc<Mutex<Instant>>,
    timeout: Arc<Mutex<Duration>>,
    changed: Arc<Notify>,
}

impl ActivityTimer {
    pub fn update(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
        self.changed.notify_one();
    }
}

pub fn cancel_after_inactivity(token: CancellationToken, timeout: Duration) -> ActivityTimer {
    let timer = ActivityTimer {
        last: Arc::new(Mutex::new(Instant::now())),
        timeout: Arc::new(Mutex::new(timeout)),
        changed: Arc::new(Notify::new()),
    };

    let t = timer.clone();
    tokio::spawn(async move {
        loop {
            let deadline = *t.last.lock().unwrap() + *t.timeout.lock().unwrap();
            if Instant::now() >= deadline {
                token.cancel();
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = t.changed.notified() => {}
                _ = token.cancelled() => return,
            }
        }
    });

    timer
}
