//! Recurring expiry of overdue waitlist notifications.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::waitlist_queue::WaitlistQueue;

/// Runs [`WaitlistQueue::cleanup_expired`] every `interval` on its own thread.
#[derive(Debug)]
pub struct ExpirySweeper {
    waitlist: WaitlistQueue,
    interval: Duration,
}

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct ExpirySweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    expired: Arc<AtomicU64>,
}

impl ExpirySweeperHandle {
    /// Stop the sweeper and wait for its current pass to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Entries expired since the sweeper started.
    pub fn expired_total(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }
}

impl ExpirySweeper {
    pub fn new(waitlist: WaitlistQueue, interval: Duration) -> Self {
        Self { waitlist, interval }
    }

    pub fn spawn(self) -> io::Result<ExpirySweeperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let expired = Arc::new(AtomicU64::new(0));
        let counter = expired.clone();

        let join = thread::Builder::new()
            .name("waitlist-expiry".to_string())
            .spawn(move || self.run(&shutdown_rx, &counter))?;

        Ok(ExpirySweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            expired,
        })
    }

    fn run(&self, shutdown_rx: &mpsc::Receiver<()>, expired: &AtomicU64) {
        info!(interval_secs = self.interval.as_secs(), "waitlist expiry sweeper started");
        loop {
            match self.waitlist.cleanup_expired() {
                Ok(outcome) => {
                    expired.fetch_add(outcome.expired_count as u64, Ordering::Relaxed);
                }
                Err(e) => error!(error = %e, "waitlist expiry sweep failed"),
            }

            match shutdown_rx.recv_timeout(self.interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
        info!("waitlist expiry sweeper stopped");
    }
}
