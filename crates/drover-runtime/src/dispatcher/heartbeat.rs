use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Beat {
    Armed(Duration),
    Stopped,
}

/// Resettable failure detector.
///
/// Counts down from the given timeout and runs the expiry callback once
/// if no `refresh` arrives in time. Expiry is terminal: after the callback
/// has run, further refreshes are ignored. Dropping the heartbeat stops it.
#[derive(Debug)]
pub struct Heartbeat {
    tx: watch::Sender<Beat>,
}

impl Heartbeat {
    /// Start a countdown. Must be called inside a tokio runtime.
    pub fn start<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = watch::channel(Beat::Armed(timeout));
        tokio::spawn(countdown(rx, on_expire));
        Self { tx }
    }

    /// Prove liveness and restart the countdown with a new timeout.
    pub fn refresh(&self, timeout: Duration) {
        self.tx.send_if_modified(|beat| match beat {
            Beat::Armed(current) => {
                *current = timeout;
                true
            }
            Beat::Stopped => false,
        });
    }

    /// Cancel the countdown permanently. Safe to call more than once.
    pub fn stop(&self) {
        self.tx.send_if_modified(|beat| {
            let changed = *beat != Beat::Stopped;
            *beat = Beat::Stopped;
            changed
        });
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow() == Beat::Stopped
    }
}

async fn countdown<F: FnOnce()>(mut rx: watch::Receiver<Beat>, on_expire: F) {
    loop {
        let timeout = match *rx.borrow_and_update() {
            Beat::Armed(timeout) => timeout,
            Beat::Stopped => return,
        };

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                // A refresh or stop that raced the deadline wins.
                match rx.has_changed() {
                    Ok(false) => {
                        on_expire();
                        return;
                    }
                    Ok(true) => continue,
                    Err(_) => return,
                }
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
