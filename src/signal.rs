//! A cooperative stop signal shared by every loop the container owns.
//!
//! Every scheduler, reaper and poller iteration checks this between
//! Redis operations (ß5: "Cancellation & timeouts"). None of them hold a
//! lock; they just observe the same `watch` channel.

use tokio::sync::watch;

#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn new() -> (Self, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (StopHandle { tx }, StopSignal { rx })
    }

    /// Ask every loop watching this signal to quiesce.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop has been requested. Loops race this against
    /// their sleep so a stop request is never delayed by a long sleep.
    pub async fn stopped(&mut self) {
        if self.is_stopped() {
            return;
        }
        let _ = self.rx.changed().await;
    }
}
