use std::time::Duration;

use tokio::sync::watch;

use crate::model::StageStatus;

/// Why a stage is asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopSignalKind {
    #[default]
    None,
    /// The user cancelled the deployment
    Cancel,
    /// Piped is shutting down, the stage resumes after restart
    Terminate,
    /// The stage or deployment deadline passed
    Timeout,
}

/// Sending half, owned by the scheduler
#[derive(Debug)]
pub struct StopSignalHandler {
    tx: watch::Sender<StopSignalKind>,
}

/// Receiving half handed to executors. Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<StopSignalKind>,
}

pub fn new_stop_signal() -> (StopSignalHandler, StopSignal) {
    let (tx, rx) = watch::channel(StopSignalKind::None);
    (StopSignalHandler { tx }, StopSignal { rx })
}

impl StopSignalHandler {
    /// Only the first signal is kept
    pub fn send(&self, kind: StopSignalKind) {
        if kind == StopSignalKind::None {
            return;
        }
        self.tx.send_if_modified(|current| {
            if *current == StopSignalKind::None {
                *current = kind;
                true
            } else {
                false
            }
        });
    }

    pub fn signal(&self) -> StopSignalKind {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    pub fn signal(&self) -> StopSignalKind {
        *self.rx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.signal() != StopSignalKind::None
    }

    /// Resolve once a signal is sent. Never resolves if the handler is
    /// dropped without signalling.
    pub async fn wait(&self) -> StopSignalKind {
        let mut rx = self.rx.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current != StopSignalKind::None {
                return current;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration`, returning early with the signal when stopped
    pub async fn sleep(&self, duration: Duration) -> Option<StopSignalKind> {
        tokio::select! {
            kind = self.wait() => Some(kind),
            _ = tokio::time::sleep(duration) => None,
        }
    }
}

/// Final status of a stage from the signal it received, its status before it
/// ran and what the executor returned.
pub fn determine_stage_status(
    signal: StopSignalKind,
    original: StageStatus,
    got: StageStatus,
) -> StageStatus {
    match signal {
        StopSignalKind::None => got,
        StopSignalKind::Terminate => original,
        StopSignalKind::Cancel => StageStatus::Cancelled,
        StopSignalKind::Timeout => StageStatus::Failure,
    }
}
