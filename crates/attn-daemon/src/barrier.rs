//! Recovery barrier.
//!
//! Raised by the startup orchestrator before the recovery scan and
//! lifted when reconciliation completes or its bounded timeout expires.
//! While raised, `initial_state` is deferred and PTY-lifecycle commands
//! answer `command_error(daemon_recovering)`.

use tokio::sync::watch;

#[derive(Clone)]
pub struct RecoveryGate {
    rx: watch::Receiver<bool>,
}

pub struct RecoveryGateHandle {
    tx: watch::Sender<bool>,
}

/// Create a raised gate plus the handle that lifts it.
pub fn recovery_gate() -> (RecoveryGateHandle, RecoveryGate) {
    let (tx, rx) = watch::channel(false);
    (RecoveryGateHandle { tx }, RecoveryGate { rx })
}

impl RecoveryGateHandle {
    /// Lift the barrier. Idempotent.
    pub fn lift(&self) {
        let _ = self.tx.send(true);
    }
}

impl RecoveryGate {
    pub fn is_lifted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the barrier lifts. The orchestrator guarantees a lift
    /// within its bounded timeout, so no deadline is needed here.
    pub async fn lifted(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Handle dropped without lifting: treat as lifted so
                // shutdown never wedges a client.
                return;
            }
        }
    }
}
