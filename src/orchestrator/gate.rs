//! Control-channel primitives between the control surface and a running
//! build driver: the cooperative cancel flag, the pause gate, and the
//! interjection queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, mpsc};

use crate::models::ResumeAction;

/// Cooperative cancellation: a flag plus a wakeup, so suspension points can
/// `select!` on it and drop in-flight work (tool subprocesses die with the
/// dropped future).
#[derive(Debug, Default)]
pub struct CancelFlag {
    flag: AtomicBool,
    /// Set only by force-cancel; the driver skips cleanup hooks.
    force: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self, force: bool) {
        if force {
            self.force.store(true, Ordering::SeqCst);
        }
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    /// Resolves when cancellation is requested. Safe to poll from multiple
    /// suspension points.
    pub async fn cancelled(&self) {
        // Re-check after arming the waiter to close the set-then-wait race.
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A user's answer to a pause gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResolution {
    pub action: ResumeAction,
    pub message: Option<String>,
}

/// Channel handles the control surface keeps for one running build.
#[derive(Clone)]
pub struct BuildControls {
    pub cancel: Arc<CancelFlag>,
    pub gate_tx: mpsc::Sender<GateResolution>,
    pub interject_tx: mpsc::Sender<String>,
}

/// Receiver halves owned by the driver.
pub struct DriverChannels {
    pub gate_rx: mpsc::Receiver<GateResolution>,
    pub interject_rx: mpsc::Receiver<String>,
}

pub fn build_channels() -> (BuildControls, DriverChannels) {
    let (gate_tx, gate_rx) = mpsc::channel(4);
    let (interject_tx, interject_rx) = mpsc::channel(16);
    (
        BuildControls {
            cancel: CancelFlag::new(),
            gate_tx,
            interject_tx,
        },
        DriverChannels {
            gate_rx,
            interject_rx,
        },
    )
}

/// Drain every queued interjection without blocking, coalescing them into a
/// single user turn.
pub fn drain_interjections(rx: &mut mpsc::Receiver<String>) -> Option<String> {
    let mut parts = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        parts.push(msg);
    }
    if parts.is_empty() {
        None
    } else {
        Some(format!("[User interjection] {}", parts.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let flag = CancelFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.cancel(false);
        let woke = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
        assert!(flag.is_cancelled());
        assert!(!flag.is_forced());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_set() {
        let flag = CancelFlag::new();
        flag.cancel(true);
        tokio::time::timeout(Duration::from_millis(50), flag.cancelled())
            .await
            .expect("should resolve without waiting");
        assert!(flag.is_forced());
    }

    #[tokio::test]
    async fn interjections_coalesce_in_order() {
        let (controls, mut channels) = build_channels();
        controls.interject_tx.send("first".into()).await.unwrap();
        controls.interject_tx.send("second".into()).await.unwrap();
        let combined = drain_interjections(&mut channels.interject_rx).unwrap();
        assert_eq!(combined, "[User interjection] first\nsecond");
        assert!(drain_interjections(&mut channels.interject_rx).is_none());
    }

    #[tokio::test]
    async fn gate_resolution_round_trip() {
        let (controls, mut channels) = build_channels();
        controls
            .gate_tx
            .send(GateResolution {
                action: ResumeAction::RetryWithMessage,
                message: Some("use pytest".into()),
            })
            .await
            .unwrap();
        let res = channels.gate_rx.recv().await.unwrap();
        assert_eq!(res.action, ResumeAction::RetryWithMessage);
        assert_eq!(res.message.as_deref(), Some("use pytest"));
    }
}
