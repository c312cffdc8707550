//! Session control plumbing
//!
//! `Rendezvous` is a single-slot handoff: the loop arms it and parks; an
//! external caller resolves it with a value. At most one exchange can be
//! outstanding. `Controls` bundles the cancel flag, the pause gate, the
//! question/permission rendezvous and the mid-run instruction queue.

use std::sync::Mutex as StdMutex;

use tokio::sync::{oneshot, watch};

/// Single-slot rendezvous between the session loop and an external caller
pub struct Rendezvous<T> {
    slot: StdMutex<Option<oneshot::Sender<T>>>,
}

impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Self {
            slot: StdMutex::new(None),
        }
    }
}

impl<T> Rendezvous<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot and return the receiving end. The previous sender, if
    /// any, is dropped; a session only ever waits on one exchange at a time.
    pub fn arm(&self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock().unwrap() = Some(tx);
        rx
    }

    /// Deliver a value to the armed waiter. Returns false when nothing was
    /// waiting (no exchange outstanding, or the waiter gave up).
    pub fn resolve(&self, value: T) -> bool {
        match self.slot.lock().unwrap().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Drop the armed sender, waking the waiter with a closed-channel error.
    pub fn disarm(&self) {
        self.slot.lock().unwrap().take();
    }
}

/// External control surface of one running session
pub struct Controls {
    cancel_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
    pub question: Rendezvous<String>,
    pub permission: Rendezvous<bool>,
    instructions: StdMutex<Vec<String>>,
}

impl Default for Controls {
    fn default() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);
        Self {
            cancel_tx,
            pause_tx,
            question: Rendezvous::new(),
            permission: Rendezvous::new(),
            instructions: StdMutex::new(Vec::new()),
        }
    }
}

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        // send_replace stores the flag even while no receiver is
        // subscribed; the loop only subscribes while parked.
        self.cancel_tx.send_replace(true);
        // Wake anything parked on a rendezvous so the loop can observe
        // the cancel flag.
        self.question.disarm();
        self.permission.disarm();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Resolves once the session has been cancelled. Used to race the
    /// in-flight LLM call and rendezvous waits.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Controls outlive the loop; an error here means shutdown.
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Park until unpaused. Returns true when the session was cancelled
    /// while waiting.
    pub async fn wait_while_paused(&self) -> bool {
        let mut rx = self.pause_tx.subscribe();
        loop {
            if self.is_cancelled() {
                return true;
            }
            if !*rx.borrow() {
                return false;
            }
            tokio::select! {
                _ = self.cancelled() => return true,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Attach an instruction to be folded into the next LLM request.
    pub fn push_instruction(&self, text: impl Into<String>) {
        self.instructions.lock().unwrap().push(text.into());
    }

    pub fn drain_instructions(&self) -> Vec<String> {
        std::mem::take(&mut *self.instructions.lock().unwrap())
    }
}
