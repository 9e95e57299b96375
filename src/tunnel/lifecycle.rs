/// Readiness and stop signalling shared by pod tunnels and SSH sessions
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TunnelError};

/// Observable tunnel state
///
/// `Idle → Starting → Ready → Closing → Closed`. A stop or a failure that
/// arrives while `Starting` moves straight to `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Ready,
    Closing,
    Closed,
}

struct Inner {
    state: watch::Sender<LifecycleState>,
    ready: Mutex<Option<oneshot::Sender<Result<()>>>>,
    stop_requested: AtomicBool,
}

/// Coordinates one tunnel from request to close
///
/// Clones share the same state; the task running the tunnel, the interrupt
/// observer and the caller each hold one.
#[derive(Clone)]
pub struct TunnelLifecycle {
    inner: Arc<Inner>,
    stop: CancellationToken,
}

/// Caller side of the readiness signal
pub struct ReadyWaiter {
    rx: oneshot::Receiver<Result<()>>,
}

impl ReadyWaiter {
    /// Wait until the tunnel is ready or has failed
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(TunnelError::Closed))
    }
}

/// Moves the lifecycle to `Closed` when dropped
pub struct CloseGuard {
    lifecycle: TunnelLifecycle,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.lifecycle.finish();
    }
}

impl TunnelLifecycle {
    /// Create a lifecycle in `Idle` together with its readiness waiter
    pub fn new() -> (Self, ReadyWaiter) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (state, _) = watch::channel(LifecycleState::Idle);

        let lifecycle = Self {
            inner: Arc::new(Inner {
                state,
                ready: Mutex::new(Some(ready_tx)),
                stop_requested: AtomicBool::new(false),
            }),
            stop: CancellationToken::new(),
        };

        (lifecycle, ReadyWaiter { rx: ready_rx })
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// `Idle → Starting`
    pub fn begin(&self) {
        let stopping = self.is_stopped();
        self.transition(|state| match state {
            LifecycleState::Idle if stopping => Some(LifecycleState::Closing),
            LifecycleState::Idle => Some(LifecycleState::Starting),
            _ => None,
        });
    }

    /// Announce that every resource needed for I/O is in place
    ///
    /// Returns `false` when a stop was requested first; the waiter then
    /// receives [`TunnelError::Interrupted`] and the caller must unwind
    /// instead of serving traffic.
    pub fn mark_ready(&self) -> bool {
        let stop_requested = &self.inner.stop_requested;
        let mut became_ready = false;

        self.inner.state.send_if_modified(|state| match *state {
            LifecycleState::Idle | LifecycleState::Starting => {
                if stop_requested.load(Ordering::SeqCst) {
                    *state = LifecycleState::Closing;
                } else {
                    *state = LifecycleState::Ready;
                    became_ready = true;
                }
                true
            }
            _ => false,
        });

        if became_ready {
            self.resolve(Ok(()));
        } else {
            self.resolve(Err(TunnelError::Interrupted));
        }
        became_ready
    }

    /// Abort before readiness: the waiter receives `err`
    pub fn fail(&self, err: TunnelError) {
        debug!("Tunnel failed before readiness: {}", err);
        self.transition(|state| match state {
            LifecycleState::Idle | LifecycleState::Starting | LifecycleState::Ready => {
                Some(LifecycleState::Closing)
            }
            _ => None,
        });
        self.resolve(Err(err));
    }

    /// Set the stop signal
    ///
    /// Only the first call has an effect; it returns `true`, every later call
    /// returns `false`.
    pub fn request_stop(&self) -> bool {
        if self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.transition(|state| match state {
            LifecycleState::Starting | LifecycleState::Ready => Some(LifecycleState::Closing),
            _ => None,
        });
        self.stop.cancel();
        true
    }

    /// Whether the stop signal has been set
    pub fn is_stopped(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    /// Resolves once the stop signal is set
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Resolves once the lifecycle reaches `Closed`
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == LifecycleState::Closed).await;
    }

    /// Enter `Closed`; a waiter that was never resolved receives [`TunnelError::Closed`]
    pub fn finish(&self) {
        self.resolve(Err(TunnelError::Closed));
        self.transition(|state| match state {
            LifecycleState::Closed => None,
            _ => Some(LifecycleState::Closed),
        });
    }

    /// Guard that calls [`finish`](Self::finish) on every exit path of the owning task
    pub fn close_on_drop(&self) -> CloseGuard {
        CloseGuard {
            lifecycle: self.clone(),
        }
    }

    fn transition<F>(&self, next: F)
    where
        F: Fn(LifecycleState) -> Option<LifecycleState>,
    {
        self.inner.state.send_if_modified(|state| match next(*state) {
            Some(new_state) => {
                debug!("Tunnel state {:?} -> {:?}", state, new_state);
                *state = new_state;
                true
            }
            None => false,
        });
    }

    fn resolve(&self, outcome: Result<()>) {
        let sender = match self.inner.ready.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}
