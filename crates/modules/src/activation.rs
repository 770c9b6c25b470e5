//! Delegated-activation retry.
//!
//! Some capability calls fail because a downstream execution surface (a
//! remote playback device, say) is not running yet. The pattern here:
//! trigger an out-of-band activation request, wait for the client to
//! signal readiness, then retry the call exactly once. No unbounded
//! retries, no second activation attempt.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// One-shot readiness signal.
///
/// The activation requester resets the gate, the transport-message hook
/// signals it, and the waiter is woken instead of polling on an interval.
#[derive(Debug, Default)]
pub struct ActivationGate {
    ready: AtomicBool,
    notify: Notify,
}

impl ActivationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the surface ready and wake any waiter.
    pub fn signal(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn reset(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Wait until the gate is signaled or the timeout elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking the flag so a concurrent
            // signal() cannot slip between the check and the await.
            let notified = self.notify.notified();
            if self.is_ready() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_ready();
            }
        }
    }
}

/// Timing for one activation round.
#[derive(Debug, Clone, Copy)]
pub struct ActivationPolicy {
    /// How long to wait for the readiness signal.
    pub timeout: Duration,
    /// Settle delay after readiness before retrying.
    pub settle: Duration,
}

impl Default for ActivationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            settle: Duration::from_millis(250),
        }
    }
}

impl From<&murmur_core::module::ModuleTuning> for ActivationPolicy {
    fn from(tuning: &murmur_core::module::ModuleTuning) -> Self {
        Self {
            timeout: Duration::from_millis(tuning.activation_timeout_ms),
            settle: Duration::from_millis(tuning.activation_settle_ms),
        }
    }
}

/// Terminal outcome of an exhausted or failed activation round.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationFailure<E> {
    /// The readiness signal never arrived, or the retried call still
    /// needed activation.
    Exhausted,
    /// The underlying call failed for an unrelated reason.
    Failed(E),
}

/// Run `op`, recovering once from a needs-activation failure.
///
/// `needs_activation` classifies the error; `request_activation` fires the
/// out-of-band startup request (at most once). Any other failure kind is
/// surfaced immediately.
pub async fn run_with_activation<T, E, Op, Fut, Act, ActFut>(
    gate: &ActivationGate,
    policy: &ActivationPolicy,
    needs_activation: impl Fn(&E) -> bool,
    request_activation: Act,
    op: Op,
) -> Result<T, ActivationFailure<E>>
where
    Op: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Act: FnOnce() -> ActFut,
    ActFut: Future<Output = ()>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(e) if needs_activation(&e) => {
            gate.reset();
            request_activation().await;

            if !gate.wait_ready(policy.timeout).await {
                return Err(ActivationFailure::Exhausted);
            }
            tokio::time::sleep(policy.settle).await;

            match op().await {
                Ok(value) => Ok(value),
                Err(e) if needs_activation(&e) => Err(ActivationFailure::Exhausted),
                Err(e) => Err(ActivationFailure::Failed(e)),
            }
        }
        Err(e) => Err(ActivationFailure::Failed(e)),
    }
}
