use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use clue_claimer_core::SessionConfig;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::api::{SessionEvent, SessionPhase, StatusSnapshot, StopReason};

const PHASE_RUNNING: u8 = 1;
const PHASE_STOPPING: u8 = 2;
const PHASE_IDLE: u8 = 3;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channels that outlive individual sessions.
pub(crate) struct Hub {
    pub(crate) event_tx: broadcast::Sender<SessionEvent>,
    pub(crate) snapshot_tx: watch::Sender<StatusSnapshot>,
    /// Generation of the newest session; only that session may publish.
    generation: AtomicU64,
}

impl Hub {
    pub(crate) fn new(event_capacity: usize) -> (Self, watch::Receiver<StatusSnapshot>) {
        let (event_tx, _) = broadcast::channel(event_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
        let hub = Self {
            event_tx,
            snapshot_tx,
            generation: AtomicU64::new(0),
        };
        (hub, snapshot_rx)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Claim-limit headroom.
///
/// A slot is reserved before a claim request goes out and either committed
/// (success) or released (failure). `successful <= reserved <= limit` holds
/// at every instant.
#[derive(Debug)]
pub(crate) struct ClaimBudget {
    limit: u32,
    reserved: AtomicU32,
    successful: AtomicU32,
}

impl ClaimBudget {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            limit,
            reserved: AtomicU32::new(0),
            successful: AtomicU32::new(0),
        }
    }

    pub(crate) fn limit(&self) -> u32 {
        self.limit
    }

    pub(crate) fn try_reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                (r < self.limit).then_some(r + 1)
            })
            .is_ok()
    }

    pub(crate) fn release(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1));
    }

    /// Turn a reservation into a counted claim; returns the new total.
    pub(crate) fn commit(&self) -> u32 {
        self.successful.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn successful(&self) -> u32 {
        self.successful.load(Ordering::Acquire)
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.successful() >= self.limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    Poll,
    Claim,
}

/// Last failure per operation kind; a success only clears its own kind.
#[derive(Debug, Default)]
struct ErrorSlots {
    seq: u64,
    poll: Option<(u64, String)>,
    claim: Option<(u64, String)>,
}

impl ErrorSlots {
    fn slot(&mut self, kind: ErrorKind) -> &mut Option<(u64, String)> {
        match kind {
            ErrorKind::Poll => &mut self.poll,
            ErrorKind::Claim => &mut self.claim,
        }
    }

    fn latest(&self) -> &str {
        match (&self.poll, &self.claim) {
            (Some((a, pm)), Some((b, cm))) => {
                if a > b {
                    pm
                } else {
                    cm
                }
            }
            (Some((_, m)), None) | (None, Some((_, m))) => m,
            (None, None) => "",
        }
    }
}

/// State of one session, shared by the poll loop and the claim workers.
pub(crate) struct SessionShared {
    pub(crate) cfg: SessionConfig,
    pub(crate) cancel: CancellationToken,
    pub(crate) budget: ClaimBudget,
    phase: AtomicU8,
    in_flight: AtomicU32,
    errors: Mutex<ErrorSlots>,
    stop_reason: Mutex<Option<StopReason>>,
    generation: u64,
    hub: std::sync::Arc<Hub>,
}

impl SessionShared {
    pub(crate) fn new(cfg: SessionConfig, hub: std::sync::Arc<Hub>) -> Self {
        Self {
            budget: ClaimBudget::new(cfg.claim_limit),
            cfg,
            cancel: CancellationToken::new(),
            phase: AtomicU8::new(PHASE_RUNNING),
            in_flight: AtomicU32::new(0),
            errors: Mutex::new(ErrorSlots::default()),
            stop_reason: Mutex::new(None),
            generation: hub.generation.fetch_add(1, Ordering::AcqRel) + 1,
            hub,
        }
    }

    pub(crate) fn phase(&self) -> SessionPhase {
        match self.phase.load(Ordering::Acquire) {
            PHASE_RUNNING => SessionPhase::Running,
            PHASE_STOPPING => SessionPhase::Stopping,
            _ => SessionPhase::Idle,
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.hub.emit(event);
    }

    fn build_snapshot(&self) -> StatusSnapshot {
        let phase = self.phase();
        StatusSnapshot {
            phase,
            is_active: phase == SessionPhase::Running,
            successful_claims: self.budget.successful(),
            claim_limit: self.budget.limit(),
            in_flight: self.in_flight.load(Ordering::Acquire),
            last_error: lock(&self.errors).latest().to_string(),
        }
    }

    /// Publish the current state. The snapshot is built under the watch
    /// channel's lock so concurrent publishers cannot leave a stale one behind.
    pub(crate) fn publish(&self) {
        self.publish_with(|| {});
    }

    /// Apply `update` and publish, both under the watch lock. A session that
    /// has been superseded by a newer one leaves the snapshot alone.
    fn publish_with(&self, update: impl FnOnce()) {
        self.hub.snapshot_tx.send_if_modified(|snap| {
            update();
            if self.hub.generation.load(Ordering::Acquire) != self.generation {
                return false;
            }
            *snap = self.build_snapshot();
            true
        });
    }

    pub(crate) fn set_error(&self, kind: ErrorKind, message: String) {
        {
            let mut slots = lock(&self.errors);
            slots.seq += 1;
            let seq = slots.seq;
            *slots.slot(kind) = Some((seq, message));
        }
        self.publish();
    }

    pub(crate) fn clear_error(&self, kind: ErrorKind) {
        let cleared = lock(&self.errors).slot(kind).take().is_some();
        if cleared {
            self.publish();
        }
    }

    pub(crate) fn claim_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.publish();
    }

    pub(crate) fn claim_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn stop_reason(&self) -> Option<StopReason> {
        lock(&self.stop_reason).clone()
    }

    /// Running -> Stopping. The first recorded reason wins.
    pub(crate) fn request_stop(&self, reason: StopReason) {
        {
            let mut slot = lock(&self.stop_reason);
            if slot.is_none() {
                *slot = Some(reason.clone());
            }
        }
        if self
            .phase
            .compare_exchange(
                PHASE_RUNNING,
                PHASE_STOPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.cancel.cancel();

        match &reason {
            StopReason::Requested => {
                tracing::info!("stop requested");
                self.emit(SessionEvent::StopRequested);
            }
            StopReason::LimitReached => {
                tracing::info!(limit = self.budget.limit(), "claim limit reached");
                self.emit(SessionEvent::LimitReached);
            }
            StopReason::Fatal { message } => {
                tracing::error!(%message, "session failed");
            }
        }
        self.publish();
    }

    /// Stopping -> Idle, once the poll loop and every worker have exited.
    pub(crate) fn finish(&self) {
        self.cancel.cancel();
        self.publish_with(|| self.phase.store(PHASE_IDLE, Ordering::Release));

        let reason = self.stop_reason().unwrap_or(StopReason::Requested);
        let successful_claims = self.budget.successful();
        tracing::info!(?reason, successful_claims, "session stopped");
        self.emit(SessionEvent::Stopped {
            reason,
            successful_claims,
        });
    }
}
