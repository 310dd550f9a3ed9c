use std::collections::HashSet;
use std::sync::{Arc, PoisonError};

use clue_claimer_core::{Clue, ItemId};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::api::{ClaimOutcome, SessionEvent, StopReason};
use crate::backend::{QueueError, RemoteQueue};
use crate::state::{ErrorKind, SessionShared};

#[derive(Debug)]
struct ClaimJob {
    item: Clue,
}

/// What happened to a submitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submitted {
    /// Queued for a worker; a claim slot is reserved for it.
    Queued,
    /// Already submitted earlier in this session.
    Duplicate,
    /// Every remaining claim slot is taken by queued or in-flight attempts.
    NoHeadroom,
    /// The session is cancelled; the item was dropped.
    Cancelled,
}

/// Ids queued or being claimed right now.
type Pending = Arc<std::sync::Mutex<HashSet<ItemId>>>;

fn pending_remove(pending: &Pending, id: ItemId) {
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

/// Bounded pool of claim workers.
///
/// The queue holds at most `concurrency` pending jobs; `submit` waits for
/// space, which is what throttles the poll loop when claims lag behind.
///
/// Submitted ids are remembered so an item is attempted once while it stays
/// listed. After a cycle that walked the whole queue, ids that were not
/// listed and are not pending are forgotten, which keeps the set bounded by
/// the queue size.
pub(crate) struct ClaimScheduler {
    session: Arc<SessionShared>,
    tx: Option<mpsc::Sender<ClaimJob>>,
    submitted: HashSet<ItemId>,
    listed: HashSet<ItemId>,
    pending: Pending,
    workers: JoinSet<()>,
}

impl ClaimScheduler {
    pub(crate) fn spawn(session: Arc<SessionShared>, queue: Arc<dyn RemoteQueue>) -> Self {
        let concurrency = session.cfg.concurrency.max(1);
        let (tx, rx) = mpsc::channel::<ClaimJob>(concurrency);
        let rx = Arc::new(Mutex::new(rx));
        let pending = Pending::default();

        let mut workers = JoinSet::new();
        for worker_idx in 0..concurrency {
            let rx = rx.clone();
            let queue = queue.clone();
            let session = session.clone();
            let pending = pending.clone();
            workers.spawn(run_claim_worker(worker_idx, rx, queue, session, pending));
        }

        Self {
            session,
            tx: Some(tx),
            submitted: HashSet::new(),
            listed: HashSet::new(),
            pending,
            workers,
        }
    }

    pub(crate) fn begin_cycle(&mut self) {
        self.listed.clear();
    }

    pub(crate) fn note_listed(&mut self, id: ItemId) {
        self.listed.insert(id);
    }

    /// Forget submitted ids missing from a complete walk of the queue.
    pub(crate) fn forget_unlisted(&mut self) {
        let before = self.submitted.len();
        {
            let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let listed = &self.listed;
            self.submitted
                .retain(|id| listed.contains(id) || pending.contains(id));
        }
        let forgotten = before - self.submitted.len();
        if forgotten > 0 {
            tracing::debug!(
                forgotten,
                remembered = self.submitted.len(),
                "forgot unlisted items"
            );
        }
    }

    pub(crate) async fn submit(&mut self, item: Clue) -> Submitted {
        let cancel = &self.session.cancel;
        if cancel.is_cancelled() {
            return Submitted::Cancelled;
        }
        let Some(tx) = self.tx.as_ref() else {
            return Submitted::Cancelled;
        };
        if self.submitted.contains(&item.id) {
            return Submitted::Duplicate;
        }
        if !self.session.budget.try_reserve() {
            return Submitted::NoHeadroom;
        }
        self.submitted.insert(item.id);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item.id);

        let item_id = item.id;
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            res = tx.send(ClaimJob { item }) => res.is_ok(),
        };
        if !sent {
            self.session.budget.release();
            pending_remove(&self.pending, item_id);
            return Submitted::Cancelled;
        }
        tracing::debug!(item_id, "queued claim");
        Submitted::Queued
    }

    /// Close the queue and wait for every worker to finish its current attempt.
    /// Jobs still queued are dropped once the session is cancelled.
    pub(crate) async fn shutdown(mut self) {
        self.tx = None;
        while let Some(res) = self.workers.join_next().await {
            if let Err(err) = res {
                tracing::warn!(error = %err, "claim worker task join error");
            }
        }
    }
}

async fn run_claim_worker(
    worker_idx: usize,
    rx: Arc<Mutex<mpsc::Receiver<ClaimJob>>>,
    queue: Arc<dyn RemoteQueue>,
    session: Arc<SessionShared>,
    pending: Pending,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };

        let item_id = job.item.id;
        if session.cancel.is_cancelled() {
            session.budget.release();
        } else {
            run_claim(worker_idx, &*queue, &session, job.item).await;
        }
        pending_remove(&pending, item_id);
    }
}

async fn run_claim(worker_idx: usize, queue: &dyn RemoteQueue, session: &SessionShared, item: Clue) {
    let cfg = &session.cfg;
    session.claim_started();
    let res = queue
        .claim_item(cfg.task_type, item.id, &cfg.identity, &session.cancel)
        .await;
    session.claim_finished();

    let outcome = match res {
        Ok(()) => {
            let total = session.budget.commit();
            session.clear_error(ErrorKind::Claim);
            session.publish();
            tracing::info!(
                worker_idx,
                item_id = item.id,
                brief = %item.brief,
                total,
                limit = session.budget.limit(),
                "claimed item"
            );
            if total >= session.budget.limit() {
                session.request_stop(StopReason::LimitReached);
            }
            ClaimOutcome {
                item_id: item.id,
                success: true,
                error: None,
            }
        }
        Err(QueueError::Cancelled) => {
            session.budget.release();
            session.publish();
            tracing::debug!(worker_idx, item_id = item.id, "claim abandoned on stop");
            ClaimOutcome {
                item_id: item.id,
                success: false,
                error: Some(QueueError::Cancelled.to_string()),
            }
        }
        Err(err) => {
            session.budget.release();
            let message = format!("claim of item {} failed: {err}", item.id);
            tracing::warn!(worker_idx, item_id = item.id, error = %err, "claim failed");
            session.set_error(ErrorKind::Claim, message.clone());
            if err.is_fatal() {
                session.request_stop(StopReason::Fatal {
                    message: message.clone(),
                });
            }
            ClaimOutcome {
                item_id: item.id,
                success: false,
                error: Some(message),
            }
        }
    };

    session.emit(SessionEvent::ClaimFinished {
        outcome,
        successful_claims: session.budget.successful(),
    });
}
