use clue_claimer_core::{ClueFilter, matches};

use crate::api::{SessionEvent, StopReason};
use crate::backend::{ListQuery, QueueError, RemoteQueue};
use crate::scheduler::{ClaimScheduler, Submitted};
use crate::state::{ErrorKind, SessionShared};

/// Failed list cycles in a row (each after in-client retries) that end the session.
pub(crate) const MAX_CONSECUTIVE_LIST_FAILURES: u32 = 5;

enum CycleEnd {
    /// Page cap hit or no claim headroom left; `walked_queue` is set when the
    /// cycle reached the end of the queue instead.
    Completed { walked_queue: bool },
    Cancelled,
    ListFailed(QueueError),
}

/// Drive the session: page through the queue once per interval, feed matches
/// to the scheduler, and return once the session must end.
pub(crate) async fn run_poll_loop(
    session: &SessionShared,
    queue: &dyn RemoteQueue,
    scheduler: &mut ClaimScheduler,
) -> StopReason {
    let filter = ClueFilter::from_config(&session.cfg);
    let mut cycle: u64 = 0;
    let mut consecutive_failures: u32 = 0;

    loop {
        if session.cancel.is_cancelled() {
            return session.stop_reason().unwrap_or(StopReason::Requested);
        }
        if session.budget.is_exhausted() {
            return StopReason::LimitReached;
        }

        cycle += 1;
        match run_cycle(session, queue, scheduler, &filter, cycle).await {
            CycleEnd::Completed { walked_queue } => {
                consecutive_failures = 0;
                if walked_queue {
                    scheduler.forget_unlisted();
                }
            }
            CycleEnd::Cancelled => continue,
            CycleEnd::ListFailed(err) => {
                if err.is_fatal() {
                    return StopReason::Fatal {
                        message: format!("listing items failed: {err}"),
                    };
                }
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_LIST_FAILURES {
                    return StopReason::Fatal {
                        message: format!(
                            "giving up after {consecutive_failures} consecutive list failures: {err}"
                        ),
                    };
                }
            }
        }

        tokio::select! {
            _ = session.cancel.cancelled() => {}
            _ = tokio::time::sleep(session.cfg.poll_interval) => {}
        }
    }
}

async fn run_cycle(
    session: &SessionShared,
    queue: &dyn RemoteQueue,
    scheduler: &mut ClaimScheduler,
    filter: &ClueFilter,
    cycle: u64,
) -> CycleEnd {
    let cfg = &session.cfg;
    let mut page: u32 = 1;
    scheduler.begin_cycle();

    loop {
        if session.cancel.is_cancelled() {
            return CycleEnd::Cancelled;
        }
        if cfg.max_pages != 0 && page > cfg.max_pages {
            return CycleEnd::Completed {
                walked_queue: false,
            };
        }

        let query = ListQuery {
            task_type: cfg.task_type,
            filter_ids: cfg.filter_ids,
            page,
        };
        let fetched = match queue.list_items(&query, &cfg.identity, &session.cancel).await {
            Ok(p) => p,
            Err(QueueError::Cancelled) => return CycleEnd::Cancelled,
            Err(err) => {
                let message = format!("listing page {page} failed: {err}");
                tracing::warn!(cycle, page, error = %err, "list failed");
                session.set_error(ErrorKind::Poll, message.clone());
                session.emit(SessionEvent::PollFailed { message });
                return CycleEnd::ListFailed(err);
            }
        };
        session.clear_error(ErrorKind::Poll);

        let total_items = fetched.items.len();
        if total_items == 0 {
            tracing::debug!(cycle, page, "queue page empty");
            session.emit(SessionEvent::PageFetched {
                cycle,
                page,
                items: 0,
                matched: 0,
            });
            return CycleEnd::Completed { walked_queue: true };
        }

        for item in &fetched.items {
            scheduler.note_listed(item.id);
        }
        let mut matched = 0;
        let mut end = None;
        for item in fetched.items {
            if !matches(&item, filter) {
                continue;
            }
            matched += 1;
            match scheduler.submit(item).await {
                Submitted::Queued | Submitted::Duplicate => {}
                Submitted::NoHeadroom => {
                    end = Some(CycleEnd::Completed {
                        walked_queue: false,
                    });
                    break;
                }
                Submitted::Cancelled => {
                    end = Some(CycleEnd::Cancelled);
                    break;
                }
            }
        }

        tracing::debug!(cycle, page, items = total_items, matched, "page filtered");
        session.emit(SessionEvent::PageFetched {
            cycle,
            page,
            items: total_items,
            matched,
        });

        if let Some(end) = end {
            return end;
        }
        if !fetched.has_more {
            return CycleEnd::Completed { walked_queue: true };
        }
        page += 1;
    }
}
