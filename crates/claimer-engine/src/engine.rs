use std::sync::{Arc, Mutex, PoisonError};

use clue_claimer_core::{Identity, SessionConfig, TaskType};
use tokio::sync::{broadcast, watch};

use crate::api::{
    CommandResponse, LOCAL_FAILURE_ERRNO, LabelsResponse, SessionEvent, SessionPhase, StartError,
    StatusResponse, StatusSnapshot, StopReason, UserInfoResponse,
};
use crate::backend::{QueueError, RemoteQueue, TaskLabels, UserInfo};
use crate::poll::run_poll_loop;
use crate::scheduler::ClaimScheduler;
use crate::state::{ErrorKind, Hub, SessionShared};

/// Owner of the single auto-claim session.
///
/// `start`, `stop` and `status` may be called from any task; at most one
/// session runs at a time. Starting a session spawns onto the current Tokio
/// runtime.
pub struct SessionController {
    queue: Arc<dyn RemoteQueue>,
    hub: Arc<Hub>,
    snapshot_rx: watch::Receiver<StatusSnapshot>,
    current: Mutex<Option<Arc<SessionShared>>>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("status", &*self.snapshot_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create an idle controller over `queue`.
    pub fn new(queue: Arc<dyn RemoteQueue>) -> Self {
        let (hub, snapshot_rx) = Hub::new(1024);
        Self {
            queue,
            hub: Arc::new(hub),
            snapshot_rx,
            current: Mutex::new(None),
        }
    }

    /// Subscribe to the session event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.hub.event_tx.subscribe()
    }

    /// Watch status snapshots as they change.
    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Start a session. Returns as soon as the poll loop is spawned.
    pub fn start(&self, config: SessionConfig) -> Result<(), StartError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = current.as_ref() {
            if session.phase() != SessionPhase::Idle {
                return Err(StartError::AlreadyRunning);
            }
        }
        config.validate()?;

        let claim_limit = config.claim_limit;
        tracing::info!(
            task_type = %config.task_type,
            claim_limit,
            concurrency = config.concurrency,
            interval = ?config.poll_interval,
            max_pages = config.max_pages,
            "starting auto-claim session"
        );
        let session = Arc::new(SessionShared::new(config, self.hub.clone()));
        session.publish();
        *current = Some(session.clone());
        drop(current);

        self.hub.emit(SessionEvent::Started { claim_limit });
        tokio::spawn(supervise_session(session, self.queue.clone()));
        Ok(())
    }

    /// Raise the cancellation signal of the running session, if any.
    ///
    /// Returns `true` if a running session was signalled. Does not wait for
    /// in-flight claims to complete.
    pub fn stop(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(session) if session.phase() == SessionPhase::Running => {
                session.request_stop(StopReason::Requested);
                true
            }
            _ => false,
        }
    }

    /// Latest status snapshot. Never waits on the poll loop.
    pub fn status(&self) -> StatusSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Resolve once no session is running or draining.
    pub async fn wait_idle(&self) {
        let mut rx = self.snapshot_rx.clone();
        let _ = rx.wait_for(|s| s.phase == SessionPhase::Idle).await;
    }

    /// `StartAutoClaiming`: start a session and report the outcome as a message.
    pub fn start_auto_claiming(&self, config: SessionConfig) -> CommandResponse {
        match self.start(config) {
            Ok(()) => CommandResponse {
                success: true,
                message: "auto-claiming started".to_string(),
            },
            Err(err) => {
                tracing::warn!(error = %err, "start rejected");
                CommandResponse {
                    success: false,
                    message: format!("failed to start auto-claiming: {err}"),
                }
            }
        }
    }

    /// `StopAutoClaiming`: idempotent; succeeds whether or not a session runs.
    pub fn stop_auto_claiming(&self) -> CommandResponse {
        let message = if self.stop() {
            "auto-claiming is stopping"
        } else {
            "no auto-claim session is running"
        };
        CommandResponse {
            success: true,
            message: message.to_string(),
        }
    }

    /// `GetAutoClaimStatus`.
    pub fn auto_claim_status(&self) -> StatusResponse {
        StatusResponse::from(&*self.snapshot_rx.borrow())
    }

    /// `GetTaskLabels`: filter taxonomy used to resolve human selections to ids.
    pub async fn task_labels(&self, task_type: TaskType, identity: &Identity) -> LabelsResponse {
        match self.queue.task_labels(task_type, identity).await {
            Ok(data) => LabelsResponse {
                errno: 0,
                errmsg: String::new(),
                data,
            },
            Err(err) => LabelsResponse {
                errno: errno_of(&err),
                errmsg: err.to_string(),
                data: TaskLabels::default(),
            },
        }
    }

    /// `GetUserInfo`: identity display only.
    pub async fn user_info(&self, identity: &Identity) -> UserInfoResponse {
        match self.queue.user_info(identity).await {
            Ok(data) => UserInfoResponse {
                errno: 0,
                errmsg: String::new(),
                data,
            },
            Err(err) => UserInfoResponse {
                errno: errno_of(&err),
                errmsg: err.to_string(),
                data: UserInfo::default(),
            },
        }
    }
}

fn errno_of(err: &QueueError) -> i64 {
    match err {
        QueueError::Unauthorized(_) => 401,
        _ => LOCAL_FAILURE_ERRNO,
    }
}

/// Run the session on its own task so that a panic in the poll loop or the
/// scheduler still ends the session instead of leaving it `Running`.
async fn supervise_session(session: Arc<SessionShared>, queue: Arc<dyn RemoteQueue>) {
    let task = tokio::spawn(run_session(session.clone(), queue));
    if let Err(err) = task.await {
        let message = format!("session task failed: {err}");
        tracing::error!(error = %err, "session task aborted");
        session.set_error(ErrorKind::Poll, message.clone());
        session.request_stop(StopReason::Fatal { message });
        session.finish();
    }
}

async fn run_session(session: Arc<SessionShared>, queue: Arc<dyn RemoteQueue>) {
    let mut scheduler = ClaimScheduler::spawn(session.clone(), queue.clone());

    let reason = run_poll_loop(&session, &*queue, &mut scheduler).await;
    session.request_stop(reason);

    scheduler.shutdown().await;
    session.finish();
}
