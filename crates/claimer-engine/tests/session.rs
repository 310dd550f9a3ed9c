#![allow(unused_crate_dependencies)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clue_claimer_core::{Clue, Identity, ItemId, SessionConfig, TaskType};
use clue_claimer_engine::{
    ItemPage, ListQuery, QueueError, RemoteQueue, SessionController, SessionEvent, SessionPhase,
    StartError, StopReason, TaskLabels, UserInfo,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const PAGE_SIZE: usize = 4;

/// In-memory queue: items are listed in pages of `PAGE_SIZE`, successful
/// claims disappear from later listings.
#[derive(Default)]
struct FakeQueue {
    items: Mutex<Vec<Clue>>,
    reject: HashSet<ItemId>,
    hidden: Mutex<HashSet<ItemId>>,
    panic_on_list: bool,
    claim_delay: Duration,
    list_error: Option<QueueError>,
    claim_error: Option<QueueError>,
    list_calls: AtomicUsize,
    claim_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    claimed: Mutex<Vec<ItemId>>,
}

fn clue(id: ItemId, brief: &str) -> Clue {
    Clue {
        id,
        task_id: id,
        clue_id: id,
        brief: brief.to_string(),
        subject_name: String::new(),
        step_name: String::new(),
        clue_type_name: String::new(),
        dispatch_time: None,
    }
}

impl FakeQueue {
    fn with_items(n: u64) -> Self {
        Self {
            items: Mutex::new((1..=n).map(|id| clue(id, "练习题")).collect()),
            claim_delay: Duration::from_millis(50),
            ..Self::default()
        }
    }

    fn claimed(&self) -> Vec<ItemId> {
        self.claimed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteQueue for FakeQueue {
    async fn list_items(
        &self,
        query: &ListQuery,
        _identity: &Identity,
        _cancel: &CancellationToken,
    ) -> Result<ItemPage, QueueError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_list {
            panic!("list handler blew up");
        }
        if let Some(err) = &self.list_error {
            return Err(err.clone());
        }
        let hidden = self.hidden.lock().unwrap().clone();
        let items: Vec<Clue> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !hidden.contains(&c.id))
            .cloned()
            .collect();
        let start = (query.page as usize - 1) * PAGE_SIZE;
        let page: Vec<Clue> = items.iter().skip(start).take(PAGE_SIZE).cloned().collect();
        Ok(ItemPage {
            has_more: start + page.len() < items.len(),
            total: items.len() as u64,
            items: page,
        })
    }

    async fn claim_item(
        &self,
        _task_type: TaskType,
        item_id: ItemId,
        _identity: &Identity,
        _cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.claim_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = &self.claim_error {
            return Err(err.clone());
        }
        if self.reject.contains(&item_id) {
            return Err(QueueError::Rejected(format!("item {item_id} already taken")));
        }
        self.items.lock().unwrap().retain(|c| c.id != item_id);
        self.claimed.lock().unwrap().push(item_id);
        Ok(())
    }

    async fn task_labels(
        &self,
        _task_type: TaskType,
        _identity: &Identity,
    ) -> Result<TaskLabels, QueueError> {
        Ok(TaskLabels::default())
    }

    async fn user_info(&self, _identity: &Identity) -> Result<UserInfo, QueueError> {
        Err(QueueError::Unauthorized("errno 110: 用户未登录".into()))
    }
}

fn config(limit: u32, concurrency: usize) -> SessionConfig {
    let mut cfg = SessionConfig::new(TaskType::Audit, Identity::new("BDUSS=test"));
    cfg.claim_limit = limit;
    cfg.concurrency = concurrency;
    cfg.poll_interval = Duration::from_millis(100);
    cfg
}

async fn stopped_reason(events: &mut broadcast::Receiver<SessionEvent>) -> StopReason {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Stopped { reason, .. }) => return reason,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
        }
    }
}

async fn first_page_fetched(events: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        if let Ok(SessionEvent::PageFetched { .. }) = events.recv().await {
            return;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn reaches_limit_exactly_and_goes_idle() {
    let queue = Arc::new(FakeQueue::with_items(10));
    let ctrl = SessionController::new(queue.clone());
    let mut events = ctrl.subscribe();

    ctrl.start(config(3, 5)).unwrap();
    assert!(ctrl.status().is_active);

    let reason = stopped_reason(&mut events).await;
    assert_eq!(reason, StopReason::LimitReached);

    let status = ctrl.status();
    assert_eq!(status.phase, SessionPhase::Idle);
    assert!(!status.is_active);
    assert_eq!(status.successful_claims, 3);
    assert_eq!(queue.claimed().len(), 3);
    assert_eq!(queue.claim_calls.load(Ordering::SeqCst), 3);
    assert!(queue.max_in_flight.load(Ordering::SeqCst) <= 5);
}

#[tokio::test(start_paused = true)]
async fn counter_stays_within_limit_when_claims_race_and_fail() {
    let mut queue = FakeQueue::with_items(40);
    queue.reject = (1..=40).filter(|id| id % 3 == 0).collect();
    let queue = Arc::new(queue);
    let ctrl = SessionController::new(queue.clone());
    let mut watch = ctrl.watch_status();

    ctrl.start(config(7, 8)).unwrap();

    let mut max_seen = 0;
    loop {
        let snap = watch.borrow_and_update().clone();
        assert!(snap.successful_claims <= 7);
        assert!(snap.in_flight <= 8);
        max_seen = max_seen.max(snap.successful_claims);
        if snap.phase == SessionPhase::Idle {
            break;
        }
        watch.changed().await.unwrap();
    }

    assert_eq!(max_seen, 7);
    assert_eq!(queue.claimed().len(), 7);
    assert!(queue.max_in_flight.load(Ordering::SeqCst) <= 8);
}

#[tokio::test(start_paused = true)]
async fn concurrency_ceiling_is_respected() {
    let queue = Arc::new(FakeQueue::with_items(12));
    let ctrl = SessionController::new(queue.clone());

    ctrl.start(config(12, 1)).unwrap();
    ctrl.wait_idle().await;

    assert_eq!(ctrl.status().successful_claims, 12);
    assert_eq!(queue.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn start_while_running_is_rejected_without_side_effects() {
    let queue = Arc::new(FakeQueue::with_items(3));
    let ctrl = SessionController::new(queue.clone());
    let mut events = ctrl.subscribe();

    let mut cfg = config(10, 2);
    cfg.poll_interval = Duration::from_secs(3600);
    ctrl.start(cfg.clone()).unwrap();
    first_page_fetched(&mut events).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let before = ctrl.status();
    assert_eq!(before.successful_claims, 3);
    assert_eq!(ctrl.start(cfg.clone()), Err(StartError::AlreadyRunning));

    let resp = ctrl.start_auto_claiming(cfg);
    assert!(!resp.success);
    assert_eq!(ctrl.status(), before);

    ctrl.stop();
    ctrl.wait_idle().await;
}

#[tokio::test]
async fn invalid_config_never_enters_running() {
    let ctrl = SessionController::new(Arc::new(FakeQueue::default()));
    let err = ctrl.start(config(0, 1)).unwrap_err();
    match err {
        StartError::InvalidConfig(e) => assert_eq!(e.field, "claim_limit"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(ctrl.status().phase, SessionPhase::Idle);

    let resp = ctrl.start_auto_claiming(config(1, 0));
    assert!(!resp.success);
    assert!(resp.message.contains("concurrency"));
}

#[tokio::test]
async fn stop_when_idle_is_idempotent_success() {
    let ctrl = SessionController::new(Arc::new(FakeQueue::default()));
    assert!(!ctrl.stop());
    assert!(ctrl.stop_auto_claiming().success);
    assert!(ctrl.stop_auto_claiming().success);

    let status = ctrl.auto_claim_status();
    assert!(status.success);
    assert!(!status.is_active);
    assert_eq!(status.successful_claims, 0);
    assert_eq!(status.last_error, "");
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_the_interval_sleep() {
    let queue = Arc::new(FakeQueue::default());
    let ctrl = SessionController::new(queue.clone());
    let mut events = ctrl.subscribe();

    let mut cfg = config(5, 2);
    cfg.poll_interval = Duration::from_secs(3600);
    ctrl.start(cfg).unwrap();
    first_page_fetched(&mut events).await;

    let resp = ctrl.stop_auto_claiming();
    assert!(resp.success);
    assert_eq!(ctrl.status().phase, SessionPhase::Stopping);

    tokio::time::timeout(Duration::from_secs(5), ctrl.wait_idle())
        .await
        .expect("loop should observe cancellation during its sleep");
    assert_eq!(stopped_reason(&mut events).await, StopReason::Requested);
    assert_eq!(queue.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_credential_ends_the_session() {
    let queue = Arc::new(FakeQueue {
        list_error: Some(QueueError::Unauthorized("http 401".into())),
        ..FakeQueue::default()
    });
    let ctrl = SessionController::new(queue.clone());
    let mut events = ctrl.subscribe();

    ctrl.start(config(5, 2)).unwrap();
    let reason = stopped_reason(&mut events).await;

    assert!(matches!(reason, StopReason::Fatal { .. }));
    assert_eq!(queue.list_calls.load(Ordering::SeqCst), 1);
    let status = ctrl.auto_claim_status();
    assert!(!status.is_active);
    assert!(status.last_error.contains("authentication rejected"));
}

#[tokio::test(start_paused = true)]
async fn repeated_list_failures_end_the_session() {
    let queue = Arc::new(FakeQueue {
        list_error: Some(QueueError::Transient("connection reset".into())),
        ..FakeQueue::default()
    });
    let ctrl = SessionController::new(queue.clone());
    let mut events = ctrl.subscribe();

    ctrl.start(config(5, 2)).unwrap();
    let reason = stopped_reason(&mut events).await;

    match reason {
        StopReason::Fatal { message } => assert!(message.contains("consecutive")),
        other => panic!("unexpected reason: {other:?}"),
    }
    assert_eq!(queue.list_calls.load(Ordering::SeqCst), 5);
    assert!(ctrl.status().last_error.contains("connection reset"));
}

#[tokio::test(start_paused = true)]
async fn unauthorized_claim_is_fatal() {
    let queue = Arc::new(FakeQueue {
        claim_error: Some(QueueError::Unauthorized("http 403".into())),
        ..FakeQueue::with_items(5)
    });
    let ctrl = SessionController::new(queue.clone());
    let mut events = ctrl.subscribe();

    ctrl.start(config(5, 1)).unwrap();
    let reason = stopped_reason(&mut events).await;

    assert!(matches!(reason, StopReason::Fatal { .. }));
    assert_eq!(ctrl.status().successful_claims, 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_items_are_not_retried() {
    let mut queue = FakeQueue::with_items(6);
    queue.reject = (1..=6).collect();
    let queue = Arc::new(queue);
    let ctrl = SessionController::new(queue.clone());

    ctrl.start(config(3, 3)).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let status = ctrl.status();
    assert!(status.is_active);
    assert_eq!(status.successful_claims, 0);
    assert!(status.last_error.contains("already taken"));
    assert_eq!(queue.claim_calls.load(Ordering::SeqCst), 6);
    assert!(queue.list_calls.load(Ordering::SeqCst) > 6);

    ctrl.stop();
    ctrl.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn page_cap_limits_each_cycle() {
    let mut queue = FakeQueue::with_items(20);
    queue.reject = (1..=20).collect();
    let queue = Arc::new(queue);
    let ctrl = SessionController::new(queue.clone());
    let mut events = ctrl.subscribe();

    let mut cfg = config(1, 1);
    cfg.poll_interval = Duration::from_secs(3600);
    cfg.max_pages = 2;
    cfg.exclude_keywords = vec!["练习".to_string()];
    ctrl.start(cfg).unwrap();

    first_page_fetched(&mut events).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(queue.list_calls.load(Ordering::SeqCst), 2);
    assert_eq!(queue.claim_calls.load(Ordering::SeqCst), 0);

    ctrl.stop();
    ctrl.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn unbounded_paging_walks_every_page() {
    let queue = Arc::new(FakeQueue::with_items(10));
    let ctrl = SessionController::new(queue.clone());

    let mut cfg = config(10, 4);
    cfg.poll_interval = Duration::from_secs(3600);
    cfg.include_keywords = vec!["不存在".to_string()];
    ctrl.start(cfg).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(queue.list_calls.load(Ordering::SeqCst), 3);

    ctrl.stop();
    ctrl.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn only_matching_items_are_claimed() {
    let queue = Arc::new(FakeQueue {
        items: Mutex::new(vec![
            clue(1, "二次函数练习"),
            clue(2, "立体几何"),
            clue(3, "平面几何与函数"),
            clue(4, "解析几何"),
        ]),
        claim_delay: Duration::from_millis(10),
        ..FakeQueue::default()
    });
    let ctrl = SessionController::new(queue.clone());

    let mut cfg = config(10, 2);
    cfg.include_keywords = vec!["几何".to_string()];
    cfg.exclude_keywords = vec!["函数".to_string()];
    ctrl.start(cfg).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let mut claimed = queue.claimed();
    claimed.sort_unstable();
    assert_eq!(claimed, vec![2, 4]);

    ctrl.stop();
    ctrl.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn a_new_session_can_start_after_the_previous_one_ends() {
    let queue = Arc::new(FakeQueue::with_items(4));
    let ctrl = SessionController::new(queue.clone());

    ctrl.start(config(2, 2)).unwrap();
    ctrl.wait_idle().await;
    assert_eq!(ctrl.status().successful_claims, 2);

    ctrl.start(config(2, 2)).unwrap();
    assert_eq!(ctrl.status().successful_claims, 0);
    ctrl.wait_idle().await;
    assert_eq!(ctrl.status().successful_claims, 2);
    assert_eq!(queue.claimed().len(), 4);
}

#[tokio::test]
async fn identity_lookup_maps_errors_to_errno() {
    let ctrl = SessionController::new(Arc::new(FakeQueue::default()));
    let resp = ctrl.user_info(&Identity::new("x")).await;
    assert_eq!(resp.errno, 401);
    assert!(resp.errmsg.contains("用户未登录"));

    let labels = ctrl.task_labels(TaskType::Produce, &Identity::new("x")).await;
    assert_eq!(labels.errno, 0);
    assert!(labels.data.filter.is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_claim_queue_stalls_the_poll_loop() {
    let queue = Arc::new(FakeQueue {
        claim_delay: Duration::from_secs(10),
        ..FakeQueue::with_items(10)
    });
    let ctrl = SessionController::new(queue.clone());
    let mut events = ctrl.subscribe();

    ctrl.start(config(10, 1)).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    // One claim in flight, one queued, the poll loop waiting on the third.
    assert_eq!(queue.list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.claim_calls.load(Ordering::SeqCst), 1);
    let status = ctrl.status();
    assert_eq!(status.in_flight, 1);
    assert_eq!(status.successful_claims, 0);

    assert!(ctrl.stop());
    ctrl.wait_idle().await;

    assert_eq!(stopped_reason(&mut events).await, StopReason::Requested);
    assert_eq!(ctrl.status().successful_claims, 1);
    assert_eq!(queue.claimed(), vec![1]);
    assert_eq!(queue.claim_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn oversized_concurrency_is_rejected() {
    let ctrl = SessionController::new(Arc::new(FakeQueue::with_items(2)));

    match ctrl.start(config(1, usize::MAX)) {
        Err(StartError::InvalidConfig(e)) => assert_eq!(e.field, "concurrency"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(ctrl.status().phase, SessionPhase::Idle);

    ctrl.start(config(1, SessionConfig::MAX_CONCURRENCY)).unwrap();
    ctrl.wait_idle().await;
    assert_eq!(ctrl.status().successful_claims, 1);
}

#[tokio::test(start_paused = true)]
async fn panicking_session_task_still_goes_idle() {
    let ctrl = SessionController::new(Arc::new(FakeQueue {
        panic_on_list: true,
        ..FakeQueue::default()
    }));
    let mut events = ctrl.subscribe();

    ctrl.start(config(1, 1)).unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), stopped_reason(&mut events))
        .await
        .expect("session should end after its task panics");

    assert!(matches!(reason, StopReason::Fatal { .. }));
    let status = ctrl.status();
    assert_eq!(status.phase, SessionPhase::Idle);
    assert!(status.last_error.contains("session task failed"));

    ctrl.start(config(1, 1)).unwrap();
    ctrl.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn items_that_leave_the_queue_are_forgotten() {
    let mut queue = FakeQueue::with_items(1);
    queue.reject = HashSet::from([1]);
    let queue = Arc::new(queue);
    let ctrl = SessionController::new(queue.clone());

    ctrl.start(config(3, 3)).unwrap();

    // Cycles at 0ms and 100ms: attempted once, then remembered.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(queue.claim_calls.load(Ordering::SeqCst), 1);

    // Cycle at 200ms walks an empty queue.
    queue.hidden.lock().unwrap().insert(1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.claim_calls.load(Ordering::SeqCst), 1);

    // Relisted at 300ms: a fresh dispatch, attempted again.
    queue.hidden.lock().unwrap().clear();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.claim_calls.load(Ordering::SeqCst), 2);

    ctrl.stop();
    ctrl.wait_idle().await;
}
