use std::time::Duration;

use async_trait::async_trait;
use clue_claimer_core::{Clue, FilterIds, Identity, ItemId, TaskType, parse_timestamp};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::retry::{CancelMode, RetryPolicy, with_retry};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Failure of a remote queue call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Network failure, timeout or overloaded server; retried inside the client.
    #[error("network error: {0}")]
    Transient(String),
    /// The credential was refused. Ends the session.
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    /// The service refused the request (item already taken, bad request, ...).
    #[error("rejected by remote service: {0}")]
    Rejected(String),
    /// The response could not be understood.
    #[error("unexpected response: {0}")]
    Protocol(String),
    /// The session was cancelled before the call completed.
    #[error("request cancelled")]
    Cancelled,
}

impl QueueError {
    /// Whether the call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }

    /// Whether the failure invalidates the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Unauthorized(_))
    }
}

/// One page request of the list endpoint. The page cursor is owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    /// Queue to list.
    pub task_type: TaskType,
    /// Numeric filters applied by the service.
    pub filter_ids: FilterIds,
    /// 1-based page number.
    pub page: u32,
}

/// A page of items returned by [`RemoteQueue::list_items`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPage {
    /// Items on this page.
    pub items: Vec<Clue>,
    /// Whether a following page exists.
    pub has_more: bool,
    /// Total number of items reported by the service.
    pub total: u64,
}

/// A selectable value inside a label group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelOption {
    /// Numeric filter id.
    pub id: i64,
    /// Human-facing label.
    pub name: String,
}

/// A label group (`step`, `subject`, `clueType`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelGroup {
    /// Group identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Group kind as reported by the service.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Selectable values.
    #[serde(default)]
    pub list: Vec<LabelOption>,
}

/// Filter taxonomy of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLabels {
    /// Label groups.
    #[serde(default)]
    pub filter: Vec<LabelGroup>,
}

impl TaskLabels {
    /// Group id of the grade filter.
    pub const STEP: &'static str = "step";
    /// Group id of the subject filter.
    pub const SUBJECT: &'static str = "subject";
    /// Group id of the clue type filter.
    pub const CLUE_TYPE: &'static str = "clueType";

    /// Look up a group by id.
    pub fn group(&self, id: &str) -> Option<&LabelGroup> {
        self.filter.iter().find(|g| g.id == id)
    }

    /// Resolve a human selection (label name or numeric id) to a filter id.
    pub fn resolve(&self, group: &str, selector: &str) -> Option<u32> {
        let selector = selector.trim();
        if let Ok(id) = selector.parse::<u32>() {
            return Some(id);
        }
        let group = self.group(group)?;
        let found = group
            .list
            .iter()
            .find(|o| o.name == selector)
            .or_else(|| {
                let lower = selector.to_lowercase();
                group.list.iter().find(|o| o.name.to_lowercase() == lower)
            })?;
        u32::try_from(found.id).ok()
    }
}

/// Account details of the credential holder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Display name.
    #[serde(rename = "userName", default)]
    pub user_name: String,
    /// Avatar URL.
    #[serde(default)]
    pub avatar: String,
    /// Role names granted to the account.
    #[serde(rename = "roleNames", default)]
    pub role_names: Vec<String>,
}

/// The remote work queue. Implementations hold no per-session state.
#[async_trait]
pub trait RemoteQueue: Send + Sync {
    /// Fetch one page of items. Abandoned when `cancel` fires.
    async fn list_items(
        &self,
        query: &ListQuery,
        identity: &Identity,
        cancel: &CancellationToken,
    ) -> Result<ItemPage, QueueError>;

    /// Claim one item. An in-flight request is allowed to finish after
    /// `cancel` fires, but is not retried.
    async fn claim_item(
        &self,
        task_type: TaskType,
        item_id: ItemId,
        identity: &Identity,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError>;

    /// Fetch the filter taxonomy of a queue.
    async fn task_labels(
        &self,
        task_type: TaskType,
        identity: &Identity,
    ) -> Result<TaskLabels, QueueError>;

    /// Fetch account details for `identity`.
    async fn user_info(&self, identity: &Identity) -> Result<UserInfo, QueueError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    errno: i64,
    #[serde(default)]
    errmsg: String,
    data: Option<T>,
}

fn is_auth_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("登录") || lower.contains("login") || lower.contains("unauthorized")
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, QueueError> {
        if self.errno != 0 {
            let msg = format!("errno {}: {}", self.errno, self.errmsg);
            if is_auth_message(&self.errmsg) {
                return Err(QueueError::Unauthorized(msg));
            }
            return Err(QueueError::Rejected(msg));
        }
        self.data
            .ok_or_else(|| QueueError::Protocol("response has no data".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskItemDto {
    #[serde(rename = "taskID", default)]
    task_id: u64,
    #[serde(rename = "clueID", default)]
    clue_id: u64,
    #[serde(default)]
    brief: String,
    #[serde(default)]
    step_name: String,
    #[serde(default)]
    subject_name: String,
    #[serde(default)]
    clue_type_name: String,
    #[serde(default)]
    dispatch_time: String,
}

impl TaskItemDto {
    fn into_clue(self, task_type: TaskType) -> Clue {
        let id = match task_type {
            TaskType::Produce => self.clue_id,
            TaskType::Audit => self.task_id,
        };
        Clue {
            id,
            task_id: self.task_id,
            clue_id: self.clue_id,
            brief: self.brief,
            subject_name: self.subject_name,
            step_name: self.step_name,
            clue_type_name: self.clue_type_name,
            dispatch_time: parse_timestamp(&self.dispatch_time),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskListDto {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    list: Option<Vec<TaskItemDto>>,
}

#[derive(Debug, Serialize)]
struct ClaimRequest {
    #[serde(rename = "taskIDs", skip_serializing_if = "Option::is_none")]
    task_ids: Option<Vec<ItemId>>,
    #[serde(rename = "clueIDs", skip_serializing_if = "Option::is_none")]
    clue_ids: Option<Vec<ItemId>>,
}

impl ClaimRequest {
    fn single(task_type: TaskType, item_id: ItemId) -> Self {
        match task_type {
            TaskType::Produce => Self {
                task_ids: None,
                clue_ids: Some(vec![item_id]),
            },
            TaskType::Audit => Self {
                task_ids: Some(vec![item_id]),
                clue_ids: None,
            },
        }
    }
}

fn page_from_dto(dto: TaskListDto, task_type: TaskType, page: u32) -> ItemPage {
    let items: Vec<Clue> = dto
        .list
        .unwrap_or_default()
        .into_iter()
        .map(|item| item.into_clue(task_type))
        .collect();
    let seen = u64::from(page) * u64::from(HttpQueue::PAGE_SIZE);
    ItemPage {
        has_more: !items.is_empty() && seen < dto.total,
        total: dto.total,
        items,
    }
}

fn claimed_count(data: &serde_json::Value) -> u64 {
    data.get("success")
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
        .unwrap_or(0)
}

fn classify_status(status: StatusCode, body: &str) -> QueueError {
    let detail = format!("http {status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        QueueError::Unauthorized(detail)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        QueueError::Transient(detail)
    } else {
        QueueError::Rejected(detail)
    }
}

fn classify_reqwest(err: reqwest::Error) -> QueueError {
    if err.is_decode() {
        QueueError::Protocol(format!("{err:#}"))
    } else if err.is_builder() {
        QueueError::Rejected(format!("malformed request: {err:#}"))
    } else {
        QueueError::Transient(format!("{err:#}"))
    }
}

/// [`RemoteQueue`] over the service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpQueue {
    http: reqwest::Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl HttpQueue {
    /// Production service.
    pub const DEFAULT_BASE_URL: &'static str = "https://easylearn.baidu.com/";

    /// Items requested per list page.
    pub const PAGE_SIZE: u32 = 20;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

    /// Build a client for `base_url` with the default retry policy.
    ///
    /// A base URL without a trailing `/` is treated as a directory, so
    /// `http://host/prefix` serves endpoints under `/prefix/`.
    pub fn new(mut base_url: Url) -> Result<Self, QueueError> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| QueueError::Protocol(format!("build http client: {err:#}")))?;
        Ok(Self {
            http,
            base_url,
            retry: RetryPolicy::default(),
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, QueueError> {
        self.base_url
            .join(path)
            .map_err(|err| QueueError::Rejected(format!("malformed url {path}: {err}")))
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        identity: &Identity,
    ) -> Result<T, QueueError> {
        let req = if identity.is_empty() {
            req
        } else {
            req.header(reqwest::header::COOKIE, identity.cookie())
        };
        let res = req.send().await.map_err(classify_reqwest)?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let envelope: Envelope<T> = res.json().await.map_err(classify_reqwest)?;
        envelope.into_data()
    }

    fn list_url(&self, query: &ListQuery) -> Result<Url, QueueError> {
        let mut url = self.endpoint(&format!(
            "edushop/question/{}/list",
            query.task_type.queue_segment()
        ))?;
        url.query_pairs_mut()
            .append_pair("pn", &query.page.to_string())
            .append_pair("rn", &Self::PAGE_SIZE.to_string())
            .append_pair("clueID", "")
            .append_pair("clueType", &query.filter_ids.clue_type.to_string())
            .append_pair("step", &query.filter_ids.step.to_string())
            .append_pair("subject", &query.filter_ids.subject.to_string());
        Ok(url)
    }
}

#[async_trait]
impl RemoteQueue for HttpQueue {
    async fn list_items(
        &self,
        query: &ListQuery,
        identity: &Identity,
        cancel: &CancellationToken,
    ) -> Result<ItemPage, QueueError> {
        let url = self.list_url(query)?;
        let dto: TaskListDto = with_retry(&self.retry, cancel, CancelMode::Abort, move || {
            self.send_once(self.http.get(url.clone()), identity)
        })
        .await?;
        Ok(page_from_dto(dto, query.task_type, query.page))
    }

    async fn claim_item(
        &self,
        task_type: TaskType,
        item_id: ItemId,
        identity: &Identity,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let url = self.endpoint(&format!(
            "edushop/question/{}/claim",
            task_type.commit_segment()
        ))?;
        let body = ClaimRequest::single(task_type, item_id);
        let data: serde_json::Value =
            with_retry(&self.retry, cancel, CancelMode::FinishInFlight, move || {
                self.send_once(self.http.post(url.clone()).json(&body), identity)
            })
            .await?;

        if claimed_count(&data) == 0 {
            return Err(QueueError::Rejected(format!(
                "item {item_id} was not assigned (already claimed?)"
            )));
        }
        Ok(())
    }

    async fn task_labels(
        &self,
        task_type: TaskType,
        identity: &Identity,
    ) -> Result<TaskLabels, QueueError> {
        let url = self.endpoint(&format!(
            "edushop/question/{}/getlabel",
            task_type.queue_segment()
        ))?;
        let never = CancellationToken::new();
        with_retry(&self.retry, &never, CancelMode::Abort, move || {
            self.send_once(self.http.get(url.clone()), identity)
        })
        .await
    }

    async fn user_info(&self, identity: &Identity) -> Result<UserInfo, QueueError> {
        let url = self.endpoint("edushop/user/common/info")?;
        let never = CancellationToken::new();
        with_retry(&self.retry, &never, CancelMode::Abort, move || {
            self.send_once(self.http.get(url.clone()), identity)
        })
        .await
    }
}
