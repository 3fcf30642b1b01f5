use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Host-facing data types ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    Open,
    Merged,
    Declined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub id: u64,
    pub title: String,
    pub author: String,
    pub source_branch: String,
    pub destination_branch: String,
    pub source_sha: String,
    pub state: PullRequestState,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub reviewer: String,
    pub state: ReviewState,
}

/// Aggregated build status for one commit under the configured build key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    NotStarted,
    InProgress,
    Successful,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Rate limiting or a 5xx; the job is retried with backoff.
    #[error("transient host error: {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type HostResult<T> = Result<T, HostError>;

// ── The adapter seam ─────────────────────────────────────────────────────

/// Capability set the core consumes from a git host. Implementations hide
/// Bitbucket vs GitHub differences behind this trait.
#[async_trait]
pub trait GitHost: Send + Sync {
    /// Hosts that cannot express an author's approval of their own PR
    /// return false; the author-approval check is then skipped.
    fn supports_author_approval(&self) -> bool {
        true
    }

    async fn get_pull_request(&self, id: u64) -> HostResult<PullRequestInfo>;

    async fn list_open_pull_requests(&self) -> HostResult<Vec<PullRequestInfo>>;

    /// The open PR from `source` into `destination`, if one exists.
    async fn find_pull_request(
        &self,
        source: &str,
        destination: &str,
    ) -> HostResult<Option<PullRequestInfo>>;

    async fn create_pull_request(
        &self,
        title: &str,
        source: &str,
        destination: &str,
        description: &str,
    ) -> HostResult<PullRequestInfo>;

    async fn decline_pull_request(&self, id: u64) -> HostResult<()>;

    /// Called after a promotion advanced the destination past the PR.
    /// Hosts that auto-detect merged PRs may ignore this.
    async fn mark_merged(&self, _id: u64) -> HostResult<()> {
        Ok(())
    }

    /// Comments in creation order, ties broken by id.
    async fn list_comments(&self, pr_id: u64) -> HostResult<Vec<Comment>>;

    async fn post_comment(&self, pr_id: u64, text: &str) -> HostResult<Comment>;

    async fn list_reviews(&self, pr_id: u64) -> HostResult<Vec<Review>>;

    /// Build status for one commit under `build_key`.
    async fn build_status(&self, sha: &str, build_key: &str) -> HostResult<BuildState>;
}

// ── Timeout decorator ────────────────────────────────────────────────────

/// Applies the configured per-call timeout to every host operation; a call
/// that runs over is reported as transient so the job is retried.
pub struct TimedHost {
    inner: Arc<dyn GitHost>,
    timeout: Duration,
}

impl TimedHost {
    pub fn new(inner: Arc<dyn GitHost>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn timed<T>(
        &self,
        call: impl std::future::Future<Output = HostResult<T>> + Send,
    ) -> HostResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(HostError::Transient(format!(
                "host call exceeded {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl GitHost for TimedHost {
    fn supports_author_approval(&self) -> bool {
        self.inner.supports_author_approval()
    }

    async fn get_pull_request(&self, id: u64) -> HostResult<PullRequestInfo> {
        self.timed(self.inner.get_pull_request(id)).await
    }

    async fn list_open_pull_requests(&self) -> HostResult<Vec<PullRequestInfo>> {
        self.timed(self.inner.list_open_pull_requests()).await
    }

    async fn find_pull_request(
        &self,
        source: &str,
        destination: &str,
    ) -> HostResult<Option<PullRequestInfo>> {
        self.timed(self.inner.find_pull_request(source, destination))
            .await
    }

    async fn create_pull_request(
        &self,
        title: &str,
        source: &str,
        destination: &str,
        description: &str,
    ) -> HostResult<PullRequestInfo> {
        self.timed(
            self.inner
                .create_pull_request(title, source, destination, description),
        )
        .await
    }

    async fn decline_pull_request(&self, id: u64) -> HostResult<()> {
        self.timed(self.inner.decline_pull_request(id)).await
    }

    async fn mark_merged(&self, id: u64) -> HostResult<()> {
        self.timed(self.inner.mark_merged(id)).await
    }

    async fn list_comments(&self, pr_id: u64) -> HostResult<Vec<Comment>> {
        self.timed(self.inner.list_comments(pr_id)).await
    }

    async fn post_comment(&self, pr_id: u64, text: &str) -> HostResult<Comment> {
        self.timed(self.inner.post_comment(pr_id, text)).await
    }

    async fn list_reviews(&self, pr_id: u64) -> HostResult<Vec<Review>> {
        self.timed(self.inner.list_reviews(pr_id)).await
    }

    async fn build_status(&self, sha: &str, build_key: &str) -> HostResult<BuildState> {
        self.timed(self.inner.build_status(sha, build_key)).await
    }
}

// ── In-memory implementation ─────────────────────────────────────────────

#[derive(Default)]
struct MemState {
    pull_requests: HashMap<u64, PullRequestInfo>,
    comments: HashMap<u64, Vec<Comment>>,
    reviews: HashMap<u64, Vec<Review>>,
    builds: HashMap<(String, String), BuildState>,
    next_pr_id: u64,
    next_comment_id: u64,
}

/// In-process host used by tests, local runs and the end-to-end scenarios.
pub struct InMemoryHost {
    state: Mutex<MemState>,
    author_approval: bool,
    /// Login comments posted through this host are attributed to.
    login: String,
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new("gwf-bot")
    }
}

impl InMemoryHost {
    pub fn new(login: &str) -> Self {
        Self {
            state: Mutex::new(MemState {
                next_pr_id: 1,
                next_comment_id: 1,
                ..MemState::default()
            }),
            author_approval: true,
            login: login.to_string(),
        }
    }

    pub fn without_author_approval(mut self) -> Self {
        self.author_approval = false;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // Seeding helpers for tests and the local demo mode.

    pub fn seed_pull_request(
        &self,
        author: &str,
        source: &str,
        destination: &str,
        source_sha: &str,
    ) -> u64 {
        let mut s = self.lock();
        let id = s.next_pr_id;
        s.next_pr_id += 1;
        s.pull_requests.insert(
            id,
            PullRequestInfo {
                id,
                title: format!("{source} -> {destination}"),
                author: author.to_string(),
                source_branch: source.to_string(),
                destination_branch: destination.to_string(),
                source_sha: source_sha.to_string(),
                state: PullRequestState::Open,
                description: String::new(),
            },
        );
        id
    }

    pub fn set_source_sha(&self, pr_id: u64, sha: &str) {
        if let Some(pr) = self.lock().pull_requests.get_mut(&pr_id) {
            pr.source_sha = sha.to_string();
        }
    }

    pub fn add_review(&self, pr_id: u64, reviewer: &str, state: ReviewState) {
        self.lock().reviews.entry(pr_id).or_default().push(Review {
            reviewer: reviewer.to_string(),
            state,
        });
    }

    pub fn set_build(&self, sha: &str, key: &str, state: BuildState) {
        self.lock()
            .builds
            .insert((sha.to_string(), key.to_string()), state);
    }

    pub fn add_comment(&self, pr_id: u64, author: &str, text: &str) -> u64 {
        let mut s = self.lock();
        let id = s.next_comment_id;
        s.next_comment_id += 1;
        s.comments.entry(pr_id).or_default().push(Comment {
            id,
            author: author.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        });
        id
    }

    pub fn delete_comment(&self, pr_id: u64, comment_id: u64) {
        if let Some(list) = self.lock().comments.get_mut(&pr_id) {
            list.retain(|c| c.id != comment_id);
        }
    }
}

#[async_trait]
impl GitHost for InMemoryHost {
    fn supports_author_approval(&self) -> bool {
        self.author_approval
    }

    async fn get_pull_request(&self, id: u64) -> HostResult<PullRequestInfo> {
        self.lock()
            .pull_requests
            .get(&id)
            .cloned()
            .ok_or_else(|| HostError::NotFound(format!("pull request {id}")))
    }

    async fn list_open_pull_requests(&self) -> HostResult<Vec<PullRequestInfo>> {
        let mut prs: Vec<PullRequestInfo> = self
            .lock()
            .pull_requests
            .values()
            .filter(|pr| pr.state == PullRequestState::Open)
            .cloned()
            .collect();
        prs.sort_by_key(|pr| pr.id);
        Ok(prs)
    }

    async fn find_pull_request(
        &self,
        source: &str,
        destination: &str,
    ) -> HostResult<Option<PullRequestInfo>> {
        Ok(self
            .lock()
            .pull_requests
            .values()
            .find(|pr| {
                pr.state == PullRequestState::Open
                    && pr.source_branch == source
                    && pr.destination_branch == destination
            })
            .cloned())
    }

    async fn create_pull_request(
        &self,
        title: &str,
        source: &str,
        destination: &str,
        description: &str,
    ) -> HostResult<PullRequestInfo> {
        let mut s = self.lock();
        let id = s.next_pr_id;
        s.next_pr_id += 1;
        let pr = PullRequestInfo {
            id,
            title: title.to_string(),
            author: self.login.clone(),
            source_branch: source.to_string(),
            destination_branch: destination.to_string(),
            source_sha: String::new(),
            state: PullRequestState::Open,
            description: description.to_string(),
        };
        s.pull_requests.insert(id, pr.clone());
        Ok(pr)
    }

    async fn decline_pull_request(&self, id: u64) -> HostResult<()> {
        let mut s = self.lock();
        let pr = s
            .pull_requests
            .get_mut(&id)
            .ok_or_else(|| HostError::NotFound(format!("pull request {id}")))?;
        pr.state = PullRequestState::Declined;
        Ok(())
    }

    async fn mark_merged(&self, id: u64) -> HostResult<()> {
        let mut s = self.lock();
        let pr = s
            .pull_requests
            .get_mut(&id)
            .ok_or_else(|| HostError::NotFound(format!("pull request {id}")))?;
        pr.state = PullRequestState::Merged;
        Ok(())
    }

    async fn list_comments(&self, pr_id: u64) -> HostResult<Vec<Comment>> {
        let mut comments = self.lock().comments.get(&pr_id).cloned().unwrap_or_default();
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(comments)
    }

    async fn post_comment(&self, pr_id: u64, text: &str) -> HostResult<Comment> {
        let mut s = self.lock();
        let id = s.next_comment_id;
        s.next_comment_id += 1;
        let comment = Comment {
            id,
            author: self.login.clone(),
            text: text.to_string(),
            created_at: Utc::now(),
        };
        s.comments.entry(pr_id).or_default().push(comment.clone());
        Ok(comment)
    }

    async fn list_reviews(&self, pr_id: u64) -> HostResult<Vec<Review>> {
        Ok(self.lock().reviews.get(&pr_id).cloned().unwrap_or_default())
    }

    async fn build_status(&self, sha: &str, build_key: &str) -> HostResult<BuildState> {
        Ok(self
            .lock()
            .builds
            .get(&(sha.to_string(), build_key.to_string()))
            .copied()
            .unwrap_or(BuildState::NotStarted))
    }
}
