use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::host::{HostError, HostResult};

/// Issue fields the gating checks consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub key: String,
    /// e.g. "Bug", "Improvement", "Story", "Sub-task".
    pub issue_type: String,
    /// Key of the parent issue when this is a subtask.
    pub parent: Option<String>,
    pub fix_versions: Vec<String>,
}

impl Issue {
    pub fn project(&self) -> &str {
        self.key.split_once('-').map(|(p, _)| p).unwrap_or(&self.key)
    }

    pub fn is_subtask(&self) -> bool {
        self.parent.is_some()
    }
}

/// Issue-tracker adapter. Absence of a tracker disables every tracker check.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// `Ok(None)` when the issue does not exist.
    async fn get_issue(&self, key: &str) -> HostResult<Option<Issue>>;
}

/// In-process tracker used by tests and local runs.
#[derive(Default)]
pub struct InMemoryTracker {
    issues: Mutex<HashMap<String, Issue>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_issue(&self, issue: Issue) {
        let mut issues = match self.issues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        issues.insert(issue.key.clone(), issue);
    }
}

#[async_trait]
impl IssueTracker for InMemoryTracker {
    async fn get_issue(&self, key: &str) -> HostResult<Option<Issue>> {
        let issues = self
            .issues
            .lock()
            .map_err(|_| HostError::Transient("tracker state poisoned".into()))?;
        Ok(issues.get(key).cloned())
    }
}
