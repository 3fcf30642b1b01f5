use serde::{Deserialize, Serialize};

use crate::branch::{SourceBranch, STANDARD_PREFIXES};
use crate::cascade::{prefix_compatible, Cascade};
use crate::commands::{Bypass, Options};
use crate::config::RepoSettings;
use crate::errors::{EvalError, EvalResult};
use crate::host::{BuildState, PullRequestInfo, PullRequestState};
use crate::integration::IntegrationBranch;
use crate::status::StatusCode;
use crate::tracker::Issue;

/// Result of looking the PR's issue up in the tracker.
#[derive(Debug, Clone)]
pub enum IssueLookup {
    /// No tracker configured, or the prefix is exempt.
    Disabled,
    NotFound(String),
    Found(Issue),
}

/// Review state folded by role.
#[derive(Debug, Clone, Default)]
pub struct Approvals {
    pub author_approved: bool,
    /// Reviewers (other than the author) with an active approval.
    pub peers: Vec<String>,
    /// Reviewers with an outstanding change request.
    pub change_requests: Vec<String>,
}

/// Everything one evaluation needs, rebuilt from repository facts on every
/// wake-up and never persisted.
#[derive(Debug, Clone)]
pub struct PRFacts {
    pub pr: PullRequestInfo,
    pub source: SourceBranch,
    pub cascade: Cascade,
    pub options: Options,
    pub approvals: Approvals,
    /// Commits on the source that are not on its target.
    pub commit_diff: u64,
    pub issue: IssueLookup,
    /// Current integration branch states; empty while creation is deferred.
    pub integration: Vec<IntegrationBranch>,
    /// True while the integration branches have not been materialized yet.
    pub integration_deferred: bool,
    /// True when the branches already exist remotely or their creation was
    /// explicitly requested (settings or option). When false, creation
    /// waits for every review gate so reviewers are not buried in build
    /// noise.
    pub integration_requested: bool,
    /// Build status per integration branch tip.
    pub builds: Vec<(String, BuildState)>,
    /// `after_pull_request` dependencies and their current state.
    pub dependencies: Vec<(u64, PullRequestState)>,
    pub host_supports_author_approval: bool,
}

/// What the caller should do after an all-green evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    /// Hand the PR to the queue manager.
    Queue,
    /// Queues disabled: merge the integration branches directly.
    Merge,
    /// All review gates passed but integration branches are still pending;
    /// materialize them and re-evaluate.
    NeedIntegration,
    /// Nothing to do right now (builds running, `wait` in effect).
    Wait(&'static str),
}

// ── The check chain ──────────────────────────────────────────────────────

type CheckFn = fn(&PRFacts, &RepoSettings) -> EvalResult<()>;

pub struct Check {
    pub name: &'static str,
    pub run: CheckFn,
}

/// Checks that run before any integration branch is touched. The first
/// failure short-circuits the evaluation; its status is what the user sees.
pub const PRE_CHECKS: &[Check] = &[
    Check { name: "source_prefix", run: check_source_prefix },
    Check { name: "destination_compatible", run: check_destination_compatible },
    Check { name: "commit_diff", run: check_commit_diff },
    Check { name: "issue_reference", run: check_issue_reference },
    Check { name: "issue_exists", run: check_issue_exists },
    Check { name: "issue_project", run: check_issue_project },
    Check { name: "issue_not_subtask", run: check_issue_not_subtask },
    Check { name: "issue_type_prefix", run: check_issue_type_prefix },
    Check { name: "fix_versions", run: check_fix_versions },
];

/// Checks that run after the integration step (history mismatch and
/// conflicts surface while materializing, between the two groups).
pub const GATE_CHECKS: &[Check] = &[
    Check { name: "author_approval", run: check_author_approval },
    Check { name: "peer_approvals", run: check_peer_approvals },
    Check { name: "leader_approvals", run: check_leader_approvals },
    Check { name: "dependencies", run: check_dependencies },
    Check { name: "build_status", run: check_build_status },
];

fn tracker_active(facts: &PRFacts, settings: &RepoSettings) -> bool {
    settings.tracker_enabled()
        && !facts.source.tracker_exempt(&settings.bypass_prefixes)
        && !facts.options.has_bypass(Bypass::JiraCheck)
}

fn check_source_prefix(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if facts.source.prefix_allowed(&settings.bypass_prefixes) {
        return Ok(());
    }
    let mut allowed: Vec<String> = STANDARD_PREFIXES.iter().map(|p| p.to_string()).collect();
    allowed.extend(settings.bypass_prefixes.iter().cloned());
    Err(EvalError::status_with(
        StatusCode::IncorrectPrefix,
        serde_json::json!({ "prefix": facts.source.prefix, "allowed": allowed }),
    ))
}

fn check_destination_compatible(facts: &PRFacts, _settings: &RepoSettings) -> EvalResult<()> {
    if facts.options.has_bypass(Bypass::IncompatibleBranch) {
        return Ok(());
    }
    let target = facts.cascade.target();
    if prefix_compatible(&facts.source.prefix, target.kind) {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::IncompatibleBranch,
        serde_json::json!({ "prefix": facts.source.prefix, "destination": target.name }),
    ))
}

fn check_commit_diff(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if settings.max_commit_diff == 0 || facts.commit_diff <= u64::from(settings.max_commit_diff) {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::SourceDiverged,
        serde_json::json!({
            "reason": "too_many_commits",
            "target": facts.cascade.target().name,
            "commits": facts.commit_diff,
            "limit": settings.max_commit_diff,
        }),
    ))
}

fn check_issue_reference(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if !tracker_active(facts, settings) || facts.source.issue_key.is_some() {
        return Ok(());
    }
    Err(EvalError::status(StatusCode::MissingIssue))
}

fn check_issue_exists(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if !tracker_active(facts, settings) {
        return Ok(());
    }
    match &facts.issue {
        IssueLookup::NotFound(key) => Err(EvalError::status_with(
            StatusCode::IssueNotFound,
            serde_json::json!({ "issue": key }),
        )),
        _ => Ok(()),
    }
}

fn check_issue_project(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if !tracker_active(facts, settings) || settings.jira_keys.is_empty() {
        return Ok(());
    }
    let IssueLookup::Found(issue) = &facts.issue else {
        return Ok(());
    };
    if settings.jira_keys.iter().any(|k| k == issue.project()) {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::WrongProject,
        serde_json::json!({ "issue": issue.key, "expected": settings.jira_keys }),
    ))
}

fn check_issue_not_subtask(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if !tracker_active(facts, settings) {
        return Ok(());
    }
    let IssueLookup::Found(issue) = &facts.issue else {
        return Ok(());
    };
    if !issue.is_subtask() {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::SubtaskIssue,
        serde_json::json!({
            "issue": issue.key,
            "parent": issue.parent.clone().unwrap_or_default(),
        }),
    ))
}

fn check_issue_type_prefix(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if !tracker_active(facts, settings) {
        return Ok(());
    }
    let IssueLookup::Found(issue) = &facts.issue else {
        return Ok(());
    };
    let Some(expected) = settings.prefixes.get(&issue.issue_type) else {
        return Ok(());
    };
    if expected == &facts.source.prefix {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::TypePrefixMismatch,
        serde_json::json!({
            "issue": issue.key,
            "issue_type": issue.issue_type,
            "expected_prefix": expected,
            "prefix": facts.source.prefix,
        }),
    ))
}

fn check_fix_versions(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if !tracker_active(facts, settings) || settings.disable_version_checks {
        return Ok(());
    }
    let IssueLookup::Found(issue) = &facts.issue else {
        return Ok(());
    };
    let expected = facts.cascade.versions();
    if expected
        .iter()
        .all(|v| issue.fix_versions.iter().any(|fv| fv == v))
    {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::FixVersionMismatch,
        serde_json::json!({
            "issue": issue.key,
            "fix_versions": issue.fix_versions,
            "expected": expected,
        }),
    ))
}

fn check_author_approval(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if !settings.need_author_approval
        || !facts.host_supports_author_approval
        || facts.options.has_bypass(Bypass::AuthorApproval)
    {
        return Ok(());
    }
    if facts.approvals.author_approved || facts.options.approved_by_author {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::MissingApprovals,
        serde_json::json!({ "missing": ["author approval"] }),
    ))
}

fn check_peer_approvals(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if facts.options.has_bypass(Bypass::PeerApproval) {
        return Ok(());
    }
    let mut missing: Vec<String> = Vec::new();
    let have = facts.approvals.peers.len() as u32;
    if have < settings.required_peer_approvals {
        missing.push(format!(
            "{} peer approval(s)",
            settings.required_peer_approvals - have
        ));
    }
    for reviewer in &facts.approvals.change_requests {
        missing.push(format!("changes requested by {reviewer}"));
    }
    if missing.is_empty() {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::MissingApprovals,
        serde_json::json!({ "missing": missing }),
    ))
}

fn check_leader_approvals(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<()> {
    if settings.required_leader_approvals == 0
        || facts.options.has_bypass(Bypass::LeaderApproval)
    {
        return Ok(());
    }
    let have = facts
        .approvals
        .peers
        .iter()
        .filter(|p| settings.is_leader(p))
        .count() as u32;
    if have >= settings.required_leader_approvals {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::MissingApprovals,
        serde_json::json!({
            "missing": [format!(
                "{} project leader approval(s)",
                settings.required_leader_approvals - have
            )],
        }),
    ))
}

fn check_dependencies(facts: &PRFacts, _settings: &RepoSettings) -> EvalResult<()> {
    let pending: Vec<String> = facts
        .dependencies
        .iter()
        .filter(|(_, state)| *state != PullRequestState::Merged)
        .map(|(id, _)| format!("#{id}"))
        .collect();
    if pending.is_empty() {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::AfterPullRequest,
        serde_json::json!({ "pending": pending }),
    ))
}

fn check_build_status(facts: &PRFacts, _settings: &RepoSettings) -> EvalResult<()> {
    if facts.options.has_bypass(Bypass::BuildStatus) {
        return Ok(());
    }
    let failed: Vec<String> = facts
        .builds
        .iter()
        .filter(|(_, state)| *state == BuildState::Failed)
        .map(|(branch, _)| branch.clone())
        .collect();
    if failed.is_empty() {
        return Ok(());
    }
    Err(EvalError::status_with(
        StatusCode::BuildFailed,
        serde_json::json!({ "branches": failed }),
    ))
}

// ── Evaluation ───────────────────────────────────────────────────────────

/// Run the whole gate over one set of facts.
///
/// Pure: the same facts always produce the same outcome, which is what
/// makes back-to-back evaluations idempotent.
pub fn evaluate(facts: &PRFacts, settings: &RepoSettings) -> EvalResult<NextAction> {
    if facts.pr.state != PullRequestState::Open {
        return Err(EvalError::NotMyJob(format!(
            "pull request #{} is not open",
            facts.pr.id
        )));
    }

    for check in PRE_CHECKS {
        (check.run)(facts, settings)?;
    }

    // Requested integration data is built before the review gates, so
    // history mismatches and conflicts are reported first.
    if facts.integration_deferred && facts.integration_requested {
        return Ok(NextAction::NeedIntegration);
    }

    for check in GATE_CHECKS {
        (check.run)(facts, settings)?;
    }

    if facts.integration_deferred {
        return Ok(NextAction::NeedIntegration);
    }

    if !facts.options.has_bypass(Bypass::BuildStatus)
        && facts
            .builds
            .iter()
            .any(|(_, state)| *state != BuildState::Successful)
    {
        // Failures were caught by the check chain; the rest are pending.
        return Ok(NextAction::Wait("builds in progress"));
    }

    if facts.options.wait {
        return Ok(NextAction::Wait("wait option in effect"));
    }

    if settings.use_queues {
        Ok(NextAction::Queue)
    } else {
        Ok(NextAction::Merge)
    }
}
