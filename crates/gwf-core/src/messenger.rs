use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::host::{Comment, GitHost, HostResult};
use crate::status::StatusCode;

pub const ROBOT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// What the evaluator wants said, decoupled from how it is said.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSpec {
    pub code: StatusCode,
    pub params: serde_json::Value,
}

impl MessageSpec {
    pub fn new(code: StatusCode, params: serde_json::Value) -> Self {
        Self { code, params }
    }

    /// Key under which this message is posted at most once per PR:
    /// the code plus a digest of the salient parameters.
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.params.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(12);
        for byte in digest.iter().take(6) {
            hex.push_str(&format!("{byte:02x}"));
        }
        format!("{}-{}", self.code.code(), hex)
    }
}

/// Hidden marker appended to every robot comment; scanning for it gives the
/// set of keys already posted.
#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    code: u16,
    key: String,
}

const MARKER_PREFIX: &str = "<!-- gwf-status: ";
const MARKER_SUFFIX: &str = " -->";

fn render_marker(spec: &MessageSpec) -> String {
    let marker = Marker {
        code: spec.code.code(),
        key: spec.idempotency_key(),
    };
    let json = serde_json::to_string(&marker).unwrap_or_default();
    format!("{MARKER_PREFIX}{json}{MARKER_SUFFIX}")
}

fn extract_marker_key(text: &str) -> Option<String> {
    let start = text.find(MARKER_PREFIX)? + MARKER_PREFIX.len();
    let end = text[start..].find(MARKER_SUFFIX)? + start;
    let marker: Marker = serde_json::from_str(&text[start..end]).ok()?;
    Some(marker.key)
}

fn params_list(params: &serde_json::Value, field: &str) -> String {
    params[field]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| format!("`{s}`"))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

/// Human text for a message spec. Rendering lives here, outside the
/// evaluator, which only ever produces `MessageSpec`s.
pub fn render_body(spec: &MessageSpec) -> String {
    let p = &spec.params;
    match spec.code {
        StatusCode::Hello => "Hello! I am the merge robot in charge of this repository. \
             Once this pull request is approved and green, I will propagate \
             it through every newer release line and merge it. Talk to me \
             with `@<robot> <option>` comments."
            .to_string(),
        StatusCode::Queued => format!(
            "This pull request has been added to the merge queue behind {} \
             other change(s). It will be merged once every build on its \
             queue branches is successful.",
            p["position"].as_u64().unwrap_or(0)
        ),
        StatusCode::SuccessfulMerge => format!(
            "The changes have been merged into: {}. Thank you!",
            params_list(p, "branches")
        ),
        StatusCode::IncorrectPrefix => format!(
            "The source branch prefix `{}` is not recognized. Allowed \
             prefixes: {}.",
            p["prefix"].as_str().unwrap_or("?"),
            params_list(p, "allowed")
        ),
        StatusCode::IncompatibleBranch => format!(
            "A `{}` branch may not target `{}`.",
            p["prefix"].as_str().unwrap_or("?"),
            p["destination"].as_str().unwrap_or("?")
        ),
        StatusCode::MissingIssue => "The source branch name carries no issue reference, \
             and this repository requires one."
            .to_string(),
        StatusCode::IssueNotFound => format!(
            "Issue `{}` could not be found in the tracker.",
            p["issue"].as_str().unwrap_or("?")
        ),
        StatusCode::SubtaskIssue => format!(
            "Issue `{}` is a subtask; please reference its parent `{}` instead.",
            p["issue"].as_str().unwrap_or("?"),
            p["parent"].as_str().unwrap_or("?")
        ),
        StatusCode::WrongProject => format!(
            "Issue `{}` does not belong to an accepted project ({}).",
            p["issue"].as_str().unwrap_or("?"),
            params_list(p, "expected")
        ),
        StatusCode::TypePrefixMismatch => format!(
            "Issue `{}` has type `{}`, which maps to the `{}` prefix, but \
             the source branch uses `{}`.",
            p["issue"].as_str().unwrap_or("?"),
            p["issue_type"].as_str().unwrap_or("?"),
            p["expected_prefix"].as_str().unwrap_or("?"),
            p["prefix"].as_str().unwrap_or("?")
        ),
        StatusCode::FixVersionMismatch => format!(
            "The issue's fix versions ({}) do not cover the cascade ({}).",
            params_list(p, "fix_versions"),
            params_list(p, "expected")
        ),
        StatusCode::HistoryMismatch => format!(
            "The integration branch `{}` contains commits that come from \
             neither the source branch nor its destination; the source \
             history has probably been rewritten. Use `reset` to rebuild \
             the integration branches.",
            p["branch"].as_str().unwrap_or("?")
        ),
        StatusCode::Conflict => {
            let files = params_list(p, "files");
            if p["origin"].as_str() == Some("feature") {
                format!(
                    "A conflict blocks the merge into `{}`.\n\nPlease resolve \
                     it on your feature branch: merge `{}` into `{}`, fix the \
                     conflicts ({files}), and push.",
                    p["destination"].as_str().unwrap_or("?"),
                    p["target"].as_str().unwrap_or("?"),
                    p["source"].as_str().unwrap_or("?"),
                )
            } else {
                format!(
                    "A conflict blocks the merge into `{}`.\n\nPlease resolve \
                     it on the integration branch `{}` ({files}) and push; \
                     do not rebase it.",
                    p["destination"].as_str().unwrap_or("?"),
                    p["branch"].as_str().unwrap_or("?"),
                )
            }
        }
        StatusCode::MissingApprovals => format!(
            "Waiting for approvals before merging. Still missing: {}.",
            params_list(p, "missing")
        ),
        StatusCode::BuildFailed => format!(
            "The build failed on {}. Fix the problem and push, or rerun the \
             build if it looks flaky.",
            params_list(p, "branches")
        ),
        StatusCode::AfterPullRequest => format!(
            "This pull request waits for the following pull request(s) to be \
             merged first: {}.",
            params_list(p, "pending")
        ),
        StatusCode::IntegrationDataCreated => format!(
            "Integration data created. Your change is staged on the \
             following integration branches: {}.\n\nDo not edit these \
             branches directly except to resolve conflicts; they are rebuilt \
             from your source branch.",
            params_list(p, "branches")
        ),
        StatusCode::ResetComplete => format!(
            "As requested, the integration branches have been deleted: {}. \
             They will be rebuilt from the current source branch.",
            params_list(p, "branches")
        ),
        StatusCode::UnknownCommand => format!(
            "I do not understand the command `{}`.",
            p["token"].as_str().unwrap_or("?")
        ),
        StatusCode::NotAuthorized => format!(
            "`@{}`: you are not authorized to use `{}` here.",
            p["author"].as_str().unwrap_or("?"),
            p["token"].as_str().unwrap_or("?")
        ),
        StatusCode::PartialMerge => format!(
            "The source branch moved while this pull request was queued; \
             only the commits that were queued have been merged: {}.",
            params_list(p, "commits")
        ),
        StatusCode::QueueConflict => format!(
            "This pull request conflicts with changes already in the merge \
             queue (lane `{}`). It will have to be updated and re-approved \
             once the queue has been merged.",
            p["lane"].as_str().unwrap_or("?")
        ),
        StatusCode::QueueOutOfOrder => "The merge queue is out of order — a queue branch no \
             longer descends from its predecessor. No merge will happen \
             until the queue is rebuilt or deleted by an administrator."
            .to_string(),
        StatusCode::ResetHistoryMismatch => format!(
            "Refusing to reset: the integration branch `{}` carries commits \
             that are not mine (probably your conflict resolutions). Use \
             `force_reset` to discard them.",
            p["branch"].as_str().unwrap_or("?")
        ),
        StatusCode::InternalError => "Something went wrong on my side; an administrator has \
             been notified. I will retry on the next event."
            .to_string(),
        StatusCode::SourceDiverged => {
            if p["reason"].as_str() == Some("not_author") {
                format!(
                    "`@{}`: only the author of this pull request may use `{}`.",
                    p["author"].as_str().unwrap_or("?"),
                    p["token"].as_str().unwrap_or("?")
                )
            } else {
                format!(
                    "The source branch has diverged from `{}` by {} commits, \
                     which exceeds the configured limit of {}. Please rebase \
                     or split the change.",
                    p["target"].as_str().unwrap_or("?"),
                    p["commits"].as_u64().unwrap_or(0),
                    p["limit"].as_u64().unwrap_or(0)
                )
            }
        }
    }
}

/// Full comment text: body, status footer, hidden idempotency marker.
pub fn render(spec: &MessageSpec, active_options: &[String]) -> String {
    let body = render_body(spec);
    let options = if active_options.is_empty() {
        "none".to_string()
    } else {
        active_options.join(", ")
    };
    format!(
        "{body}\n\n---\n*status: {} — active options: {options} — robot v{}*\n{}",
        spec.code.code(),
        ROBOT_VERSION,
        render_marker(spec)
    )
}

/// Keys of every robot message already present on the PR.
pub fn posted_keys(comments: &[Comment], robot: &str) -> Vec<String> {
    comments
        .iter()
        .filter(|c| c.author == robot)
        .filter_map(|c| extract_marker_key(&c.text))
        .collect()
}

/// Post a message unless an identical `(code, params)` message already
/// exists on the PR. Returns whether a comment was actually created.
pub async fn post_once(
    host: &dyn GitHost,
    pr_id: u64,
    spec: &MessageSpec,
    active_options: &[String],
    robot: &str,
) -> HostResult<bool> {
    let comments = host.list_comments(pr_id).await?;
    let key = spec.idempotency_key();
    if posted_keys(&comments, robot).contains(&key) {
        return Ok(false);
    }
    host.post_comment(pr_id, &render(spec, active_options)).await?;
    Ok(true)
}

/// Render the description used when opening an integration pull request.
pub fn integration_pr_description(parent_id: u64, branch: &str) -> String {
    format!(
        "Integration branch `{branch}` for pull request #{parent_id}.\n\n\
         Do not edit this pull request directly; push fixes to the parent's \
         source branch, or resolve conflicts on the integration branch."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn idempotency_key_depends_on_code_and_params() {
        let a = MessageSpec::new(StatusCode::BuildFailed, serde_json::json!({"b": ["w/2.0/x"]}));
        let b = MessageSpec::new(StatusCode::BuildFailed, serde_json::json!({"b": ["w/3.0/x"]}));
        let c = MessageSpec::new(StatusCode::Conflict, serde_json::json!({"b": ["w/2.0/x"]}));
        assert_ne!(a.idempotency_key(), b.idempotency_key());
        assert_ne!(a.idempotency_key(), c.idempotency_key());
        assert_eq!(a.idempotency_key(), a.idempotency_key());
    }

    #[test]
    fn marker_round_trips_through_rendered_comment() {
        let spec = MessageSpec::new(StatusCode::Hello, serde_json::json!({}));
        let text = render(&spec, &[]);
        assert_eq!(extract_marker_key(&text), Some(spec.idempotency_key()));
        assert!(text.contains("status: 100"));
        assert!(text.contains(ROBOT_VERSION));
    }

    #[test]
    fn footer_lists_active_options() {
        let spec = MessageSpec::new(StatusCode::MissingApprovals, serde_json::json!({}));
        let text = render(&spec, &["wait".to_string(), "approve".to_string()]);
        assert!(text.contains("active options: wait, approve"));
    }

    #[test]
    fn posted_keys_only_considers_robot_comments() {
        let spec = MessageSpec::new(StatusCode::Hello, serde_json::json!({}));
        let comments = vec![
            Comment {
                id: 1,
                author: "alice".into(),
                text: render(&spec, &[]),
                created_at: Utc::now(),
            },
            Comment {
                id: 2,
                author: "gwf-bot".into(),
                text: render(&spec, &[]),
                created_at: Utc::now(),
            },
        ];
        assert_eq!(posted_keys(&comments, "gwf-bot"), vec![spec.idempotency_key()]);
    }

    #[test]
    fn conflict_message_is_role_aware() {
        let feature = MessageSpec::new(
            StatusCode::Conflict,
            serde_json::json!({
                "origin": "feature",
                "destination": "development/2.0",
                "target": "development/1.0",
                "source": "bugfix/PROJ-1-x",
                "files": ["src/a.rs"],
            }),
        );
        assert!(render_body(&feature).contains("feature branch"));

        let integration = MessageSpec::new(
            StatusCode::Conflict,
            serde_json::json!({
                "origin": "integration",
                "destination": "development/3.0",
                "branch": "w/3.0/bugfix/PROJ-1-x",
                "files": ["src/a.rs"],
            }),
        );
        assert!(render_body(&integration).contains("integration branch"));
    }
}
