use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::RepoSettings;
use crate::errors::{EvalError, EvalResult};
use crate::host::Comment;
use crate::status::StatusCode;

/// Checks that can be waived by a sticky bypass option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bypass {
    AuthorApproval,
    PeerApproval,
    LeaderApproval,
    BuildStatus,
    IncompatibleBranch,
    JiraCheck,
}

impl Bypass {
    fn token(self) -> &'static str {
        match self {
            Bypass::AuthorApproval => "bypass_author_approval",
            Bypass::PeerApproval => "bypass_peer_approval",
            Bypass::LeaderApproval => "bypass_leader_approval",
            Bypass::BuildStatus => "bypass_build_status",
            Bypass::IncompatibleBranch => "bypass_incompatible_branch",
            Bypass::JiraCheck => "bypass_jira_check",
        }
    }

    fn from_token(token: &str) -> Option<Bypass> {
        Some(match token {
            "bypass_author_approval" => Bypass::AuthorApproval,
            "bypass_peer_approval" => Bypass::PeerApproval,
            "bypass_leader_approval" => Bypass::LeaderApproval,
            "bypass_build_status" => Bypass::BuildStatus,
            "bypass_incompatible_branch" => Bypass::IncompatibleBranch,
            "bypass_jira_check" => Bypass::JiraCheck,
            _ => return None,
        })
    }
}

/// One-shot commands. Everything else addressed to the robot is an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Reset,
    ForceReset,
}

/// The effective set of sticky options, folded over the comments that
/// currently exist. Options from deleted comments disappear with them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    pub approved_by_author: bool,
    pub wait: bool,
    pub no_octopus: bool,
    pub create_pull_requests: bool,
    pub create_integration_branches: bool,
    pub after_pull_requests: Vec<u64>,
    pub bypasses: BTreeSet<Bypass>,
    /// Token spellings currently in effect, for the message footer.
    pub active: Vec<String>,
}

impl Options {
    pub fn has_bypass(&self, b: Bypass) -> bool {
        self.bypasses.contains(&b)
    }
}

/// A one-shot command the robot has not yet answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    pub kind: CommandKind,
    /// Comment that carried it, used to key the acknowledgement.
    pub comment_id: u64,
}

/// Parser output: sticky options plus commands not yet acknowledged.
#[derive(Debug, Clone, Default)]
pub struct Directives {
    pub options: Options,
    /// Commands appearing after the robot's most recent comment, in order.
    pub pending_commands: Vec<PendingCommand>,
}

/// Does this author hold the privilege for a privileged token?
///
/// Admins qualify, but never on their own pull request; per-author grants in
/// `pr_author_options` qualify regardless.
fn privileged(settings: &RepoSettings, author: &str, pr_author: &str, token: &str) -> bool {
    if settings.author_options(author).iter().any(|t| t == token) {
        return true;
    }
    settings.is_admin(author) && author != pr_author
}

/// Extract the token words a comment line addresses to the robot, if any.
fn directive_words<'a>(line: &'a str, robot: &str) -> Option<Vec<&'a str>> {
    let trimmed = line.trim();
    let rest = if let Some(rest) = trimmed.strip_prefix('/') {
        rest
    } else {
        let mention = format!("@{robot}");
        let rest = trimmed.strip_prefix(mention.as_str())?;
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            // e.g. "@gwf-bot2 ..." addressed to someone else
            return None;
        }
        rest
    };
    let words: Vec<&str> = rest.split_whitespace().collect();
    if words.is_empty() {
        None
    } else {
        Some(words)
    }
}

/// Interpret every live comment on the PR, in creation order.
///
/// The first violation aborts with its status: unknown token (122),
/// missing privilege (123), or an authored token used by a non-author (134).
pub fn parse_comments(
    comments: &[Comment],
    settings: &RepoSettings,
    pr_author: &str,
) -> EvalResult<Directives> {
    let robot = settings.robot.as_str();
    let last_robot_comment = comments
        .iter()
        .filter(|c| c.author == robot)
        .map(|c| c.id)
        .max();

    let mut directives = Directives::default();

    for comment in comments {
        if comment.author == robot {
            continue;
        }
        for line in comment.text.lines() {
            let Some(words) = directive_words(line, robot) else {
                continue;
            };
            for word in words {
                apply_token(
                    &mut directives,
                    word,
                    comment,
                    settings,
                    pr_author,
                    last_robot_comment,
                )?;
            }
        }
    }

    directives.options.active.sort();
    directives.options.active.dedup();
    Ok(directives)
}

fn apply_token(
    directives: &mut Directives,
    word: &str,
    comment: &Comment,
    settings: &RepoSettings,
    pr_author: &str,
    last_robot_comment: Option<u64>,
) -> EvalResult<()> {
    let (token, value) = match word.split_once('=') {
        Some((t, v)) => (t, Some(v)),
        None => (word, None),
    };
    let author = comment.author.as_str();
    let opts = &mut directives.options;

    match token {
        "approve" => {
            if author != pr_author {
                return Err(EvalError::status_with(
                    StatusCode::SourceDiverged,
                    serde_json::json!({ "reason": "not_author", "token": token, "author": author }),
                ));
            }
            opts.approved_by_author = true;
        }
        "wait" => opts.wait = true,
        "no_octopus" => opts.no_octopus = true,
        "create_pull_requests" => opts.create_pull_requests = true,
        "create_integration_branches" => opts.create_integration_branches = true,
        "after_pull_request" => {
            let id = value.and_then(|v| v.trim_start_matches('#').parse::<u64>().ok());
            let Some(id) = id else {
                return Err(EvalError::status_with(
                    StatusCode::UnknownCommand,
                    serde_json::json!({ "token": word, "author": author }),
                ));
            };
            if !opts.after_pull_requests.contains(&id) {
                opts.after_pull_requests.push(id);
            }
        }
        "reset" | "force_reset" => {
            let kind = if token == "reset" {
                CommandKind::Reset
            } else {
                CommandKind::ForceReset
            };
            // One-shot: consumed once the robot has answered anything later.
            if last_robot_comment.map_or(true, |last| comment.id > last) {
                directives.pending_commands.push(PendingCommand {
                    kind,
                    comment_id: comment.id,
                });
            }
            return Ok(());
        }
        _ => {
            let Some(bypass) = Bypass::from_token(token) else {
                return Err(EvalError::status_with(
                    StatusCode::UnknownCommand,
                    serde_json::json!({ "token": word, "author": author }),
                ));
            };
            if !privileged(settings, author, pr_author, token) {
                return Err(EvalError::status_with(
                    StatusCode::NotAuthorized,
                    serde_json::json!({ "token": token, "author": author }),
                ));
            }
            opts.bypasses.insert(bypass);
            opts.active.push(bypass.token().to_string());
            return Ok(());
        }
    }
    opts.active.push(token.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn settings() -> RepoSettings {
        serde_json::from_value(serde_json::json!({
            "repository_host": "bitbucket",
            "repository_owner": "acme",
            "repository_slug": "widgets",
            "robot": "gwf-bot",
            "robot_email": "gwf-bot@acme.example",
            "build_key": "pre-merge",
            "clone_url": "/srv/git/widgets.git",
            "admins": ["root"],
            "pr_author_options": { "alice": ["bypass_jira_check"] }
        }))
        .unwrap()
    }

    fn comment(id: u64, author: &str, text: &str) -> Comment {
        Comment {
            id,
            author: author.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn options_accumulate_from_mentions_and_slashes() {
        let comments = vec![
            comment(1, "alice", "@gwf-bot approve"),
            comment(2, "bob", "/wait"),
            comment(3, "bob", "looks good to me"),
        ];
        let d = parse_comments(&comments, &settings(), "alice").unwrap();
        assert!(d.options.approved_by_author);
        assert!(d.options.wait);
        assert_eq!(d.options.active, vec!["approve", "wait"]);
    }

    #[test]
    fn approve_by_non_author_is_rejected() {
        let comments = vec![comment(1, "bob", "@gwf-bot approve")];
        let err = parse_comments(&comments, &settings(), "alice").unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::SourceDiverged));
    }

    #[test]
    fn bypass_requires_privilege() {
        let comments = vec![comment(1, "bob", "@gwf-bot bypass_build_status")];
        let err = parse_comments(&comments, &settings(), "alice").unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::NotAuthorized));
    }

    #[test]
    fn admin_cannot_bypass_own_pull_request() {
        let comments = vec![comment(1, "root", "@gwf-bot bypass_peer_approval")];
        let err = parse_comments(&comments, &settings(), "root").unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::NotAuthorized));

        let d = parse_comments(&comments, &settings(), "alice").unwrap();
        assert!(d.options.has_bypass(Bypass::PeerApproval));
    }

    #[test]
    fn author_grants_work_on_own_pull_request() {
        let comments = vec![comment(1, "alice", "/bypass_jira_check")];
        let d = parse_comments(&comments, &settings(), "alice").unwrap();
        assert!(d.options.has_bypass(Bypass::JiraCheck));
    }

    #[test]
    fn unknown_token_is_reported() {
        let comments = vec![comment(1, "bob", "@gwf-bot frobnicate")];
        let err = parse_comments(&comments, &settings(), "alice").unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::UnknownCommand));
    }

    #[test]
    fn robot_and_other_mentions_are_ignored() {
        let comments = vec![
            comment(1, "gwf-bot", "status 100"),
            comment(2, "bob", "@gwf-bot2 wait"),
            comment(3, "bob", "please @gwf-bot wait"),
        ];
        let d = parse_comments(&comments, &settings(), "alice").unwrap();
        assert!(!d.options.wait);
    }

    #[test]
    fn after_pull_request_collects_ids() {
        let comments = vec![
            comment(1, "bob", "/after_pull_request=12"),
            comment(2, "bob", "@gwf-bot after_pull_request=#34"),
        ];
        let d = parse_comments(&comments, &settings(), "alice").unwrap();
        assert_eq!(d.options.after_pull_requests, vec![12, 34]);
    }

    #[test]
    fn commands_are_consumed_by_robot_replies() {
        let comments = vec![
            comment(1, "alice", "/reset"),
            comment(2, "gwf-bot", "reset done"),
        ];
        let d = parse_comments(&comments, &settings(), "alice").unwrap();
        assert!(d.pending_commands.is_empty());

        let comments = vec![
            comment(1, "gwf-bot", "hello"),
            comment(2, "alice", "/force_reset"),
        ];
        let d = parse_comments(&comments, &settings(), "alice").unwrap();
        assert_eq!(
            d.pending_commands,
            vec![PendingCommand {
                kind: CommandKind::ForceReset,
                comment_id: 2
            }]
        );
    }
}
