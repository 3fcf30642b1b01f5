use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Process-level configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the cached mirror clones, one per repository.
    pub data_dir: String,
    /// Path to the per-repository settings file (JSON).
    pub settings_path: String,

    // Web API
    pub web_bind: String,
    pub web_port: u16,
    /// Token exchanged for an API session via GET /api/auth.
    pub api_token: String,

    // Dispatcher tuning
    /// Seconds between periodic scans for missed events. 0 disables.
    pub scan_interval_s: u64,
    /// Timeout applied to each external call (git network I/O, host REST).
    pub external_timeout_s: u64,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Config {
            data_dir: get_str("GWF_DATA_DIR", &dotenv, "store"),
            settings_path: get_str("GWF_SETTINGS", &dotenv, "settings.json"),
            web_bind: get_str("GWF_WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_u16("GWF_WEB_PORT", &dotenv, 8080),
            api_token: get_str("GWF_API_TOKEN", &dotenv, ""),
            scan_interval_s: get_u64("GWF_SCAN_INTERVAL_S", &dotenv, 600),
            external_timeout_s: get_u64("GWF_EXTERNAL_TIMEOUT_S", &dotenv, 60),
            max_retries: get_u32("GWF_MAX_RETRIES", &dotenv, 5),
        })
    }
}

// ── Per-repository settings ──────────────────────────────────────────────

/// Everything the robot needs to know about one repository, loaded from the
/// settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSettings {
    pub repository_host: String,
    pub repository_owner: String,
    pub repository_slug: String,

    /// Login the robot acts as; comments addressed to `@<robot>` are parsed.
    pub robot: String,
    pub robot_email: String,
    /// Build-status key inspected on integration and queue tips.
    pub build_key: String,

    #[serde(default)]
    pub required_peer_approvals: u32,
    #[serde(default)]
    pub required_leader_approvals: u32,
    #[serde(default)]
    pub need_author_approval: bool,

    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub project_leaders: Vec<String>,
    /// Per-author grants of otherwise-privileged options.
    #[serde(default)]
    pub pr_author_options: HashMap<String, Vec<String>>,

    // Issue tracker
    #[serde(default)]
    pub jira_account_url: String,
    #[serde(default)]
    pub jira_email: String,
    #[serde(default)]
    pub jira_keys: Vec<String>,
    /// Issue type → required branch prefix.
    #[serde(default)]
    pub prefixes: HashMap<String, String>,
    /// Source prefixes exempt from prefix and tracker checks.
    #[serde(default)]
    pub bypass_prefixes: Vec<String>,
    #[serde(default)]
    pub disable_version_checks: bool,

    /// Maximum commits the source may be ahead of its target. 0 disables.
    #[serde(default)]
    pub max_commit_diff: u32,
    #[serde(default)]
    pub always_create_integration_pull_requests: bool,
    #[serde(default)]
    pub always_create_integration_branches: bool,

    /// Serialize merges through the queue (direct merge when false).
    #[serde(default = "default_true")]
    pub use_queues: bool,

    /// Where the repository can be cloned from.
    pub clone_url: String,
}

fn default_true() -> bool {
    true
}

impl RepoSettings {
    pub fn load(path: &str) -> Result<Vec<RepoSettings>> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read settings file {path}"))?;
        let settings: Vec<RepoSettings> =
            serde_json::from_str(&contents).with_context(|| format!("parse {path}"))?;
        for s in &settings {
            s.validate()?;
        }
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.robot.is_empty(), "robot login must be set");
        anyhow::ensure!(!self.robot_email.is_empty(), "robot_email must be set");
        anyhow::ensure!(
            self.required_leader_approvals <= self.required_peer_approvals,
            "required_leader_approvals ({}) exceeds required_peer_approvals ({})",
            self.required_leader_approvals,
            self.required_peer_approvals
        );
        Ok(())
    }

    /// Identifier used for workspace directories and job routing.
    pub fn repo_key(&self) -> String {
        format!("{}/{}", self.repository_owner, self.repository_slug)
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.iter().any(|a| a == user)
    }

    pub fn is_leader(&self, user: &str) -> bool {
        self.project_leaders.iter().any(|l| l == user)
    }

    /// Tracker checks only run when a tracker is configured.
    pub fn tracker_enabled(&self) -> bool {
        !self.jira_account_url.is_empty()
    }

    /// Options the PR author may use on their own pull request.
    pub fn author_options(&self, author: &str) -> &[String] {
        self.pr_author_options
            .get(author)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> RepoSettings {
        serde_json::from_value(serde_json::json!({
            "repository_host": "bitbucket",
            "repository_owner": "acme",
            "repository_slug": "widgets",
            "robot": "gwf-bot",
            "robot_email": "gwf-bot@acme.example",
            "build_key": "pre-merge",
            "clone_url": "/srv/git/widgets.git"
        }))
        .unwrap()
    }

    #[test]
    fn defaults_are_sane() {
        let s = minimal();
        assert_eq!(s.required_peer_approvals, 0);
        assert!(s.use_queues);
        assert!(!s.need_author_approval);
        assert!(!s.tracker_enabled());
        assert_eq!(s.repo_key(), "acme/widgets");
    }

    #[test]
    fn leader_approvals_capped_by_peer_approvals() {
        let mut s = minimal();
        s.required_peer_approvals = 1;
        s.required_leader_approvals = 2;
        assert!(s.validate().is_err());
        s.required_peer_approvals = 2;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn author_options_lookup() {
        let mut s = minimal();
        s.pr_author_options
            .insert("alice".into(), vec!["bypass_jira_check".into()]);
        assert_eq!(s.author_options("alice"), ["bypass_jira_check".to_string()]);
        assert!(s.author_options("bob").is_empty());
    }
}
