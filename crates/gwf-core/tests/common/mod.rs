#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use gwf_core::config::{Config, RepoSettings};
use gwf_core::host::InMemoryHost;
use gwf_core::jobs::{run_worker, Job, JobHandler, JobKind, JobQueue, JobStatus};
use gwf_core::robot::Robot;
use gwf_core::tracker::InMemoryTracker;
use tempfile::TempDir;

/// A scratch "origin" plus a user clone to push seed history from.
pub struct Sandbox {
    pub dir: TempDir,
    pub origin: PathBuf,
    pub clone: PathBuf,
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("spawn git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {args:?} failed: {}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

impl Sandbox {
    pub fn new() -> Sandbox {
        let dir = tempfile::tempdir().expect("tempdir");
        let origin = dir.path().join("origin.git");
        let clone = dir.path().join("clone");
        std::fs::create_dir_all(&origin).expect("mkdir origin");
        git(&origin, &["init", "--bare", "--initial-branch=main"]);
        git(dir.path(), &["clone", origin.to_str().expect("utf8"), "clone"]);
        git(&clone, &["config", "user.name", "Seed User"]);
        git(&clone, &["config", "user.email", "seed@users.example"]);
        Sandbox { dir, origin, clone }
    }

    /// Commit a file on a branch (creating it from `start` if needed) and
    /// push. Returns the new tip sha.
    pub fn commit(&self, branch: &str, start: Option<&str>, file: &str, content: &str) -> String {
        let exists = Command::new("git")
            .arg("-C")
            .arg(&self.clone)
            .args(["rev-parse", "--verify", "--quiet", branch])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if exists {
            git(&self.clone, &["checkout", "--quiet", branch]);
        } else {
            match start {
                Some(start) => {
                    git(&self.clone, &["fetch", "--quiet", "origin"]);
                    git(
                        &self.clone,
                        &["checkout", "--quiet", "-b", branch, &format!("origin/{start}")],
                    );
                }
                None => {
                    git(&self.clone, &["checkout", "--quiet", "--orphan", branch]);
                }
            }
        }
        let path = self.clone.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&path, content).expect("write file");
        git(&self.clone, &["add", "."]);
        git(
            &self.clone,
            &["commit", "--quiet", "-m", &format!("update {file} on {branch}")],
        );
        git(&self.clone, &["push", "--quiet", "origin", branch]);
        git(&self.clone, &["rev-parse", "HEAD"])
    }

    /// Merge `other` into `branch` in the user clone, resolving conflicts by
    /// taking the given file contents, then push.
    pub fn merge_with_resolution(
        &self,
        branch: &str,
        other: &str,
        resolutions: &[(&str, &str)],
    ) -> String {
        git(&self.clone, &["fetch", "--quiet", "origin"]);
        git(&self.clone, &["checkout", "--quiet", branch]);
        let merge = Command::new("git")
            .arg("-C")
            .arg(&self.clone)
            .args(["merge", "--no-edit", &format!("origin/{other}")])
            .output()
            .expect("spawn git merge");
        if !merge.status.success() {
            for (file, content) in resolutions {
                std::fs::write(self.clone.join(file), content).expect("resolve");
                git(&self.clone, &["add", file]);
            }
            git(&self.clone, &["commit", "--quiet", "--no-edit"]);
        }
        git(&self.clone, &["push", "--quiet", "origin", branch]);
        git(&self.clone, &["rev-parse", "HEAD"])
    }

    /// Tip of a branch as origin sees it.
    pub fn sha(&self, branch: &str) -> String {
        git(&self.origin, &["rev-parse", &format!("refs/heads/{branch}")])
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        Command::new("git")
            .arg("-C")
            .arg(&self.origin)
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        Command::new("git")
            .arg("-C")
            .arg(&self.origin)
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Push a commit straight onto a robot-owned branch, as a misbehaving
    /// user would, with a configurable committer identity.
    pub fn rogue_commit(&self, branch: &str, file: &str, content: &str, email: &str) -> String {
        git(&self.clone, &["fetch", "--quiet", "origin"]);
        git(
            &self.clone,
            &["checkout", "--quiet", "-B", branch, &format!("origin/{branch}")],
        );
        std::fs::write(self.clone.join(file), content).expect("write");
        git(&self.clone, &["add", "."]);
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.clone)
            .env("GIT_COMMITTER_EMAIL", email)
            .env("GIT_COMMITTER_NAME", "Rogue")
            .args(["commit", "--quiet", "-m", "direct edit"])
            .output()
            .expect("spawn git commit");
        assert!(output.status.success(), "rogue commit failed");
        git(&self.clone, &["push", "--quiet", "origin", branch]);
        git(&self.clone, &["rev-parse", "HEAD"])
    }
}

/// Everything a scenario needs: sandbox, host, robot worker, job queue.
pub struct Harness {
    pub sandbox: Sandbox,
    pub host: Arc<InMemoryHost>,
    pub tracker: Arc<InMemoryTracker>,
    pub queue: Arc<JobQueue>,
    pub settings: RepoSettings,
}

pub fn settings_json(clone_url: &str) -> serde_json::Value {
    serde_json::json!({
        "repository_host": "test",
        "repository_owner": "acme",
        "repository_slug": "widgets",
        "robot": "gwf-bot",
        "robot_email": "gwf-bot@acme.example",
        "build_key": "pre-merge",
        "clone_url": clone_url,
        "required_peer_approvals": 2,
        "need_author_approval": true,
        "admins": ["root"],
        "always_create_integration_branches": true
    })
}

impl Harness {
    pub async fn start(mutate: impl FnOnce(&mut serde_json::Value)) -> Harness {
        let sandbox = Sandbox::new();
        let mut json = settings_json(sandbox.origin.to_str().expect("utf8"));
        mutate(&mut json);
        let settings: RepoSettings = serde_json::from_value(json).expect("settings");

        let config = Arc::new(Config {
            data_dir: sandbox
                .dir
                .path()
                .join("store")
                .to_str()
                .expect("utf8")
                .to_string(),
            settings_path: String::new(),
            web_bind: String::new(),
            web_port: 0,
            api_token: String::new(),
            scan_interval_s: 0,
            external_timeout_s: 60,
            max_retries: 2,
        });

        let host = Arc::new(InMemoryHost::new(&settings.robot));
        let tracker = Arc::new(InMemoryTracker::new());
        let robot = Arc::new(
            Robot::new(
                config,
                settings.clone(),
                host.clone(),
                Some(tracker.clone()),
            )
            .expect("robot"),
        );

        let (queue, wake) = JobQueue::new();
        tokio::spawn(run_worker(
            queue.clone(),
            wake,
            robot as Arc<dyn JobHandler>,
            Arc::new(AtomicBool::new(false)),
            2,
        ));

        Harness {
            sandbox,
            host,
            tracker,
            queue,
            settings,
        }
    }

    /// Enqueue a job and wait for the worker to finish it.
    pub async fn run(&self, kind: JobKind) -> Job {
        let id = self.queue.enqueue(kind, None).expect("enqueue");
        self.wait_for(id).await
    }

    pub async fn wait_for(&self, id: u64) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            if let Some(job) = self.queue.get(id) {
                if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
                    return job;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job #{id} did not finish in time"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// All robot comments on a PR, as rendered text.
    pub async fn robot_comments(&self, pr_id: u64) -> Vec<String> {
        use gwf_core::host::GitHost;
        self.host
            .list_comments(pr_id)
            .await
            .expect("comments")
            .into_iter()
            .filter(|c| c.author == self.settings.robot)
            .map(|c| c.text)
            .collect()
    }

    pub async fn has_status(&self, pr_id: u64, code: u16) -> bool {
        self.robot_comments(pr_id)
            .await
            .iter()
            .any(|text| text.contains(&format!("status: {code} ")))
    }

    pub async fn comment_count(&self, pr_id: u64) -> usize {
        use gwf_core::host::GitHost;
        self.host.list_comments(pr_id).await.expect("comments").len()
    }
}
