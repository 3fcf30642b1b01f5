use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Thin wrapper around the `git` binary rooted at one working copy.
pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_path);
        cmd.args(args);

        let output = cmd.output().with_context(|| {
            format!("failed to spawn git -C {} {}", self.repo_path, args.join(" "))
        })?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    fn run(&self, args: &[&str]) -> Result<ExecResult> {
        let result = self.exec(args)?;
        if !result.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                result.combined_output()
            ));
        }
        Ok(result)
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        Ok(self.run(&["rev-parse", refname])?.stdout.trim().to_string())
    }

    /// True when `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let result = self.exec(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match result.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                result.combined_output()
            )),
        }
    }

    /// Number of commits reachable from `tip` but not `base`.
    pub fn ahead_count(&self, tip: &str, base: &str) -> Result<u64> {
        let range = format!("{base}..{tip}");
        let result = self.run(&["rev-list", "--count", &range])?;
        result
            .stdout
            .trim()
            .parse()
            .with_context(|| format!("parse rev-list --count output for {range}"))
    }

    /// Shas reachable from `tip` and none of `excludes`.
    pub fn commits_only_on(&self, tip: &str, excludes: &[&str]) -> Result<Vec<String>> {
        let mut args = vec!["rev-list".to_string(), tip.to_string()];
        for e in excludes {
            args.push(format!("^{e}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.run(&arg_refs)?;
        Ok(result.stdout.lines().map(str::to_string).collect())
    }

    /// Like `commits_only_on`, skipping merge commits.
    pub fn non_merge_commits_only_on(&self, tip: &str, excludes: &[&str]) -> Result<Vec<String>> {
        let mut args = vec![
            "rev-list".to_string(),
            "--no-merges".to_string(),
            tip.to_string(),
        ];
        for e in excludes {
            args.push(format!("^{e}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.run(&arg_refs)?;
        Ok(result.stdout.lines().map(str::to_string).collect())
    }

    /// Committer emails of the commits reachable from `tip` and none of
    /// `excludes`. Used to tell robot-owned commits from user-authored ones.
    pub fn committers_only_on(&self, tip: &str, excludes: &[&str]) -> Result<Vec<String>> {
        let mut args = vec![
            "log".to_string(),
            "--format=%ce".to_string(),
            tip.to_string(),
        ];
        for e in excludes {
            args.push(format!("^{e}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.run(&arg_refs)?;
        Ok(result.stdout.lines().map(str::to_string).collect())
    }

    // ── Local branch surgery ─────────────────────────────────────────────

    /// Create or reset a local branch at `start_point` and check it out.
    pub fn checkout_reset(&self, branch: &str, start_point: &str) -> Result<()> {
        self.run(&["checkout", "--quiet", "-B", branch, start_point])?;
        Ok(())
    }

    /// Merge one or more heads into the current checkout. Two and more
    /// heads in one call produce an octopus merge. Returns `false` and
    /// leaves the merge in progress when there are conflicts.
    pub fn merge(&self, heads: &[&str], message: &str) -> Result<bool> {
        let mut args = vec!["merge", "--no-ff", "--no-edit", "-m", message];
        args.extend_from_slice(heads);
        let result = self.exec(&args)?;
        if result.success() {
            return Ok(true);
        }
        let combined = result.combined_output();
        if combined.contains("CONFLICT")
            || combined.contains("Automatic merge failed")
            || combined.contains("Merge with strategy")
        {
            return Ok(false);
        }
        Err(anyhow!(
            "git merge {} failed: {combined}",
            heads.join(" ")
        ))
    }

    pub fn merge_abort(&self) -> Result<()> {
        // No-op when no merge is in progress.
        let _ = self.exec(&["merge", "--abort"])?;
        Ok(())
    }

    /// Paths left unmerged by a conflicting merge.
    pub fn conflicted_files(&self) -> Result<Vec<String>> {
        let result = self.run(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(result.stdout.lines().map(str::to_string).collect())
    }

    pub fn set_identity(&self, name: &str, email: &str) -> Result<()> {
        self.run(&["config", "user.name", name])?;
        self.run(&["config", "user.email", email])?;
        Ok(())
    }

    // ── Remote I/O ───────────────────────────────────────────────────────

    pub fn fetch(&self) -> Result<()> {
        self.run(&["fetch", "--prune", "origin"])?;
        Ok(())
    }

    /// Push one refspec. `force_with_lease` is only ever passed for
    /// integration (`w/`) branches; destinations and queue branches are
    /// pushed fast-forward.
    pub fn push(&self, refspec: &str, force_with_lease: bool) -> Result<ExecResult> {
        let result = if force_with_lease {
            self.exec(&["push", "--force-with-lease", "origin", refspec])?
        } else {
            self.exec(&["push", "origin", refspec])?
        };
        if !result.success() {
            return Err(anyhow!(
                "git push origin {refspec} failed: {}",
                result.combined_output()
            ));
        }
        Ok(result)
    }

    /// Push several refspecs in one atomic transaction; either every ref
    /// advances or none do.
    pub fn push_atomic(&self, refspecs: &[String]) -> Result<()> {
        let mut args = vec!["push", "--atomic", "origin"];
        args.extend(refspecs.iter().map(String::as_str));
        self.run(&args)?;
        Ok(())
    }

    pub fn delete_remote_branch(&self, branch: &str) -> Result<()> {
        self.run(&["push", "origin", "--delete", branch])?;
        Ok(())
    }

    pub fn tag(&self, name: &str, target: &str) -> Result<()> {
        self.run(&["tag", name, target])?;
        self.run(&["push", "origin", &format!("refs/tags/{name}")])?;
        Ok(())
    }
}

// ── Workspace ────────────────────────────────────────────────────────────

/// Cached clone of one repository plus an ls-remote cache.
///
/// The dispatcher guarantees a single writer per repository, so the cache
/// needs no interior locking; it is invalidated by any fetch or push.
pub struct Workspace {
    pub git: Git,
    refs: Option<HashMap<String, String>>,
}

impl Workspace {
    /// Open the cached clone under `data_dir`, cloning it first if absent.
    pub fn open(data_dir: &str, repo_key: &str, clone_url: &str) -> Result<Workspace> {
        let path = format!("{data_dir}/{repo_key}");
        if !Path::new(&path).join(".git").exists() {
            if let Some(parent) = Path::new(&path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create workspace dir {}", parent.display()))?;
            }
            let output = Command::new("git")
                .args(["clone", clone_url, path.as_str()])
                .output()
                .with_context(|| format!("failed to spawn git clone {clone_url}"))?;
            if !output.status.success() {
                return Err(anyhow!(
                    "git clone {clone_url} failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                ));
            }
        }
        Ok(Workspace {
            git: Git::new(path),
            refs: None,
        })
    }

    /// Refresh the local clone and drop the ref cache.
    pub fn update(&mut self) -> Result<()> {
        self.git.fetch()?;
        self.refs = None;
        Ok(())
    }

    /// Remote refs as `name → sha`, read through the cache.
    pub fn remote_refs(&mut self) -> Result<&HashMap<String, String>> {
        if self.refs.is_none() {
            let result = self.git.exec(&["ls-remote", "--heads", "origin"])?;
            if !result.success() {
                return Err(anyhow!(
                    "git ls-remote failed: {}",
                    result.combined_output()
                ));
            }
            let mut map = HashMap::new();
            for line in result.stdout.lines() {
                if let Some((sha, name)) = line.split_once('\t') {
                    if let Some(branch) = name.strip_prefix("refs/heads/") {
                        map.insert(branch.to_string(), sha.trim().to_string());
                    }
                }
            }
            self.refs = Some(map);
        }
        Ok(self.refs.get_or_insert_with(HashMap::new))
    }

    pub fn invalidate_refs(&mut self) {
        self.refs = None;
    }

    pub fn remote_branch_sha(&mut self, branch: &str) -> Result<Option<String>> {
        Ok(self.remote_refs()?.get(branch).cloned())
    }

    /// Remote branch names matching a prefix, e.g. `q/`.
    pub fn remote_branches_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .remote_refs()?
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}
