use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::branch::{integration_branch, SourceBranch, Version};
use crate::cascade::Cascade;
use crate::commands::Options;
use crate::config::RepoSettings;
use crate::errors::{EvalError, EvalResult};
use crate::git::{Git, Workspace};
use crate::status::StatusCode;

/// One materialized `w/` branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationBranch {
    pub name: String,
    pub destination: String,
    pub version: Version,
    pub tip: String,
    pub created: bool,
}

/// Names of the integration branches a cascade implies, in order. `W_0` is
/// the source branch itself and is never materialized.
pub fn integration_branch_names(cascade: &Cascade, source: &SourceBranch) -> Vec<String> {
    cascade
        .forward()
        .iter()
        .map(|d| integration_branch(&d.version, &source.name))
        .collect()
}

enum MergeAttempt {
    Clean,
    Conflicts(Vec<String>),
}

/// Merge `heads` into the current checkout, octopus first when allowed,
/// falling back to consecutive two-way merges. On double failure the
/// reported conflict set is the attempt that conflicted least.
fn robust_merge(git: &Git, heads: &[&str], allow_octopus: bool, message: &str) -> Result<MergeAttempt> {
    let mut best: Option<Vec<String>> = None;

    if heads.len() >= 2 && allow_octopus {
        if git.merge(heads, message)? {
            return Ok(MergeAttempt::Clean);
        }
        let files = git.conflicted_files()?;
        git.merge_abort()?;
        best = Some(files);
    }

    for head in heads {
        if git.merge(&[head], message)? {
            continue;
        }
        let files = git.conflicted_files()?;
        git.merge_abort()?;
        let fewer = match &best {
            Some(prev) => files.len() < prev.len(),
            None => true,
        };
        if fewer {
            best = Some(files);
        }
        return Ok(MergeAttempt::Conflicts(best.unwrap_or_default()));
    }
    Ok(MergeAttempt::Clean)
}

/// Builds and maintains the `w/` branches of one pull request.
pub struct IntegrationEngine<'a> {
    pub workspace: &'a mut Workspace,
    pub settings: &'a RepoSettings,
}

impl<'a> IntegrationEngine<'a> {
    pub fn new(workspace: &'a mut Workspace, settings: &'a RepoSettings) -> Self {
        Self { workspace, settings }
    }

    /// Create or update every integration branch of the cascade and push
    /// the ones that changed. Conflicts surface as status 114 with the
    /// remediation role, stale first-branch history as 113.
    pub fn build(
        &mut self,
        cascade: &Cascade,
        source: &SourceBranch,
        options: &Options,
    ) -> EvalResult<Vec<IntegrationBranch>> {
        let target_name = cascade.target().name.clone();
        let source_ref = format!("origin/{}", source.name);
        let allow_octopus = !options.no_octopus;

        let mut result: Vec<IntegrationBranch> = Vec::new();
        // W_0 is the source itself.
        let mut prev_ref = source_ref.clone();

        for (index, dest) in cascade.forward().iter().enumerate() {
            let first = index == 0;
            let name = integration_branch(&dest.version, &source.name);
            let dest_ref = format!("origin/{}", dest.name);
            let remote_tip = self
                .workspace
                .remote_branch_sha(&name)
                .map_err(EvalError::Transient)?;

            let git = &self.workspace.git;
            let mut created = false;
            let mut changed = false;

            match remote_tip {
                Some(tip) => {
                    if first {
                        self.check_divergence(&name, &tip, &source_ref, &dest_ref)?;
                    }
                    git.checkout_reset(&name, &tip).map_err(EvalError::Fatal)?;
                    // Merge in whichever inputs advanced since the last pass.
                    let mut heads: Vec<&str> = Vec::new();
                    if !git.is_ancestor(&prev_ref, &name).map_err(EvalError::Fatal)? {
                        heads.push(&prev_ref);
                    }
                    if !git.is_ancestor(&dest_ref, &name).map_err(EvalError::Fatal)? {
                        heads.push(&dest_ref);
                    }
                    if !heads.is_empty() {
                        let message = format!("Merge into {name}");
                        match robust_merge(git, &heads, allow_octopus, &message)
                            .map_err(EvalError::Fatal)?
                        {
                            MergeAttempt::Clean => changed = true,
                            MergeAttempt::Conflicts(files) => {
                                return Err(self.conflict(
                                    first, dest, &target_name, source, &name, files,
                                ));
                            }
                        }
                    }
                }
                None => {
                    created = true;
                    changed = true;
                    git.checkout_reset(&name, &dest_ref).map_err(EvalError::Fatal)?;
                    let message = format!("Merge {} into {name}", source.name);
                    match robust_merge(git, &[prev_ref.as_str()], allow_octopus, &message)
                        .map_err(EvalError::Fatal)?
                    {
                        MergeAttempt::Clean => {}
                        MergeAttempt::Conflicts(files) => {
                            return Err(self.conflict(
                                first, dest, &target_name, source, &name, files,
                            ));
                        }
                    }
                }
            }

            if changed {
                git.push(&name, true).map_err(EvalError::Transient)?;
                self.workspace.invalidate_refs();
            }
            let tip = self
                .workspace
                .git
                .rev_parse(&name)
                .map_err(EvalError::Fatal)?;

            result.push(IntegrationBranch {
                name: name.clone(),
                destination: dest.name.clone(),
                version: dest.version,
                tip,
                created,
            });
            prev_ref = name;
        }

        Ok(result)
    }

    /// Status 113 when the first integration branch carries non-merge
    /// commits that belong to neither the source nor its destination —
    /// the usual sign of a rewritten source history. User conflict
    /// resolutions live inside merge commits and never trip this.
    fn check_divergence(
        &self,
        name: &str,
        tip: &str,
        source_ref: &str,
        dest_ref: &str,
    ) -> EvalResult<()> {
        let foreign = self
            .workspace
            .git
            .non_merge_commits_only_on(tip, &[source_ref, dest_ref])
            .map_err(EvalError::Fatal)?;
        if foreign.is_empty() {
            return Ok(());
        }
        Err(EvalError::status_with(
            StatusCode::HistoryMismatch,
            serde_json::json!({ "branch": name, "commits": foreign }),
        ))
    }

    fn conflict(
        &self,
        first: bool,
        dest: &crate::branch::DestinationBranch,
        target_name: &str,
        source: &SourceBranch,
        branch: &str,
        files: Vec<String>,
    ) -> EvalError {
        let origin = if first { "feature" } else { "integration" };
        EvalError::status_with(
            StatusCode::Conflict,
            serde_json::json!({
                "origin": origin,
                "destination": dest.name,
                "target": target_name,
                "source": source.name,
                "branch": branch,
                "files": files,
            }),
        )
    }

    /// Delete every integration branch of the cascade.
    ///
    /// Refuses (status 132) when a branch carries commits whose committer
    /// is not the robot, unless `force` is set. Returns the names deleted.
    pub fn reset(
        &mut self,
        cascade: &Cascade,
        source: &SourceBranch,
        force: bool,
    ) -> EvalResult<Vec<String>> {
        let source_ref = format!("origin/{}", source.name);
        let mut prev_ref: Option<String> = None;
        let mut to_delete: Vec<String> = Vec::new();

        for dest in cascade.forward() {
            let name = integration_branch(&dest.version, &source.name);
            let Some(tip) = self
                .workspace
                .remote_branch_sha(&name)
                .map_err(EvalError::Transient)?
            else {
                continue;
            };
            if !force {
                let dest_ref = format!("origin/{}", dest.name);
                let mut excludes: Vec<&str> = vec![&source_ref, &dest_ref];
                if let Some(prev) = &prev_ref {
                    excludes.push(prev);
                }
                let committers = self
                    .workspace
                    .git
                    .committers_only_on(&tip, &excludes)
                    .map_err(EvalError::Fatal)?;
                if committers.iter().any(|c| c != &self.settings.robot_email) {
                    return Err(EvalError::status_with(
                        StatusCode::ResetHistoryMismatch,
                        serde_json::json!({ "branch": name }),
                    ));
                }
            }
            to_delete.push(name.clone());
            prev_ref = Some(format!("origin/{name}"));
        }

        for name in &to_delete {
            self.workspace
                .git
                .delete_remote_branch(name)
                .map_err(EvalError::Transient)?;
        }
        self.workspace.invalidate_refs();
        Ok(to_delete)
    }
}
