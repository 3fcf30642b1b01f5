use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::branch::{
    parse_integration_branch, parse_queue_item_branch, queue_branch, DestinationBranch,
    SourceBranch,
};
use crate::cascade::{build_cascade, Cascade};
use crate::commands::{parse_comments, CommandKind, Directives, Options};
use crate::config::{Config, RepoSettings};
use crate::errors::{EvalError, EvalResult};
use crate::gating::{evaluate, Approvals, IssueLookup, NextAction, PRFacts};
use crate::git::Workspace;
use crate::host::{
    BuildState, GitHost, HostError, PullRequestInfo, PullRequestState, ReviewState, TimedHost,
};
use crate::integration::{IntegrationBranch, IntegrationEngine};
use crate::jobs::{Job, JobHandler, JobKind};
use crate::messenger::{self, MessageSpec};
use crate::queue::{QueueManager, QueueView};
use crate::status::StatusCode;
use crate::tracker::IssueTracker;

fn host_err(e: HostError) -> EvalError {
    match e {
        HostError::Transient(msg) => EvalError::Transient(anyhow!(msg)),
        HostError::NotFound(what) => EvalError::NotMyJob(format!("{what} does not exist")),
        HostError::Other(e) => EvalError::Fatal(e),
    }
}

/// One repository's merge robot: owns the workspace, talks to the host and
/// tracker, and turns jobs into observable actions.
pub struct Robot {
    pub settings: RepoSettings,
    pub config: Arc<Config>,
    pub host: Arc<dyn GitHost>,
    pub tracker: Option<Arc<dyn IssueTracker>>,
    workspace: Mutex<Workspace>,
}

impl Robot {
    pub fn new(
        config: Arc<Config>,
        settings: RepoSettings,
        host: Arc<dyn GitHost>,
        tracker: Option<Arc<dyn IssueTracker>>,
    ) -> anyhow::Result<Robot> {
        let workspace = Workspace::open(&config.data_dir, &settings.repo_key(), &settings.clone_url)?;
        workspace
            .git
            .set_identity(&settings.robot, &settings.robot_email)?;
        // Every external call gets the configured timeout; overruns are
        // treated as transient and retried by the worker.
        let timeout = std::time::Duration::from_secs(config.external_timeout_s);
        let host: Arc<dyn GitHost> = Arc::new(TimedHost::new(host, timeout));
        Ok(Robot {
            settings,
            config,
            host,
            tracker,
            workspace: Mutex::new(workspace),
        })
    }

    // ── Shared helpers ───────────────────────────────────────────────────

    fn destinations(&self, workspace: &mut Workspace) -> EvalResult<Vec<DestinationBranch>> {
        let refs = workspace.remote_refs().map_err(EvalError::Transient)?;
        let mut destinations: Vec<DestinationBranch> = refs
            .keys()
            .filter_map(|name| DestinationBranch::parse(name))
            .collect();
        destinations.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(destinations)
    }

    async fn post(&self, pr_id: u64, spec: &MessageSpec, active_options: &[String]) -> EvalResult<bool> {
        messenger::post_once(
            self.host.as_ref(),
            pr_id,
            spec,
            active_options,
            &self.settings.robot,
        )
        .await
        .map_err(host_err)
    }

    /// Best-effort view of the active options, for message footers posted
    /// outside a full evaluation.
    async fn active_options(&self, pr_id: u64, pr_author: &str) -> Vec<String> {
        let Ok(comments) = self.host.list_comments(pr_id).await else {
            return Vec::new();
        };
        parse_comments(&comments, &self.settings, pr_author)
            .map(|d| d.options.active)
            .unwrap_or_default()
    }

    async fn approvals(&self, pr: &PullRequestInfo) -> EvalResult<Approvals> {
        let reviews = self.host.list_reviews(pr.id).await.map_err(host_err)?;
        // Later reviews supersede earlier ones from the same reviewer.
        let mut latest: HashMap<String, ReviewState> = HashMap::new();
        for review in reviews {
            latest.insert(review.reviewer, review.state);
        }
        let mut approvals = Approvals::default();
        for (reviewer, state) in latest {
            match state {
                ReviewState::Approved if reviewer == pr.author => {
                    approvals.author_approved = true;
                }
                ReviewState::Approved => approvals.peers.push(reviewer),
                ReviewState::ChangesRequested => approvals.change_requests.push(reviewer),
            }
        }
        approvals.peers.sort();
        approvals.change_requests.sort();
        Ok(approvals)
    }

    async fn issue_lookup(&self, source: &SourceBranch) -> EvalResult<IssueLookup> {
        if !self.settings.tracker_enabled()
            || source.tracker_exempt(&self.settings.bypass_prefixes)
        {
            return Ok(IssueLookup::Disabled);
        }
        let Some(tracker) = &self.tracker else {
            // No adapter wired in: tracker checks are disabled.
            return Ok(IssueLookup::Disabled);
        };
        let Some(key) = &source.issue_key else {
            // The reference check itself works off the branch name.
            return Ok(IssueLookup::Disabled);
        };
        match tracker.get_issue(key).await.map_err(host_err)? {
            Some(issue) => Ok(IssueLookup::Found(issue)),
            None => Ok(IssueLookup::NotFound(key.clone())),
        }
    }

    async fn builds_for(
        &self,
        source: &SourceBranch,
        source_sha: &str,
        integration: &[IntegrationBranch],
    ) -> EvalResult<Vec<(String, BuildState)>> {
        let mut builds = vec![(
            source.name.clone(),
            self.host
                .build_status(source_sha, &self.settings.build_key)
                .await
                .map_err(host_err)?,
        )];
        for w in integration {
            builds.push((
                w.name.clone(),
                self.host
                    .build_status(&w.tip, &self.settings.build_key)
                    .await
                    .map_err(host_err)?,
            ));
        }
        Ok(builds)
    }

    async fn dependencies(
        &self,
        options: &Options,
    ) -> EvalResult<Vec<(u64, PullRequestState)>> {
        let mut dependencies = Vec::new();
        for id in &options.after_pull_requests {
            let state = match self.host.get_pull_request(*id).await {
                Ok(pr) => pr.state,
                Err(HostError::NotFound(_)) => PullRequestState::Open,
                Err(e) => return Err(host_err(e)),
            };
            dependencies.push((*id, state));
        }
        Ok(dependencies)
    }

    /// Open the missing integration pull requests for review.
    async fn ensure_integration_prs(
        &self,
        pr_id: u64,
        integration: &[IntegrationBranch],
    ) -> EvalResult<()> {
        for w in integration {
            let existing = self
                .host
                .find_pull_request(&w.name, &w.destination)
                .await
                .map_err(host_err)?;
            if existing.is_none() {
                self.host
                    .create_pull_request(
                        &format!("Integration of #{pr_id} into {}", w.destination),
                        &w.name,
                        &w.destination,
                        &messenger::integration_pr_description(pr_id, &w.name),
                    )
                    .await
                    .map_err(host_err)?;
            }
        }
        Ok(())
    }

    async fn decline_integration_prs(&self, branches: &[String]) -> EvalResult<()> {
        if branches.is_empty() {
            return Ok(());
        }
        let open = self.host.list_open_pull_requests().await.map_err(host_err)?;
        for pr in open.iter().filter(|pr| branches.contains(&pr.source_branch)) {
            self.host
                .decline_pull_request(pr.id)
                .await
                .map_err(host_err)?;
        }
        Ok(())
    }

    // ── Pull request evaluation ──────────────────────────────────────────

    async fn handle_pull_request(
        &self,
        workspace: &mut Workspace,
        pr_id: u64,
    ) -> Result<String, EvalError> {
        workspace.update().map_err(EvalError::Transient)?;

        let pr = self.host.get_pull_request(pr_id).await.map_err(host_err)?;
        if pr.state != PullRequestState::Open {
            return Err(EvalError::NotMyJob(format!("pull request #{pr_id} is not open")));
        }

        let destinations = self.destinations(workspace)?;
        let Some(source) = SourceBranch::parse(&pr.source_branch) else {
            return Err(EvalError::status_with(
                StatusCode::IncorrectPrefix,
                serde_json::json!({
                    "prefix": pr.source_branch,
                    "allowed": crate::branch::STANDARD_PREFIXES,
                }),
            ));
        };
        let Some(cascade) = build_cascade(&destinations, &pr.destination_branch, &source.prefix)
        else {
            return Err(EvalError::NotMyJob(format!(
                "destination {} is not managed",
                pr.destination_branch
            )));
        };

        // One hello per pull request lifetime.
        let hello = MessageSpec::new(StatusCode::Hello, serde_json::json!({}));
        self.post(pr_id, &hello, &[]).await?;

        let comments = self.host.list_comments(pr_id).await.map_err(host_err)?;
        let directives = parse_comments(&comments, &self.settings, &pr.author)?;

        // Already queued: builds on queue branches drive it from here.
        let queued_prefix = format!("q/w/{pr_id}/");
        if !workspace
            .remote_branches_with_prefix(&queued_prefix)
            .map_err(EvalError::Transient)?
            .is_empty()
        {
            return Ok(format!("#{pr_id} is in the merge queue"));
        }

        self.run_commands(workspace, &pr, &cascade, &source, &directives)
            .await?;

        self.evaluate_pr(workspace, &pr, cascade, source, directives)
            .await
    }

    /// Execute pending one-shot commands, acknowledging each.
    async fn run_commands(
        &self,
        workspace: &mut Workspace,
        pr: &PullRequestInfo,
        cascade: &Cascade,
        source: &SourceBranch,
        directives: &Directives,
    ) -> EvalResult<()> {
        for command in &directives.pending_commands {
            let force = command.kind == CommandKind::ForceReset;
            let mut engine = IntegrationEngine::new(workspace, &self.settings);
            let deleted = engine.reset(cascade, source, force)?;
            self.decline_integration_prs(&deleted).await?;
            let ack = MessageSpec::new(
                StatusCode::ResetComplete,
                serde_json::json!({ "branches": deleted, "command": command.comment_id }),
            );
            self.post(pr.id, &ack, &directives.options.active).await?;
            info!("reset integration branches of #{}: {deleted:?}", pr.id);
        }
        Ok(())
    }

    async fn evaluate_pr(
        &self,
        workspace: &mut Workspace,
        pr: &PullRequestInfo,
        cascade: Cascade,
        source: SourceBranch,
        directives: Directives,
    ) -> Result<String, EvalError> {
        let options = directives.options;
        let target_ref = format!("origin/{}", cascade.target().name);
        let source_ref = format!("origin/{}", source.name);
        let source_sha = workspace
            .remote_branch_sha(&source.name)
            .map_err(EvalError::Transient)?
            .ok_or_else(|| EvalError::NotMyJob(format!("source {} is gone", source.name)))?;
        if source_sha != pr.source_sha {
            warn!(
                "#{}: host reports tip {} but {} is at {source_sha}",
                pr.id, pr.source_sha, source.name
            );
        }
        let commit_diff = workspace
            .git
            .ahead_count(&source_ref, &target_ref)
            .map_err(EvalError::Fatal)?;

        let issue = self.issue_lookup(&source).await?;
        let approvals = self.approvals(pr).await?;
        let dependencies = self.dependencies(&options).await?;

        let existing = {
            let refs = workspace.remote_refs().map_err(EvalError::Transient)?;
            crate::integration::integration_branch_names(&cascade, &source)
                .iter()
                .any(|name| refs.contains_key(name))
        };
        let requested = existing
            || self.settings.always_create_integration_branches
            || self.settings.always_create_integration_pull_requests
            || options.create_integration_branches
            || options.create_pull_requests;

        let mut integration: Vec<IntegrationBranch> = Vec::new();
        let mut deferred = true;

        for _ in 0..2 {
            let facts = PRFacts {
                pr: pr.clone(),
                source: source.clone(),
                cascade: cascade.clone(),
                options: options.clone(),
                approvals: approvals.clone(),
                commit_diff,
                issue: issue.clone(),
                integration: integration.clone(),
                integration_deferred: deferred,
                integration_requested: requested,
                builds: self.builds_for(&source, &source_sha, &integration).await?,
                dependencies: dependencies.clone(),
                host_supports_author_approval: self.host.supports_author_approval(),
            };

            match evaluate(&facts, &self.settings)? {
                NextAction::NeedIntegration => {
                    integration = self
                        .materialize(workspace, pr, &cascade, &source, &options)
                        .await?;
                    deferred = false;
                    continue;
                }
                NextAction::Wait(reason) => return Ok(format!("#{}: {reason}", pr.id)),
                NextAction::Queue => {
                    return self
                        .admit_to_queue(workspace, pr, &cascade, &source, &integration, &options)
                        .await;
                }
                NextAction::Merge => {
                    return self
                        .direct_merge(workspace, pr, &cascade, &integration, &options)
                        .await;
                }
            }
        }
        Err(EvalError::Fatal(anyhow!(
            "evaluation of #{} did not settle after materialization",
            pr.id
        )))
    }

    /// Build or refresh the `w/` branches, posting 121 on first creation.
    async fn materialize(
        &self,
        workspace: &mut Workspace,
        pr: &PullRequestInfo,
        cascade: &Cascade,
        source: &SourceBranch,
        options: &Options,
    ) -> EvalResult<Vec<IntegrationBranch>> {
        let mut engine = IntegrationEngine::new(workspace, &self.settings);
        let integration = engine.build(cascade, source, options)?;

        if integration.iter().any(|w| w.created) {
            let spec = MessageSpec::new(
                StatusCode::IntegrationDataCreated,
                serde_json::json!({
                    "branches": integration.iter().map(|w| w.name.clone()).collect::<Vec<_>>(),
                    "ignored": cascade.ignored,
                }),
            );
            self.post(pr.id, &spec, &options.active).await?;
        }

        if self.settings.always_create_integration_pull_requests || options.create_pull_requests {
            self.ensure_integration_prs(pr.id, &integration).await?;
        }
        Ok(integration)
    }

    async fn admit_to_queue(
        &self,
        workspace: &mut Workspace,
        pr: &PullRequestInfo,
        cascade: &Cascade,
        source: &SourceBranch,
        integration: &[IntegrationBranch],
        options: &Options,
    ) -> Result<String, EvalError> {
        let position = {
            let mut manager = QueueManager::new(workspace, &self.settings);
            let view = manager.read()?;
            let position = view.items.len();
            manager.admit(cascade, source, pr.id, integration)?;
            position
        };

        let spec = MessageSpec::new(
            StatusCode::Queued,
            serde_json::json!({ "position": position }),
        );
        self.post(pr.id, &spec, &options.active).await?;
        info!("#{} admitted to the queue at position {position}", pr.id);

        // The queue branches may already carry green builds (they often
        // fast-forward from the integration tips), so check right away.
        self.queue_check(workspace).await
    }

    /// Direct-merge path for repositories running without queues: stage a
    /// merge commit on the target and chain every forward destination on
    /// top, then push all destinations atomically.
    async fn direct_merge(
        &self,
        workspace: &mut Workspace,
        pr: &PullRequestInfo,
        cascade: &Cascade,
        integration: &[IntegrationBranch],
        options: &Options,
    ) -> Result<String, EvalError> {
        let git = &workspace.git;
        let staging = format!("gwf/stage/{}", pr.id);
        let target = cascade.target();
        git.checkout_reset(&staging, &format!("origin/{}", target.name))
            .map_err(EvalError::Fatal)?;
        if !git
            .merge(
                &[&format!("origin/{}", pr.source_branch)],
                &format!("Merge pull request #{} into {}", pr.id, target.name),
            )
            .map_err(EvalError::Fatal)?
        {
            git.merge_abort().map_err(EvalError::Fatal)?;
            return Err(EvalError::status_with(
                StatusCode::Conflict,
                serde_json::json!({
                    "origin": "feature",
                    "destination": target.name,
                    "target": target.name,
                    "source": pr.source_branch,
                    "files": [],
                }),
            ));
        }
        let mut prev = git.rev_parse(&staging).map_err(EvalError::Fatal)?;
        let mut refspecs = vec![format!("{prev}:refs/heads/{}", target.name)];
        let mut branches = vec![target.name.clone()];

        for w in integration {
            let chain = format!("gwf/stage/{}/{}", pr.id, w.version.label());
            git.checkout_reset(&chain, &w.tip).map_err(EvalError::Fatal)?;
            if !git
                .merge(&[&prev], &format!("Propagate {} into {}", target.name, w.destination))
                .map_err(EvalError::Fatal)?
            {
                git.merge_abort().map_err(EvalError::Fatal)?;
                return Err(EvalError::Fatal(anyhow!(
                    "unexpected conflict propagating into {}",
                    w.destination
                )));
            }
            prev = git.rev_parse(&chain).map_err(EvalError::Fatal)?;
            refspecs.push(format!("{prev}:refs/heads/{}", w.destination));
            branches.push(w.destination.clone());
        }

        git.push_atomic(&refspecs).map_err(EvalError::Transient)?;
        workspace.invalidate_refs();

        self.host.mark_merged(pr.id).await.map_err(host_err)?;
        let spec = MessageSpec::new(
            StatusCode::SuccessfulMerge,
            serde_json::json!({ "branches": branches }),
        );
        self.post(pr.id, &spec, &options.active).await?;
        Ok(format!("#{} merged into {} branches", pr.id, branches.len()))
    }

    // ── Queue handling ───────────────────────────────────────────────────

    /// Fill build states in, promote the green prefix, notify everyone.
    async fn queue_check(&self, workspace: &mut Workspace) -> Result<String, EvalError> {
        let read = {
            let mut manager = QueueManager::new(workspace, &self.settings);
            manager.read()
        };
        let mut view = match read {
            Ok(view) => view,
            Err(EvalError::UserFacing { code, context })
                if code == StatusCode::QueueOutOfOrder =>
            {
                return self.report_queue_disorder(workspace, context).await;
            }
            Err(e) => return Err(e),
        };
        if view.is_empty() {
            return Ok("queue is empty".to_string());
        }

        for item in &mut view.items {
            for entry in &mut item.lanes {
                entry.build = self
                    .host
                    .build_status(&entry.sha, &self.settings.build_key)
                    .await
                    .map_err(host_err)?;
            }
        }

        // Failed rows get their 118 on the PR itself.
        for item in &view.items {
            let failed: Vec<String> = item
                .lanes
                .iter()
                .filter(|l| l.build == BuildState::Failed)
                .map(|l| l.branch.clone())
                .collect();
            if !failed.is_empty() {
                let spec = MessageSpec::new(
                    StatusCode::BuildFailed,
                    serde_json::json!({ "branches": failed }),
                );
                self.post(item.pr_id, &spec, &[]).await?;
            }
        }

        let promotion = {
            let mut manager = QueueManager::new(workspace, &self.settings);
            manager.promote(&view, false)?
        };
        if promotion.merged.is_empty() {
            return Ok("queue waiting on builds".to_string());
        }

        for merged in &promotion.merged {
            self.host.mark_merged(merged.pr_id).await.map_err(host_err)?;
            let spec = if merged.is_partial() {
                MessageSpec::new(
                    StatusCode::PartialMerge,
                    serde_json::json!({
                        "commits": merged.merged_commits,
                        "missing": merged.missing_commits,
                    }),
                )
            } else {
                MessageSpec::new(
                    StatusCode::SuccessfulMerge,
                    serde_json::json!({ "branches": merged.branches }),
                )
            };
            self.post(merged.pr_id, &spec, &[]).await?;
            info!(
                "#{} promoted onto {:?}",
                merged.pr_id, merged.branches
            );
        }
        Ok(format!("promoted {} pull request(s)", promotion.merged.len()))
    }

    async fn report_queue_disorder(
        &self,
        workspace: &mut Workspace,
        context: serde_json::Value,
    ) -> Result<String, EvalError> {
        let spec = MessageSpec::new(StatusCode::QueueOutOfOrder, context);
        for pr_id in self.queued_pr_ids(workspace)? {
            self.post(pr_id, &spec, &[]).await?;
        }
        Ok("queue out of order; waiting for operator action".to_string())
    }

    fn queued_pr_ids(&self, workspace: &mut Workspace) -> EvalResult<Vec<u64>> {
        let names = workspace
            .remote_branches_with_prefix("q/w/")
            .map_err(EvalError::Transient)?;
        let mut ids: Vec<u64> = names
            .iter()
            .filter_map(|n| parse_queue_item_branch(n))
            .map(|i| i.pr_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Wipe the queue and re-evaluate everything that was in it.
    async fn rebuild_queues(&self, workspace: &mut Workspace) -> Result<String, EvalError> {
        workspace.update().map_err(EvalError::Transient)?;
        let pr_ids = {
            let mut manager = QueueManager::new(workspace, &self.settings);
            manager.delete_all().map_err(EvalError::Transient)?
        };
        let mut evaluated = 0;
        for pr_id in pr_ids {
            match self.handle_pull_request(workspace, pr_id).await {
                Ok(_) => evaluated += 1,
                Err(EvalError::UserFacing { code, context }) => {
                    self.report_for_pr(pr_id, code, &context).await;
                    evaluated += 1;
                }
                Err(EvalError::NotMyJob(reason)) => {
                    info!("rebuild: skipping #{pr_id}: {reason}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(format!("queue rebuilt; {evaluated} pull request(s) re-evaluated"))
    }

    async fn force_merge(&self, workspace: &mut Workspace) -> Result<String, EvalError> {
        workspace.update().map_err(EvalError::Transient)?;
        let view: QueueView = {
            let mut manager = QueueManager::new(workspace, &self.settings);
            manager.read()?
        };
        if view.is_empty() {
            return Ok("queue is empty".to_string());
        }
        let promotion = {
            let mut manager = QueueManager::new(workspace, &self.settings);
            manager.promote(&view, true)?
        };
        for merged in &promotion.merged {
            self.host.mark_merged(merged.pr_id).await.map_err(host_err)?;
            let spec = MessageSpec::new(
                StatusCode::SuccessfulMerge,
                serde_json::json!({ "branches": merged.branches }),
            );
            self.post(merged.pr_id, &spec, &[]).await?;
        }
        Ok(format!("force-merged {} pull request(s)", promotion.merged.len()))
    }

    // ── Branch management ────────────────────────────────────────────────

    async fn create_branch(
        &self,
        workspace: &mut Workspace,
        branch: &str,
        from: &str,
    ) -> Result<String, EvalError> {
        if DestinationBranch::parse(branch).is_none() {
            return Err(EvalError::Fatal(anyhow!(
                "{branch} is not a destination branch name"
            )));
        }
        workspace.update().map_err(EvalError::Transient)?;
        let git = &workspace.git;
        let sha = git
            .rev_parse(&format!("origin/{from}"))
            .or_else(|_| git.rev_parse(from))
            .map_err(EvalError::Fatal)?;
        git.push(&format!("{sha}:refs/heads/{branch}"), false)
            .map_err(EvalError::Transient)?;
        workspace.invalidate_refs();
        Ok(format!("created {branch} at {sha}"))
    }

    async fn delete_branch(
        &self,
        workspace: &mut Workspace,
        branch: &str,
    ) -> Result<String, EvalError> {
        let Some(destination) = DestinationBranch::parse(branch) else {
            return Err(EvalError::Fatal(anyhow!(
                "{branch} is not a destination branch name"
            )));
        };
        workspace.update().map_err(EvalError::Transient)?;
        let lane = queue_branch(&destination.version);
        if workspace
            .remote_branch_sha(&lane)
            .map_err(EvalError::Transient)?
            .is_some()
        {
            return Err(EvalError::Fatal(anyhow!(
                "cannot delete {branch}: queued changes exist on {lane}"
            )));
        }
        let sha = workspace
            .remote_branch_sha(branch)
            .map_err(EvalError::Transient)?
            .ok_or_else(|| EvalError::NotMyJob(format!("{branch} does not exist")))?;

        // The branch is replaced by an immutable tag at its tip.
        let git = &workspace.git;
        git.tag(&destination.deletion_tag(), &sha)
            .map_err(EvalError::Transient)?;
        git.delete_remote_branch(branch)
            .map_err(EvalError::Transient)?;
        workspace.invalidate_refs();
        Ok(format!(
            "deleted {branch}; tagged {} at {sha}",
            destination.deletion_tag()
        ))
    }

    // ── Event fan-out ────────────────────────────────────────────────────

    /// A commit or build event on some branch: find the affected PRs and
    /// re-evaluate each, reporting per-PR statuses inline.
    async fn handle_branch_event(
        &self,
        workspace: &mut Workspace,
        branch: &str,
    ) -> Result<String, EvalError> {
        if branch.starts_with("q/") {
            workspace.update().map_err(EvalError::Transient)?;
            return self.queue_check(workspace).await;
        }

        // A push to w/<version>/<src> is a conflict resolution on the
        // integration branch; route it to the parent PR.
        let source_name = parse_integration_branch(branch)
            .map(|(_, source)| source)
            .unwrap_or_else(|| branch.to_string());

        let open = self.host.list_open_pull_requests().await.map_err(host_err)?;
        let affected: Vec<u64> = open
            .iter()
            .filter(|pr| pr.source_branch == source_name)
            .map(|pr| pr.id)
            .collect();
        if affected.is_empty() {
            return Err(EvalError::NotMyJob(format!(
                "no open pull request for {branch}"
            )));
        }

        let mut outcomes: Vec<String> = Vec::new();
        for pr_id in affected {
            match self.handle_pull_request(workspace, pr_id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(EvalError::UserFacing { code, context }) => {
                    self.report_for_pr(pr_id, code, &context).await;
                    outcomes.push(format!("#{pr_id}: status {}", code.code()));
                }
                Err(EvalError::NotMyJob(reason)) => outcomes.push(reason),
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes.join("; "))
    }

    async fn report_for_pr(&self, pr_id: u64, code: StatusCode, context: &serde_json::Value) {
        let author = self
            .host
            .get_pull_request(pr_id)
            .await
            .map(|pr| pr.author)
            .unwrap_or_default();
        let options = self.active_options(pr_id, &author).await;
        let spec = MessageSpec::new(code, context.clone());
        if let Err(e) = self.post(pr_id, &spec, &options).await {
            warn!("failed to post status {} on #{pr_id}: {e}", code.code());
        }
    }
}

// ── JobHandler ───────────────────────────────────────────────────────────

#[async_trait]
impl JobHandler for Robot {
    async fn process(&self, job: &Job) -> Result<String, EvalError> {
        let mut workspace = self.workspace.lock().await;
        match &job.kind {
            JobKind::PullRequest { pr_id } => {
                self.handle_pull_request(&mut workspace, *pr_id).await
            }
            JobKind::Commit { branch, .. } | JobKind::BuildStatus { branch, .. } => {
                self.handle_branch_event(&mut workspace, branch).await
            }
            JobKind::QueueRebuild => self.rebuild_queues(&mut workspace).await,
            JobKind::ForceMerge => self.force_merge(&mut workspace).await,
            JobKind::DeleteQueues => {
                workspace.update().map_err(EvalError::Transient)?;
                let mut manager = QueueManager::new(&mut workspace, &self.settings);
                let pr_ids = manager.delete_all().map_err(EvalError::Transient)?;
                Ok(format!("deleted queues of {} pull request(s)", pr_ids.len()))
            }
            JobKind::CreateBranch { branch, from } => {
                self.create_branch(&mut workspace, branch, from).await
            }
            JobKind::DeleteBranch { branch } => {
                self.delete_branch(&mut workspace, branch).await
            }
        }
    }

    async fn report(&self, job: &Job, code: StatusCode, context: &serde_json::Value) {
        if let JobKind::PullRequest { pr_id } = &job.kind {
            self.report_for_pr(*pr_id, code, context).await;
        } else {
            warn!(
                "job #{} ended with status {} but has no pull request to notify",
                job.id,
                code.code()
            );
        }
    }

    async fn report_internal_error(&self, job: &Job) {
        if let JobKind::PullRequest { pr_id } = &job.kind {
            let spec = MessageSpec::new(
                StatusCode::InternalError,
                serde_json::json!({ "job": job.id }),
            );
            if let Err(e) = self.post(*pr_id, &spec, &[]).await {
                warn!("failed to post internal error on #{pr_id}: {e}");
            }
        }
    }
}
