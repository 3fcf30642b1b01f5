use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::branch::{
    parse_queue_branch, parse_queue_item_branch, queue_branch, queue_item_branch,
    DestinationBranch, SourceBranch, Version,
};
use crate::cascade::Cascade;
use crate::config::RepoSettings;
use crate::errors::{EvalError, EvalResult};
use crate::git::Workspace;
use crate::host::BuildState;
use crate::integration::IntegrationBranch;
use crate::status::StatusCode;

// ── Queue model ──────────────────────────────────────────────────────────

/// One PR's branch in one lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneEntry {
    pub lane: Version,
    pub branch: String,
    pub sha: String,
    pub build: BuildState,
}

/// One queued pull request across every lane of its cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    pub pr_id: u64,
    pub source: String,
    /// Sorted by lane version; every lane of the item's cascade.
    pub lanes: Vec<LaneEntry>,
}

impl QueuedItem {
    pub fn lane(&self, version: &Version) -> Option<&LaneEntry> {
        self.lanes.iter().find(|l| &l.lane == version)
    }

    fn lane_versions(&self) -> Vec<Version> {
        self.lanes.iter().map(|l| l.lane).collect()
    }
}

/// A destination lane and the refs backing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lane {
    pub version: Version,
    pub branch: String,
    pub sha: String,
    pub destination: String,
    pub destination_sha: String,
}

/// Snapshot of the whole queue, reconstructed from `q/*` refs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueView {
    pub lanes: Vec<Lane>,
    /// Items in admission order.
    pub items: Vec<QueuedItem>,
}

impl QueueView {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, pr_id: u64) -> bool {
        self.items.iter().any(|i| i.pr_id == pr_id)
    }

    pub fn pr_ids(&self) -> Vec<u64> {
        self.items.iter().map(|i| i.pr_id).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Green,
    Red,
    Pending,
}

/// All lanes successful → green; any failure → red; otherwise pending.
pub fn row_status(item: &QueuedItem) -> RowStatus {
    if item
        .lanes
        .iter()
        .any(|l| l.build == BuildState::Failed)
    {
        return RowStatus::Red;
    }
    if item
        .lanes
        .iter()
        .all(|l| l.build == BuildState::Successful)
    {
        return RowStatus::Green;
    }
    RowStatus::Pending
}

/// Length of the longest promotable prefix of the queue.
///
/// An item is promotable when it is green itself, or when it is still
/// pending and a later green item's lane set covers it — the later item's
/// queue branches contain every commit of the earlier one per lane, so a
/// green build there validates both. A red row always blocks: an explicit
/// failure is authoritative and no downstream build overrides it.
pub fn promotable_prefix(items: &[QueuedItem]) -> usize {
    let covered_green = |index: usize| -> bool {
        let lanes = items[index].lane_versions();
        items.iter().skip(index + 1).any(|later| {
            row_status(later) == RowStatus::Green
                && lanes.iter().all(|v| later.lane(v).is_some())
        })
    };

    let mut prefix = 0;
    for (i, item) in items.iter().enumerate() {
        let promotable = match row_status(item) {
            RowStatus::Green => true,
            RowStatus::Red => false,
            RowStatus::Pending => covered_green(i),
        };
        if promotable {
            prefix = i + 1;
        } else {
            break;
        }
    }
    prefix
}

// ── Manager ──────────────────────────────────────────────────────────────

/// Outcome of one promotion pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Promotion {
    /// Destination branch name → new tip.
    pub advanced: Vec<(String, String)>,
    pub merged: Vec<MergedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedItem {
    pub pr_id: u64,
    pub source: String,
    /// Destination branches this PR now lives on.
    pub branches: Vec<String>,
    /// Source commits left behind because they were pushed after admission.
    /// Empty for a full merge.
    pub missing_commits: Vec<String>,
    /// Source commits that were actually merged (reported on partial merge).
    pub merged_commits: Vec<String>,
}

impl MergedItem {
    pub fn is_partial(&self) -> bool {
        !self.missing_commits.is_empty()
    }
}

pub struct QueueManager<'a> {
    pub workspace: &'a mut Workspace,
    pub settings: &'a RepoSettings,
}

impl<'a> QueueManager<'a> {
    pub fn new(workspace: &'a mut Workspace, settings: &'a RepoSettings) -> Self {
        Self { workspace, settings }
    }

    /// Reconstruct the queue from remote refs, verifying lane ancestry.
    ///
    /// Build states come back as `NotStarted`; the caller fills them in
    /// from the host before computing promotions.
    pub fn read(&mut self) -> EvalResult<QueueView> {
        let refs = self
            .workspace
            .remote_refs()
            .map_err(EvalError::Transient)?
            .clone();

        let mut lanes: Vec<Lane> = Vec::new();
        let mut entries: BTreeMap<Version, Vec<(u64, String, String, String)>> = BTreeMap::new();

        for (name, sha) in &refs {
            if let Some(version) = parse_queue_branch(name) {
                let destination = refs
                    .iter()
                    .find_map(|(n, s)| {
                        DestinationBranch::parse(n)
                            .filter(|d| d.version == version)
                            .map(|d| (d.name, s.clone()))
                    })
                    .ok_or_else(|| self.out_of_order(format!("lane {name} has no destination")))?;
                lanes.push(Lane {
                    version,
                    branch: name.clone(),
                    sha: sha.clone(),
                    destination: destination.0,
                    destination_sha: destination.1,
                });
            } else if let Some(item) = parse_queue_item_branch(name) {
                entries.entry(item.version).or_default().push((
                    item.pr_id,
                    item.source,
                    name.clone(),
                    sha.clone(),
                ));
            }
        }
        lanes.sort_by(|a, b| a.version.cmp(&b.version));

        // Order each lane's entries by ancestry and verify the chain.
        let mut per_lane: BTreeMap<Version, Vec<(u64, String, String, String)>> = BTreeMap::new();
        for (version, mut list) in entries {
            let lane = lanes
                .iter()
                .find(|l| l.version == version)
                .ok_or_else(|| self.out_of_order(format!("items without a q/{version} lane")))?;
            self.sort_by_ancestry(&mut list)?;
            self.verify_chain(lane, &list)?;
            per_lane.insert(version, list);
        }

        // Global admission order comes from the longest lane; every cascade
        // ends at the newest development branch, so that lane sees all PRs.
        let longest: Vec<u64> = per_lane
            .values()
            .max_by_key(|list| list.len())
            .map(|list| list.iter().map(|(pr, ..)| *pr).collect())
            .unwrap_or_default();

        for (version, list) in &per_lane {
            let order: Vec<u64> = list.iter().map(|(pr, ..)| *pr).collect();
            if !is_subsequence(&order, &longest) {
                return Err(self.out_of_order(format!(
                    "lane q/{version} order {order:?} disagrees with {longest:?}"
                )));
            }
        }

        let mut items: Vec<QueuedItem> = Vec::new();
        for pr_id in longest {
            let mut source = String::new();
            let mut item_lanes: Vec<LaneEntry> = Vec::new();
            for list in per_lane.values() {
                if let Some((_, src, branch, sha)) = list.iter().find(|(pr, ..)| *pr == pr_id) {
                    source = src.clone();
                    item_lanes.push(LaneEntry {
                        lane: parse_queue_item_branch(branch)
                            .map(|i| i.version)
                            .ok_or_else(|| {
                                EvalError::Fatal(anyhow!("unparseable queue ref {branch}"))
                            })?,
                        branch: branch.clone(),
                        sha: sha.clone(),
                        build: BuildState::NotStarted,
                    });
                }
            }
            item_lanes.sort_by(|a, b| a.lane.cmp(&b.lane));
            items.push(QueuedItem {
                pr_id,
                source,
                lanes: item_lanes,
            });
        }

        Ok(QueueView { lanes, items })
    }

    fn out_of_order(&self, detail: String) -> EvalError {
        EvalError::status_with(
            StatusCode::QueueOutOfOrder,
            serde_json::json!({ "detail": detail }),
        )
    }

    /// Order one lane's entries so that each is an ancestor of the next.
    fn sort_by_ancestry(&self, list: &mut [(u64, String, String, String)]) -> EvalResult<()> {
        let git = &self.workspace.git;
        let mut ranked: Vec<(usize, usize)> = Vec::new();
        for (i, (_, _, _, sha)) in list.iter().enumerate() {
            let mut ancestors = 0;
            for (j, (_, _, _, other)) in list.iter().enumerate() {
                if i != j && git.is_ancestor(other, sha).map_err(EvalError::Fatal)? {
                    ancestors += 1;
                }
            }
            ranked.push((i, ancestors));
        }
        ranked.sort_by_key(|(_, rank)| *rank);
        let reordered: Vec<_> = ranked.iter().map(|(i, _)| list[*i].clone()).collect();
        list.clone_from_slice(&reordered);
        Ok(())
    }

    fn verify_chain(&self, lane: &Lane, list: &[(u64, String, String, String)]) -> EvalResult<()> {
        let git = &self.workspace.git;
        let mut prev = lane.destination_sha.clone();
        for (_, _, branch, sha) in list {
            if !git.is_ancestor(&prev, sha).map_err(EvalError::Fatal)? {
                return Err(self.out_of_order(format!(
                    "{branch} does not descend from its predecessor"
                )));
            }
            prev = sha.clone();
        }
        if let Some((_, _, _, last)) = list.last() {
            if last != &lane.sha {
                return Err(self.out_of_order(format!(
                    "{} does not point at its last item",
                    lane.branch
                )));
            }
        }
        Ok(())
    }

    /// Admit a green pull request into every lane of its cascade.
    ///
    /// All lane branches are built locally first; a conflict anywhere
    /// rejects the whole admission (status 130) without touching what is
    /// already queued.
    pub fn admit(
        &mut self,
        cascade: &Cascade,
        source: &SourceBranch,
        pr_id: u64,
        integration: &[IntegrationBranch],
    ) -> EvalResult<Vec<LaneEntry>> {
        let view = self.read()?;
        if view.contains(pr_id) {
            return Err(EvalError::NotMyJob(format!("#{pr_id} already queued")));
        }

        let mut refspecs: Vec<String> = Vec::new();
        let mut entries: Vec<LaneEntry> = Vec::new();
        // Tip of this PR's item branch in the previous lane. Merging it into
        // every later lane keeps each destination a superset of the one
        // before it once the prefix is promoted.
        let mut prev_item: Option<String> = None;

        for dest in &cascade.branches {
            // Content for the target lane is the source itself (W_0).
            let content = integration
                .iter()
                .find(|w| w.version == dest.version)
                .map(|w| w.tip.clone());
            let content = match content {
                Some(tip) => tip,
                None => self
                    .workspace
                    .remote_branch_sha(&source.name)
                    .map_err(EvalError::Transient)?
                    .ok_or_else(|| {
                        EvalError::Fatal(anyhow!("source branch {} vanished", source.name))
                    })?,
            };

            let lane_branch = queue_branch(&dest.version);
            let parent = match view.lanes.iter().find(|l| l.version == dest.version) {
                Some(lane) => lane.sha.clone(),
                None => self
                    .workspace
                    .remote_branch_sha(&dest.name)
                    .map_err(EvalError::Transient)?
                    .ok_or_else(|| {
                        EvalError::Fatal(anyhow!(
                            "destination {} vanished while queueing",
                            dest.name
                        ))
                    })?,
            };

            let item_branch = queue_item_branch(pr_id, &dest.version, &source.name);
            let git = &self.workspace.git;
            git.checkout_reset(&item_branch, &parent)
                .map_err(EvalError::Fatal)?;
            let message = format!("Queue #{pr_id} on {}", dest.name);
            let mut heads: Vec<&str> = Vec::new();
            if let Some(prev) = &prev_item {
                heads.push(prev);
            }
            heads.push(&content);
            for head in heads {
                if !git.merge(&[head], &message).map_err(EvalError::Fatal)? {
                    git.merge_abort().map_err(EvalError::Fatal)?;
                    return Err(EvalError::status_with(
                        StatusCode::QueueConflict,
                        serde_json::json!({ "lane": lane_branch, "pr": pr_id }),
                    ));
                }
            }
            let sha = git.rev_parse(&item_branch).map_err(EvalError::Fatal)?;

            refspecs.push(format!("{sha}:refs/heads/{item_branch}"));
            refspecs.push(format!("{sha}:refs/heads/{lane_branch}"));
            entries.push(LaneEntry {
                lane: dest.version,
                branch: item_branch,
                sha: sha.clone(),
                build: BuildState::NotStarted,
            });
            prev_item = Some(sha);
        }

        // Nothing was pushed while building; publish the whole admission
        // in one transaction.
        self.workspace
            .git
            .push_atomic(&refspecs)
            .map_err(EvalError::Transient)?;
        self.workspace.invalidate_refs();
        Ok(entries)
    }

    /// Fast-forward destinations to the promotable prefix.
    ///
    /// With `force`, every queued item is promoted regardless of builds.
    pub fn promote(&mut self, view: &QueueView, force: bool) -> EvalResult<Promotion> {
        let prefix = if force {
            view.items.len()
        } else {
            promotable_prefix(&view.items)
        };
        if prefix == 0 {
            return Ok(Promotion::default());
        }
        let promoted = &view.items[..prefix];

        // Boundary per lane: the last promoted item present in that lane.
        let mut refspecs: Vec<String> = Vec::new();
        let mut advanced: Vec<(String, String)> = Vec::new();
        for lane in &view.lanes {
            let boundary = promoted
                .iter()
                .rev()
                .find_map(|item| item.lane(&lane.version))
                .map(|entry| entry.sha.clone());
            let Some(boundary) = boundary else {
                continue;
            };
            let git = &self.workspace.git;
            if !git
                .is_ancestor(&lane.destination_sha, &boundary)
                .map_err(EvalError::Fatal)?
            {
                return Err(self.out_of_order(format!(
                    "{} cannot fast-forward to {boundary}",
                    lane.destination
                )));
            }
            refspecs.push(format!("{boundary}:refs/heads/{}", lane.destination));
            advanced.push((lane.destination.clone(), boundary));
        }

        self.workspace
            .git
            .push_atomic(&refspecs)
            .map_err(EvalError::Transient)?;
        self.workspace.invalidate_refs();

        let mut merged: Vec<MergedItem> = Vec::new();
        for item in promoted {
            merged.push(self.merged_item(view, item)?);
        }

        // Drop the promoted queue refs; drop lanes left without items.
        for item in promoted {
            for entry in &item.lanes {
                self.workspace
                    .git
                    .delete_remote_branch(&entry.branch)
                    .map_err(EvalError::Transient)?;
            }
        }
        if prefix == view.items.len() {
            for lane in &view.lanes {
                self.workspace
                    .git
                    .delete_remote_branch(&lane.branch)
                    .map_err(EvalError::Transient)?;
            }
        }
        self.workspace.invalidate_refs();

        Ok(Promotion { advanced, merged })
    }

    /// Compare what was queued with the source branch as it is now.
    fn merged_item(&mut self, view: &QueueView, item: &QueuedItem) -> EvalResult<MergedItem> {
        let branches: Vec<String> = view
            .lanes
            .iter()
            .filter(|l| item.lane(&l.version).is_some())
            .map(|l| l.destination.clone())
            .collect();
        let first = item.lanes.first().ok_or_else(|| {
            EvalError::Fatal(anyhow!("queued item #{} has no lanes", item.pr_id))
        })?;
        let base = view
            .lanes
            .iter()
            .find(|l| l.version == first.lane)
            .map(|l| l.destination_sha.clone());

        let mut missing: Vec<String> = Vec::new();
        let mut included: Vec<String> = Vec::new();
        if let Some(source_sha) = self
            .workspace
            .remote_branch_sha(&item.source)
            .map_err(EvalError::Transient)?
        {
            let git = &self.workspace.git;
            if !git
                .is_ancestor(&source_sha, &first.sha)
                .map_err(EvalError::Fatal)?
            {
                missing = git
                    .commits_only_on(&source_sha, &[&first.sha])
                    .map_err(EvalError::Fatal)?;
                if let Some(base) = &base {
                    included = git
                        .commits_only_on(&source_sha, &[base])
                        .map_err(EvalError::Fatal)?
                        .into_iter()
                        .filter(|sha| !missing.contains(sha))
                        .collect();
                }
            }
        }

        Ok(MergedItem {
            pr_id: item.pr_id,
            source: item.source.clone(),
            branches,
            missing_commits: missing,
            merged_commits: included,
        })
    }

    /// Delete every queue branch. Returns the PRs that were queued so the
    /// caller can schedule their re-evaluation.
    pub fn delete_all(&mut self) -> Result<Vec<u64>> {
        let refs = self.workspace.remote_branches_with_prefix("q/")?;
        let mut pr_ids: Vec<u64> = Vec::new();
        for name in &refs {
            if let Some(item) = parse_queue_item_branch(name) {
                if !pr_ids.contains(&item.pr_id) {
                    pr_ids.push(item.pr_id);
                }
            }
        }
        for name in refs {
            self.workspace.git.delete_remote_branch(&name)?;
        }
        self.workspace.invalidate_refs();
        Ok(pr_ids)
    }
}

fn is_subsequence(needle: &[u64], haystack: &[u64]) -> bool {
    let mut it = haystack.iter();
    needle.iter().all(|n| it.any(|h| h == n))
}
