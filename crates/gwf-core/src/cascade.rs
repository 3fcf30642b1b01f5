use serde::{Deserialize, Serialize};

use crate::branch::{DestinationBranch, DestinationKind};

/// Prefixes whose changes flow through stabilization branches as well as
/// development lines.
fn prefix_admits_stabilization(prefix: &str) -> bool {
    matches!(prefix, "bugfix" | "improvement")
}

/// True when a source with this prefix may target a destination of this kind.
pub fn prefix_compatible(prefix: &str, kind: DestinationKind) -> bool {
    match kind {
        DestinationKind::Development => true,
        DestinationKind::Stabilization => prefix_admits_stabilization(prefix),
    }
}

/// The ordered list of destination branches one pull request must traverse,
/// beginning at its target, plus the destinations it will not touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cascade {
    pub branches: Vec<DestinationBranch>,
    pub ignored: Vec<String>,
}

impl Cascade {
    /// `d_0` — the pull request's declared target.
    pub fn target(&self) -> &DestinationBranch {
        &self.branches[0]
    }

    /// Destinations strictly after the target, in cascade order. These are
    /// the branches that get a `w/` integration branch.
    pub fn forward(&self) -> &[DestinationBranch] {
        &self.branches[1..]
    }

    pub fn versions(&self) -> Vec<String> {
        self.branches.iter().map(|d| d.version.label()).collect()
    }
}

/// Compute the cascade for a pull request.
///
/// Returns `None` when `target_name` is not a live managed destination —
/// the caller treats that as not-my-job.
///
/// Membership: the target, then every strictly newer destination, with
/// stabilization branches admitted only for prefixes that flow through
/// them. Everything else managed is reported in `ignored` so the user sees
/// which branches their change will not reach.
pub fn build_cascade(
    destinations: &[DestinationBranch],
    target_name: &str,
    source_prefix: &str,
) -> Option<Cascade> {
    let target = destinations.iter().find(|d| d.name == target_name)?.clone();
    let admit_stab = prefix_admits_stabilization(source_prefix);

    let mut branches: Vec<DestinationBranch> = Vec::new();
    let mut ignored: Vec<String> = Vec::new();

    for d in destinations {
        if d.name == target.name {
            continue;
        }
        let newer = d.version > target.version;
        let included = newer
            && match d.kind {
                DestinationKind::Development => true,
                DestinationKind::Stabilization => admit_stab,
            };
        if included {
            branches.push(d.clone());
        } else {
            ignored.push(d.name.clone());
        }
    }

    branches.push(target);
    branches.sort_by(|a, b| a.version.cmp(&b.version));
    ignored.sort();

    Some(Cascade { branches, ignored })
}
