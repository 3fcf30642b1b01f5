use serde::{Deserialize, Serialize};

// ── Versions ─────────────────────────────────────────────────────────────

/// Version carried by a destination branch name.
///
/// `development/4` has no minor, `development/4.3` no patch; a missing
/// component sorts *after* every concrete value of that component, so
/// `stabilization/4.3.17` < `development/4.3` < `development/4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: Option<u64>,
    pub patch: Option<u64>,
}

impl Version {
    pub fn new(major: u64, minor: Option<u64>, patch: Option<u64>) -> Self {
        Self { major, minor, patch }
    }

    fn sort_key(&self) -> (u64, u64, u64) {
        (
            self.major,
            self.minor.unwrap_or(u64::MAX),
            self.patch.unwrap_or(u64::MAX),
        )
    }

    /// `"4"`, `"4.3"` or `"4.3.17"` — the form used inside `w/`, `q/` and
    /// tag names.
    pub fn label(&self) -> String {
        match (self.minor, self.patch) {
            (Some(mi), Some(pa)) => format!("{}.{}.{}", self.major, mi, pa),
            (Some(mi), None) => format!("{}.{}", self.major, mi),
            _ => format!("{}", self.major),
        }
    }

    /// True when both versions live on the same `major.minor` line.
    pub fn same_line(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

fn parse_dotted(s: &str) -> Option<Vec<u64>> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    parts.iter().map(|p| p.parse::<u64>().ok()).collect()
}

// ── Destination branches ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Development,
    Stabilization,
}

/// A release line the robot manages. Never mutated by the core; discovered
/// by fetch and replaced by an immutable tag on deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationBranch {
    pub name: String,
    pub kind: DestinationKind,
    pub version: Version,
}

impl DestinationBranch {
    /// Parse a remote branch name. Returns `None` for branches the robot
    /// does not manage (`hotfix/*`, `user/*`, feature branches, ...).
    pub fn parse(name: &str) -> Option<DestinationBranch> {
        if let Some(rest) = name.strip_prefix("development/") {
            let nums = parse_dotted(rest)?;
            let version = match nums.as_slice() {
                [major] => Version::new(*major, None, None),
                [major, minor] => Version::new(*major, Some(*minor), None),
                _ => return None,
            };
            return Some(DestinationBranch {
                name: name.to_string(),
                kind: DestinationKind::Development,
                version,
            });
        }
        if let Some(rest) = name.strip_prefix("stabilization/") {
            let nums = parse_dotted(rest)?;
            let [major, minor, patch] = nums.as_slice() else {
                return None;
            };
            return Some(DestinationBranch {
                name: name.to_string(),
                kind: DestinationKind::Stabilization,
                version: Version::new(*major, Some(*minor), Some(*patch)),
            });
        }
        None
    }

    /// Tag applied in place of the branch when it is deleted.
    pub fn deletion_tag(&self) -> String {
        self.version.label()
    }
}

// ── Source branches ──────────────────────────────────────────────────────

pub const STANDARD_PREFIXES: &[&str] = &["feature", "bugfix", "improvement", "project"];

/// The user's branch behind a pull request, parsed from its ref name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBranch {
    pub name: String,
    pub prefix: String,
    pub issue_key: Option<String>,
}

impl SourceBranch {
    pub fn parse(name: &str) -> Option<SourceBranch> {
        let (prefix, rest) = name.split_once('/')?;
        if prefix.is_empty() || rest.is_empty() {
            return None;
        }
        Some(SourceBranch {
            name: name.to_string(),
            prefix: prefix.to_string(),
            issue_key: extract_issue_key(rest),
        })
    }

    /// A prefix is permitted when standard or whitelisted in the settings.
    pub fn prefix_allowed(&self, bypass_prefixes: &[String]) -> bool {
        STANDARD_PREFIXES.contains(&self.prefix.as_str())
            || bypass_prefixes.iter().any(|p| p == &self.prefix)
    }

    /// Prefixes exempt from issue-tracker checks.
    pub fn tracker_exempt(&self, bypass_prefixes: &[String]) -> bool {
        self.prefix == "project" || bypass_prefixes.iter().any(|p| p == &self.prefix)
    }
}

/// Leading `KEY-123` issue reference of a branch name, if any.
fn extract_issue_key(rest: &str) -> Option<String> {
    let (project, tail) = rest.split_once('-')?;
    if project.len() < 2 || !project.chars().next()?.is_ascii_uppercase() {
        return None;
    }
    if !project.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
        return None;
    }
    let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    Some(format!("{project}-{digits}"))
}

// ── Robot-owned branch names ─────────────────────────────────────────────

/// `w/<version>/<source>` — integration branch for one forward destination.
pub fn integration_branch(version: &Version, source: &str) -> String {
    format!("w/{}/{}", version.label(), source)
}

/// `q/<version>` — queue lane for one destination.
pub fn queue_branch(version: &Version) -> String {
    format!("q/{}", version.label())
}

/// `q/w/<pr_id>/<version>/<source>` — one PR's contribution to a lane.
pub fn queue_item_branch(pr_id: u64, version: &Version, source: &str) -> String {
    format!("q/w/{}/{}/{}", pr_id, version.label(), source)
}

/// Parsed form of a `q/w/...` ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItemRef {
    pub pr_id: u64,
    pub version: Version,
    pub source: String,
}

/// Parse `q/<version>` into the lane's version.
pub fn parse_queue_branch(name: &str) -> Option<Version> {
    let rest = name.strip_prefix("q/")?;
    if rest.starts_with("w/") {
        return None;
    }
    let nums = parse_dotted(rest)?;
    Some(match nums.as_slice() {
        [major] => Version::new(*major, None, None),
        [major, minor] => Version::new(*major, Some(*minor), None),
        [major, minor, patch] => Version::new(*major, Some(*minor), Some(*patch)),
        _ => return None,
    })
}

/// Parse `q/w/<pr_id>/<version>/<source>`.
pub fn parse_queue_item_branch(name: &str) -> Option<QueueItemRef> {
    let rest = name.strip_prefix("q/w/")?;
    let (pr_part, rest) = rest.split_once('/')?;
    let pr_id = pr_part.parse::<u64>().ok()?;
    let (version_part, source) = rest.split_once('/')?;
    let nums = parse_dotted(version_part)?;
    let version = match nums.as_slice() {
        [major] => Version::new(*major, None, None),
        [major, minor] => Version::new(*major, Some(*minor), None),
        [major, minor, patch] => Version::new(*major, Some(*minor), Some(*patch)),
        _ => return None,
    };
    if source.is_empty() {
        return None;
    }
    Some(QueueItemRef {
        pr_id,
        version,
        source: source.to_string(),
    })
}

/// Parse `w/<version>/<source>`.
pub fn parse_integration_branch(name: &str) -> Option<(Version, String)> {
    let rest = name.strip_prefix("w/")?;
    let (version_part, source) = rest.split_once('/')?;
    let nums = parse_dotted(version_part)?;
    let version = match nums.as_slice() {
        [major] => Version::new(*major, None, None),
        [major, minor] => Version::new(*major, Some(*minor), None),
        [major, minor, patch] => Version::new(*major, Some(*minor), Some(*patch)),
        _ => return None,
    };
    if source.is_empty() {
        return None;
    }
    Some((version, source.to_string()))
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_missing_components_sort_last() {
        let stab = Version::new(4, Some(3), Some(17));
        let dev_minor = Version::new(4, Some(3), None);
        let dev_major = Version::new(4, None, None);
        let newer = Version::new(5, Some(0), None);
        assert!(stab < dev_minor);
        assert!(dev_minor < dev_major);
        assert!(dev_major < newer);
    }

    #[test]
    fn parse_development_branches() {
        let d = DestinationBranch::parse("development/4.3").unwrap();
        assert_eq!(d.kind, DestinationKind::Development);
        assert_eq!(d.version, Version::new(4, Some(3), None));
        assert_eq!(d.version.label(), "4.3");

        let d = DestinationBranch::parse("development/10").unwrap();
        assert_eq!(d.version, Version::new(10, None, None));
        assert_eq!(d.version.label(), "10");
    }

    #[test]
    fn parse_stabilization_branch() {
        let d = DestinationBranch::parse("stabilization/4.3.17").unwrap();
        assert_eq!(d.kind, DestinationKind::Stabilization);
        assert_eq!(d.version.label(), "4.3.17");
    }

    #[test]
    fn unmanaged_branches_are_rejected() {
        assert!(DestinationBranch::parse("hotfix/4.2.1").is_none());
        assert!(DestinationBranch::parse("user/alice/wip").is_none());
        assert!(DestinationBranch::parse("feature/PROJ-1-x").is_none());
        assert!(DestinationBranch::parse("development/abc").is_none());
        assert!(DestinationBranch::parse("stabilization/4.3").is_none());
    }

    #[test]
    fn source_branch_with_issue_key() {
        let s = SourceBranch::parse("bugfix/PROJ-1234-fix-the-thing").unwrap();
        assert_eq!(s.prefix, "bugfix");
        assert_eq!(s.issue_key.as_deref(), Some("PROJ-1234"));
    }

    #[test]
    fn source_branch_without_issue_key() {
        let s = SourceBranch::parse("feature/shiny-new-thing").unwrap();
        assert_eq!(s.prefix, "feature");
        assert_eq!(s.issue_key, None);

        let s = SourceBranch::parse("improvement/lowercase-proj-12").unwrap();
        assert_eq!(s.issue_key, None);
    }

    #[test]
    fn prefix_allowance() {
        let s = SourceBranch::parse("docs/update-readme").unwrap();
        assert!(!s.prefix_allowed(&[]));
        assert!(s.prefix_allowed(&["docs".to_string()]));
        let s = SourceBranch::parse("bugfix/x").unwrap();
        assert!(s.prefix_allowed(&[]));
    }

    #[test]
    fn robot_branch_name_round_trips() {
        let v = Version::new(4, Some(3), None);
        assert_eq!(integration_branch(&v, "bugfix/PROJ-1-x"), "w/4.3/bugfix/PROJ-1-x");
        assert_eq!(queue_branch(&v), "q/4.3");
        assert_eq!(
            queue_item_branch(77, &v, "bugfix/PROJ-1-x"),
            "q/w/77/4.3/bugfix/PROJ-1-x"
        );

        let (pv, src) = parse_integration_branch("w/4.3/bugfix/PROJ-1-x").unwrap();
        assert_eq!(pv, v);
        assert_eq!(src, "bugfix/PROJ-1-x");

        let item = parse_queue_item_branch("q/w/77/4.3/bugfix/PROJ-1-x").unwrap();
        assert_eq!(item.pr_id, 77);
        assert_eq!(item.version, v);
        assert_eq!(item.source, "bugfix/PROJ-1-x");

        assert_eq!(parse_queue_branch("q/4.3"), Some(v));
        // q/w/... refs are not lanes
        assert_eq!(parse_queue_branch("q/w/77/4.3/x"), None);
    }
}
