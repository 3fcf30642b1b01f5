//! Property tests for the cascade builder and the queue prefix computation.

use gwf_core::branch::{DestinationBranch, Version};
use gwf_core::cascade::build_cascade;
use gwf_core::host::BuildState;
use gwf_core::queue::{promotable_prefix, row_status, LaneEntry, QueuedItem, RowStatus};
use proptest::prelude::*;

fn destination_set() -> impl Strategy<Value = Vec<DestinationBranch>> {
    // Majors 1..=4, optional minor, plus stabilization patches hanging off
    // the minor lines. Deduplicated by name.
    proptest::collection::vec(
        (1u64..5, proptest::option::of(0u64..4), proptest::option::of(1u64..4)),
        1..8,
    )
    .prop_map(|seeds| {
        let mut out: Vec<DestinationBranch> = Vec::new();
        for (major, minor, patch) in seeds {
            let name = match (minor, patch) {
                (Some(minor), Some(patch)) => format!("stabilization/{major}.{minor}.{patch}"),
                (Some(minor), None) => format!("development/{major}.{minor}"),
                _ => format!("development/{major}"),
            };
            if out.iter().all(|d| d.name != name) {
                if let Some(d) = DestinationBranch::parse(&name) {
                    out.push(d);
                }
            }
        }
        out
    })
    .prop_filter("need at least one destination", |v| !v.is_empty())
}

fn prefix_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("feature"),
        Just("bugfix"),
        Just("improvement"),
        Just("project"),
    ]
}

proptest! {
    /// The cascade is monotone by version, begins at the target, and
    /// together with the ignored set partitions the destinations.
    #[test]
    fn cascade_is_monotone_and_partitions(
        destinations in destination_set(),
        target_index in any::<prop::sample::Index>(),
        prefix in prefix_strategy(),
    ) {
        let target = &destinations[target_index.index(destinations.len())];
        let cascade = build_cascade(&destinations, &target.name, prefix)
            .expect("target is in the set");

        prop_assert_eq!(&cascade.branches[0].name, &target.name);
        for pair in cascade.branches.windows(2) {
            prop_assert!(pair[0].version < pair[1].version);
        }
        for d in cascade.forward() {
            prop_assert!(d.version > target.version);
        }

        let mut seen: Vec<&str> = cascade
            .branches
            .iter()
            .map(|d| d.name.as_str())
            .chain(cascade.ignored.iter().map(String::as_str))
            .collect();
        seen.sort_unstable();
        let mut all: Vec<&str> = destinations.iter().map(|d| d.name.as_str()).collect();
        all.sort_unstable();
        prop_assert_eq!(seen, all);
    }

    /// Feature changes never traverse stabilization branches.
    #[test]
    fn feature_cascades_are_development_only(
        destinations in destination_set(),
        target_index in any::<prop::sample::Index>(),
    ) {
        let target = &destinations[target_index.index(destinations.len())];
        let cascade = build_cascade(&destinations, &target.name, "feature")
            .expect("target is in the set");
        for d in cascade.forward() {
            prop_assert!(d.name.starts_with("development/"));
        }
    }
}

// ── Queue prefix properties ──────────────────────────────────────────────

fn build_state() -> impl Strategy<Value = BuildState> {
    prop_oneof![
        Just(BuildState::NotStarted),
        Just(BuildState::InProgress),
        Just(BuildState::Successful),
        Just(BuildState::Failed),
    ]
}

fn queue_items() -> impl Strategy<Value = Vec<QueuedItem>> {
    // Lane sets are suffixes of the cascade (every cascade ends at the
    // newest development line), which matches real queues.
    proptest::collection::vec((0usize..3, proptest::collection::vec(build_state(), 3)), 0..6)
        .prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .map(|(i, (start, builds))| QueuedItem {
                    pr_id: i as u64 + 1,
                    source: format!("bugfix/PROJ-{i}-x"),
                    lanes: (start..3)
                        .map(|lane| LaneEntry {
                            lane: Version::new(lane as u64 + 1, Some(0), None),
                            branch: format!("q/w/{}/{}.0/x", i + 1, lane + 1),
                            sha: format!("{i}-{lane}"),
                            build: builds[lane],
                        })
                        .collect(),
                })
                .collect()
        })
}

proptest! {
    /// The promotable prefix never includes a red row, never exceeds the
    /// queue, and swallows the whole queue when everything is green.
    #[test]
    fn prefix_is_sound(items in queue_items()) {
        let prefix = promotable_prefix(&items);
        prop_assert!(prefix <= items.len());
        for item in &items[..prefix] {
            prop_assert!(row_status(item) != RowStatus::Red);
        }
        if items.iter().all(|i| row_status(i) == RowStatus::Green) {
            prop_assert_eq!(prefix, items.len());
        }
        // The first item past the prefix is never green on its own.
        if prefix < items.len() {
            prop_assert!(row_status(&items[prefix]) != RowStatus::Green);
        }
    }

    /// Upgrading one build to successful never shrinks the prefix.
    #[test]
    fn prefix_grows_monotonically(items in queue_items(), pick in any::<prop::sample::Index>()) {
        prop_assume!(!items.is_empty());
        let before = promotable_prefix(&items);

        let mut upgraded = items.clone();
        let item = pick.index(upgraded.len());
        prop_assume!(!upgraded[item].lanes.is_empty());
        let lane = pick.index(upgraded[item].lanes.len());
        prop_assume!(upgraded[item].lanes[lane].build != BuildState::Failed);
        upgraded[item].lanes[lane].build = BuildState::Successful;

        prop_assert!(promotable_prefix(&upgraded) >= before);
    }
}
