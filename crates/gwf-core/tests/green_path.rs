//! End-to-end: a bugfix flows through integration, the queue, and lands on
//! every development line.

mod common;

use common::Harness;
use gwf_core::host::{BuildState, GitHost, PullRequestState, ReviewState};
use gwf_core::jobs::JobKind;

const KEY: &str = "pre-merge";

/// Walk one PR from hello to merged across development/1.0 and 2.0.
#[tokio::test]
async fn bugfix_is_merged_across_the_cascade() {
    let h = Harness::start(|_| {}).await;
    h.sandbox.commit("development/1.0", None, "README.md", "v1\n");
    h.sandbox
        .commit("development/2.0", Some("development/1.0"), "CHANGES.md", "v2\n");
    let source_sha = h
        .sandbox
        .commit("bugfix/PROJ-1-x", Some("development/1.0"), "fix.txt", "fixed\n");

    let pr_id = h
        .host
        .seed_pull_request("alice", "bugfix/PROJ-1-x", "development/1.0", &source_sha);
    h.host.add_review(pr_id, "alice", ReviewState::Approved);
    h.host.add_review(pr_id, "bob", ReviewState::Approved);
    h.host.add_review(pr_id, "carol", ReviewState::Approved);

    // First pass: hello + integration data, then waiting on builds.
    let job = h.run(JobKind::PullRequest { pr_id }).await;
    assert!(job.details.as_deref().unwrap_or("").contains("builds"));
    assert!(h.has_status(pr_id, 100).await, "hello missing");
    assert!(h.has_status(pr_id, 121).await, "integration data missing");
    assert!(h.sandbox.branch_exists("w/2.0/bugfix/PROJ-1-x"));

    // Builds go green on the source and the integration tip.
    let w_tip = h.sandbox.sha("w/2.0/bugfix/PROJ-1-x");
    h.host.set_build(&source_sha, KEY, BuildState::Successful);
    h.host.set_build(&w_tip, KEY, BuildState::Successful);

    // Second pass: the PR is admitted to the queue.
    h.run(JobKind::PullRequest { pr_id }).await;
    assert!(h.has_status(pr_id, 101).await, "queued notification missing");
    assert!(h.sandbox.branch_exists("q/1.0"));
    assert!(h.sandbox.branch_exists("q/2.0"));

    // Queue builds go green; a build event promotes the prefix.
    let q1 = h.sandbox.sha("q/w/1/1.0/bugfix/PROJ-1-x");
    let q2 = h.sandbox.sha("q/w/1/2.0/bugfix/PROJ-1-x");
    h.host.set_build(&q1, KEY, BuildState::Successful);
    h.host.set_build(&q2, KEY, BuildState::Successful);
    h.run(JobKind::BuildStatus {
        sha: q2.clone(),
        branch: "q/w/1/2.0/bugfix/PROJ-1-x".into(),
    })
    .await;

    assert!(h.has_status(pr_id, 102).await, "merged notification missing");
    let pr = h.host.get_pull_request(pr_id).await.unwrap();
    assert_eq!(pr.state, PullRequestState::Merged);

    // Both destinations advanced, and forward propagation holds: every
    // commit of development/1.0 is on development/2.0.
    assert_eq!(h.sandbox.sha("development/1.0"), q1);
    assert_eq!(h.sandbox.sha("development/2.0"), q2);
    assert!(h.sandbox.is_ancestor(&source_sha, &q1));
    assert!(h
        .sandbox
        .is_ancestor(&h.sandbox.sha("development/1.0"), &h.sandbox.sha("development/2.0")));

    // Queue refs are gone.
    assert!(!h.sandbox.branch_exists("q/1.0"));
    assert!(!h.sandbox.branch_exists("q/w/1/1.0/bugfix/PROJ-1-x"));
}

/// A conflict on the first integration branch is reported as 114 with the
/// fix-on-feature-branch remediation, and clears after the user resolves it
/// on their branch.
#[tokio::test]
async fn forward_conflict_fixed_on_feature_branch() {
    let h = Harness::start(|_| {}).await;
    h.sandbox.commit("development/1.0", None, "data.txt", "base\n");
    h.sandbox
        .commit("development/2.0", Some("development/1.0"), "data.txt", "two\n");
    let source_sha = h
        .sandbox
        .commit("bugfix/PROJ-2-y", Some("development/1.0"), "data.txt", "fix\n");

    let pr_id = h
        .host
        .seed_pull_request("alice", "bugfix/PROJ-2-y", "development/1.0", &source_sha);
    h.host.add_review(pr_id, "alice", ReviewState::Approved);
    h.host.add_review(pr_id, "bob", ReviewState::Approved);
    h.host.add_review(pr_id, "carol", ReviewState::Approved);

    let job = h.run(JobKind::PullRequest { pr_id }).await;
    assert!(job.details.as_deref().unwrap_or("").contains("status 114"));
    assert!(h.has_status(pr_id, 114).await);
    let comments = h.robot_comments(pr_id).await;
    assert!(
        comments.iter().any(|c| c.contains("feature branch")),
        "remediation should point at the feature branch"
    );

    // The user aligns the file with development/2.0 on their own branch.
    let resolved = h
        .sandbox
        .commit("bugfix/PROJ-2-y", None, "data.txt", "two\n");
    h.host.set_source_sha(pr_id, &resolved);

    let job = h.run(JobKind::PullRequest { pr_id }).await;
    assert!(job.details.as_deref().unwrap_or("").contains("builds"));
    assert!(h.has_status(pr_id, 121).await);

    let w_tip = h.sandbox.sha("w/2.0/bugfix/PROJ-2-y");
    h.host.set_build(&resolved, KEY, BuildState::Successful);
    h.host.set_build(&w_tip, KEY, BuildState::Successful);
    h.run(JobKind::PullRequest { pr_id }).await;
    assert!(h.has_status(pr_id, 101).await);

    let q1 = h.sandbox.sha("q/w/1/1.0/bugfix/PROJ-2-y");
    let q2 = h.sandbox.sha("q/w/1/2.0/bugfix/PROJ-2-y");
    h.host.set_build(&q1, KEY, BuildState::Successful);
    h.host.set_build(&q2, KEY, BuildState::Successful);
    h.run(JobKind::BuildStatus {
        sha: q2,
        branch: "q/w/1/2.0/bugfix/PROJ-2-y".into(),
    })
    .await;
    assert!(h.has_status(pr_id, 102).await);
}

/// Running the evaluator twice on an unchanged repository posts nothing new
/// and reaches the same conclusion.
#[tokio::test]
async fn evaluation_is_idempotent() {
    let h = Harness::start(|_| {}).await;
    h.sandbox.commit("development/1.0", None, "README.md", "v1\n");
    h.sandbox
        .commit("development/2.0", Some("development/1.0"), "CHANGES.md", "v2\n");
    let source_sha =
        h.sandbox
            .commit("bugfix/PROJ-3-z", Some("development/1.0"), "z.txt", "z\n");

    // No approvals yet: the PR parks on 115.
    let pr_id = h
        .host
        .seed_pull_request("alice", "bugfix/PROJ-3-z", "development/1.0", &source_sha);

    let first = h.run(JobKind::PullRequest { pr_id }).await;
    assert!(h.has_status(pr_id, 115).await);
    let after_first = h.comment_count(pr_id).await;

    let second = h.run(JobKind::PullRequest { pr_id }).await;
    let after_second = h.comment_count(pr_id).await;

    assert_eq!(after_first, after_second, "second run must post nothing");
    assert_eq!(first.details, second.details);
}
