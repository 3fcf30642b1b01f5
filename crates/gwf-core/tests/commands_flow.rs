//! Comment-driven behavior: privileges, unknown commands, reset.

mod common;

use common::Harness;
use gwf_core::host::{GitHost, PullRequestState, ReviewState};
use gwf_core::jobs::JobKind;

fn seed_destinations(h: &Harness) {
    h.sandbox.commit("development/1.0", None, "README.md", "v1\n");
    h.sandbox
        .commit("development/2.0", Some("development/1.0"), "CHANGES.md", "v2\n");
}

async fn open_pr(h: &Harness, branch: &str) -> u64 {
    let source_sha = h
        .sandbox
        .commit(branch, Some("development/1.0"), "fix.txt", "payload\n");
    h.host
        .seed_pull_request("alice", branch, "development/1.0", &source_sha)
}

/// A bypass by someone who is not an admin is refused with 123 and changes
/// nothing.
#[tokio::test]
async fn bypass_by_non_admin_is_not_authorized() {
    let h = Harness::start(|_| {}).await;
    seed_destinations(&h);
    let pr_id = open_pr(&h, "bugfix/PROJ-50-a").await;
    h.host.add_comment(pr_id, "alice", "@gwf-bot bypass_build_status");

    let job = h.run(JobKind::PullRequest { pr_id }).await;
    assert!(job.details.as_deref().unwrap_or("").contains("status 123"));
    assert!(h.has_status(pr_id, 123).await);
    assert_eq!(
        h.host.get_pull_request(pr_id).await.unwrap().state,
        PullRequestState::Open
    );
    assert!(!h.sandbox.branch_exists(&format!("q/w/{pr_id}/1.0/bugfix/PROJ-50-a")));
}

/// The same bypass from an admin who is not the author takes effect.
#[tokio::test]
async fn bypass_by_admin_takes_effect() {
    let h = Harness::start(|_| {}).await;
    seed_destinations(&h);
    let pr_id = open_pr(&h, "bugfix/PROJ-51-b").await;
    h.host.add_review(pr_id, "alice", ReviewState::Approved);
    h.host.add_review(pr_id, "bob", ReviewState::Approved);
    h.host.add_review(pr_id, "carol", ReviewState::Approved);
    h.host
        .add_comment(pr_id, "root", "@gwf-bot bypass_build_status");

    // No build ever reported, yet the PR reaches the queue.
    h.run(JobKind::PullRequest { pr_id }).await;
    assert!(h.has_status(pr_id, 101).await);
}

#[tokio::test]
async fn unknown_command_is_reported() {
    let h = Harness::start(|_| {}).await;
    seed_destinations(&h);
    let pr_id = open_pr(&h, "bugfix/PROJ-52-c").await;
    h.host.add_comment(pr_id, "bob", "/frobnicate");

    let job = h.run(JobKind::PullRequest { pr_id }).await;
    assert!(job.details.as_deref().unwrap_or("").contains("status 122"));
    assert!(h.has_status(pr_id, 122).await);
}

/// `reset` succeeds while the integration branches carry only robot
/// commits, and rebuilds them from the current source.
#[tokio::test]
async fn reset_with_clean_integration_branches() {
    let h = Harness::start(|_| {}).await;
    seed_destinations(&h);
    let pr_id = open_pr(&h, "bugfix/PROJ-53-d").await;

    h.run(JobKind::PullRequest { pr_id }).await;
    assert!(h.sandbox.branch_exists("w/2.0/bugfix/PROJ-53-d"));

    h.host.add_comment(pr_id, "alice", "/reset");
    h.run(JobKind::PullRequest { pr_id }).await;

    assert!(h.has_status(pr_id, 126).await, "reset acknowledgement missing");
    // Rebuilt straight away by the same evaluation.
    assert!(h.sandbox.branch_exists("w/2.0/bugfix/PROJ-53-d"));
}

/// `reset` refuses to discard a user's commit on an integration branch;
/// `force_reset` discards it and declines the integration PRs.
#[tokio::test]
async fn reset_with_user_commit_requires_force() {
    let h = Harness::start(|json| {
        json["always_create_integration_pull_requests"] = serde_json::json!(true);
    })
    .await;
    seed_destinations(&h);
    let pr_id = open_pr(&h, "bugfix/PROJ-54-e").await;

    h.run(JobKind::PullRequest { pr_id }).await;
    let w_branch = "w/2.0/bugfix/PROJ-54-e";
    assert!(h.sandbox.branch_exists(w_branch));
    let integration_pr = h
        .host
        .find_pull_request(w_branch, "development/2.0")
        .await
        .unwrap()
        .expect("integration PR should have been opened");

    let rogue = h
        .sandbox
        .rogue_commit(w_branch, "sneaky.txt", "hi\n", "rogue@users.example");

    h.host.add_comment(pr_id, "alice", "/reset");
    let job = h.run(JobKind::PullRequest { pr_id }).await;
    assert!(job.details.as_deref().unwrap_or("").contains("status 132"));
    assert!(h.has_status(pr_id, 132).await);
    assert!(h.sandbox.branch_exists(w_branch), "plain reset must not delete");

    h.host.add_comment(pr_id, "alice", "/force_reset");
    h.run(JobKind::PullRequest { pr_id }).await;

    assert!(h.has_status(pr_id, 126).await);
    assert_eq!(
        h.host
            .get_pull_request(integration_pr.id)
            .await
            .unwrap()
            .state,
        PullRequestState::Declined
    );
    // The branch is rebuilt without the rogue commit.
    assert!(h.sandbox.branch_exists(w_branch));
    assert!(!h.sandbox.is_ancestor(&rogue, &h.sandbox.sha(w_branch)));
}
