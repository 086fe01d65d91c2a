//! Graceful departure: handshake, re-attachment, and work completion
//! across a leave.

use std::time::Duration;

use crate::harness::{make_artifact, read_output_values, TestNode};

const T: Duration = Duration::from_secs(10);
const JOB_T: Duration = Duration::from_secs(60);

#[tokio::test]
async fn middle_node_leaves_and_leaf_reattaches_to_root() -> anyhow::Result<()> {
    let root = TestNode::start(None).await?;
    let mid = TestNode::start(Some(root.dial_addr())).await?;
    let leaf = TestNode::start(Some(mid.dial_addr())).await?;
    for node in [&root, &mid, &leaf] {
        node.wait_potential(3, T).await?;
    }

    mid.disconnect().await?;
    mid.wait_exit(T).await?;

    root.wait_potential(2, T).await?;
    leaf.wait_potential(2, T).await?;

    // The leaf now hangs directly off the root.
    let leaf_status = leaf
        .wait_for(
            "leaf to identify its new parent",
            |s| s.links.iter().any(|l| l.remote_app_id == Some(root.handle.app_id)),
            T,
        )
        .await?;
    let parent = leaf_status.links.iter().find(|l| l.is_parent).unwrap();
    assert_eq!(parent.peer_addr, root.dial_addr());
    assert!(parent.connected && !parent.leaving);

    root.wait_for(
        "root to identify the re-attached leaf",
        |s| s.links.iter().any(|l| l.remote_app_id == Some(leaf.handle.app_id)),
        T,
    )
    .await?;
    Ok(())
}

#[tokio::test]
async fn root_cannot_disconnect() -> anyhow::Result<()> {
    let root = TestNode::start(None).await?;
    let child = TestNode::start(Some(root.dial_addr())).await?;
    root.wait_potential(2, T).await?;

    root.disconnect().await?;
    // The command is refused; the node keeps running and serving.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = root.status().await?;
    assert!(!status.leaving);
    child.wait_potential(2, T).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn departure_mid_job_still_covers_the_range() -> anyhow::Result<()> {
    let root = TestNode::start(None).await?;
    let mid = TestNode::start(Some(root.dial_addr())).await?;
    let leaf = TestNode::start(Some(mid.dial_addr())).await?;
    for node in [&root, &mid, &leaf] {
        node.wait_potential(3, T).await?;
    }

    // The slow checker keeps work in flight long enough for the
    // departure to land in the middle of the job.
    let artifact = make_artifact(&root.results_dir)?;
    let output = root.start_job(&artifact, "slow", 0, 300, "departed.out").await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    mid.disconnect().await?;
    mid.wait_exit(T).await?;

    let answered = root.wait_jobs_finished(JOB_T).await?;
    assert_eq!(answered, 300);
    assert_eq!(read_output_values(&output)?, (0..300).collect());
    Ok(())
}
