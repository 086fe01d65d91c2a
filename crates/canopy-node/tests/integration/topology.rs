//! Potential propagation across small trees.

use std::time::Duration;

use crate::harness::TestNode;

const T: Duration = Duration::from_secs(10);

#[tokio::test]
async fn child_and_root_both_count_two() -> anyhow::Result<()> {
    let root = TestNode::start(None).await?;
    let child = TestNode::start(Some(root.dial_addr())).await?;

    root.wait_potential(2, T).await?;
    child.wait_potential(2, T).await?;

    let status = child.status().await?;
    assert_eq!(status.links.len(), 1);
    assert!(status.links[0].is_parent);
    assert_eq!(status.links[0].remote_app_id, Some(root.handle.app_id));
    Ok(())
}

#[tokio::test]
async fn star_of_three_converges() -> anyhow::Result<()> {
    let root = TestNode::start(None).await?;
    let a = TestNode::start(Some(root.dial_addr())).await?;
    let b = TestNode::start(Some(root.dial_addr())).await?;

    for node in [&root, &a, &b] {
        node.wait_potential(3, T).await?;
    }

    // The root sees each leaf as worth exactly one node.
    let status = root.status().await?;
    assert_eq!(status.links.len(), 2);
    assert!(status.links.iter().all(|l| l.potential == 1));
    Ok(())
}

#[tokio::test]
async fn chain_of_three_converges() -> anyhow::Result<()> {
    let root = TestNode::start(None).await?;
    let mid = TestNode::start(Some(root.dial_addr())).await?;
    let leaf = TestNode::start(Some(mid.dial_addr())).await?;

    for node in [&root, &mid, &leaf] {
        node.wait_potential(3, T).await?;
    }

    // The root's single link carries the whole two-node subtree; the
    // middle node sees one node on each side.
    let root_status = root.status().await?;
    assert_eq!(root_status.links.len(), 1);
    assert_eq!(root_status.links[0].potential, 2);

    let mid_status = mid.status().await?;
    assert_eq!(mid_status.links.len(), 2);
    assert!(mid_status.links.iter().all(|l| l.potential == 1));
    Ok(())
}
