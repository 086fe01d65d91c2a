//! Range distribution and answer collection, including refusals.

use std::time::Duration;

use canopy_protocol::{Packet, PacketCodec};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::harness::{make_artifact, read_output_values, TestNode};

const T: Duration = Duration::from_secs(10);
const JOB_T: Duration = Duration::from_secs(30);

fn collatz_steps(value: i64) -> u32 {
    let mut n = value as u128;
    let mut steps = 0;
    while n != 1 {
        n = if n % 2 == 0 { n / 2 } else { 3 * n + 1 };
        steps += 1;
    }
    steps
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_star_covers_the_range_exactly_once() -> anyhow::Result<()> {
    let root = TestNode::start(None).await?;
    let a = TestNode::start(Some(root.dial_addr())).await?;
    let b = TestNode::start(Some(root.dial_addr())).await?;
    for node in [&root, &a, &b] {
        node.wait_potential(3, T).await?;
    }

    let artifact = make_artifact(&root.results_dir)?;
    let output = root.start_job(&artifact, "collatz", 0, 9, "collatz.out").await?;

    let answered = root.wait_jobs_finished(JOB_T).await?;
    assert_eq!(answered, 9);
    let values = read_output_values(&output)?;
    assert_eq!(values, (0..9).collect());

    // Each leaf took an equal three-value slice and finished it.
    for leaf in [&a, &b] {
        let answered = leaf.wait_jobs_finished(JOB_T).await?;
        assert_eq!(answered, 3);
        let status = leaf.status().await?;
        assert_eq!(status.jobs.len(), 1);
        assert_eq!(status.jobs[0].role, "downstream");
        assert_eq!(status.jobs[0].total, 3);
    }

    // Spot-check a line against the checker's own arithmetic.
    let raw = std::fs::read_to_string(&output)?;
    assert!(raw
        .lines()
        .any(|l| l == format!("6 6 reaches 1 in {} steps", collatz_steps(6))));
    Ok(())
}

#[tokio::test]
async fn refused_range_is_recomputed_locally() -> anyhow::Result<()> {
    let root = TestNode::start(None).await?;

    // A bare protocol peer: greets, gets offered a range, refuses it all.
    let stream = TcpStream::connect(root.dial_addr()).await?;
    let mut framed = Framed::new(stream, PacketCodec::new());

    let greeting = tokio::time::timeout(T, framed.next()).await?.unwrap()?;
    assert!(
        matches!(greeting, Packet::Init { potential: 1, sender } if sender == root.handle.app_id)
    );
    framed.send(Packet::Updt { potential: 1, sender: 4242 }).await?;
    root.wait_potential(2, T).await?;

    let artifact = make_artifact(&root.results_dir)?;
    let output = root.start_job(&artifact, "collatz", 0, 8, "refused.out").await?;

    let offered = tokio::time::timeout(T, framed.next()).await?.unwrap()?;
    let Packet::Req { job_id, start, end, .. } = offered else {
        panic!("expected a range offer, got {offered:?}");
    };
    assert_eq!((start, end), (4, 8));
    framed.send(Packet::Ref { job_id, start, end }).await?;

    let answered = root.wait_jobs_finished(JOB_T).await?;
    assert_eq!(answered, 8);
    assert_eq!(read_output_values(&output)?, (0..8).collect());
    Ok(())
}

#[tokio::test]
async fn partial_answers_then_refusal_still_cover_everything() -> anyhow::Result<()> {
    let root = TestNode::start(None).await?;

    let stream = TcpStream::connect(root.dial_addr()).await?;
    let mut framed = Framed::new(stream, PacketCodec::new());
    let _greeting = tokio::time::timeout(T, framed.next()).await?.unwrap()?;
    framed.send(Packet::Updt { potential: 1, sender: 99 }).await?;
    root.wait_potential(2, T).await?;

    let artifact = make_artifact(&root.results_dir)?;
    let output = root.start_job(&artifact, "collatz", 0, 8, "partial.out").await?;

    let offered = tokio::time::timeout(T, framed.next()).await?.unwrap()?;
    let Packet::Req { job_id, start, end, .. } = offered else {
        panic!("expected a range offer, got {offered:?}");
    };
    framed.send(Packet::Acc { job_id, start, end }).await?;

    // Answer the first two values, hand the rest back.
    for value in start..start + 2 {
        framed
            .send(Packet::Ans { job_id, value, result: format!("{value} faked elsewhere") })
            .await?;
    }
    framed.send(Packet::Ref { job_id, start: start + 2, end }).await?;

    let answered = root.wait_jobs_finished(JOB_T).await?;
    assert_eq!(answered, 8);
    assert_eq!(read_output_values(&output)?, (0..8).collect());

    // The peer's answers landed verbatim; the refused tail was
    // recomputed with the real checker.
    let raw = std::fs::read_to_string(&output)?;
    assert!(raw.lines().any(|l| l == format!("{start} {start} faked elsewhere")));
    assert!(raw
        .lines()
        .any(|l| l == format!("7 7 reaches 1 in {} steps", collatz_steps(7))));
    Ok(())
}
