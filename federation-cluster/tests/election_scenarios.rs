//! Election scenarios: staleness, tie-break, lone survivor, self-demotion and replay.

use chrono::{DateTime, Utc};
use federation_cluster::{
    consensus::max_viable_epoch,
    elect,
    membership::ClaimedStatus,
    test_utils::{TestFederation, TEST_CLUSTER_ROOT, TEST_SEAL},
    time::{unix_seconds, Clock, ManualClock},
    ClusterSeal, ElectionReason, Epoch, HeartbeatMessage, HeartbeatRequest, NodeId, NodeRecord,
    PassOutcome, PassTrigger, Role,
};
use std::time::Duration;

const STALE: Duration = Duration::from_secs(300);

fn record(now: DateTime<Utc>, id: &str, epoch: u64, age_secs: i64) -> NodeRecord {
    NodeRecord {
        node_id: NodeId::from(id),
        epoch: Epoch::new(epoch),
        last_seen_at: now - chrono::Duration::seconds(age_secs),
        claimed_status: ClaimedStatus::Alive,
        signature_valid: true,
    }
}

#[test]
fn stale_higher_epoch_is_excluded() {
    let now = ManualClock::at_unix(1_700_000_000).now();
    let records = vec![
        record(now, "A", 5, 10),
        record(now, "B", 7, 400),
        record(now, "C", 7, 5),
    ];

    let result = elect(&NodeId::from("A"), Epoch::new(5), &records, now, STALE);

    assert_eq!(result.winner_id, NodeId::from("C"));
    assert_eq!(result.winner_epoch, Epoch::new(7));
    assert_eq!(result.reason, ElectionReason::EpochElection);
}

#[test]
fn equal_epochs_resolve_by_lowest_node_id_from_every_viewpoint() {
    let now = ManualClock::at_unix(1_700_000_000).now();
    let records = vec![record(now, "D", 7, 3), record(now, "C", 7, 5)];

    let from_c = elect(&NodeId::from("C"), Epoch::new(7), &records, now, STALE);
    let from_d = elect(&NodeId::from("D"), Epoch::new(7), &records, now, STALE);
    let reversed: Vec<NodeRecord> = records.iter().rev().cloned().collect();
    let again = elect(&NodeId::from("D"), Epoch::new(7), &reversed, now, STALE);

    assert_eq!(from_c.winner_id, NodeId::from("C"));
    assert_eq!(from_c, from_d);
    assert_eq!(from_d, again);
}

#[test]
fn lone_survivor_elects_itself() {
    let now = ManualClock::at_unix(1_700_000_000).now();
    let records = vec![record(now, "E", 2, 0), record(now, "F", 9, 900), record(now, "G", 9, 301)];

    let result = elect(&NodeId::from("E"), Epoch::new(2), &records, now, STALE);

    assert_eq!(result.winner_id, NodeId::from("E"));
    assert_eq!(result.reason, ElectionReason::NoViablePeers);
    assert_eq!(max_viable_epoch(&records, now, STALE), Some(Epoch::new(2)));
}

#[tokio::test]
async fn lone_node_promotes_without_confirmation() {
    let fed = TestFederation::new(&["node-e"]).unwrap();
    let node = fed.node("node-e");

    let outcome = node.coordinator().run_pass(PassTrigger::Manual).await.unwrap();

    assert!(matches!(outcome, PassOutcome::Leading { promoted: true, handover: None, .. }));
    assert_eq!(node.status().role, Role::Leader);
    assert!(node.status().has_lease);
}

#[tokio::test]
async fn partitioned_leader_demotes_itself() {
    let fed = TestFederation::new(&["node-a", "node-b"]).unwrap();
    let a = fed.node("node-a");
    fed.heartbeat_round().await;
    a.coordinator().run_pass(PassTrigger::Manual).await.unwrap();
    assert!(a.role().is_leader());

    // node-a loses the network; its broadcasts keep failing past the stale threshold
    fed.transport.take_down(&NodeId::from("node-a"));
    fed.advance(Duration::from_secs(150));
    fed.heartbeat_round().await;
    fed.advance(Duration::from_secs(151));
    fed.heartbeat_round().await;

    let outcome = a.coordinator().run_pass(PassTrigger::Interval).await.unwrap();

    assert_eq!(outcome, PassOutcome::SelfPartitioned);
    assert_eq!(a.role().snapshot().role, Role::Witness);
    assert_eq!(a.lease_token(), None);
}

#[tokio::test]
async fn partitioned_leader_with_no_contender_still_demotes() {
    let fed = TestFederation::new(&["node-a", "node-b"]).unwrap();
    let a = fed.node("node-a");
    a.coordinator().run_pass(PassTrigger::Manual).await.unwrap();
    assert!(a.role().is_leader());

    fed.transport.take_down(&NodeId::from("node-a"));
    fed.advance(Duration::from_secs(301));
    fed.heartbeat_round().await;

    assert!(a.coordinator().is_self_partitioned());
    a.coordinator().run_pass(PassTrigger::Interval).await.unwrap();
    assert!(!a.role().is_leader());
}

#[tokio::test]
async fn replayed_heartbeat_is_rejected() {
    let fed = TestFederation::new(&["node-a", "node-b"]).unwrap();
    let a = fed.node("node-a");
    let seal = ClusterSeal::new(TEST_SEAL, Duration::from_secs(300)).unwrap();

    let captured = HeartbeatMessage::signed(
        &seal,
        NodeId::from("node-b"),
        Epoch::new(99),
        unix_seconds(fed.clock.now()),
    );
    fed.advance(Duration::from_secs(310));

    let response = a.receive_heartbeat(&HeartbeatRequest::from_message(&captured, TEST_CLUSTER_ROOT));

    assert!(response.ok);
    assert!(!response.valid);
    assert!((response.age_seconds - 310.0).abs() < f64::EPSILON);
    assert!(a.peer_view().get(&NodeId::from("node-b")).is_none());
    assert_eq!(a.status().stats.ingress.rejected_outside_freshness_window, 1);
}

#[tokio::test]
async fn replay_does_not_refresh_existing_record() {
    let fed = TestFederation::new(&["node-a", "node-b"]).unwrap();
    let a = fed.node("node-a");
    let seal = ClusterSeal::new(TEST_SEAL, Duration::from_secs(300)).unwrap();

    let captured = HeartbeatMessage::signed(
        &seal,
        NodeId::from("node-b"),
        Epoch::new(99),
        unix_seconds(fed.clock.now()),
    );
    fed.heartbeat_round().await;
    let before = a.peer_view().get(&NodeId::from("node-b")).unwrap();

    fed.advance(Duration::from_secs(310));
    a.receive_heartbeat(&HeartbeatRequest::from_message(&captured, TEST_CLUSTER_ROOT));

    assert_eq!(a.peer_view().get(&NodeId::from("node-b")).unwrap(), before);
}
