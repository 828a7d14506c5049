//! Multi-client rebalancing scenarios against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use rebalancer_client::{
    AbortReason, ChannelHandler, ClientEvent, ClientInternalState, ClientOptions, GroupId,
    RebalancerClient, RebalancerClientBuilder, ResourceId,
};
use rebalancer_store::{CoordinationStore, GroupAdmin, MemoryEnsemble};

const SETTLE: Duration = Duration::from_secs(15);
const ASSIGNMENT: &str = "/rebalancer/workers/assignment";

struct Member {
    client: RebalancerClient,
    events: UnboundedReceiver<ClientEvent>,
}

impl Member {
    fn drain(&mut self) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn stop(&self) {
        self.client.stop(Duration::from_secs(5)).await.unwrap();
    }
}

fn resources(count: usize) -> Vec<ResourceId> {
    (0..count).map(|i| ResourceId::new(format!("res{}", i))).collect()
}

async fn group(ensemble: &MemoryEnsemble, count: usize) -> GroupAdmin {
    let admin = GroupAdmin::new(
        ensemble.session(Duration::from_secs(20)),
        "/rebalancer",
        GroupId::new("workers"),
        Duration::from_millis(100),
    );
    admin.prepare(&resources(count)).await.unwrap();
    admin
}

async fn join(ensemble: &MemoryEnsemble, options: ClientOptions) -> Member {
    let (handler, events) = ChannelHandler::new();
    let client = RebalancerClientBuilder::new()
        .connector(ensemble.connector())
        .handler(Arc::new(handler))
        .build()
        .unwrap();
    client.start(GroupId::new("workers"), options).await.unwrap();
    Member { client, events }
}

fn assigned(count: usize) -> impl Fn(&ClientEvent) -> bool {
    move |event| matches!(event, ClientEvent::Assigned(r) if r.len() == count)
}

fn assert_assigned_only(events: &[ClientEvent], count: usize) {
    assert_eq!(events.len(), 1, "events: {:?}", events);
    assert!(assigned(count)(&events[0]), "events: {:?}", events);
}

fn assert_reassigned(events: &[ClientEvent], count: usize) {
    assert_eq!(events.len(), 2, "events: {:?}", events);
    assert_eq!(events[0], ClientEvent::Unassigned);
    assert!(assigned(count)(&events[1]), "events: {:?}", events);
}

fn assert_unassigned_only(events: &[ClientEvent]) {
    assert_eq!(events, &[ClientEvent::Unassigned]);
}

fn assert_aborted(events: &[ClientEvent], expected: AbortReason) {
    assert!(
        matches!(&events[0], ClientEvent::Aborted { reason, .. } if *reason == expected),
        "events: {:?}",
        events
    );
}

fn assert_exclusive(members: &[&Member], total: usize) {
    let mut seen = HashSet::new();
    for member in members {
        for resource in member.client.assigned_resources() {
            assert!(seen.insert(resource.clone()), "{} owned twice", resource);
        }
    }
    assert_eq!(seen.len(), total);
}

#[tokio::test(start_paused = true)]
async fn test_clients_started_together_then_stopped() {
    let ensemble = MemoryEnsemble::new();
    let _admin = group(&ensemble, 6).await;

    let mut a = join(&ensemble, ClientOptions::default()).await;
    let mut b = join(&ensemble, ClientOptions::default()).await;
    let mut c = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;

    assert_assigned_only(&a.drain(), 2);
    assert_assigned_only(&b.drain(), 2);
    assert_assigned_only(&c.drain(), 2);
    assert_exclusive(&[&a, &b, &c], 6);
    assert_eq!(a.client.state(), ClientInternalState::IsLeader);
    assert_eq!(b.client.state(), ClientInternalState::IsFollower);

    a.stop().await;
    tokio::time::sleep(SETTLE).await;
    assert_unassigned_only(&a.drain());
    assert_reassigned(&b.drain(), 3);
    assert_reassigned(&c.drain(), 3);
    assert_exclusive(&[&b, &c], 6);
    assert_eq!(b.client.state(), ClientInternalState::IsLeader);

    b.stop().await;
    tokio::time::sleep(SETTLE).await;
    assert_unassigned_only(&b.drain());
    assert_reassigned(&c.drain(), 6);
    assert_eq!(c.client.assigned_resources(), resources(6));

    c.stop().await;
    assert_unassigned_only(&c.drain());
    assert_eq!(c.client.state(), ClientInternalState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_clients_join_one_by_one() {
    let ensemble = MemoryEnsemble::new();
    let _admin = group(&ensemble, 6).await;

    let mut a = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert_assigned_only(&a.drain(), 6);

    let mut b = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert_reassigned(&a.drain(), 3);
    assert_assigned_only(&b.drain(), 3);

    let mut c = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert_reassigned(&a.drain(), 2);
    assert_reassigned(&b.drain(), 2);
    assert_assigned_only(&c.drain(), 2);
    assert_exclusive(&[&a, &b, &c], 6);

    // Contiguous blocks in registration order
    assert_eq!(a.client.assigned_resources(), resources(6)[0..2].to_vec());
    assert_eq!(c.client.assigned_resources(), resources(6)[4..6].to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_more_clients_than_resources() {
    let ensemble = MemoryEnsemble::new();
    let _admin = group(&ensemble, 2).await;

    let mut a = join(&ensemble, ClientOptions::default()).await;
    let mut b = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert_assigned_only(&a.drain(), 1);
    assert_assigned_only(&b.drain(), 1);

    // A third member changes nothing
    let mut c = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert!(a.drain().is_empty());
    assert!(b.drain().is_empty());
    assert!(c.drain().is_empty());

    // Neither does its departure
    c.stop().await;
    tokio::time::sleep(SETTLE).await;
    assert!(a.drain().is_empty());
    assert!(b.drain().is_empty());
    assert!(c.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_member_takes_over_departed_share() {
    let ensemble = MemoryEnsemble::new();
    let _admin = group(&ensemble, 2).await;

    let mut a = join(&ensemble, ClientOptions::default()).await;
    let mut b = join(&ensemble, ClientOptions::default()).await;
    let mut c = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    a.drain();
    b.drain();
    assert!(c.drain().is_empty());

    b.stop().await;
    tokio::time::sleep(SETTLE).await;
    assert_reassigned(&a.drain(), 1);
    assert_unassigned_only(&b.drain());
    assert_assigned_only(&c.drain(), 1);
    assert_exclusive(&[&a, &c], 2);
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry_terminates_without_recovery() {
    let ensemble = MemoryEnsemble::new();
    let _admin = group(&ensemble, 3).await;

    let mut a = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert_assigned_only(&a.drain(), 3);

    ensemble.expire(a.client.session_id().unwrap());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let events = a.drain();
    assert_eq!(events.len(), 2, "events: {:?}", events);
    assert_eq!(events[0], ClientEvent::Unassigned);
    assert!(matches!(
        events[1],
        ClientEvent::Aborted { reason: AbortReason::SessionExpired, .. }
    ));
    assert_eq!(a.client.state(), ClientInternalState::Terminated);
    assert!(a.client.assigned_resources().is_empty());
    assert_eq!(a.client.metrics().aborts, 1);

    a.stop().await;
    assert!(a.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_leader_expiry_fails_over_and_recovers() {
    let ensemble = MemoryEnsemble::new();
    let admin = group(&ensemble, 6).await;

    let mut a = join(&ensemble, ClientOptions::with_auto_recovery()).await;
    let mut b = join(&ensemble, ClientOptions::with_auto_recovery()).await;
    tokio::time::sleep(SETTLE).await;
    a.drain();
    b.drain();
    let first_id = a.client.client_id().unwrap();

    ensemble.expire(a.client.session_id().unwrap());
    tokio::time::sleep(SETTLE).await;

    let events = a.drain();
    assert_eq!(events.len(), 3, "events: {:?}", events);
    assert_eq!(events[0], ClientEvent::Unassigned);
    assert!(matches!(
        events[1],
        ClientEvent::Aborted { reason: AbortReason::SessionExpired, .. }
    ));
    assert!(assigned(3)(&events[2]));
    assert_reassigned(&b.drain(), 3);

    // The recovered member re-registered behind the new leader
    assert_eq!(b.client.state(), ClientInternalState::IsLeader);
    assert_eq!(a.client.state(), ClientInternalState::IsFollower);
    let second_id = a.client.client_id().unwrap();
    assert!(second_id.sequence() > first_id.sequence());
    assert_eq!(
        admin.active_clients().await.unwrap(),
        vec![b.client.client_id().unwrap(), second_id]
    );
    assert_exclusive(&[&a, &b], 6);
    assert_eq!(a.client.metrics().sessions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_resource_churn_rebalances() {
    let ensemble = MemoryEnsemble::new();
    let admin = group(&ensemble, 2).await;

    let mut a = join(&ensemble, ClientOptions::default()).await;
    let mut b = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    a.drain();
    b.drain();

    admin.add_resource(&ResourceId::new("res2")).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_reassigned(&a.drain(), 2);
    assert_reassigned(&b.drain(), 1);
    assert_exclusive(&[&a, &b], 3);

    admin.remove_resource(&ResourceId::new("res0")).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_reassigned(&a.drain(), 1);
    assert_reassigned(&b.drain(), 1);
    assert_exclusive(&[&a, &b], 2);
    assert_eq!(a.client.assigned_resources(), vec![ResourceId::new("res1")]);

    for resource in [ResourceId::new("res1"), ResourceId::new("res2")] {
        let holder = admin.barrier_holder(&resource).await.unwrap();
        assert!(holder.is_some(), "{} has no barrier holder", resource);
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_resource_late_joiners_see_nothing() {
    let ensemble = MemoryEnsemble::new();
    let _admin = group(&ensemble, 1).await;

    let mut a = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert_assigned_only(&a.drain(), 1);

    let mut b = join(&ensemble, ClientOptions::default()).await;
    let mut c = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert!(a.drain().is_empty());
    assert!(b.drain().is_empty());
    assert!(c.drain().is_empty());
    assert_eq!(a.client.assigned_resources(), resources(1));
}

#[tokio::test(start_paused = true)]
async fn test_two_resources_join_then_leave() {
    let ensemble = MemoryEnsemble::new();
    let _admin = group(&ensemble, 2).await;

    let mut a = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert_assigned_only(&a.drain(), 2);

    let mut b = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert_reassigned(&a.drain(), 1);
    assert_assigned_only(&b.drain(), 1);

    let mut c = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert!(a.drain().is_empty());
    assert!(b.drain().is_empty());
    assert!(c.drain().is_empty());

    b.stop().await;
    tokio::time::sleep(SETTLE).await;
    assert_reassigned(&a.drain(), 1);
    assert_unassigned_only(&b.drain());
    assert_assigned_only(&c.drain(), 1);
    assert_exclusive(&[&a, &c], 2);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_record_is_fatal() {
    let ensemble = MemoryEnsemble::new();
    let _admin = group(&ensemble, 2).await;

    let mut a = join(&ensemble, ClientOptions::default()).await;
    let mut b = join(&ensemble, ClientOptions::default()).await;
    tokio::time::sleep(SETTLE).await;
    assert_assigned_only(&a.drain(), 1);
    assert_assigned_only(&b.drain(), 1);

    let vandal = ensemble.session(Duration::from_secs(20));
    vandal
        .set_data(ASSIGNMENT, b"not json".to_vec(), None)
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    // The follower trips on the record at once, the leader at its next round
    for member in [&mut b, &mut a] {
        let events = member.drain();
        assert_eq!(events.len(), 2, "events: {:?}", events);
        assert_eq!(events[0], ClientEvent::Unassigned);
        assert_aborted(&events[1..], AbortReason::FatalError);
        assert_eq!(member.client.state(), ClientInternalState::Terminated);
        assert!(member.client.assigned_resources().is_empty());
        assert!(member.client.client_id().is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn test_record_lost_during_handoff_recovers() {
    let ensemble = MemoryEnsemble::new();
    let _admin = group(&ensemble, 1).await;

    // A lock left by an unknown client stalls the first handoff
    let squatter = ensemble.session(Duration::from_secs(20));
    squatter
        .create_ephemeral(
            "/rebalancer/workers/resources/res0/barrier",
            b"c_0000009999".to_vec(),
        )
        .await
        .unwrap();

    let mut a = join(&ensemble, ClientOptions::with_auto_recovery()).await;
    let first_id = a.client.client_id().unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_eq!(a.client.state(), ClientInternalState::IsLeader);
    assert!(a.drain().is_empty());

    // The record vanishes between the revoking and assigned writes
    let operator = ensemble.session(Duration::from_secs(20));
    assert!(operator.delete(ASSIGNMENT).await.unwrap());
    squatter.close().await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let events = a.drain();
    assert_eq!(events.len(), 2, "events: {:?}", events);
    assert_aborted(&events, AbortReason::PotentialInconsistentState);
    assert!(assigned(1)(&events[1]), "events: {:?}", events);

    let second_id = a.client.client_id().unwrap();
    assert!(second_id.sequence() > first_id.sequence());
    assert_eq!(a.client.state(), ClientInternalState::IsLeader);
    assert_eq!(a.client.assigned_resources(), resources(1));
    assert!(ensemble.contains(ASSIGNMENT));
    assert_eq!(a.client.metrics().aborts, 1);
}
