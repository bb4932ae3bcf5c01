//! End-to-end lifecycle scenarios driven through the controller's public
//! `handle` entry point, with recording timers and runtime so every timer
//! firing is explicit and process exits are observable.

use kel_cluster::{
    main_queue, ClientEnvelope, ClientOperation, ClientReply, ClusterInfo, Controller,
    ControllerOptions, ClientRequest, DenialReason, MemberInfo, Message, NodeInfo, NodeRuntime,
    OutputBus, Principal, Role, TimerService,
};
use kel_core::{CorrelationId, InstanceId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct RecordingTimers {
    scheduled: Mutex<Vec<(Duration, Message)>>,
}

impl TimerService for RecordingTimers {
    fn schedule(&self, delay: Duration, message: Message) {
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.push((delay, message));
        }
    }
}

struct RecordingRuntime {
    database_closed: AtomicBool,
    workers_stopped: AtomicBool,
    exits: Mutex<Vec<bool>>,
}

impl NodeRuntime for RecordingRuntime {
    fn close_database(&self) {
        self.database_closed.store(true, Ordering::SeqCst);
    }
    fn stop_workers(&self) {
        self.workers_stopped.store(true, Ordering::SeqCst);
    }
    fn exit_process(&self, success: bool) {
        if let Ok(mut exits) = self.exits.lock() {
            exits.push(success);
        }
    }
}

struct Harness {
    controller: Controller,
    queue_rx: mpsc::UnboundedReceiver<Message>,
    output_rx: tokio::sync::broadcast::Receiver<Message>,
    timers: Arc<RecordingTimers>,
    runtime: Arc<RecordingRuntime>,
    roles_seen: Vec<Role>,
}

impl Harness {
    fn new(cluster_size: usize) -> Self {
        Self::build(cluster_size, false, 0)
    }

    fn build(cluster_size: usize, read_only: bool, subsystem_count: usize) -> Self {
        let mut node = NodeInfo::new(InstanceId(0), "127.0.0.1:2113".parse().unwrap())
            .with_external_tcp("127.0.0.1:1113".parse().unwrap());
        if read_only {
            node = node.read_only_replica();
        }
        let mut options = ControllerOptions::new(node, cluster_size);
        options.subsystem_count = subsystem_count;

        let (queue, queue_rx) = main_queue();
        let output = OutputBus::new(256);
        let output_rx = output.subscribe();
        let timers = Arc::new(RecordingTimers {
            scheduled: Mutex::new(Vec::new()),
        });
        let runtime = Arc::new(RecordingRuntime {
            database_closed: AtomicBool::new(false),
            workers_stopped: AtomicBool::new(false),
            exits: Mutex::new(Vec::new()),
        });
        let controller = Controller::new(
            options,
            output,
            queue,
            Arc::clone(&timers) as Arc<dyn TimerService>,
            Arc::clone(&runtime) as Arc<dyn NodeRuntime>,
        );
        Self {
            roles_seen: vec![controller.role()],
            controller,
            queue_rx,
            output_rx,
            timers,
            runtime,
        }
    }

    /// Deliver one message, then drain every self-posted follow-up,
    /// recording each role the controller passes through.
    fn deliver(&mut self, message: Message) {
        self.controller.handle(message);
        self.note_role();
        while let Ok(queued) = self.queue_rx.try_recv() {
            self.controller.handle(queued);
            self.note_role();
        }
    }

    fn note_role(&mut self) {
        let role = self.controller.role();
        if self.roles_seen.last() != Some(&role) {
            self.roles_seen.push(role);
        }
    }

    fn drain_output(&mut self) -> Vec<Message> {
        let mut drained = Vec::new();
        while let Ok(message) = self.output_rx.try_recv() {
            drained.push(message);
        }
        drained
    }

    /// Pop the most recently scheduled timer message matching `pred`.
    fn take_timer(&self, pred: fn(&Message) -> bool) -> Option<(Duration, Message)> {
        let scheduled = self.timers.scheduled.lock().ok()?;
        scheduled.iter().rev().find(|(_, m)| pred(m)).cloned()
    }

    fn init_core_services(&mut self) {
        for service in ["storage-chaser", "storage-reader", "storage-writer"] {
            self.deliver(Message::ServiceInitialized {
                service: service.to_string(),
            });
        }
    }

    fn member(&self, id: u16, role: Role) -> MemberInfo {
        MemberInfo::new(
            InstanceId(id),
            format!("127.0.0.1:{}", 2200 + id).parse().unwrap(),
            role,
        )
        .with_internal_tcp(format!("127.0.0.1:{}", 1200 + id).parse().unwrap())
        .with_external_tcp(format!("127.0.0.1:{}", 1300 + id).parse().unwrap())
    }

    /// Boot and win the first election, from either the single-node path
    /// (`Unknown`) or the clustered path (`DiscoverLeader`).
    fn boot_to_leader(&mut self) {
        self.init_core_services();
        assert!(matches!(
            self.controller.role(),
            Role::Unknown | Role::DiscoverLeader
        ));
        self.deliver(Message::ElectionsDone {
            leader: self.member(0, Role::Unknown),
            proposal_number: 1,
        });
        self.deliver(Message::ChaserCaughtUp {
            correlation_id: self.controller.state_correlation_id(),
        });
        assert_eq!(self.controller.role(), Role::Leader);
    }
}

fn write_events_request() -> (ClientRequest, mpsc::UnboundedReceiver<ClientReply>) {
    let (envelope, rx) = ClientEnvelope::channel();
    let request = ClientRequest {
        correlation_id: CorrelationId::next(),
        envelope,
        require_leader: false,
        principal: Principal::User("ops".into()),
        operation: ClientOperation::WriteEvents {
            stream: "orders".into(),
            expected_version: -2,
            events: bytes::Bytes::from_static(b"evt"),
        },
    };
    (request, rx)
}

#[test]
fn cold_start_cluster_leader_wins_election() {
    let mut harness = Harness::new(3);
    harness.init_core_services();
    assert_eq!(harness.controller.role(), Role::DiscoverLeader);

    // Gossip keeps showing no alive leader; discovery cannot conclude.
    for _ in 0..3 {
        let cluster = ClusterInfo::new(vec![
            harness.member(1, Role::Unknown),
            harness.member(2, Role::Unknown),
        ]);
        harness.deliver(Message::GossipUpdated { cluster });
        assert_eq!(harness.controller.role(), Role::DiscoverLeader);
    }

    // The discovery timer gives up and elections run.
    let (delay, timeout) = harness
        .take_timer(|m| matches!(m, Message::DiscoveryTimeout { .. }))
        .expect("discovery timeout scheduled");
    assert_eq!(delay, Duration::from_millis(3000));
    harness.deliver(timeout);
    assert_eq!(harness.controller.role(), Role::Unknown);

    harness.deliver(Message::ElectionsDone {
        leader: harness.member(0, Role::Unknown),
        proposal_number: 1,
    });
    harness.deliver(Message::ChaserCaughtUp {
        correlation_id: harness.controller.state_correlation_id(),
    });

    assert_eq!(
        harness.roles_seen,
        vec![
            Role::Initializing,
            Role::DiscoverLeader,
            Role::Unknown,
            Role::PreLeader,
            Role::Leader,
        ]
    );
}

#[test]
fn cold_start_joins_existing_leader_via_discovery() {
    let mut harness = Harness::new(3);
    harness.init_core_services();
    assert_eq!(harness.controller.role(), Role::DiscoverLeader);
    let _ = harness.drain_output();

    let leader = harness.member(1, Role::Leader);
    let cluster = ClusterInfo::new(vec![leader.clone(), harness.member(2, Role::Follower)]);
    harness.deliver(Message::GossipUpdated { cluster });
    assert_eq!(harness.controller.role(), Role::PreReplica);
    assert_eq!(
        harness.controller.leader().map(|l| l.instance_id),
        Some(InstanceId(1))
    );

    let output = harness.drain_output();
    assert!(output
        .iter()
        .any(|m| matches!(m, Message::LeaderFound { .. })));
    assert!(output
        .iter()
        .any(|m| matches!(m, Message::WaitForChaserToCatchUp { .. })));

    // Chaser catches up; the controller starts the subscription handshake.
    harness.deliver(Message::ChaserCaughtUp {
        correlation_id: harness.controller.state_correlation_id(),
    });
    let output = harness.drain_output();
    assert!(output
        .iter()
        .any(|m| matches!(m, Message::ReplicaSubscriptionRequest { .. })));
    let subscription_id = harness.controller.subscription_id();
    assert!(!subscription_id.is_unset());

    harness.deliver(Message::ReplicaSubscribed {
        subscription_id,
        leader_id: InstanceId(1),
        subscription_position: 512,
    });
    assert_eq!(harness.controller.role(), Role::CatchingUp);

    harness.deliver(Message::FollowerAssignment {
        subscription_id,
        leader_id: InstanceId(1),
    });
    assert_eq!(harness.controller.role(), Role::Follower);
}

#[test]
fn leader_losing_quorum_steps_down() {
    let mut harness = Harness::new(1);
    harness.boot_to_leader();
    let _ = harness.drain_output();

    harness.deliver(Message::NoQuorum);

    assert_eq!(harness.controller.role(), Role::Unknown);
    assert!(harness.controller.leader().is_none());
    assert!(harness
        .drain_output()
        .iter()
        .any(|m| matches!(m, Message::StartElections)));
}

#[test]
fn stale_chaser_caught_up_leaves_state_untouched() {
    let mut harness = Harness::new(3);
    harness.init_core_services();
    let leader = harness.member(1, Role::Leader);
    harness.deliver(Message::ElectionsDone {
        leader,
        proposal_number: 1,
    });
    assert_eq!(harness.controller.role(), Role::PreReplica);
    let live_id = harness.controller.state_correlation_id();
    let _ = harness.drain_output();

    harness.deliver(Message::ChaserCaughtUp {
        correlation_id: CorrelationId::next(),
    });

    assert_eq!(harness.controller.role(), Role::PreReplica);
    assert_eq!(harness.controller.state_correlation_id(), live_id);
    assert!(harness.drain_output().is_empty(), "no outbound on stale drop");
}

#[test]
fn resignation_drains_then_yields_leadership() {
    let mut harness = Harness::new(1);
    harness.boot_to_leader();

    harness.deliver(Message::InitiateLeaderResignation);
    assert_eq!(harness.controller.role(), Role::ResigningLeader);

    let (request, mut reply_rx) = write_events_request();
    harness.deliver(Message::ClientRequest(request));
    match reply_rx.try_recv().expect("write must be denied") {
        ClientReply::NotHandled { reason, .. } => assert_eq!(reason, DenialReason::NotReady),
        other => panic!("unexpected reply: {other:?}"),
    }

    harness.deliver(Message::RequestQueueDrained);
    assert_eq!(harness.controller.role(), Role::Unknown);
}

#[test]
fn shutdown_times_out_and_forces_the_rest() {
    let mut harness = Harness::new(3);
    harness.boot_to_leader();

    harness.deliver(Message::RequestShutdown {
        exit_process: true,
        shutdown_http: true,
    });
    assert_eq!(harness.controller.role(), Role::ShuttingDown);

    // Three of the six expected services acknowledge, then silence.
    for service in ["storage-chaser", "storage-reader", "storage-writer"] {
        harness.deliver(Message::ServiceShutdown {
            service: service.to_string(),
        });
    }
    assert_eq!(harness.controller.role(), Role::ShuttingDown);

    let (delay, timeout) = harness
        .take_timer(|m| matches!(m, Message::ShutdownTimeout { .. }))
        .expect("shutdown timeout scheduled");
    assert_eq!(delay, Duration::from_millis(5000));
    harness.deliver(timeout);

    assert_eq!(harness.controller.role(), Role::Shutdown);
    assert!(harness.runtime.database_closed.load(Ordering::SeqCst));
    assert!(harness.runtime.workers_stopped.load(Ordering::SeqCst));
    assert_eq!(harness.runtime.exits.lock().unwrap().as_slice(), &[true]);
}

#[test]
fn single_node_shutdown_needs_five_acks() {
    let mut harness = Harness::new(1);
    harness.boot_to_leader();

    harness.deliver(Message::RequestShutdown {
        exit_process: false,
        shutdown_http: true,
    });

    let services = [
        "storage-chaser",
        "storage-reader",
        "storage-writer",
        "index-committer",
        "http",
    ];
    for (i, service) in services.iter().enumerate() {
        assert_eq!(harness.controller.role(), Role::ShuttingDown, "ack {i}");
        harness.deliver(Message::ServiceShutdown {
            service: (*service).to_string(),
        });
    }

    // The fifth ack completes shutdown without the timer.
    assert_eq!(harness.controller.role(), Role::Shutdown);
    assert!(harness.runtime.database_closed.load(Ordering::SeqCst));
    // exit_process was false: the process stays up.
    assert!(harness.runtime.exits.lock().unwrap().is_empty());
}

#[test]
fn system_core_ready_with_no_subsystems_fires_system_ready() {
    let mut harness = Harness::new(1);
    harness.init_core_services();
    let _ = harness.drain_output();

    harness.deliver(Message::AuthenticationProviderInitialized);

    assert!(harness
        .drain_output()
        .iter()
        .any(|m| matches!(m, Message::SystemReady)));
}

#[test]
fn system_ready_waits_for_every_subsystem() {
    let mut harness = Harness::build(1, false, 2);
    harness.init_core_services();
    harness.deliver(Message::AuthenticationProviderInitialized);
    let _ = harness.drain_output();

    harness.deliver(Message::SubSystemInitialized {
        subsystem: "projections".to_string(),
    });
    assert!(!harness
        .drain_output()
        .iter()
        .any(|m| matches!(m, Message::SystemReady)));

    harness.deliver(Message::SubSystemInitialized {
        subsystem: "standard-users".to_string(),
    });
    assert!(harness
        .drain_output()
        .iter()
        .any(|m| matches!(m, Message::SystemReady)));
}

#[test]
fn auth_provider_failure_escalates_to_shutdown() {
    let mut harness = Harness::new(1);
    harness.init_core_services();

    harness.deliver(Message::AuthenticationProviderInitializationFailed {
        reason: "credential store unreachable".to_string(),
    });

    assert_eq!(harness.controller.role(), Role::ShuttingDown);
    // exit_process captured for when the countdown (or timer) completes.
    let (_, timeout) = harness
        .take_timer(|m| matches!(m, Message::ShutdownTimeout { .. }))
        .expect("bounded shutdown window armed");
    harness.deliver(timeout);
    assert_eq!(harness.runtime.exits.lock().unwrap().as_slice(), &[true]);
}

#[test]
fn follower_reenters_subscription_pipeline_after_leader_connection_loss() {
    let mut harness = Harness::new(3);
    harness.init_core_services();
    let leader = harness.member(1, Role::Leader);
    harness.deliver(Message::ElectionsDone {
        leader: leader.clone(),
        proposal_number: 1,
    });
    harness.deliver(Message::ChaserCaughtUp {
        correlation_id: harness.controller.state_correlation_id(),
    });
    let subscription_id = harness.controller.subscription_id();
    harness.deliver(Message::ReplicaSubscribed {
        subscription_id,
        leader_id: InstanceId(1),
        subscription_position: 0,
    });
    harness.deliver(Message::FollowerAssignment {
        subscription_id,
        leader_id: InstanceId(1),
    });
    assert_eq!(harness.controller.role(), Role::Follower);

    harness.deliver(Message::VNodeConnectionLost {
        endpoint: "127.0.0.1:1201".parse().unwrap(),
    });

    let (delay, reentry) = harness
        .take_timer(|m| matches!(m, Message::BecomePreReplica { .. }))
        .expect("re-entry scheduled");
    assert_eq!(delay, Duration::from_millis(500));

    // Delivering the scheduled message re-enters the pipeline.
    harness.deliver(reentry);
    assert_eq!(harness.controller.role(), Role::PreReplica);
}

#[test]
fn pre_replica_reconnects_after_leader_connection_loss() {
    let mut harness = Harness::new(3);
    harness.init_core_services();
    harness.deliver(Message::ElectionsDone {
        leader: harness.member(1, Role::Leader),
        proposal_number: 1,
    });
    assert_eq!(harness.controller.role(), Role::PreReplica);

    harness.deliver(Message::VNodeConnectionLost {
        endpoint: "127.0.0.1:1201".parse().unwrap(),
    });

    let (delay, reconnect) = harness
        .take_timer(|m| matches!(m, Message::ReconnectToLeader { .. }))
        .expect("reconnect scheduled");
    assert_eq!(delay, Duration::from_millis(500));

    let _ = harness.drain_output();
    harness.deliver(reconnect);
    assert!(harness
        .drain_output()
        .iter()
        .any(|m| matches!(m, Message::ReplicaSubscriptionRequest { .. })));
}

#[test]
fn read_only_replica_follows_gossip_out_and_back() {
    let mut harness = Harness::build(3, true, 0);
    harness.init_core_services();
    assert_eq!(harness.controller.role(), Role::ReadOnlyLeaderless);

    // Adopt the single alive leader from gossip.
    let leader = harness.member(1, Role::Leader);
    harness.deliver(Message::GossipUpdated {
        cluster: ClusterInfo::new(vec![leader.clone(), harness.member(2, Role::Follower)]),
    });
    assert_eq!(harness.controller.role(), Role::PreReadOnlyReplica);

    harness.deliver(Message::ChaserCaughtUp {
        correlation_id: harness.controller.state_correlation_id(),
    });
    let subscription_id = harness.controller.subscription_id();
    harness.deliver(Message::ReplicaSubscribed {
        subscription_id,
        leader_id: InstanceId(1),
        subscription_position: 0,
    });
    assert_eq!(harness.controller.role(), Role::ReadOnlyReplica);

    // The leader dies; gossip reports no alive leader.
    harness.deliver(Message::GossipUpdated {
        cluster: ClusterInfo::new(vec![
            harness.member(1, Role::Leader).dead(),
            harness.member(2, Role::Unknown),
        ]),
    });
    assert_eq!(harness.controller.role(), Role::ReadOnlyLeaderless);

    // Two leaders in gossip is ambiguous, keep waiting; one is adopted.
    harness.deliver(Message::GossipUpdated {
        cluster: ClusterInfo::new(vec![
            harness.member(1, Role::Leader),
            harness.member(2, Role::Leader),
        ]),
    });
    assert_eq!(harness.controller.role(), Role::ReadOnlyLeaderless);

    harness.deliver(Message::GossipUpdated {
        cluster: ClusterInfo::new(vec![harness.member(2, Role::Leader)]),
    });
    assert_eq!(harness.controller.role(), Role::PreReadOnlyReplica);
    assert_eq!(
        harness.controller.leader().map(|l| l.instance_id),
        Some(InstanceId(2))
    );
}

#[test]
fn replica_gossip_without_alive_leader_triggers_elections() {
    let mut harness = Harness::new(3);
    harness.init_core_services();
    harness.deliver(Message::ElectionsDone {
        leader: harness.member(1, Role::Leader),
        proposal_number: 1,
    });
    assert_eq!(harness.controller.role(), Role::PreReplica);
    let _ = harness.drain_output();

    harness.deliver(Message::GossipUpdated {
        cluster: ClusterInfo::new(vec![
            harness.member(1, Role::Leader).dead(),
            harness.member(2, Role::CatchingUp),
        ]),
    });

    assert!(harness
        .drain_output()
        .iter()
        .any(|m| matches!(m, Message::StartElections)));
    // No role change; elections decide what happens next.
    assert_eq!(harness.controller.role(), Role::PreReplica);
}

#[test]
fn elections_announcing_same_foreign_leader_changes_nothing() {
    let mut harness = Harness::new(3);
    harness.init_core_services();
    let leader = harness.member(1, Role::Leader);
    harness.deliver(Message::ElectionsDone {
        leader: leader.clone(),
        proposal_number: 3,
    });
    assert_eq!(harness.controller.role(), Role::PreReplica);
    let id = harness.controller.state_correlation_id();
    let _ = harness.drain_output();

    harness.deliver(Message::ElectionsDone {
        leader,
        proposal_number: 3,
    });

    assert_eq!(harness.controller.role(), Role::PreReplica);
    assert_eq!(harness.controller.state_correlation_id(), id);
    assert!(!harness
        .drain_output()
        .iter()
        .any(|m| matches!(m, Message::WriteEpoch { .. })));
}

#[test]
fn clone_dropped_by_leader_shuts_down_with_exit() {
    let mut harness = Harness::new(3);
    harness.init_core_services();
    harness.deliver(Message::ElectionsDone {
        leader: harness.member(1, Role::Leader),
        proposal_number: 1,
    });
    harness.deliver(Message::ChaserCaughtUp {
        correlation_id: harness.controller.state_correlation_id(),
    });
    let subscription_id = harness.controller.subscription_id();
    harness.deliver(Message::ReplicaSubscribed {
        subscription_id,
        leader_id: InstanceId(1),
        subscription_position: 0,
    });
    harness.deliver(Message::CloneAssignment {
        subscription_id,
        leader_id: InstanceId(1),
    });
    assert_eq!(harness.controller.role(), Role::Clone);

    harness.deliver(Message::DropSubscription {
        subscription_id,
        leader_id: InstanceId(1),
    });

    assert_eq!(harness.controller.role(), Role::ShuttingDown);
}

#[test]
fn scheduled_reentry_is_ignored_once_shutdown_began() {
    let mut harness = Harness::new(3);
    harness.init_core_services();
    let leader = harness.member(1, Role::Leader);
    harness.deliver(Message::ElectionsDone {
        leader,
        proposal_number: 1,
    });
    harness.deliver(Message::ChaserCaughtUp {
        correlation_id: harness.controller.state_correlation_id(),
    });
    let subscription_id = harness.controller.subscription_id();
    harness.deliver(Message::ReplicaSubscribed {
        subscription_id,
        leader_id: InstanceId(1),
        subscription_position: 0,
    });
    harness.deliver(Message::FollowerAssignment {
        subscription_id,
        leader_id: InstanceId(1),
    });

    // The leader connection drops, arming a delayed PreReplica re-entry...
    harness.deliver(Message::VNodeConnectionLost {
        endpoint: "127.0.0.1:1201".parse().unwrap(),
    });
    let (_, reentry) = harness
        .take_timer(|m| matches!(m, Message::BecomePreReplica { .. }))
        .expect("re-entry scheduled");

    // ...but shutdown starts before the timer fires.
    harness.deliver(Message::RequestShutdown {
        exit_process: false,
        shutdown_http: true,
    });
    assert_eq!(harness.controller.role(), Role::ShuttingDown);

    harness.deliver(reentry);

    assert_eq!(harness.controller.role(), Role::ShuttingDown);
    assert!(
        harness.runtime.exits.lock().unwrap().is_empty(),
        "a dead transition attempt must not be fatal during shutdown"
    );
}

#[test]
fn replication_message_from_old_subscription_is_dropped() {
    let mut harness = Harness::new(3);
    harness.init_core_services();
    harness.deliver(Message::ElectionsDone {
        leader: harness.member(1, Role::Leader),
        proposal_number: 1,
    });
    harness.deliver(Message::ChaserCaughtUp {
        correlation_id: harness.controller.state_correlation_id(),
    });
    assert_eq!(harness.controller.role(), Role::PreReplica);

    // A subscription id from some earlier attempt.
    harness.deliver(Message::ReplicaSubscribed {
        subscription_id: CorrelationId::next(),
        leader_id: InstanceId(1),
        subscription_position: 0,
    });

    assert_eq!(harness.controller.role(), Role::PreReplica);
}
