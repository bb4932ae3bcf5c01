//! The node lifecycle controller.
//!
//! A single-consumer state machine attached to the node's main queue. Every
//! inbound event (elections, gossip, replication handshake, timers, client
//! requests, service acknowledgements) arrives here one at a time; the
//! controller reacts by mutating its private state, publishing to the
//! output bus, and scheduling future messages back to itself. No message
//! bypasses the dispatch table.
//!
//! Handlers never block. Waiting is expressed as a scheduled timer message,
//! and cancellation as rotating the relevant correlation id so the stale
//! delivery no-ops.

use crate::bus::{MainQueue, NodeRuntime, OutputBus, TimerService};
use crate::dispatch::{Action, Dispatcher};
use crate::lifecycle::LifecycleTracker;
use crate::member::{MemberInfo, NodeInfo};
use crate::message::{Message, MessageKind};
use crate::role::Role;
use kel_core::{
    CorrelationId, InstanceId, LEADER_DISCOVERY_TIMEOUT, LEADER_RECONNECTION_DELAY,
    LEADER_SUBSCRIPTION_RETRY_DELAY, LEADER_SUBSCRIPTION_TIMEOUT, SHUTDOWN_TIMEOUT,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Roles that consume election results. Read-only replicas follow gossip
/// instead, and the shutdown family no longer transitions at all.
const ELECTION_ROLES: &[Role] = &[
    Role::Unknown,
    Role::DiscoverLeader,
    Role::PreReplica,
    Role::CatchingUp,
    Role::Clone,
    Role::Follower,
    Role::PreLeader,
    Role::Leader,
    Role::ResigningLeader,
];

/// The replica family subscribed (or subscribing) to a writable leader.
const WRITABLE_REPLICA_ROLES: &[Role] = &[
    Role::PreReplica,
    Role::CatchingUp,
    Role::Clone,
    Role::Follower,
];

/// Roles driving the replica subscription handshake.
const SUBSCRIBING_ROLES: &[Role] = &[Role::PreReplica, Role::PreReadOnlyReplica];

const READ_ONLY_ROLES: &[Role] = &[
    Role::ReadOnlyLeaderless,
    Role::PreReadOnlyReplica,
    Role::ReadOnlyReplica,
];

/// The mutable fields owned exclusively by the controller.
#[derive(Debug)]
pub(crate) struct ControllerState {
    pub(crate) role: Role,
    pub(crate) leader: Option<MemberInfo>,
    /// Rotated on every role change tied to a particular leader/epoch.
    pub(crate) state_correlation_id: CorrelationId,
    /// Rotated on every reconnect attempt to the leader.
    pub(crate) leader_connection_correlation_id: CorrelationId,
    /// Rotated each time we subscribe to a leader; `ZERO` when unset.
    pub(crate) subscription_id: CorrelationId,
    pub(crate) exit_process_on_shutdown: bool,
}

/// Construction-time options for the controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub node: NodeInfo,
    pub cluster_size: usize,
    pub subsystem_count: usize,
    pub prepare_timeout: Duration,
    pub commit_timeout: Duration,
}

impl ControllerOptions {
    #[must_use]
    pub fn new(node: NodeInfo, cluster_size: usize) -> Self {
        Self {
            node,
            cluster_size,
            subsystem_count: 0,
            prepare_timeout: Duration::from_millis(2000),
            commit_timeout: Duration::from_millis(2000),
        }
    }
}

pub struct Controller {
    pub(crate) node: NodeInfo,
    pub(crate) cluster_size: usize,
    pub(crate) prepare_timeout: Duration,
    pub(crate) commit_timeout: Duration,
    pub(crate) state: ControllerState,
    pub(crate) lifecycle: LifecycleTracker,
    dispatcher: Dispatcher,
    pub(crate) output: OutputBus,
    pub(crate) main_queue: MainQueue,
    pub(crate) timers: Arc<dyn TimerService>,
    pub(crate) proxy: crate::forward::ForwardingProxy,
    pub(crate) runtime: Arc<dyn NodeRuntime>,
    stopped: bool,
}

impl Controller {
    #[must_use]
    pub fn new(
        options: ControllerOptions,
        output: OutputBus,
        main_queue: MainQueue,
        timers: Arc<dyn TimerService>,
        runtime: Arc<dyn NodeRuntime>,
    ) -> Self {
        let lifecycle = LifecycleTracker::new(options.cluster_size, options.subsystem_count);
        kel_metrics::set_current_role(Role::Initializing.ordinal());
        Self {
            node: options.node,
            cluster_size: options.cluster_size,
            prepare_timeout: options.prepare_timeout,
            commit_timeout: options.commit_timeout,
            state: ControllerState {
                role: Role::Initializing,
                leader: None,
                state_correlation_id: CorrelationId::next(),
                leader_connection_correlation_id: CorrelationId::next(),
                subscription_id: CorrelationId::ZERO,
                exit_process_on_shutdown: false,
            },
            lifecycle,
            dispatcher: build_dispatcher(),
            output,
            main_queue,
            timers,
            proxy: crate::forward::ForwardingProxy::new(),
            runtime,
            stopped: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.state.role
    }

    #[inline]
    #[must_use]
    pub fn leader(&self) -> Option<&MemberInfo> {
        self.state.leader.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn state_correlation_id(&self) -> CorrelationId {
        self.state.state_correlation_id
    }

    #[inline]
    #[must_use]
    pub fn leader_connection_correlation_id(&self) -> CorrelationId {
        self.state.leader_connection_correlation_id
    }

    #[inline]
    #[must_use]
    pub fn subscription_id(&self) -> CorrelationId {
        self.state.subscription_id
    }

    #[inline]
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    #[must_use]
    pub fn forwarding_proxy(&self) -> crate::forward::ForwardingProxy {
        self.proxy.clone()
    }

    /// Consume the main queue until the controller stops.
    pub async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Message>) {
        info!(
            target: "keel::cluster",
            instance = %self.node.instance_id,
            cluster_size = self.cluster_size,
            read_only = self.node.is_read_only_replica,
            "Node controller started"
        );

        while let Some(message) = queue.recv().await {
            self.handle(message);
            if self.stopped {
                break;
            }
        }

        info!(target: "keel::cluster", "Node controller stopped");
    }

    /// Process one inbound message through the dispatch table.
    pub fn handle(&mut self, message: Message) {
        let kind = message.kind();
        match self.dispatcher.lookup(self.state.role, kind) {
            Some(Action::Handle(handler)) => handler(self, message),
            Some(Action::Forward) => self.output.publish(message),
            Some(Action::Ignore) => {
                trace!(
                    target: "keel::cluster",
                    role = %self.state.role,
                    kind = ?kind,
                    "Message ignored in current role"
                );
            },
            None => {
                if kind.is_state_change() {
                    self.fatal(
                        "unhandled state change",
                        format!("{kind:?} has no mapping in role {}", self.state.role),
                    );
                } else {
                    self.output.publish(message);
                }
            },
        }
    }

    // =====================================================================
    // Internal plumbing
    // =====================================================================

    pub(crate) fn fatal(&mut self, context: &'static str, detail: String) {
        error!(
            target: "keel::cluster",
            role = %self.state.role,
            context,
            detail = %detail,
            "Fatal invariant violation, terminating node"
        );
        self.stopped = true;
        self.runtime.exit_process(false);
    }

    fn rotate_state_id(&mut self) -> CorrelationId {
        let id = CorrelationId::next();
        self.state.state_correlation_id = id;
        id
    }

    fn rotate_connection_id(&mut self) -> CorrelationId {
        let id = CorrelationId::next();
        self.state.leader_connection_correlation_id = id;
        id
    }

    fn rotate_subscription_id(&mut self) -> CorrelationId {
        let id = CorrelationId::next();
        self.state.subscription_id = id;
        id
    }

    /// True (and counted) when `id` belongs to a superseded attempt.
    fn stale_state_id(&self, id: CorrelationId, context: &'static str) -> bool {
        if id == self.state.state_correlation_id {
            return false;
        }
        trace!(
            target: "keel::cluster",
            context,
            stale = %id,
            live = %self.state.state_correlation_id,
            "Dropping stale message"
        );
        kel_metrics::increment_stale_drops();
        true
    }

    /// Validate preconditions and assume `target`. Returns false after a
    /// fatal violation; callers must bail out without publishing.
    fn transition(&mut self, target: Role, leader: Option<MemberInfo>) -> bool {
        if target.requires_leader() && leader.is_none() {
            self.fatal("role precondition", format!("{target} entered without a leader"));
            return false;
        }
        if target.must_be_leaderless() && leader.is_some() {
            self.fatal("role precondition", format!("{target} entered with a leader set"));
            return false;
        }
        if target == Role::Leader {
            let leads_self = leader
                .as_ref()
                .is_some_and(|l| l.instance_id == self.node.instance_id);
            if !leads_self {
                self.fatal(
                    "role precondition",
                    "Leader entered while believing in another leader".to_string(),
                );
                return false;
            }
        }

        info!(
            target: "keel::cluster",
            from = %self.state.role,
            to = %target,
            leader = leader.as_ref().map_or_else(|| "none".to_string(), |l| l.instance_id.to_string()),
            "Node role changed"
        );
        self.state.role = target;
        self.state.leader = leader;
        kel_metrics::increment_role_transitions();
        kel_metrics::set_current_role(target.ordinal());
        true
    }

    /// Validate a replication message against the live subscription.
    ///
    /// An unset id on the message is a programmer error; a mismatched id is
    /// a silently dropped leftover of an earlier subscription; a matching
    /// id pointing at the wrong leader means the leader invariant was lost.
    fn is_legitimate_replication_message(
        &mut self,
        subscription_id: CorrelationId,
        leader_id: InstanceId,
        context: &'static str,
    ) -> bool {
        if subscription_id.is_unset() {
            self.fatal(context, "replication message with unset subscription id".to_string());
            return false;
        }
        if subscription_id != self.state.subscription_id {
            trace!(
                target: "keel::replication",
                context,
                stale = %subscription_id,
                live = %self.state.subscription_id,
                "Dropping replication message for a superseded subscription"
            );
            kel_metrics::increment_stale_drops();
            return false;
        }
        match &self.state.leader {
            Some(leader) if leader.instance_id == leader_id => true,
            other => {
                let believed = other
                    .as_ref()
                    .map_or_else(|| "none".to_string(), |l| l.instance_id.to_string());
                self.fatal(
                    context,
                    format!(
                        "subscription id matches but message leader {leader_id} != believed leader {believed}"
                    ),
                );
                false
            },
        }
    }

    fn trigger_elections(&mut self, cause: &'static str) {
        info!(target: "keel::cluster", cause, "Requesting elections");
        kel_metrics::increment_elections_triggered();
        self.output.publish(Message::StartElections);
    }

    // =====================================================================
    // System lifecycle
    // =====================================================================

    fn on_system_init(&mut self, message: Message) {
        info!(target: "keel::lifecycle", "System init");
        self.output.publish(message);
    }

    fn on_service_initialized(&mut self, message: Message) {
        let Message::ServiceInitialized { service } = message else {
            return;
        };
        if self.lifecycle.service_initialized(&service) {
            self.main_queue.publish(Message::SystemStart);
        }
    }

    fn on_system_start(&mut self, message: Message) {
        info!(target: "keel::lifecycle", "System start");
        self.output.publish(message);

        let correlation_id = self.state.state_correlation_id;
        if self.node.is_read_only_replica {
            self.main_queue
                .publish(Message::BecomeReadOnlyLeaderless { correlation_id });
        } else if self.cluster_size > 1 {
            self.main_queue
                .publish(Message::BecomeDiscoverLeader { correlation_id });
        } else {
            self.main_queue
                .publish(Message::BecomeUnknown { correlation_id });
        }
    }

    fn on_authentication_provider_initialized(&mut self, message: Message) {
        info!(target: "keel::lifecycle", "Authentication provider initialized, starting subsystems");
        self.output.publish(message);
        self.main_queue.publish(Message::SystemCoreReady);
    }

    fn on_authentication_provider_failed(&mut self, message: Message) {
        let Message::AuthenticationProviderInitializationFailed { reason } = message else {
            return;
        };
        error!(
            target: "keel::lifecycle",
            reason = %reason,
            "Authentication provider failed to initialize, shutting down"
        );
        self.main_queue.publish(Message::BecomeShuttingDown {
            exit_process: true,
            shutdown_http: true,
        });
    }

    fn on_system_core_ready(&mut self, message: Message) {
        self.output.publish(message);
        if self.lifecycle.subsystems_pending() == 0 {
            info!(target: "keel::lifecycle", "System ready");
            self.output.publish(Message::SystemReady);
        } else {
            debug!(
                target: "keel::lifecycle",
                pending = self.lifecycle.subsystems_pending(),
                "Core ready, waiting for subsystems"
            );
        }
    }

    fn on_subsystem_initialized(&mut self, message: Message) {
        let Message::SubSystemInitialized { subsystem } = message else {
            return;
        };
        debug!(target: "keel::lifecycle", subsystem = %subsystem, "Subsystem initialized");
        if self.lifecycle.subsystem_initialized() {
            info!(target: "keel::lifecycle", "System ready");
            self.output.publish(Message::SystemReady);
        }
    }

    // =====================================================================
    // Shutdown
    // =====================================================================

    fn on_request_shutdown(&mut self, message: Message) {
        let Message::RequestShutdown {
            exit_process,
            shutdown_http,
        } = message
        else {
            return;
        };
        info!(
            target: "keel::lifecycle",
            exit_process,
            shutdown_http,
            "Shutdown requested"
        );
        self.main_queue.publish(Message::BecomeShuttingDown {
            exit_process,
            shutdown_http,
        });
    }

    fn on_become_shutting_down(&mut self, message: Message) {
        let Message::BecomeShuttingDown {
            exit_process,
            shutdown_http: _,
        } = message.clone()
        else {
            return;
        };
        if matches!(self.state.role, Role::ShuttingDown | Role::Shutdown) {
            debug!(target: "keel::lifecycle", "Already shutting down");
            return;
        }

        self.state.exit_process_on_shutdown = exit_process;
        if !self.transition(Role::ShuttingDown, None) {
            return;
        }
        self.output.publish(message);

        let correlation_id = self.rotate_state_id();
        self.timers.schedule(
            SHUTDOWN_TIMEOUT,
            Message::ShutdownTimeout { correlation_id },
        );
    }

    fn on_service_shutdown(&mut self, message: Message) {
        let Message::ServiceShutdown { service } = message else {
            return;
        };
        if self.lifecycle.service_shutdown(&service) {
            self.shutdown_node();
        }
    }

    fn on_shutdown_timeout(&mut self, message: Message) {
        let Message::ShutdownTimeout { correlation_id } = message else {
            return;
        };
        if self.stale_state_id(correlation_id, "shutdown timeout") {
            return;
        }
        error!(
            target: "keel::lifecycle",
            outstanding = self.lifecycle.service_shutdowns_expected(),
            "Shutdown timed out waiting for service acknowledgements, forcing shutdown"
        );
        kel_metrics::increment_shutdown_timeouts();
        self.shutdown_node();
    }

    /// Close the log database and enter the terminal role. Only legal
    /// while shutting down.
    fn shutdown_node(&mut self) {
        if self.state.role != Role::ShuttingDown {
            self.fatal(
                "shutdown",
                format!("Shutdown() called in role {}", self.state.role),
            );
            return;
        }
        self.runtime.close_database();
        info!(target: "keel::lifecycle", "Log database closed");
        self.main_queue.publish(Message::BecomeShutdown);
    }

    fn on_become_shutdown(&mut self, message: Message) {
        if !self.transition(Role::Shutdown, None) {
            return;
        }
        self.output.publish(message);
        self.runtime.stop_workers();
        self.stopped = true;
        info!(
            target: "keel::lifecycle",
            exit_process = self.state.exit_process_on_shutdown,
            "Node shut down"
        );
        if self.state.exit_process_on_shutdown {
            self.runtime.exit_process(true);
        }
    }

    // =====================================================================
    // Elections
    // =====================================================================

    fn on_elections_done(&mut self, message: Message) {
        let Message::ElectionsDone {
            leader,
            proposal_number,
        } = message
        else {
            return;
        };

        let same_leader = self
            .state
            .leader
            .as_ref()
            .is_some_and(|l| l.instance_id == leader.instance_id);
        if same_leader {
            if leader.instance_id == self.node.instance_id && self.state.role == Role::Leader {
                info!(
                    target: "keel::cluster",
                    proposal = proposal_number,
                    "Re-elected as leader, writing new epoch"
                );
                self.output.publish(Message::WriteEpoch { proposal_number });
            } else {
                debug!(
                    target: "keel::cluster",
                    leader = %leader.instance_id,
                    "Elections confirmed the current leader"
                );
            }
            return;
        }

        info!(
            target: "keel::cluster",
            leader = %leader.instance_id,
            proposal = proposal_number,
            "Elections done"
        );
        let correlation_id = self.rotate_state_id();
        let _ = self.rotate_connection_id();
        let _ = self.rotate_subscription_id();

        if leader.instance_id == self.node.instance_id {
            self.main_queue.publish(Message::BecomePreLeader {
                correlation_id,
                leader,
            });
        } else {
            self.main_queue.publish(Message::BecomePreReplica {
                correlation_id,
                leader,
            });
        }
    }

    fn on_no_quorum(&mut self, _message: Message) {
        warn!(target: "keel::cluster", "Quorum lost, stepping down");
        let correlation_id = self.rotate_state_id();
        self.main_queue
            .publish(Message::BecomeUnknown { correlation_id });
        self.trigger_elections("no quorum");
    }

    // =====================================================================
    // Gossip
    // =====================================================================

    fn on_gossip_leader(&mut self, message: Message) {
        let Message::GossipUpdated { cluster } = message else {
            return;
        };
        let alive_leaders = cluster.alive_leader_count();
        if alive_leaders >= 2 {
            warn!(
                target: "keel::cluster",
                alive_leaders,
                "Split brain: multiple alive leaders in gossip"
            );
            kel_metrics::increment_split_brain_detections();
            self.trigger_elections("split brain");
        }
    }

    fn on_gossip_replica(&mut self, message: Message) {
        let Message::GossipUpdated { cluster } = message else {
            return;
        };
        let Some(leader) = &self.state.leader else {
            return;
        };
        if !cluster.reports_alive_leader(leader.instance_id) {
            info!(
                target: "keel::cluster",
                leader = %leader.instance_id,
                "Gossip no longer reports our leader as an alive leader"
            );
            self.trigger_elections("leader lost in gossip");
        }
    }

    fn on_gossip_read_only(&mut self, message: Message) {
        let Message::GossipUpdated { cluster } = message else {
            return;
        };
        let Some(leader) = &self.state.leader else {
            return;
        };
        if !cluster.reports_alive_leader(leader.instance_id) {
            info!(
                target: "keel::cluster",
                leader = %leader.instance_id,
                "Leader gone, read-only replica returning to leaderless"
            );
            let correlation_id = self.rotate_state_id();
            let _ = self.rotate_connection_id();
            let _ = self.rotate_subscription_id();
            self.main_queue
                .publish(Message::BecomeReadOnlyLeaderless { correlation_id });
        }
    }

    fn on_gossip_read_only_leaderless(&mut self, message: Message) {
        let Message::GossipUpdated { cluster } = message else {
            return;
        };
        let Some(leader) = cluster.single_alive_leader().cloned() else {
            trace!(target: "keel::cluster", "Still leaderless, waiting for gossip");
            return;
        };
        info!(
            target: "keel::cluster",
            leader = %leader.instance_id,
            "Gossip reports a single alive leader, adopting it"
        );
        let correlation_id = self.rotate_state_id();
        let _ = self.rotate_connection_id();
        let _ = self.rotate_subscription_id();
        self.main_queue.publish(Message::BecomePreReadOnlyReplica {
            correlation_id,
            leader,
        });
    }

    fn on_gossip_discover_leader(&mut self, message: Message) {
        let Message::GossipUpdated { cluster } = message else {
            return;
        };
        let Some(leader) = cluster.single_alive_leader().cloned() else {
            trace!(target: "keel::cluster", "Discovery: no unambiguous leader in gossip yet");
            return;
        };
        info!(
            target: "keel::cluster",
            leader = %leader.instance_id,
            "Discovery found the cluster leader"
        );
        let correlation_id = self.rotate_state_id();
        let _ = self.rotate_connection_id();
        let _ = self.rotate_subscription_id();
        self.output.publish(Message::LeaderFound {
            leader: leader.clone(),
        });
        self.main_queue.publish(Message::BecomePreReplica {
            correlation_id,
            leader,
        });
    }

    fn on_discovery_timeout(&mut self, message: Message) {
        let Message::DiscoveryTimeout { correlation_id } = message else {
            return;
        };
        if self.stale_state_id(correlation_id, "discovery timeout") {
            return;
        }
        info!(target: "keel::cluster", "Leader discovery timed out");
        let correlation_id = self.rotate_state_id();
        self.main_queue
            .publish(Message::BecomeUnknown { correlation_id });
    }

    // =====================================================================
    // Role transitions
    // =====================================================================

    fn on_become_unknown(&mut self, message: Message) {
        let Message::BecomeUnknown { correlation_id } = message.clone() else {
            return;
        };
        if self.stale_state_id(correlation_id, "become unknown") {
            return;
        }
        if self.transition(Role::Unknown, None) {
            self.output.publish(message);
        }
    }

    fn on_become_discover_leader(&mut self, message: Message) {
        let Message::BecomeDiscoverLeader { correlation_id } = message.clone() else {
            return;
        };
        if self.stale_state_id(correlation_id, "become discover leader") {
            return;
        }
        if !self.transition(Role::DiscoverLeader, None) {
            return;
        }
        self.output.publish(message);
        self.timers.schedule(
            LEADER_DISCOVERY_TIMEOUT,
            Message::DiscoveryTimeout { correlation_id },
        );
    }

    fn on_become_pre_leader(&mut self, message: Message) {
        let Message::BecomePreLeader {
            correlation_id,
            leader,
        } = message.clone()
        else {
            return;
        };
        if self.stale_state_id(correlation_id, "become pre-leader") {
            return;
        }
        if leader.instance_id != self.node.instance_id {
            self.fatal(
                "become pre-leader",
                format!("elected leader is {}, not this node", leader.instance_id),
            );
            return;
        }
        if !self.transition(Role::PreLeader, Some(leader)) {
            return;
        }
        self.output.publish(message);
        self.main_queue.publish(Message::WaitForChaserToCatchUp {
            correlation_id,
            attempt: 0,
        });
    }

    fn on_become_leader(&mut self, message: Message) {
        let Message::BecomeLeader { correlation_id } = message.clone() else {
            return;
        };
        if self.stale_state_id(correlation_id, "become leader") {
            return;
        }
        let leader = self.state.leader.clone();
        if self.transition(Role::Leader, leader) {
            self.output.publish(message);
        }
    }

    fn on_initiate_leader_resignation(&mut self, _message: Message) {
        info!(target: "keel::cluster", "Leader resignation initiated");
        // Resignation keeps the current attempt's correlation id.
        self.main_queue.publish(Message::BecomeResigningLeader {
            correlation_id: self.state.state_correlation_id,
        });
    }

    fn on_become_resigning_leader(&mut self, message: Message) {
        let Message::BecomeResigningLeader { correlation_id } = message.clone() else {
            return;
        };
        if self.stale_state_id(correlation_id, "become resigning leader") {
            return;
        }
        let leader = self.state.leader.clone();
        if self.transition(Role::ResigningLeader, leader) {
            self.output.publish(message);
        }
    }

    fn on_request_queue_drained(&mut self, _message: Message) {
        info!(target: "keel::cluster", "Request queue drained, resignation complete");
        let correlation_id = self.rotate_state_id();
        self.main_queue
            .publish(Message::BecomeUnknown { correlation_id });
    }

    fn on_become_pre_replica(&mut self, message: Message) {
        let Message::BecomePreReplica {
            correlation_id,
            leader,
        } = message.clone()
        else {
            return;
        };
        if self.stale_state_id(correlation_id, "become pre-replica") {
            return;
        }
        if !self.transition(Role::PreReplica, Some(leader)) {
            return;
        }
        self.output.publish(message);
        self.main_queue.publish(Message::WaitForChaserToCatchUp {
            correlation_id,
            attempt: 0,
        });
    }

    fn on_become_catching_up(&mut self, message: Message) {
        let Message::BecomeCatchingUp {
            correlation_id,
            leader,
        } = message.clone()
        else {
            return;
        };
        if self.stale_state_id(correlation_id, "become catching up") {
            return;
        }
        if self.transition(Role::CatchingUp, Some(leader)) {
            self.output.publish(message);
        }
    }

    fn on_become_clone(&mut self, message: Message) {
        let Message::BecomeClone {
            correlation_id,
            leader,
        } = message.clone()
        else {
            return;
        };
        if self.stale_state_id(correlation_id, "become clone") {
            return;
        }
        if self.transition(Role::Clone, Some(leader)) {
            self.output.publish(message);
        }
    }

    fn on_become_follower(&mut self, message: Message) {
        let Message::BecomeFollower {
            correlation_id,
            leader,
        } = message.clone()
        else {
            return;
        };
        if self.stale_state_id(correlation_id, "become follower") {
            return;
        }
        if self.transition(Role::Follower, Some(leader)) {
            self.output.publish(message);
        }
    }

    fn on_become_read_only_leaderless(&mut self, message: Message) {
        let Message::BecomeReadOnlyLeaderless { correlation_id } = message.clone() else {
            return;
        };
        if self.stale_state_id(correlation_id, "become read-only leaderless") {
            return;
        }
        if self.transition(Role::ReadOnlyLeaderless, None) {
            self.output.publish(message);
        }
    }

    fn on_become_pre_read_only_replica(&mut self, message: Message) {
        let Message::BecomePreReadOnlyReplica {
            correlation_id,
            leader,
        } = message.clone()
        else {
            return;
        };
        if self.stale_state_id(correlation_id, "become pre-read-only replica") {
            return;
        }
        if !self.transition(Role::PreReadOnlyReplica, Some(leader)) {
            return;
        }
        self.output.publish(message);
        self.main_queue.publish(Message::WaitForChaserToCatchUp {
            correlation_id,
            attempt: 0,
        });
    }

    fn on_become_read_only_replica(&mut self, message: Message) {
        let Message::BecomeReadOnlyReplica {
            correlation_id,
            leader,
        } = message.clone()
        else {
            return;
        };
        if self.stale_state_id(correlation_id, "become read-only replica") {
            return;
        }
        if self.transition(Role::ReadOnlyReplica, Some(leader)) {
            self.output.publish(message);
        }
    }

    // =====================================================================
    // Chaser catch-up
    // =====================================================================

    fn on_chaser_caught_up_pre_leader(&mut self, message: Message) {
        let Message::ChaserCaughtUp { correlation_id } = message else {
            return;
        };
        if self.stale_state_id(correlation_id, "chaser caught up") {
            return;
        }
        self.main_queue
            .publish(Message::BecomeLeader { correlation_id });
    }

    fn on_chaser_caught_up_subscribe(&mut self, message: Message) {
        let Message::ChaserCaughtUp { correlation_id } = message else {
            return;
        };
        if self.stale_state_id(correlation_id, "chaser caught up") {
            return;
        }
        self.main_queue
            .publish(Message::SubscribeToLeader { correlation_id });
    }

    // =====================================================================
    // Replica subscription handshake
    // =====================================================================

    fn on_subscribe_to_leader(&mut self, message: Message) {
        let Message::SubscribeToLeader { correlation_id } = message else {
            return;
        };
        if self.stale_state_id(correlation_id, "subscribe to leader") {
            return;
        }
        let Some(leader_id) = self.state.leader.as_ref().map(|l| l.instance_id) else {
            self.fatal("subscribe", "subscribing with no leader".to_string());
            return;
        };

        let subscription_id = self.rotate_subscription_id();
        info!(
            target: "keel::replication",
            leader = %leader_id,
            subscription = %subscription_id,
            "Subscribing to leader"
        );
        self.output.publish(Message::ReplicaSubscriptionRequest {
            subscription_id,
            leader_id,
            replica_id: self.node.instance_id,
        });

        // Watchdog: if the handshake stalls, this re-subscribes with a
        // fresh subscription id; once the role moves on it no-ops.
        self.timers.schedule(
            LEADER_SUBSCRIPTION_TIMEOUT,
            Message::SubscribeToLeader { correlation_id },
        );
    }

    fn on_replica_subscription_retry(&mut self, message: Message) {
        let Message::ReplicaSubscriptionRetry {
            subscription_id,
            leader_id,
        } = message
        else {
            return;
        };
        if !self.is_legitimate_replication_message(subscription_id, leader_id, "subscription retry")
        {
            return;
        }
        debug!(
            target: "keel::replication",
            leader = %leader_id,
            "Leader asked us to retry the subscription"
        );
        self.timers.schedule(
            LEADER_SUBSCRIPTION_RETRY_DELAY,
            Message::SubscribeToLeader {
                correlation_id: self.state.state_correlation_id,
            },
        );
    }

    fn on_replica_subscribed(&mut self, message: Message) {
        let Message::ReplicaSubscribed {
            subscription_id,
            leader_id,
            subscription_position,
        } = message
        else {
            return;
        };
        if !self.is_legitimate_replication_message(subscription_id, leader_id, "replica subscribed")
        {
            return;
        }
        info!(
            target: "keel::replication",
            leader = %leader_id,
            position = subscription_position,
            "Subscribed to leader"
        );

        let correlation_id = self.state.state_correlation_id;
        let Some(leader) = self.state.leader.clone() else {
            return;
        };
        if self.node.is_read_only_replica {
            self.main_queue.publish(Message::BecomeReadOnlyReplica {
                correlation_id,
                leader,
            });
        } else {
            self.main_queue.publish(Message::BecomeCatchingUp {
                correlation_id,
                leader,
            });
        }
    }

    fn on_follower_assignment(&mut self, message: Message) {
        let Message::FollowerAssignment {
            subscription_id,
            leader_id,
        } = message
        else {
            return;
        };
        if !self.is_legitimate_replication_message(subscription_id, leader_id, "follower assignment")
        {
            return;
        }
        let correlation_id = self.state.state_correlation_id;
        let Some(leader) = self.state.leader.clone() else {
            return;
        };
        self.main_queue.publish(Message::BecomeFollower {
            correlation_id,
            leader,
        });
    }

    fn on_clone_assignment(&mut self, message: Message) {
        let Message::CloneAssignment {
            subscription_id,
            leader_id,
        } = message
        else {
            return;
        };
        if !self.is_legitimate_replication_message(subscription_id, leader_id, "clone assignment") {
            return;
        }
        let correlation_id = self.state.state_correlation_id;
        let Some(leader) = self.state.leader.clone() else {
            return;
        };
        self.main_queue.publish(Message::BecomeClone {
            correlation_id,
            leader,
        });
    }

    fn on_drop_subscription(&mut self, message: Message) {
        let Message::DropSubscription {
            subscription_id,
            leader_id,
        } = message
        else {
            return;
        };
        if !self.is_legitimate_replication_message(subscription_id, leader_id, "drop subscription") {
            return;
        }
        warn!(
            target: "keel::replication",
            leader = %leader_id,
            "Leader dropped our subscription, shutting down"
        );
        self.main_queue.publish(Message::BecomeShuttingDown {
            exit_process: true,
            shutdown_http: true,
        });
    }

    // =====================================================================
    // Leader connection maintenance
    // =====================================================================

    fn on_connection_lost_replica(&mut self, message: Message) {
        let Message::VNodeConnectionLost { endpoint } = message else {
            return;
        };
        let Some(leader) = self.state.leader.clone() else {
            return;
        };
        if !leader.has_internal_endpoint(&endpoint) {
            trace!(
                target: "keel::replication",
                endpoint = %endpoint,
                "Connection lost to a non-leader endpoint, no retry"
            );
            return;
        }

        warn!(
            target: "keel::replication",
            leader = %leader.instance_id,
            endpoint = %endpoint,
            "Connection to leader lost"
        );
        let connection_correlation_id = self.rotate_connection_id();
        if self.state.role == Role::PreReplica {
            self.timers.schedule(
                LEADER_RECONNECTION_DELAY,
                Message::ReconnectToLeader {
                    connection_correlation_id,
                },
            );
        } else {
            // Re-enter the subscription pipeline from the top.
            let correlation_id = self.rotate_state_id();
            self.timers.schedule(
                LEADER_RECONNECTION_DELAY,
                Message::BecomePreReplica {
                    correlation_id,
                    leader,
                },
            );
        }
    }

    fn on_connection_lost_read_only(&mut self, message: Message) {
        let Message::VNodeConnectionLost { endpoint } = message else {
            return;
        };
        let Some(leader) = self.state.leader.clone() else {
            return;
        };
        if !leader.has_internal_endpoint(&endpoint) {
            trace!(
                target: "keel::replication",
                endpoint = %endpoint,
                "Connection lost to a non-leader endpoint, no retry"
            );
            return;
        }

        warn!(
            target: "keel::replication",
            leader = %leader.instance_id,
            endpoint = %endpoint,
            "Connection to leader lost"
        );
        let connection_correlation_id = self.rotate_connection_id();
        if self.state.role == Role::PreReadOnlyReplica {
            self.timers.schedule(
                LEADER_RECONNECTION_DELAY,
                Message::ReconnectToLeader {
                    connection_correlation_id,
                },
            );
        } else {
            let correlation_id = self.rotate_state_id();
            self.timers.schedule(
                LEADER_RECONNECTION_DELAY,
                Message::BecomePreReadOnlyReplica {
                    correlation_id,
                    leader,
                },
            );
        }
    }

    fn on_reconnect_to_leader(&mut self, message: Message) {
        let Message::ReconnectToLeader {
            connection_correlation_id,
        } = message
        else {
            return;
        };
        if connection_correlation_id != self.state.leader_connection_correlation_id {
            kel_metrics::increment_stale_drops();
            return;
        }
        info!(target: "keel::replication", "Reconnecting to leader");
        self.main_queue.publish(Message::SubscribeToLeader {
            correlation_id: self.state.state_correlation_id,
        });
    }

    fn on_leader_connection_failed(&mut self, message: Message) {
        let Message::LeaderConnectionFailed {
            connection_correlation_id,
        } = message
        else {
            return;
        };
        if connection_correlation_id != self.state.leader_connection_correlation_id {
            kel_metrics::increment_stale_drops();
            return;
        }
        warn!(target: "keel::replication", "Connection attempt to leader failed");
        let connection_correlation_id = self.rotate_connection_id();
        self.timers.schedule(
            LEADER_RECONNECTION_DELAY,
            Message::ReconnectToLeader {
                connection_correlation_id,
            },
        );
    }
}

/// Build the full routing table.
///
/// Layering: rules for every role first, then role families, then single
/// roles; higher specificity wins regardless of declaration order. Kinds
/// absent from the table fall back to forward-to-output, except
/// state-change kinds, which are fatal when unrouted.
fn build_dispatcher() -> Dispatcher {
    let mut builder = Dispatcher::builder();

    let _ = builder
        .for_all_roles()
        .handle(MessageKind::ClientRequest, Controller::on_client_request)
        .handle(MessageKind::RequestShutdown, Controller::on_request_shutdown)
        .handle(
            MessageKind::BecomeShuttingDown,
            Controller::on_become_shutting_down,
        )
        .handle(
            MessageKind::ServiceInitialized,
            Controller::on_service_initialized,
        )
        .handle(
            MessageKind::SubSystemInitialized,
            Controller::on_subsystem_initialized,
        )
        .handle(MessageKind::SystemCoreReady, Controller::on_system_core_ready)
        .handle(
            MessageKind::AuthenticationProviderInitialized,
            Controller::on_authentication_provider_initialized,
        )
        .handle(
            MessageKind::AuthenticationProviderInitializationFailed,
            Controller::on_authentication_provider_failed,
        )
        // Stale leftovers of superseded attempts die quietly rather than
        // echoing onto the output bus.
        .ignore(MessageKind::DiscoveryTimeout)
        .ignore(MessageKind::ShutdownTimeout)
        .ignore(MessageKind::ChaserCaughtUp)
        .ignore(MessageKind::SubscribeToLeader)
        .ignore(MessageKind::ReconnectToLeader)
        .ignore(MessageKind::LeaderConnectionFailed)
        .ignore(MessageKind::ReplicaSubscriptionRetry)
        .ignore(MessageKind::ReplicaSubscribed)
        .ignore(MessageKind::FollowerAssignment)
        .ignore(MessageKind::CloneAssignment)
        .ignore(MessageKind::DropSubscription)
        .ignore(MessageKind::NoQuorum)
        .ignore(MessageKind::RequestQueueDrained)
        .ignore(MessageKind::InitiateLeaderResignation)
        .ignore(MessageKind::WriteEpoch);

    let _ = builder
        .for_roles(ELECTION_ROLES)
        .handle(MessageKind::ElectionsDone, Controller::on_elections_done)
        .handle(MessageKind::BecomePreLeader, Controller::on_become_pre_leader)
        .handle(
            MessageKind::BecomePreReplica,
            Controller::on_become_pre_replica,
        );

    let _ = builder
        .for_roles(WRITABLE_REPLICA_ROLES)
        .handle(MessageKind::GossipUpdated, Controller::on_gossip_replica)
        .handle(
            MessageKind::VNodeConnectionLost,
            Controller::on_connection_lost_replica,
        );

    let _ = builder
        .for_roles(SUBSCRIBING_ROLES)
        .handle(
            MessageKind::ChaserCaughtUp,
            Controller::on_chaser_caught_up_subscribe,
        )
        .handle(
            MessageKind::SubscribeToLeader,
            Controller::on_subscribe_to_leader,
        )
        .handle(
            MessageKind::ReconnectToLeader,
            Controller::on_reconnect_to_leader,
        )
        .handle(
            MessageKind::LeaderConnectionFailed,
            Controller::on_leader_connection_failed,
        )
        .handle(
            MessageKind::ReplicaSubscriptionRetry,
            Controller::on_replica_subscription_retry,
        )
        .handle(
            MessageKind::ReplicaSubscribed,
            Controller::on_replica_subscribed,
        );

    let _ = builder
        .for_roles(&[Role::CatchingUp, Role::Clone])
        .handle(
            MessageKind::FollowerAssignment,
            Controller::on_follower_assignment,
        );

    let _ = builder
        .for_roles(&[Role::CatchingUp, Role::Follower])
        .handle(MessageKind::CloneAssignment, Controller::on_clone_assignment);

    let _ = builder
        .for_roles(&[Role::PreLeader, Role::Leader])
        .handle(MessageKind::NoQuorum, Controller::on_no_quorum);

    let _ = builder
        .for_roles(&[Role::PreReadOnlyReplica, Role::ReadOnlyReplica])
        .handle(MessageKind::GossipUpdated, Controller::on_gossip_read_only)
        .handle(
            MessageKind::VNodeConnectionLost,
            Controller::on_connection_lost_read_only,
        );

    let _ = builder.for_roles(READ_ONLY_ROLES).handle(
        MessageKind::BecomePreReadOnlyReplica,
        Controller::on_become_pre_read_only_replica,
    );

    let _ = builder
        .for_roles(&[Role::Initializing, Role::PreReadOnlyReplica, Role::ReadOnlyReplica])
        .handle(
            MessageKind::BecomeReadOnlyLeaderless,
            Controller::on_become_read_only_leaderless,
        );

    let _ = builder
        .for_roles(&[
            Role::Initializing,
            Role::DiscoverLeader,
            Role::PreLeader,
            Role::Leader,
            Role::ResigningLeader,
        ])
        .handle(MessageKind::BecomeUnknown, Controller::on_become_unknown);

    // Once shutdown begins, leftover transition messages (for instance a
    // scheduled re-entry into PreReplica) are dead attempts, not errors.
    let _ = builder
        .for_roles(&[Role::ShuttingDown, Role::Shutdown])
        .ignore(MessageKind::BecomeUnknown)
        .ignore(MessageKind::BecomeDiscoverLeader)
        .ignore(MessageKind::BecomePreLeader)
        .ignore(MessageKind::BecomeLeader)
        .ignore(MessageKind::BecomeResigningLeader)
        .ignore(MessageKind::BecomePreReplica)
        .ignore(MessageKind::BecomeCatchingUp)
        .ignore(MessageKind::BecomeClone)
        .ignore(MessageKind::BecomeFollower)
        .ignore(MessageKind::BecomeReadOnlyLeaderless)
        .ignore(MessageKind::BecomePreReadOnlyReplica)
        .ignore(MessageKind::BecomeReadOnlyReplica);

    let _ = builder
        .for_role(Role::Shutdown)
        .ignore(MessageKind::BecomeShutdown);

    let _ = builder
        .for_role(Role::Initializing)
        .handle(MessageKind::SystemInit, Controller::on_system_init)
        .handle(MessageKind::SystemStart, Controller::on_system_start)
        .handle(
            MessageKind::BecomeDiscoverLeader,
            Controller::on_become_discover_leader,
        );

    let _ = builder
        .for_role(Role::DiscoverLeader)
        .handle(
            MessageKind::GossipUpdated,
            Controller::on_gossip_discover_leader,
        )
        .handle(MessageKind::DiscoveryTimeout, Controller::on_discovery_timeout);

    let _ = builder
        .for_role(Role::PreReplica)
        .handle(MessageKind::BecomeCatchingUp, Controller::on_become_catching_up);

    let _ = builder.for_roles(&[Role::CatchingUp, Role::Clone]).handle(
        MessageKind::BecomeFollower,
        Controller::on_become_follower,
    );

    let _ = builder
        .for_roles(&[Role::CatchingUp, Role::Follower])
        .handle(MessageKind::BecomeClone, Controller::on_become_clone);

    let _ = builder
        .for_role(Role::PreLeader)
        .handle(
            MessageKind::ChaserCaughtUp,
            Controller::on_chaser_caught_up_pre_leader,
        )
        .handle(MessageKind::BecomeLeader, Controller::on_become_leader);

    let _ = builder
        .for_role(Role::Leader)
        .handle(MessageKind::GossipUpdated, Controller::on_gossip_leader)
        .handle(
            MessageKind::InitiateLeaderResignation,
            Controller::on_initiate_leader_resignation,
        )
        .handle(
            MessageKind::BecomeResigningLeader,
            Controller::on_become_resigning_leader,
        )
        // A late epoch write after demotion must not reach storage, hence
        // the explicit forward here against the baseline ignore.
        .forward(MessageKind::WriteEpoch);

    let _ = builder.for_role(Role::ResigningLeader).handle(
        MessageKind::RequestQueueDrained,
        Controller::on_request_queue_drained,
    );

    let _ = builder.for_role(Role::ReadOnlyLeaderless).handle(
        MessageKind::GossipUpdated,
        Controller::on_gossip_read_only_leaderless,
    );

    let _ = builder
        .for_role(Role::Clone)
        .handle(MessageKind::DropSubscription, Controller::on_drop_subscription);

    let _ = builder
        .for_role(Role::PreReadOnlyReplica)
        .handle(
            MessageKind::BecomeReadOnlyReplica,
            Controller::on_become_read_only_replica,
        );

    let _ = builder
        .for_role(Role::ShuttingDown)
        .handle(MessageKind::ServiceShutdown, Controller::on_service_shutdown)
        .handle(MessageKind::ShutdownTimeout, Controller::on_shutdown_timeout)
        .handle(MessageKind::BecomeShutdown, Controller::on_become_shutdown);

    builder.build()
}
