//! The controller's message vocabulary.
//!
//! Every inbound event (timers, peers, services, clients) reaches the
//! controller as one [`Message`] on the main queue. [`MessageKind`] is the
//! field-less mirror used to key the dispatch table; `Message::kind()`
//! must stay exhaustive so the two never drift apart.

use crate::leader_info::LeaderInfo;
use crate::member::{ClusterInfo, MemberInfo};
use bytes::Bytes;
use kel_core::{CorrelationId, InstanceId};
use std::net::SocketAddr;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum Message {
    // -------------------------------------------------------------------
    // System lifecycle
    // -------------------------------------------------------------------
    SystemInit,
    SystemStart,
    SystemCoreReady,
    SystemReady,
    ServiceInitialized {
        service: String,
    },
    ServiceShutdown {
        service: String,
    },
    SubSystemInitialized {
        subsystem: String,
    },
    RequestShutdown {
        exit_process: bool,
        shutdown_http: bool,
    },
    BecomeShuttingDown {
        exit_process: bool,
        shutdown_http: bool,
    },
    BecomeShutdown,
    ShutdownTimeout {
        correlation_id: CorrelationId,
    },

    // -------------------------------------------------------------------
    // Role transitions
    // -------------------------------------------------------------------
    BecomeUnknown {
        correlation_id: CorrelationId,
    },
    BecomeDiscoverLeader {
        correlation_id: CorrelationId,
    },
    BecomePreLeader {
        correlation_id: CorrelationId,
        leader: MemberInfo,
    },
    BecomeLeader {
        correlation_id: CorrelationId,
    },
    InitiateLeaderResignation,
    BecomeResigningLeader {
        correlation_id: CorrelationId,
    },
    RequestQueueDrained,
    BecomePreReplica {
        correlation_id: CorrelationId,
        leader: MemberInfo,
    },
    BecomeCatchingUp {
        correlation_id: CorrelationId,
        leader: MemberInfo,
    },
    BecomeClone {
        correlation_id: CorrelationId,
        leader: MemberInfo,
    },
    BecomeFollower {
        correlation_id: CorrelationId,
        leader: MemberInfo,
    },
    BecomeReadOnlyLeaderless {
        correlation_id: CorrelationId,
    },
    BecomePreReadOnlyReplica {
        correlation_id: CorrelationId,
        leader: MemberInfo,
    },
    BecomeReadOnlyReplica {
        correlation_id: CorrelationId,
        leader: MemberInfo,
    },
    WaitForChaserToCatchUp {
        correlation_id: CorrelationId,
        attempt: u32,
    },
    ChaserCaughtUp {
        correlation_id: CorrelationId,
    },
    NoQuorum,
    WriteEpoch {
        proposal_number: u32,
    },

    // -------------------------------------------------------------------
    // Elections and gossip
    // -------------------------------------------------------------------
    ElectionsDone {
        leader: MemberInfo,
        proposal_number: u32,
    },
    StartElections,
    GossipUpdated {
        cluster: ClusterInfo,
    },
    DiscoveryTimeout {
        correlation_id: CorrelationId,
    },
    LeaderFound {
        leader: MemberInfo,
    },

    // -------------------------------------------------------------------
    // Replication
    // -------------------------------------------------------------------
    SubscribeToLeader {
        correlation_id: CorrelationId,
    },
    ReconnectToLeader {
        connection_correlation_id: CorrelationId,
    },
    LeaderConnectionFailed {
        connection_correlation_id: CorrelationId,
    },
    ReplicaSubscriptionRetry {
        subscription_id: CorrelationId,
        leader_id: InstanceId,
    },
    ReplicaSubscribed {
        subscription_id: CorrelationId,
        leader_id: InstanceId,
        subscription_position: u64,
    },
    FollowerAssignment {
        subscription_id: CorrelationId,
        leader_id: InstanceId,
    },
    CloneAssignment {
        subscription_id: CorrelationId,
        leader_id: InstanceId,
    },
    DropSubscription {
        subscription_id: CorrelationId,
        leader_id: InstanceId,
    },
    CreateChunk {
        subscription_id: CorrelationId,
        leader_id: InstanceId,
        chunk_header: Bytes,
        is_completed_chunk: bool,
    },
    RawChunkBulk {
        subscription_id: CorrelationId,
        leader_id: InstanceId,
        data: Bytes,
    },
    DataChunkBulk {
        subscription_id: CorrelationId,
        leader_id: InstanceId,
        data: Bytes,
    },
    AckLogPosition {
        subscription_id: CorrelationId,
        log_position: u64,
    },
    ReplicaSubscriptionRequest {
        subscription_id: CorrelationId,
        leader_id: InstanceId,
        replica_id: InstanceId,
    },
    ReplicaLogPositionAck {
        subscription_id: CorrelationId,
        log_position: u64,
    },
    VNodeConnectionLost {
        endpoint: SocketAddr,
    },

    // -------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------
    ClientRequest(ClientRequest),
    ClientOperationCompleted {
        correlation_id: CorrelationId,
        payload: Bytes,
    },
    TcpForward(TcpForwardMessage),

    // -------------------------------------------------------------------
    // Authentication
    // -------------------------------------------------------------------
    AuthenticationProviderInitialized,
    AuthenticationProviderInitializationFailed {
        reason: String,
    },
}

impl Message {
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::SystemInit => MessageKind::SystemInit,
            Self::SystemStart => MessageKind::SystemStart,
            Self::SystemCoreReady => MessageKind::SystemCoreReady,
            Self::SystemReady => MessageKind::SystemReady,
            Self::ServiceInitialized { .. } => MessageKind::ServiceInitialized,
            Self::ServiceShutdown { .. } => MessageKind::ServiceShutdown,
            Self::SubSystemInitialized { .. } => MessageKind::SubSystemInitialized,
            Self::RequestShutdown { .. } => MessageKind::RequestShutdown,
            Self::BecomeShuttingDown { .. } => MessageKind::BecomeShuttingDown,
            Self::BecomeShutdown => MessageKind::BecomeShutdown,
            Self::ShutdownTimeout { .. } => MessageKind::ShutdownTimeout,
            Self::BecomeUnknown { .. } => MessageKind::BecomeUnknown,
            Self::BecomeDiscoverLeader { .. } => MessageKind::BecomeDiscoverLeader,
            Self::BecomePreLeader { .. } => MessageKind::BecomePreLeader,
            Self::BecomeLeader { .. } => MessageKind::BecomeLeader,
            Self::InitiateLeaderResignation => MessageKind::InitiateLeaderResignation,
            Self::BecomeResigningLeader { .. } => MessageKind::BecomeResigningLeader,
            Self::RequestQueueDrained => MessageKind::RequestQueueDrained,
            Self::BecomePreReplica { .. } => MessageKind::BecomePreReplica,
            Self::BecomeCatchingUp { .. } => MessageKind::BecomeCatchingUp,
            Self::BecomeClone { .. } => MessageKind::BecomeClone,
            Self::BecomeFollower { .. } => MessageKind::BecomeFollower,
            Self::BecomeReadOnlyLeaderless { .. } => MessageKind::BecomeReadOnlyLeaderless,
            Self::BecomePreReadOnlyReplica { .. } => MessageKind::BecomePreReadOnlyReplica,
            Self::BecomeReadOnlyReplica { .. } => MessageKind::BecomeReadOnlyReplica,
            Self::WaitForChaserToCatchUp { .. } => MessageKind::WaitForChaserToCatchUp,
            Self::ChaserCaughtUp { .. } => MessageKind::ChaserCaughtUp,
            Self::NoQuorum => MessageKind::NoQuorum,
            Self::WriteEpoch { .. } => MessageKind::WriteEpoch,
            Self::ElectionsDone { .. } => MessageKind::ElectionsDone,
            Self::StartElections => MessageKind::StartElections,
            Self::GossipUpdated { .. } => MessageKind::GossipUpdated,
            Self::DiscoveryTimeout { .. } => MessageKind::DiscoveryTimeout,
            Self::LeaderFound { .. } => MessageKind::LeaderFound,
            Self::SubscribeToLeader { .. } => MessageKind::SubscribeToLeader,
            Self::ReconnectToLeader { .. } => MessageKind::ReconnectToLeader,
            Self::LeaderConnectionFailed { .. } => MessageKind::LeaderConnectionFailed,
            Self::ReplicaSubscriptionRetry { .. } => MessageKind::ReplicaSubscriptionRetry,
            Self::ReplicaSubscribed { .. } => MessageKind::ReplicaSubscribed,
            Self::FollowerAssignment { .. } => MessageKind::FollowerAssignment,
            Self::CloneAssignment { .. } => MessageKind::CloneAssignment,
            Self::DropSubscription { .. } => MessageKind::DropSubscription,
            Self::CreateChunk { .. } => MessageKind::CreateChunk,
            Self::RawChunkBulk { .. } => MessageKind::RawChunkBulk,
            Self::DataChunkBulk { .. } => MessageKind::DataChunkBulk,
            Self::AckLogPosition { .. } => MessageKind::AckLogPosition,
            Self::ReplicaSubscriptionRequest { .. } => MessageKind::ReplicaSubscriptionRequest,
            Self::ReplicaLogPositionAck { .. } => MessageKind::ReplicaLogPositionAck,
            Self::VNodeConnectionLost { .. } => MessageKind::VNodeConnectionLost,
            Self::ClientRequest(_) => MessageKind::ClientRequest,
            Self::ClientOperationCompleted { .. } => MessageKind::ClientOperationCompleted,
            Self::TcpForward(_) => MessageKind::TcpForward,
            Self::AuthenticationProviderInitialized => {
                MessageKind::AuthenticationProviderInitialized
            },
            Self::AuthenticationProviderInitializationFailed { .. } => {
                MessageKind::AuthenticationProviderInitializationFailed
            },
        }
    }
}

/// Field-less mirror of [`Message`], used as the dispatch-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SystemInit,
    SystemStart,
    SystemCoreReady,
    SystemReady,
    ServiceInitialized,
    ServiceShutdown,
    SubSystemInitialized,
    RequestShutdown,
    BecomeShuttingDown,
    BecomeShutdown,
    ShutdownTimeout,
    BecomeUnknown,
    BecomeDiscoverLeader,
    BecomePreLeader,
    BecomeLeader,
    InitiateLeaderResignation,
    BecomeResigningLeader,
    RequestQueueDrained,
    BecomePreReplica,
    BecomeCatchingUp,
    BecomeClone,
    BecomeFollower,
    BecomeReadOnlyLeaderless,
    BecomePreReadOnlyReplica,
    BecomeReadOnlyReplica,
    WaitForChaserToCatchUp,
    ChaserCaughtUp,
    NoQuorum,
    WriteEpoch,
    ElectionsDone,
    StartElections,
    GossipUpdated,
    DiscoveryTimeout,
    LeaderFound,
    SubscribeToLeader,
    ReconnectToLeader,
    LeaderConnectionFailed,
    ReplicaSubscriptionRetry,
    ReplicaSubscribed,
    FollowerAssignment,
    CloneAssignment,
    DropSubscription,
    CreateChunk,
    RawChunkBulk,
    DataChunkBulk,
    AckLogPosition,
    ReplicaSubscriptionRequest,
    ReplicaLogPositionAck,
    VNodeConnectionLost,
    ClientRequest,
    ClientOperationCompleted,
    TcpForward,
    AuthenticationProviderInitialized,
    AuthenticationProviderInitializationFailed,
}

impl MessageKind {
    /// State-change kinds are exhaustive by construction: the dispatcher
    /// exits the process when one reaches a role with no mapping for it.
    #[must_use]
    pub const fn is_state_change(&self) -> bool {
        matches!(
            self,
            Self::BecomeUnknown
                | Self::BecomeDiscoverLeader
                | Self::BecomePreLeader
                | Self::BecomeLeader
                | Self::BecomeResigningLeader
                | Self::BecomePreReplica
                | Self::BecomeCatchingUp
                | Self::BecomeClone
                | Self::BecomeFollower
                | Self::BecomeReadOnlyLeaderless
                | Self::BecomePreReadOnlyReplica
                | Self::BecomeReadOnlyReplica
                | Self::BecomeShuttingDown
                | Self::BecomeShutdown
        )
    }
}

// -----------------------------------------------------------------------
// Client requests
// -----------------------------------------------------------------------

/// Whether an operation reads or mutates the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Read,
    Write,
}

/// The caller behind a request. Only the system account may write
/// through a read-only node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    System,
    User(String),
}

impl Principal {
    #[inline]
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOperation {
    ReadEvent {
        stream: String,
        event_number: u64,
    },
    ReadStreamEventsForward {
        stream: String,
        from_event_number: u64,
        max_count: u32,
    },
    ReadStreamEventsBackward {
        stream: String,
        from_event_number: u64,
        max_count: u32,
    },
    ReadAllEventsForward {
        commit_position: u64,
        prepare_position: u64,
        max_count: u32,
    },
    ReadAllEventsBackward {
        commit_position: u64,
        prepare_position: u64,
        max_count: u32,
    },
    FilteredReadAllEventsForward {
        commit_position: u64,
        prepare_position: u64,
        max_count: u32,
        filter: String,
    },
    FilteredReadAllEventsBackward {
        commit_position: u64,
        prepare_position: u64,
        max_count: u32,
        filter: String,
    },
    WriteEvents {
        stream: String,
        expected_version: i64,
        events: Bytes,
    },
    TransactionStart {
        stream: String,
        expected_version: i64,
    },
    TransactionWrite {
        transaction_id: u64,
        events: Bytes,
    },
    TransactionCommit {
        transaction_id: u64,
    },
    DeleteStream {
        stream: String,
        expected_version: i64,
        hard_delete: bool,
    },
    CreatePersistentSubscriptionToStream {
        stream: String,
        group: String,
    },
    UpdatePersistentSubscriptionToStream {
        stream: String,
        group: String,
    },
    DeletePersistentSubscriptionToStream {
        stream: String,
        group: String,
    },
    ConnectToPersistentSubscriptionToStream {
        stream: String,
        group: String,
    },
    CreatePersistentSubscriptionToAll {
        group: String,
    },
    UpdatePersistentSubscriptionToAll {
        group: String,
    },
    DeletePersistentSubscriptionToAll {
        group: String,
    },
    ConnectToPersistentSubscriptionToAll {
        group: String,
    },
}

impl ClientOperation {
    /// Persistent-subscription management mutates leader-owned state, so
    /// the whole family is write-class for admission purposes.
    #[must_use]
    pub const fn class(&self) -> RequestClass {
        match self {
            Self::ReadEvent { .. }
            | Self::ReadStreamEventsForward { .. }
            | Self::ReadStreamEventsBackward { .. }
            | Self::ReadAllEventsForward { .. }
            | Self::ReadAllEventsBackward { .. }
            | Self::FilteredReadAllEventsForward { .. }
            | Self::FilteredReadAllEventsBackward { .. } => RequestClass::Read,
            Self::WriteEvents { .. }
            | Self::TransactionStart { .. }
            | Self::TransactionWrite { .. }
            | Self::TransactionCommit { .. }
            | Self::DeleteStream { .. }
            | Self::CreatePersistentSubscriptionToStream { .. }
            | Self::UpdatePersistentSubscriptionToStream { .. }
            | Self::DeletePersistentSubscriptionToStream { .. }
            | Self::ConnectToPersistentSubscriptionToStream { .. }
            | Self::CreatePersistentSubscriptionToAll { .. }
            | Self::UpdatePersistentSubscriptionToAll { .. }
            | Self::DeletePersistentSubscriptionToAll { .. }
            | Self::ConnectToPersistentSubscriptionToAll { .. } => RequestClass::Write,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ReadEvent { .. } => "ReadEvent",
            Self::ReadStreamEventsForward { .. } => "ReadStreamEventsForward",
            Self::ReadStreamEventsBackward { .. } => "ReadStreamEventsBackward",
            Self::ReadAllEventsForward { .. } => "ReadAllEventsForward",
            Self::ReadAllEventsBackward { .. } => "ReadAllEventsBackward",
            Self::FilteredReadAllEventsForward { .. } => "FilteredReadAllEventsForward",
            Self::FilteredReadAllEventsBackward { .. } => "FilteredReadAllEventsBackward",
            Self::WriteEvents { .. } => "WriteEvents",
            Self::TransactionStart { .. } => "TransactionStart",
            Self::TransactionWrite { .. } => "TransactionWrite",
            Self::TransactionCommit { .. } => "TransactionCommit",
            Self::DeleteStream { .. } => "DeleteStream",
            Self::CreatePersistentSubscriptionToStream { .. } => {
                "CreatePersistentSubscriptionToStream"
            },
            Self::UpdatePersistentSubscriptionToStream { .. } => {
                "UpdatePersistentSubscriptionToStream"
            },
            Self::DeletePersistentSubscriptionToStream { .. } => {
                "DeletePersistentSubscriptionToStream"
            },
            Self::ConnectToPersistentSubscriptionToStream { .. } => {
                "ConnectToPersistentSubscriptionToStream"
            },
            Self::CreatePersistentSubscriptionToAll { .. } => "CreatePersistentSubscriptionToAll",
            Self::UpdatePersistentSubscriptionToAll { .. } => "UpdatePersistentSubscriptionToAll",
            Self::DeletePersistentSubscriptionToAll { .. } => "DeletePersistentSubscriptionToAll",
            Self::ConnectToPersistentSubscriptionToAll { .. } => {
                "ConnectToPersistentSubscriptionToAll"
            },
        }
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    NotReady,
    NotLeader,
    IsReadOnly,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotReady => "NotReady",
            Self::NotLeader => "NotLeader",
            Self::IsReadOnly => "IsReadOnly",
        };
        write!(f, "{name}")
    }
}

/// Replies the controller itself produces. Successful completions come
/// from storage and never pass through here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientReply {
    NotHandled {
        correlation_id: CorrelationId,
        reason: DenialReason,
        leader_info: Option<LeaderInfo>,
    },
    ForwardTimedOut {
        correlation_id: CorrelationId,
    },
}

/// Cloneable reply handle carried by every client request. Replies to a
/// client that has gone away are dropped silently.
#[derive(Debug, Clone)]
pub struct ClientEnvelope {
    tx: mpsc::UnboundedSender<ClientReply>,
}

impl ClientEnvelope {
    /// Create an envelope and the receiver the client half reads from.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn reply(&self, reply: ClientReply) {
        let _ = self.tx.send(reply);
    }
}

#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub correlation_id: CorrelationId,
    pub envelope: ClientEnvelope,
    pub require_leader: bool,
    pub principal: Principal,
    pub operation: ClientOperation,
}

/// A write handed to the forwarding transport, addressed at the leader.
#[derive(Debug, Clone)]
pub struct TcpForwardMessage {
    pub leader_endpoint: SocketAddr,
    pub is_secure: bool,
    pub internal_correlation_id: CorrelationId,
    pub request: ClientRequest,
}
