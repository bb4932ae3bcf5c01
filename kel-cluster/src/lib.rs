#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

//! Cluster node lifecycle controller for the KEEL event-log database.
//!
//! One controller runs per node. It is the single authority over the
//! node's role, consumes election results, gossip, replication handshake
//! events and timers from the main queue, admits or rejects client
//! requests, and orchestrates startup and shutdown of the node's
//! subordinate services. Collaborators (the log, elections, gossip, the
//! replication pipeline, transports) are reached only through message
//! contracts on the output bus.

mod admission;
mod bus;
mod controller;
mod dispatch;
mod forward;
mod leader_info;
mod lifecycle;
mod member;
mod message;
mod role;

pub use bus::{main_queue, MainQueue, NodeRuntime, OutputBus, TimerService, TokioTimers};
pub use controller::{Controller, ControllerOptions};
pub use dispatch::{Action, Dispatcher, Handler};
pub use forward::ForwardingProxy;
pub use leader_info::{resolve as resolve_leader_info, AdvertisedEndpoint, LeaderInfo};
pub use lifecycle::LifecycleTracker;
pub use member::{ClusterInfo, MemberInfo, NodeInfo};
pub use message::{
    ClientEnvelope, ClientOperation, ClientReply, ClientRequest, DenialReason, Message,
    MessageKind, Principal, RequestClass, TcpForwardMessage,
};
pub use role::Role;
