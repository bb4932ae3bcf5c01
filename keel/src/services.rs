//! In-process core-service harness.
//!
//! In a full deployment the chaser, reader, writer, index committer,
//! replication and HTTP services run as their own components and answer
//! the controller over the main queue. This harness stands in for them in
//! a single-process node: it acknowledges init and shutdown, echoes the
//! chaser catch-up, and - on a single-node cluster - plays the elections
//! service by electing this node the moment it becomes `Unknown`.

use kel_cluster::{MainQueue, MemberInfo, Message, NodeInfo, Role};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const CORE_SERVICES: [&str; 3] = ["storage-chaser", "storage-reader", "storage-writer"];

const CLUSTERED_SHUTDOWN_SERVICES: [&str; 6] = [
    "storage-chaser",
    "storage-reader",
    "storage-writer",
    "index-committer",
    "replication",
    "http",
];

const SINGLE_NODE_SHUTDOWN_SERVICES: [&str; 5] = [
    "storage-chaser",
    "storage-reader",
    "storage-writer",
    "index-committer",
    "http",
];

pub struct ServiceHarness {
    node: NodeInfo,
    internal_tcp: std::net::SocketAddr,
    cluster_size: usize,
    main_queue: MainQueue,
    election_proposal: u32,
}

impl ServiceHarness {
    #[must_use]
    pub fn new(
        node: NodeInfo,
        internal_tcp: std::net::SocketAddr,
        cluster_size: usize,
        main_queue: MainQueue,
    ) -> Self {
        Self {
            node,
            internal_tcp,
            cluster_size,
            main_queue,
            election_proposal: 0,
        }
    }

    fn own_member(&self, role: Role) -> MemberInfo {
        let mut member = MemberInfo::new(self.node.instance_id, self.node.http_endpoint, role)
            .with_internal_tcp(self.internal_tcp);
        if let Some(tcp) = self.node.external_tcp_endpoint {
            member = member.with_external_tcp(tcp);
        }
        if let Some(secure) = self.node.external_secure_tcp_endpoint {
            member = member.with_external_secure_tcp(secure);
        }
        member
    }

    pub async fn run(mut self, mut bus: broadcast::Receiver<Message>) {
        info!(
            target: "keel::services",
            cluster_size = self.cluster_size,
            "Core service harness attached"
        );

        loop {
            let message = match bus.recv().await {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "keel::services", skipped, "Service harness lagged");
                    continue;
                },
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match message {
                Message::SystemInit => {
                    for service in CORE_SERVICES {
                        self.main_queue.publish(Message::ServiceInitialized {
                            service: service.to_string(),
                        });
                    }
                    self.main_queue
                        .publish(Message::AuthenticationProviderInitialized);
                },
                Message::WaitForChaserToCatchUp { correlation_id, .. } => {
                    debug!(target: "keel::services", "Chaser caught up");
                    self.main_queue
                        .publish(Message::ChaserCaughtUp { correlation_id });
                },
                Message::BecomeUnknown { .. } if self.cluster_size == 1 => {
                    // Single-node elections conclude immediately.
                    self.election_proposal += 1;
                    let leader = self.own_member(Role::Unknown);
                    info!(
                        target: "keel::services",
                        proposal = self.election_proposal,
                        "Single-node election won"
                    );
                    self.main_queue.publish(Message::ElectionsDone {
                        leader,
                        proposal_number: self.election_proposal,
                    });
                },
                Message::BecomeShuttingDown { .. } => {
                    let services: &[&str] = if self.cluster_size > 1 {
                        &CLUSTERED_SHUTDOWN_SERVICES
                    } else {
                        &SINGLE_NODE_SHUTDOWN_SERVICES
                    };
                    for service in services {
                        self.main_queue.publish(Message::ServiceShutdown {
                            service: (*service).to_string(),
                        });
                    }
                },
                Message::BecomeShutdown => break,
                _ => {},
            }
        }

        debug!(target: "keel::services", "Core service harness detached");
    }
}
