//! Client request admission.
//!
//! Every client request passes through here exactly once. Depending on the
//! current role a request is forwarded to storage, relayed to the leader
//! through the forwarding proxy, or denied with `NotHandled` carrying the
//! advertised leader endpoints so the client can go to the right node.

use crate::controller::Controller;
use crate::leader_info;
use crate::message::{
    ClientReply, ClientRequest, DenialReason, Message, RequestClass, TcpForwardMessage,
};
use crate::role::Role;
use kel_core::{CorrelationId, FORWARD_TIMEOUT_PADDING};
use tracing::debug;

impl Controller {
    pub(crate) fn on_client_request(&mut self, message: Message) {
        let Message::ClientRequest(request) = message else {
            return;
        };

        match self.state.role {
            Role::Leader => self.output.publish(Message::ClientRequest(request)),
            Role::ResigningLeader => match request.operation.class() {
                RequestClass::Read => self.output.publish(Message::ClientRequest(request)),
                RequestClass::Write => self.deny(&request, DenialReason::NotReady),
            },
            Role::PreReplica | Role::CatchingUp | Role::Clone | Role::Follower => {
                self.admit_on_replica(request);
            },
            Role::ReadOnlyLeaderless | Role::PreReadOnlyReplica | Role::ReadOnlyReplica => {
                self.admit_on_read_only(request);
            },
            Role::Initializing
            | Role::DiscoverLeader
            | Role::Unknown
            | Role::PreLeader
            | Role::ShuttingDown
            | Role::Shutdown => self.deny(&request, DenialReason::NotReady),
        }
    }

    fn admit_on_replica(&mut self, request: ClientRequest) {
        match request.operation.class() {
            RequestClass::Read => {
                if request.require_leader {
                    if self.state.leader.is_some() {
                        self.deny(&request, DenialReason::NotLeader);
                    } else {
                        self.deny(&request, DenialReason::NotReady);
                    }
                } else {
                    self.output.publish(Message::ClientRequest(request));
                }
            },
            RequestClass::Write => {
                if request.require_leader {
                    self.deny(&request, DenialReason::NotLeader);
                } else {
                    self.forward_write_to_leader(request);
                }
            },
        }
    }

    fn admit_on_read_only(&mut self, request: ClientRequest) {
        match request.operation.class() {
            RequestClass::Read => {
                if request.require_leader {
                    if self.state.leader.is_some() {
                        self.deny(&request, DenialReason::NotLeader);
                    } else {
                        self.deny(&request, DenialReason::NotReady);
                    }
                } else {
                    self.output.publish(Message::ClientRequest(request));
                }
            },
            RequestClass::Write => {
                if request.principal.is_system() {
                    self.forward_write_to_leader(request);
                } else {
                    self.deny(&request, DenialReason::IsReadOnly);
                }
            },
        }
    }

    /// Remember the client under a fresh internal id and hand the write to
    /// the forwarding transport. The proxy replies with the request's
    /// forward-timeout completion if the leader never answers.
    fn forward_write_to_leader(&mut self, request: ClientRequest) {
        let Some(leader) = &self.state.leader else {
            self.deny(&request, DenialReason::NotReady);
            return;
        };
        let Some((leader_endpoint, is_secure)) = leader.replication_endpoint() else {
            self.deny(&request, DenialReason::NotReady);
            return;
        };

        let internal_correlation_id = CorrelationId::next();
        let timeout = self.prepare_timeout + self.commit_timeout + FORWARD_TIMEOUT_PADDING;
        self.proxy.register(
            internal_correlation_id,
            request.correlation_id,
            request.envelope.clone(),
            timeout,
            ClientReply::ForwardTimedOut {
                correlation_id: request.correlation_id,
            },
        );
        kel_metrics::increment_writes_forwarded();
        debug!(
            target: "keel::admission",
            operation = request.operation.name(),
            leader = %leader.instance_id,
            internal = %internal_correlation_id,
            "Forwarding write to leader"
        );
        self.output.publish(Message::TcpForward(TcpForwardMessage {
            leader_endpoint,
            is_secure,
            internal_correlation_id,
            request,
        }));
    }

    fn deny(&mut self, request: &ClientRequest, reason: DenialReason) {
        let leader_info = match reason {
            DenialReason::NotReady => None,
            DenialReason::NotLeader | DenialReason::IsReadOnly => {
                Some(leader_info::resolve(self.state.leader.as_ref(), &self.node))
            },
        };
        match reason {
            DenialReason::NotReady => kel_metrics::increment_denied_not_ready(),
            DenialReason::NotLeader => kel_metrics::increment_denied_not_leader(),
            DenialReason::IsReadOnly => kel_metrics::increment_denied_read_only(),
        }
        debug!(
            target: "keel::admission",
            operation = request.operation.name(),
            role = %self.state.role,
            reason = %reason,
            "Denying client request"
        );
        request.envelope.reply(ClientReply::NotHandled {
            correlation_id: request.correlation_id,
            reason,
            leader_info,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bus::{main_queue, NodeRuntime, OutputBus, TimerService};
    use crate::controller::ControllerOptions;
    use crate::member::{MemberInfo, NodeInfo};
    use crate::message::{ClientEnvelope, ClientOperation, Principal};
    use bytes::Bytes;
    use kel_core::InstanceId;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NoTimers;
    impl TimerService for NoTimers {
        fn schedule(&self, _delay: Duration, _message: Message) {}
    }

    struct NoRuntime;
    impl NodeRuntime for NoRuntime {
        fn close_database(&self) {}
        fn stop_workers(&self) {}
        fn exit_process(&self, _success: bool) {}
    }

    struct Harness {
        controller: Controller,
        queue_rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Harness {
        fn new(read_only: bool) -> Self {
            let mut node = NodeInfo::new(InstanceId(0), "127.0.0.1:2113".parse().unwrap())
                .with_external_tcp("127.0.0.1:1113".parse().unwrap());
            if read_only {
                node = node.read_only_replica();
            }
            let (queue, queue_rx) = main_queue();
            let controller = Controller::new(
                ControllerOptions::new(node, 3),
                OutputBus::new(128),
                queue,
                Arc::new(NoTimers),
                Arc::new(NoRuntime),
            );
            Self {
                controller,
                queue_rx,
            }
        }

        fn pump(&mut self) {
            while let Ok(message) = self.queue_rx.try_recv() {
                self.controller.handle(message);
            }
        }

        fn leader_member(&self) -> MemberInfo {
            MemberInfo::new(InstanceId(1), "127.0.0.1:2201".parse().unwrap(), Role::Leader)
                .with_internal_tcp("127.0.0.1:1201".parse().unwrap())
                .with_external_tcp("127.0.0.1:1301".parse().unwrap())
        }

        /// Boot the storage services and adopt node 1 as leader, landing
        /// in PreReplica (or PreReadOnlyReplica when read-only).
        fn boot_with_leader(&mut self) {
            for service in ["storage-chaser", "storage-reader", "storage-writer"] {
                self.controller.handle(Message::ServiceInitialized {
                    service: service.to_string(),
                });
            }
            self.pump();
            if self.controller.role() == Role::ReadOnlyLeaderless {
                let cluster = crate::member::ClusterInfo::new(vec![self.leader_member()]);
                self.controller.handle(Message::GossipUpdated { cluster });
            } else {
                self.controller.handle(Message::ElectionsDone {
                    leader: self.leader_member(),
                    proposal_number: 1,
                });
            }
            self.pump();
        }
    }

    fn read_request(require_leader: bool) -> (ClientRequest, mpsc::UnboundedReceiver<ClientReply>) {
        let (envelope, rx) = ClientEnvelope::channel();
        let request = ClientRequest {
            correlation_id: CorrelationId::next(),
            envelope,
            require_leader,
            principal: Principal::User("ops".into()),
            operation: ClientOperation::ReadStreamEventsForward {
                stream: "orders".into(),
                from_event_number: 0,
                max_count: 100,
            },
        };
        (request, rx)
    }

    fn write_request(principal: Principal) -> (ClientRequest, mpsc::UnboundedReceiver<ClientReply>) {
        let (envelope, rx) = ClientEnvelope::channel();
        let request = ClientRequest {
            correlation_id: CorrelationId::next(),
            envelope,
            require_leader: false,
            principal,
            operation: ClientOperation::WriteEvents {
                stream: "orders".into(),
                expected_version: -2,
                events: Bytes::from_static(b"e"),
            },
        };
        (request, rx)
    }

    fn expect_denial(rx: &mut mpsc::UnboundedReceiver<ClientReply>) -> DenialReason {
        match rx.try_recv().unwrap() {
            ClientReply::NotHandled { reason, .. } => reason,
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_initializing_denies_not_ready() {
        let mut harness = Harness::new(false);
        let (request, mut rx) = read_request(false);

        harness.controller.handle(Message::ClientRequest(request));

        assert_eq!(expect_denial(&mut rx), DenialReason::NotReady);
    }

    #[test]
    fn test_replica_forwards_plain_read_to_storage() {
        let mut harness = Harness::new(false);
        harness.boot_with_leader();
        assert_eq!(harness.controller.role(), Role::PreReplica);
        let mut output = harness.controller.output.subscribe();

        let (request, mut rx) = read_request(false);
        harness.controller.handle(Message::ClientRequest(request));

        assert!(rx.try_recv().is_err(), "no denial expected");
        assert!(matches!(
            output.try_recv().unwrap(),
            Message::ClientRequest(_)
        ));
    }

    #[test]
    fn test_replica_read_requiring_leader_gets_leader_info() {
        let mut harness = Harness::new(false);
        harness.boot_with_leader();

        let (request, mut rx) = read_request(true);
        harness.controller.handle(Message::ClientRequest(request));

        match rx.try_recv().unwrap() {
            ClientReply::NotHandled {
                reason,
                leader_info,
                ..
            } => {
                assert_eq!(reason, DenialReason::NotLeader);
                let info = leader_info.unwrap();
                assert_eq!(info.tcp.unwrap().port, 1301);
            },
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_replica_write_registers_forward() {
        let mut harness = Harness::new(false);
        harness.boot_with_leader();
        let mut output = harness.controller.output.subscribe();

        let (request, mut rx) = write_request(Principal::User("ops".into()));
        harness.controller.handle(Message::ClientRequest(request));

        assert!(rx.try_recv().is_err(), "no denial expected");
        assert_eq!(harness.controller.forwarding_proxy().pending_count(), 1);
        let forwarded = loop {
            match output.try_recv().unwrap() {
                Message::TcpForward(forward) => break forward,
                _ => continue,
            }
        };
        assert_eq!(
            forwarded.leader_endpoint,
            "127.0.0.1:1201".parse().unwrap()
        );
        assert!(!forwarded.is_secure);
    }

    #[test]
    fn test_read_only_denies_user_writes() {
        let mut harness = Harness::new(true);
        harness.boot_with_leader();
        harness.controller.handle(Message::ChaserCaughtUp {
            correlation_id: harness.controller.state_correlation_id(),
        });
        harness.pump();
        assert_eq!(harness.controller.role(), Role::PreReadOnlyReplica);

        let (request, mut rx) = write_request(Principal::User("ops".into()));
        harness.controller.handle(Message::ClientRequest(request));
        assert_eq!(expect_denial(&mut rx), DenialReason::IsReadOnly);

        // The system account still writes through.
        let (request, mut rx) = write_request(Principal::System);
        harness.controller.handle(Message::ClientRequest(request));
        assert!(rx.try_recv().is_err(), "system write must not be denied");
    }

    #[test]
    fn test_resigning_leader_serves_reads_denies_writes() {
        let mut harness = Harness::new(false);
        for service in ["storage-chaser", "storage-reader", "storage-writer"] {
            harness.controller.handle(Message::ServiceInitialized {
                service: service.to_string(),
            });
        }
        harness.pump();
        // Cluster size 3 puts us in DiscoverLeader; win the election.
        let own = MemberInfo::new(InstanceId(0), "127.0.0.1:2113".parse().unwrap(), Role::Unknown)
            .with_internal_tcp("127.0.0.1:1200".parse().unwrap());
        harness.controller.handle(Message::ElectionsDone {
            leader: own,
            proposal_number: 1,
        });
        harness.pump();
        harness.controller.handle(Message::ChaserCaughtUp {
            correlation_id: harness.controller.state_correlation_id(),
        });
        harness.pump();
        assert_eq!(harness.controller.role(), Role::Leader);

        harness.controller.handle(Message::InitiateLeaderResignation);
        harness.pump();
        assert_eq!(harness.controller.role(), Role::ResigningLeader);

        let (request, mut rx) = write_request(Principal::User("ops".into()));
        harness.controller.handle(Message::ClientRequest(request));
        assert_eq!(expect_denial(&mut rx), DenialReason::NotReady);

        let (request, mut rx) = read_request(false);
        harness.controller.handle(Message::ClientRequest(request));
        assert!(rx.try_recv().is_err(), "reads still flow while resigning");
    }
}
