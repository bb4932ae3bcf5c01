//! Cluster member descriptors.
//!
//! `NodeInfo` is this node's immutable identity, fixed at construction.
//! `MemberInfo` is a peer descriptor as reported by gossip; `ClusterInfo`
//! is one gossip round's view of the whole cluster.

use crate::role::Role;
use kel_core::InstanceId;
use std::net::SocketAddr;

/// This node's identity and endpoints, fixed at construction.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub instance_id: InstanceId,
    pub http_endpoint: SocketAddr,
    pub external_tcp_endpoint: Option<SocketAddr>,
    pub external_secure_tcp_endpoint: Option<SocketAddr>,
    pub is_read_only_replica: bool,
}

impl NodeInfo {
    pub fn new(instance_id: InstanceId, http_endpoint: SocketAddr) -> Self {
        Self {
            instance_id,
            http_endpoint,
            external_tcp_endpoint: None,
            external_secure_tcp_endpoint: None,
            is_read_only_replica: false,
        }
    }

    pub fn with_external_tcp(mut self, endpoint: SocketAddr) -> Self {
        self.external_tcp_endpoint = Some(endpoint);
        self
    }

    pub fn with_external_secure_tcp(mut self, endpoint: SocketAddr) -> Self {
        self.external_secure_tcp_endpoint = Some(endpoint);
        self
    }

    pub fn read_only_replica(mut self) -> Self {
        self.is_read_only_replica = true;
        self
    }
}

/// A peer as described by gossip.
///
/// `advertised_host` empty means "use the endpoint's host"; an advertised
/// port of 0 means "use the endpoint's port".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub instance_id: InstanceId,
    pub http_endpoint: SocketAddr,
    pub internal_tcp_endpoint: Option<SocketAddr>,
    pub internal_secure_tcp_endpoint: Option<SocketAddr>,
    pub external_tcp_endpoint: Option<SocketAddr>,
    pub external_secure_tcp_endpoint: Option<SocketAddr>,
    pub advertised_host: String,
    pub advertised_tcp_port: u16,
    pub advertised_http_port: u16,
    pub is_alive: bool,
    pub role: Role,
}

impl MemberInfo {
    pub fn new(instance_id: InstanceId, http_endpoint: SocketAddr, role: Role) -> Self {
        Self {
            instance_id,
            http_endpoint,
            internal_tcp_endpoint: None,
            internal_secure_tcp_endpoint: None,
            external_tcp_endpoint: None,
            external_secure_tcp_endpoint: None,
            advertised_host: String::new(),
            advertised_tcp_port: 0,
            advertised_http_port: 0,
            is_alive: true,
            role,
        }
    }

    pub fn with_internal_tcp(mut self, endpoint: SocketAddr) -> Self {
        self.internal_tcp_endpoint = Some(endpoint);
        self
    }

    pub fn with_internal_secure_tcp(mut self, endpoint: SocketAddr) -> Self {
        self.internal_secure_tcp_endpoint = Some(endpoint);
        self
    }

    pub fn with_external_tcp(mut self, endpoint: SocketAddr) -> Self {
        self.external_tcp_endpoint = Some(endpoint);
        self
    }

    pub fn with_external_secure_tcp(mut self, endpoint: SocketAddr) -> Self {
        self.external_secure_tcp_endpoint = Some(endpoint);
        self
    }

    pub fn dead(mut self) -> Self {
        self.is_alive = false;
        self
    }

    #[inline]
    #[must_use]
    pub fn is_alive_leader(&self) -> bool {
        self.is_alive && self.role == Role::Leader
    }

    /// True if `endpoint` is one of this member's node-to-node endpoints.
    #[must_use]
    pub fn has_internal_endpoint(&self, endpoint: &SocketAddr) -> bool {
        self.internal_tcp_endpoint.as_ref() == Some(endpoint)
            || self.internal_secure_tcp_endpoint.as_ref() == Some(endpoint)
    }

    /// The endpoint replicas connect to for subscription and forwarding:
    /// the secure internal endpoint when present, the plain one otherwise.
    /// The `bool` is the secure flag.
    #[must_use]
    pub fn replication_endpoint(&self) -> Option<(SocketAddr, bool)> {
        if let Some(secure) = self.internal_secure_tcp_endpoint {
            return Some((secure, true));
        }
        self.internal_tcp_endpoint.map(|ep| (ep, false))
    }
}

/// One gossip round's view of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub members: Vec<MemberInfo>,
}

impl ClusterInfo {
    pub fn new(members: Vec<MemberInfo>) -> Self {
        Self { members }
    }

    #[must_use]
    pub fn get(&self, instance_id: InstanceId) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.instance_id == instance_id)
    }

    #[must_use]
    pub fn alive_leader_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_alive_leader()).count()
    }

    /// The alive leader, if gossip reports exactly one.
    #[must_use]
    pub fn single_alive_leader(&self) -> Option<&MemberInfo> {
        let mut leaders = self.members.iter().filter(|m| m.is_alive_leader());
        let first = leaders.next()?;
        if leaders.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// True if gossip still reports `instance_id` as an alive leader.
    #[must_use]
    pub fn reports_alive_leader(&self, instance_id: InstanceId) -> bool {
        self.get(instance_id).is_some_and(MemberInfo::is_alive_leader)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn member(id: u16, role: Role) -> MemberInfo {
        MemberInfo::new(InstanceId(id), addr(2100 + id), role)
    }

    #[test]
    fn test_single_alive_leader() {
        let view = ClusterInfo::new(vec![
            member(1, Role::Leader),
            member(2, Role::Follower),
            member(3, Role::CatchingUp),
        ]);

        assert_eq!(view.alive_leader_count(), 1);
        assert_eq!(
            view.single_alive_leader().unwrap().instance_id,
            InstanceId(1)
        );
    }

    #[test]
    fn test_two_alive_leaders_is_ambiguous() {
        let view = ClusterInfo::new(vec![member(1, Role::Leader), member(2, Role::Leader)]);

        assert_eq!(view.alive_leader_count(), 2);
        assert!(view.single_alive_leader().is_none());
    }

    #[test]
    fn test_dead_leader_not_counted() {
        let view = ClusterInfo::new(vec![member(1, Role::Leader).dead(), member(2, Role::Follower)]);

        assert_eq!(view.alive_leader_count(), 0);
        assert!(!view.reports_alive_leader(InstanceId(1)));
    }

    #[test]
    fn test_replication_endpoint_prefers_secure() {
        let m = member(1, Role::Leader)
            .with_internal_tcp(addr(1111))
            .with_internal_secure_tcp(addr(1112));

        assert_eq!(m.replication_endpoint(), Some((addr(1112), true)));
        assert!(m.has_internal_endpoint(&addr(1111)));
        assert!(m.has_internal_endpoint(&addr(1112)));
        assert!(!m.has_internal_endpoint(&addr(9999)));
    }
}
