//! Advertised leader endpoints for deny replies.
//!
//! Clients told "not leader" or "read-only" get back where to go instead.
//! Gossip members may advertise a host and ports that differ from the
//! endpoints the node binds (NAT, load balancers); an empty advertised
//! host falls back to the endpoint's host and a zero advertised port to
//! the endpoint's port.

use crate::member::{MemberInfo, NodeInfo};
use std::net::SocketAddr;

/// A host/port pair as advertised to clients. The host may be a DNS name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedEndpoint {
    pub host: String,
    pub port: u16,
}

impl AdvertisedEndpoint {
    fn from_endpoint(endpoint: SocketAddr, advertised_host: &str, advertised_port: u16) -> Self {
        let host = if advertised_host.is_empty() {
            endpoint.ip().to_string()
        } else {
            advertised_host.to_string()
        };
        let port = if advertised_port == 0 {
            endpoint.port()
        } else {
            advertised_port
        };
        Self { host, port }
    }
}

impl std::fmt::Display for AdvertisedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The endpoint triple returned with `NotLeader` / `IsReadOnly` denials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub tcp: Option<AdvertisedEndpoint>,
    pub is_tcp_secure: bool,
    pub http: AdvertisedEndpoint,
}

/// Compute the advertised endpoints for the current leader, or for this
/// node itself when no leader is known. The secure external TCP endpoint
/// wins over the plain one when both exist; own endpoints carry no
/// advertised overrides.
#[must_use]
pub fn resolve(leader: Option<&MemberInfo>, node: &NodeInfo) -> LeaderInfo {
    match leader {
        Some(member) => {
            let (endpoint, secure) = match member.external_secure_tcp_endpoint {
                Some(ep) => (Some(ep), true),
                None => (member.external_tcp_endpoint, false),
            };
            LeaderInfo {
                tcp: endpoint.map(|ep| {
                    AdvertisedEndpoint::from_endpoint(
                        ep,
                        &member.advertised_host,
                        member.advertised_tcp_port,
                    )
                }),
                is_tcp_secure: secure,
                http: AdvertisedEndpoint::from_endpoint(
                    member.http_endpoint,
                    &member.advertised_host,
                    member.advertised_http_port,
                ),
            }
        },
        None => {
            let (endpoint, secure) = match node.external_secure_tcp_endpoint {
                Some(ep) => (Some(ep), true),
                None => (node.external_tcp_endpoint, false),
            };
            LeaderInfo {
                tcp: endpoint.map(|ep| AdvertisedEndpoint::from_endpoint(ep, "", 0)),
                is_tcp_secure: secure,
                http: AdvertisedEndpoint::from_endpoint(node.http_endpoint, "", 0),
            }
        },
    }
}
