#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod ids;

pub use error::{KeelError, Result};
pub use ids::{CorrelationId, InstanceId};

use std::time::Duration;

/// How long a node waits in leader discovery before giving up and
/// falling back to elections.
pub const LEADER_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(3000);
/// Delay before re-attempting a connection to the current leader.
pub const LEADER_RECONNECTION_DELAY: Duration = Duration::from_millis(500);
/// Delay before re-sending a replica subscription after an explicit retry.
pub const LEADER_SUBSCRIPTION_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Watchdog interval for an unanswered replica subscription handshake.
pub const LEADER_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_millis(1000);
/// Bounded window for services to acknowledge shutdown before it is forced.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(5000);
/// Slack added on top of prepare + commit timeouts for forwarded writes.
pub const FORWARD_TIMEOUT_PADDING: Duration = Duration::from_millis(300);

/// Core services that must report in before `SystemStart` is published:
/// storage chaser, storage reader, storage writer.
pub const CORE_SERVICE_INIT_COUNT: usize = 3;
/// Services expected to acknowledge shutdown on a clustered node:
/// chaser, reader, writer, index committer, replication, HTTP.
pub const CLUSTERED_SHUTDOWN_ACK_COUNT: usize = 6;
/// Single-node deployments run no replication service.
pub const SINGLE_NODE_SHUTDOWN_ACK_COUNT: usize = 5;
