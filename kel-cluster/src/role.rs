//! Node roles in the cluster lifecycle.

/// The controller's current position in the cluster lifecycle.
///
/// `Initializing` is the initial role; `Shutdown` is terminal. The
/// `Pre*` roles exist solely to wait for the local log chaser to catch
/// up before taking on the full role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initializing,
    DiscoverLeader,
    Unknown,
    PreReplica,
    CatchingUp,
    Clone,
    Follower,
    PreLeader,
    Leader,
    ResigningLeader,
    ShuttingDown,
    Shutdown,
    ReadOnlyLeaderless,
    PreReadOnlyReplica,
    ReadOnlyReplica,
}

impl Role {
    /// Roles whose preconditions require a known leader.
    #[inline]
    #[must_use]
    pub const fn requires_leader(&self) -> bool {
        matches!(
            self,
            Self::PreReplica
                | Self::CatchingUp
                | Self::Clone
                | Self::Follower
                | Self::PreLeader
                | Self::PreReadOnlyReplica
                | Self::ReadOnlyReplica
        )
    }

    /// Roles whose preconditions require `leader == None`.
    #[inline]
    #[must_use]
    pub const fn must_be_leaderless(&self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::DiscoverLeader
                | Self::Unknown
                | Self::ReadOnlyLeaderless
                | Self::Shutdown
        )
    }

    /// The replica family subscribed (or subscribing) to a writable leader.
    #[inline]
    #[must_use]
    pub const fn is_replica_family(&self) -> bool {
        matches!(
            self,
            Self::PreReplica | Self::CatchingUp | Self::Clone | Self::Follower
        )
    }

    /// The read-only replica family.
    #[inline]
    #[must_use]
    pub const fn is_read_only_family(&self) -> bool {
        matches!(
            self,
            Self::ReadOnlyLeaderless | Self::PreReadOnlyReplica | Self::ReadOnlyReplica
        )
    }

    /// Roles in which no client request can be serviced at all.
    #[inline]
    #[must_use]
    pub const fn is_unready(&self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::DiscoverLeader
                | Self::Unknown
                | Self::PreLeader
                | Self::ShuttingDown
                | Self::Shutdown
        )
    }

    /// Stable ordinal for the metrics gauge.
    #[inline]
    #[must_use]
    pub const fn ordinal(&self) -> u64 {
        match self {
            Self::Initializing => 0,
            Self::DiscoverLeader => 1,
            Self::Unknown => 2,
            Self::PreReplica => 3,
            Self::CatchingUp => 4,
            Self::Clone => 5,
            Self::Follower => 6,
            Self::PreLeader => 7,
            Self::Leader => 8,
            Self::ResigningLeader => 9,
            Self::ShuttingDown => 10,
            Self::Shutdown => 11,
            Self::ReadOnlyLeaderless => 12,
            Self::PreReadOnlyReplica => 13,
            Self::ReadOnlyReplica => 14,
        }
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::DiscoverLeader => "DiscoverLeader",
            Self::Unknown => "Unknown",
            Self::PreReplica => "PreReplica",
            Self::CatchingUp => "CatchingUp",
            Self::Clone => "Clone",
            Self::Follower => "Follower",
            Self::PreLeader => "PreLeader",
            Self::Leader => "Leader",
            Self::ResigningLeader => "ResigningLeader",
            Self::ShuttingDown => "ShuttingDown",
            Self::Shutdown => "Shutdown",
            Self::ReadOnlyLeaderless => "ReadOnlyLeaderless",
            Self::PreReadOnlyReplica => "PreReadOnlyReplica",
            Self::ReadOnlyReplica => "ReadOnlyReplica",
        }
    }

    /// Every role, in ordinal order. Used to build the dispatch table.
    pub const ALL: [Role; 15] = [
        Self::Initializing,
        Self::DiscoverLeader,
        Self::Unknown,
        Self::PreReplica,
        Self::CatchingUp,
        Self::Clone,
        Self::Follower,
        Self::PreLeader,
        Self::Leader,
        Self::ResigningLeader,
        Self::ShuttingDown,
        Self::Shutdown,
        Self::ReadOnlyLeaderless,
        Self::PreReadOnlyReplica,
        Self::ReadOnlyReplica,
    ];
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
