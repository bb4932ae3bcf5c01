//! Table-driven routing of `(role, message kind)` to an action.
//!
//! The table is built from layered rules: rules for a single role override
//! rules for a set of roles, which override rules for every role. Within
//! one layer the rule declared last wins. Kinds with no entry fall back to
//! the controller's default: fatal for state-change kinds, forward to the
//! output bus for everything else.
//!
//! The table is plain data, so startup code and tests can inspect exactly
//! which roles claim a given message kind.

use crate::controller::Controller;
use crate::message::{Message, MessageKind};
use crate::role::Role;
use std::collections::HashMap;

pub type Handler = fn(&mut Controller, Message);

#[derive(Debug, Clone, Copy)]
pub enum Action {
    Handle(Handler),
    Forward,
    Ignore,
}

const RANK_ANY_ROLE: u8 = 0;
const RANK_ROLE_SET: u8 = 1;
const RANK_SINGLE_ROLE: u8 = 2;

pub struct Dispatcher {
    table: HashMap<(Role, MessageKind), Action>,
}

impl Dispatcher {
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder {
            table: HashMap::new(),
        }
    }

    #[must_use]
    pub fn lookup(&self, role: Role, kind: MessageKind) -> Option<Action> {
        self.table.get(&(role, kind)).copied()
    }

    /// Roles with an explicit `Handle` entry for `kind`.
    #[must_use]
    pub fn handled_roles(&self, kind: MessageKind) -> Vec<Role> {
        let mut roles: Vec<Role> = Role::ALL
            .into_iter()
            .filter(|role| matches!(self.table.get(&(*role, kind)), Some(Action::Handle(_))))
            .collect();
        roles.sort_by_key(Role::ordinal);
        roles
    }
}

pub struct DispatcherBuilder {
    table: HashMap<(Role, MessageKind), (u8, Action)>,
}

impl DispatcherBuilder {
    pub fn for_all_roles(&mut self) -> Scope<'_> {
        Scope {
            builder: self,
            roles: Role::ALL.to_vec(),
            rank: RANK_ANY_ROLE,
        }
    }

    pub fn for_roles(&mut self, roles: &[Role]) -> Scope<'_> {
        Scope {
            builder: self,
            roles: roles.to_vec(),
            rank: RANK_ROLE_SET,
        }
    }

    pub fn for_role(&mut self, role: Role) -> Scope<'_> {
        Scope {
            builder: self,
            roles: vec![role],
            rank: RANK_SINGLE_ROLE,
        }
    }

    #[must_use]
    pub fn build(self) -> Dispatcher {
        let table = self
            .table
            .into_iter()
            .map(|(key, (_, action))| (key, action))
            .collect();
        Dispatcher { table }
    }

    fn set(&mut self, roles: &[Role], rank: u8, kind: MessageKind, action: Action) {
        for &role in roles {
            let entry = self.table.entry((role, kind)).or_insert((rank, action));
            if rank >= entry.0 {
                *entry = (rank, action);
            }
        }
    }
}

/// One layer of rules for a fixed set of roles.
pub struct Scope<'a> {
    builder: &'a mut DispatcherBuilder,
    roles: Vec<Role>,
    rank: u8,
}

impl Scope<'_> {
    #[must_use]
    pub fn handle(mut self, kind: MessageKind, handler: Handler) -> Self {
        self.set(kind, Action::Handle(handler));
        self
    }

    #[must_use]
    pub fn forward(mut self, kind: MessageKind) -> Self {
        self.set(kind, Action::Forward);
        self
    }

    #[must_use]
    pub fn ignore(mut self, kind: MessageKind) -> Self {
        self.set(kind, Action::Ignore);
        self
    }

    fn set(&mut self, kind: MessageKind, action: Action) {
        let Self {
            builder,
            roles,
            rank,
        } = self;
        builder.set(roles, *rank, kind, action);
    }
}
