//! Requester identity
//!
//! A request optionally carries a session holding the user resource. The
//! user's realms are derived from the schema's groups.

use crate::storage::document::Resource;
use std::collections::BTreeSet;

/// Realm every requester belongs to, and that group-less grants target
pub const EVERYONE: &str = "everyone";

/// The set of realms a requester belongs to
pub type UserRealms = BTreeSet<String>;

/// An authenticated (or anonymous) requester
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub user: Option<Resource>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user: Resource) -> Self {
        Self { user: Some(user) }
    }
}

/// Per-request context handed to validation and search
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub session: Option<Session>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user: Resource) -> Self {
        Self {
            session: Some(Session::for_user(user)),
        }
    }

    pub fn user(&self) -> Option<&Resource> {
        self.session.as_ref().and_then(|s| s.user.as_ref())
    }
}
