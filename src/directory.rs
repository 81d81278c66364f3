//! Session directory.
//!
//! The persistent session store lives elsewhere; the relay only needs to know
//! whether a session exists and which streaming host instance runs it.

use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::FutureExt;

/// What the relay needs to know about a sandbox session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    /// Streaming host instance. `None` while the session has not been placed.
    pub instance_id: Option<String>,
}

/// Read-only view of the session store.
pub trait SessionDirectory: Send + Sync + 'static {
    fn lookup<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Option<SessionRecord>>;
}

/// Directory backed by the `[sessions]` config table.
pub struct StaticDirectory {
    sessions: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new(sessions: HashMap<String, String>) -> Self {
        Self { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionDirectory for StaticDirectory {
    fn lookup<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Option<SessionRecord>> {
        async move {
            self.sessions.get(session_id).map(|instance| SessionRecord {
                session_id: session_id.to_string(),
                instance_id: (!instance.is_empty()).then(|| instance.clone()),
            })
        }
        .boxed()
    }
}
