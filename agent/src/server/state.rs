//! Server state

use std::sync::Arc;

use crate::reconcile::Controller;
use crate::storage::status::StatusStore;
use crate::telemetry::HostIdentity;

/// Server state shared across handlers
pub struct ServerState {
    pub store: StatusStore,
    pub controller: Arc<Controller>,
    pub identity: HostIdentity,
}

impl ServerState {
    pub fn new(store: StatusStore, controller: Arc<Controller>, identity: HostIdentity) -> Self {
        Self {
            store,
            controller,
            identity,
        }
    }
}
