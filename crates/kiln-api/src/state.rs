//! Application state.

use kiln_scheduler::Service;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: Service,
}

impl AppState {
    pub fn new(service: Service) -> Self {
        Self { service }
    }
}
