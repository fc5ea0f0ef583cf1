use std::sync::Arc;

use control_core::{ControlConfig, ControlPlane, RelayHub};

pub(crate) struct AppState {
    pub(crate) control: Arc<ControlPlane>,
    pub(crate) relay: Arc<RelayHub>,
}

impl AppState {
    pub(crate) fn new(config: ControlConfig) -> Self {
        let relay = Arc::new(RelayHub::new());
        let control = ControlPlane::new(config, relay.clone());
        Self { control, relay }
    }
}
