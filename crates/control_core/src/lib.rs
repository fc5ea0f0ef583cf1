//! Switcher control core: batch building, settings cache, relay
//! correlation and scene reconciliation.

pub mod batch;
pub mod cache;
pub mod control;
pub mod correlator;
pub mod error;
pub mod reconciler;
pub mod relay;
pub mod scene;

pub use control::{ControlConfig, ControlPlane, ReconcileOutcome};
pub use relay::{RelayHub, RelayTransport};
pub use scene::SceneCatalog;

#[cfg(test)]
#[path = "tests/support.rs"]
mod tests_support;
