//! Device-side half of the relay: executes dispatched command batches
//! against the switcher and reports scene state back.

pub mod error;
pub mod executor;
pub mod obs;
pub mod relay_client;

pub use error::ObsError;
pub use executor::DeviceExecutor;
pub use obs::{ObsConfig, ObsSession, DEFAULT_SOURCE_PREFIX};
pub use relay_client::{run_relay_client, RelayClientConfig, DEFAULT_RECONNECT_DELAY};
