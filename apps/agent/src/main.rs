use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use relay_agent::{
    run_relay_client, ObsConfig, ObsSession, RelayClientConfig, DEFAULT_RECONNECT_DELAY,
    DEFAULT_SOURCE_PREFIX,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Bridges the switcher control server to a local OBS instance")]
struct Args {
    /// Base URL of the control server; the agent connects to its /relay endpoint.
    #[arg(long, env = "RELAY_URL", default_value = "http://127.0.0.1:3000")]
    relay_url: String,
    #[arg(long, env = "OBS_URL", default_value = "ws://127.0.0.1:4455")]
    obs_url: String,
    #[arg(long, env = "OBS_PASSWORD")]
    obs_password: Option<String>,
    /// Only OBS sources named `<prefix><slot>` are controlled.
    #[arg(long, env = "SOURCE_PREFIX", default_value = DEFAULT_SOURCE_PREFIX)]
    source_prefix: String,
    #[arg(
        long,
        env = "RECONNECT_DELAY_MS",
        default_value_t = DEFAULT_RECONNECT_DELAY.as_millis() as u64
    )]
    reconnect_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let reconnect_delay = Duration::from_millis(args.reconnect_delay_ms);
    let obs = ObsConfig {
        url: args.obs_url,
        password: args.obs_password,
        source_prefix: args.source_prefix,
    };
    let relay = RelayClientConfig {
        server_url: args.relay_url,
        reconnect_delay,
    };

    loop {
        match ObsSession::connect(&obs).await {
            Ok(session) => {
                info!(url = %obs.url, "agent: obs session ready");
                run_relay_client(relay.clone(), session).await?;
                warn!("agent: obs session lost");
            }
            Err(err) => warn!(url = %obs.url, error = %err, "agent: obs connection failed"),
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}
