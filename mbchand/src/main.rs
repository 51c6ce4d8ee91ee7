mod config;
mod logging;
mod smoke;

use anyhow::Result;
use tracing::info;

fn main() -> Result<()> {
    let config = config::load_config()?;
    logging::init(&config.logging)?;

    info!(
        nodes = config.fabric.nodes,
        messages = config.smoke.messages,
        payload_len = config.smoke.payload_len,
        "starting loopback smoke run"
    );

    let stats = smoke::run(&config)?;

    info!(
        nodes = stats.pairs,
        messages = stats.messages,
        "smoke run passed"
    );
    Ok(())
}
