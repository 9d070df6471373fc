//! Wasla - Backend
//!
//! REST API server for ISP operators: subscribers, routers, card sales,
//! payments and staff, one isolated workspace per tenant.
//!
//! Licensed under the GNU Affero General Public License v3.0. See the LICENSE file for details.

use anyhow::Context;
use wasla_lib::{server, ServerConfig};

// ============================================================================
// WEB SERVER MODE
// ============================================================================

async fn run_web() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env().context("Invalid configuration")?;
    log::info!("Data directory: {:?}", config.data_dir);

    server::start_server(config)
        .await
        .map_err(|e| anyhow::anyhow!("Server failed: {}", e))
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    if let Err(e) = runtime.block_on(run_web()) {
        log::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
