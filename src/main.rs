use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use tokio::runtime::Builder;

use routing_flow::config::RouterConfig;
use routing_flow::control_server::ControlServer;
use routing_flow::controller::Controller;
use routing_flow::southbound::{Datapath, LoggingDatapath};

#[derive(Parser)]
#[command(name = "routing-flow", about = "Distance-vector routing control plane")]
struct Cli {
    /// JSON configuration file; defaults are used when omitted.
    #[arg(long)]
    config: Option<String>,

    /// Overrides `control_addr` from the configuration.
    #[arg(long)]
    control_addr: Option<String>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level.as_str())).init();

    let mut config = match &cli.config {
        Some(path) => RouterConfig::load(path)?,
        None => RouterConfig::default(),
    };
    if let Some(addr) = cli.control_addr {
        config.control_addr = addr;
    }
    config.validate()?;

    let rt = Builder::new_multi_thread().enable_all().build()?;

    rt.block_on(async {
        let controller = Arc::new(Controller::from_config(&config));
        controller
            .apply_topology(&config.topology, |dpid| Arc::new(LoggingDatapath::new(dpid)) as Arc<dyn Datapath>)
            .await?;
        info!("{} switch(es) running", controller.list_switches().await.len());

        let server = ControlServer::new(config.control_addr.clone(), controller.clone());

        tokio::select! {
            result = server.start() => {
                if let Err(e) = result {
                    error!("Control server stopped: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
            }
        }

        controller.shutdown().await;
        Ok(())
    })
}
