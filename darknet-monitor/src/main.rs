use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use darknet_monitor::{
    config::{DataPlaneBackend, MonitorConfig},
    controller,
};

#[derive(Parser)]
#[command(name = "darknet-monitor")]
#[command(about = "Darknet activity-decay controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Program the data plane, run the sweep loop and serve the query API
    Serve(ConfigArgs),
    /// Validate the configuration and monitored list, then exit
    Check(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Monitored-prefix list, one CIDR per line
    #[arg(long, value_name = "FILE")]
    monitored: Option<PathBuf>,
    /// Minutes between sweeps
    #[arg(long, value_name = "MINS")]
    interval_mins: Option<u64>,
    /// Silent sweeps tolerated before an address is reported inactive
    #[arg(long)]
    alpha: Option<u32>,
    /// Address the query API listens on
    #[arg(long, value_name = "ADDR")]
    listen: Option<std::net::SocketAddr>,
    #[arg(long, value_enum)]
    data_plane: Option<DataPlaneBackend>,
    /// Directory holding the pinned data-plane maps
    #[arg(long, value_name = "DIR")]
    pin_dir: Option<PathBuf>,
}

impl ConfigArgs {
    fn resolve(self) -> Result<MonitorConfig> {
        let mut config = MonitorConfig::load(self.config.as_deref())?;
        if let Some(monitored) = self.monitored {
            config.monitored = monitored;
        }
        if let Some(interval_mins) = self.interval_mins {
            config.interval_mins = interval_mins;
        }
        if let Some(alpha) = self.alpha {
            config.alpha = alpha;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(data_plane) = self.data_plane {
            config.data_plane = data_plane;
        }
        if let Some(pin_dir) = self.pin_dir {
            config.pin_dir = pin_dir;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(err) = run().await {
        eprintln!("darknet-monitor error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve(args)) => {
            controller::run_controller(args.resolve()?).await?;
        }
        Some(Commands::Check(args)) => {
            let config = args.resolve()?;
            config.validate()?;
            let registry = controller::build_registry(&config)?;
            println!(
                "{}: {} prefixes, {} of {} indices",
                config.monitored.display(),
                registry.blocks().len(),
                registry.len(),
                config.global_table_size
            );
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}
