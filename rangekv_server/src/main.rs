//! Rangekv local cluster executable.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use rangekv::cluster::{ClusterConfig, LocalCluster};
use rangekv::{logger_init, pf_error, pf_info, KvError, ME};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// TOML config file, one table per section ('[store]', '[zone]', ...).
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    /// Number of nodes in the cluster; overrides the config file.
    #[arg(short, long)]
    nodes: Option<usize>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return the cluster config on
    /// success or `Err(KvError)` on any error.
    fn sanitize(&self) -> Result<ClusterConfig, KvError> {
        if self.threads < 2 {
            return Err(KvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        let mut config = match &self.config_file {
            Some(path) => ClusterConfig::from_toml(&fs::read_to_string(path)?)?,
            None => ClusterConfig::default(),
        };
        if let Some(nodes) = self.nodes {
            config.num_nodes = nodes;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Actual main function of the cluster runner.
fn server_main() -> Result<(), KvError> {
    let args = CliArgs::parse();
    let config = args.sanitize()?;

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-rangekv")
            .build()?;

        runtime.block_on(async move {
            let num_nodes = config.num_nodes;
            let cluster = LocalCluster::start(config).await?;
            pf_info!("cluster of {} node(s) up, ctrl-c to stop", num_nodes);

            while !*rx_term.borrow() {
                rx_term.changed().await?;
            }
            cluster.stop().await;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), KvError>(())
        })?;
    }

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the cluster runner.
fn main() -> ExitCode {
    logger_init();
    let _ = ME.set("rangekv".into());

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
