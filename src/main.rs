// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use log::{error, info, warn};

use onaccess_monitor::config::{verify_config, MonitorConfig};
use onaccess_monitor::consumer::ConsumerHandle;
use onaccess_monitor::ddd::DddHandle;
use onaccess_monitor::event_loop::{EventLoop, LoopExit};
use onaccess_monitor::owner::OwnerFilter;
use onaccess_monitor::queue::ScanQueue;
use onaccess_monitor::scanner::{ClamdScanner, Scanner};
use onaccess_monitor::setup;
use onaccess_monitor::shutdown::Shutdown;
use onaccess_monitor::state::DaemonState;
use onaccess_monitor::util::{init_logger, mask_loop_signals, wait_for_shutdown};

#[derive(Parser)]
#[command(name = "onaccess-monitor")]
#[command(about = "On-access virus scanning monitor built on fanotify")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser)]
enum Commands {
    /// Start the monitor
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        debug: bool,
        /// Disable virus scanning (treat all files as clean)
        #[arg(long)]
        no_scan: bool,
    },
    /// Verify configuration file without starting the monitor
    Verify {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            debug,
            no_scan,
        } => {
            init_logger(debug)?;

            let config = match config {
                Some(path) => MonitorConfig::load(&path).with_context(|| {
                    format!("Failed to load configuration from {}", path.display())
                })?,
                None => MonitorConfig::default(),
            };
            config.validate()?;

            run(Arc::new(config), no_scan).await
        }
        Commands::Verify { config } => verify_config(&config)
            .with_context(|| format!("Failed to verify configuration file {}", config.display())),
    }
}

async fn run(config: Arc<MonitorConfig>, no_scan: bool) -> Result<()> {
    let scanner: Arc<dyn Scanner> = Arc::new(ClamdScanner::new(config.clamd_socket.clone()));
    if no_scan {
        info!("Virus scanning disabled via --no-scan flag");
    } else if let Err(e) = scanner.validate_availability() {
        warn!("ClamAV unavailable: {e}. Events will pass through unscanned until it returns.");
    }

    let state = Arc::new(DaemonState::new().context("Daemon state initialization failed")?);
    let ctx = Arc::new(setup::initialize(Arc::clone(&config)).context("Fanotify setup failed")?);
    state.mark_channel_open();

    let (queue, scan_rx) = ScanQueue::bounded(config.queue_capacity);
    let consumer = ConsumerHandle::spawn(Arc::clone(&ctx), scanner, scan_rx);

    let ddd = if ctx.ddd_enabled {
        Some(DddHandle::spawn(Arc::clone(&ctx)).context("Directory discovery failed to start")?)
    } else {
        None
    };

    let filter = OwnerFilter::from_config(&config);
    let mut event_loop = EventLoop::new(Arc::clone(&ctx), Arc::clone(&state), queue, filter);
    // no_scan rides in on the queue producer side: with scanning off every
    // request is marked clean by the consumer
    let scan = !no_scan;
    event_loop.set_scan(scan);

    let mut loop_task = tokio::task::spawn_blocking(move || {
        if let Err(e) = mask_loop_signals() {
            warn!("could not mask signals on the event-loop thread: {e}");
        }
        event_loop.run()
    });

    info!("on-access monitor running");

    let loop_result = tokio::select! {
        signal = wait_for_shutdown() => {
            let signal = signal.context("Signal handler installation failed")?;
            info!("stopping on {signal:?}");
            state.request_stop();
            loop_task.await
        }
        result = &mut loop_task => {
            // The loop ended on its own; make the stop visible to the rest
            state.request_stop();
            result
        }
    };

    let mut shutdown = Shutdown::new(state, ctx, ddd, consumer);
    shutdown.execute().await;

    match loop_result.context("Event loop thread panicked")? {
        Ok(LoopExit::Stopped) => {
            info!("on-access monitor stopped");
            Ok(())
        }
        Err(e) => {
            error!("on-access monitoring failed: {e}");
            Err(e).context("Event loop failed")
        }
    }
}
