use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use homewatch::config::{self, AppConfig};
use homewatch::logging;
use homewatch::pipeline::{Pipeline, PipelineHandle, PipelineRequest, RunFlags, SourceSelect};
use homewatch::probe::probe_url;
use homewatch::sources::{DeviceRegistry, NetworkSource, UrlStore};
use homewatch::types::{DetectMode, Outcome, Sensitivity};

#[derive(Parser)]
#[command(name = "homewatch", version)]
#[command(about = "Home camera surveillance — capture, anomaly detection and alert pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a local or network source through the pipeline
    Run {
        /// Local device position (from `homewatch devices`)
        #[arg(long, conflicts_with_all = ["url", "stored"])]
        device: Option<usize>,
        /// Network source: full URL or bare IP
        #[arg(long, conflicts_with = "stored")]
        url: Option<String>,
        /// Network source: index of a stored device
        #[arg(long)]
        stored: Option<i64>,
        /// Transport protocol for bare-IP sources
        #[arg(long, default_value = "rtsp")]
        protocol: String,
        /// Do not open a display window
        #[arg(long)]
        headless: bool,
        /// Do not record the session
        #[arg(long)]
        no_record: bool,
        /// Do not run the anomaly detector
        #[arg(long)]
        no_detect: bool,
        /// Detection mode: all, fire, person, fall
        #[arg(long, default_value = "all")]
        mode: String,
        /// Detection sensitivity: low, high
        #[arg(long, default_value = "low")]
        sensitivity: String,
    },

    /// Replay a stored recording, re-running detection over it
    History {
        /// Recording start date, e.g. 2024-06-11
        date: String,
        /// Index of the recording within that day
        #[arg(default_value = "1")]
        index: u32,
        #[arg(long)]
        headless: bool,
        #[arg(long)]
        no_detect: bool,
        #[arg(long, default_value = "all")]
        mode: String,
        #[arg(long, default_value = "low")]
        sensitivity: String,
    },

    /// Check whether a source URL is openable within the probe deadline
    Probe {
        url: String,
        /// Deadline in seconds (defaults to the configured probe timeout)
        #[arg(long)]
        deadline: Option<u64>,
    },

    /// List local capture devices
    Devices,

    /// List stored network devices
    Urls,
}

fn parse_mode(raw: &str) -> Result<DetectMode> {
    Ok(match raw {
        "all" => DetectMode::All,
        "fire" => DetectMode::FireSmoke,
        "person" => DetectMode::Person,
        "fall" => DetectMode::Fall,
        other => bail!("unknown detection mode {:?} (expected all/fire/person/fall)", other),
    })
}

fn parse_sensitivity(raw: &str) -> Result<Sensitivity> {
    Ok(match raw {
        "low" => Sensitivity::Low,
        "high" => Sensitivity::High,
        other => bail!("unknown sensitivity {:?} (expected low/high)", other),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();
    let cli = Cli::parse();
    let cfg = config::load_config().unwrap_or_else(|err| {
        warn!("config load failed ({}), using defaults", err);
        AppConfig::default()
    });

    match cli.command {
        Command::Run {
            device,
            url,
            stored,
            protocol,
            headless,
            no_record,
            no_detect,
            mode,
            sensitivity,
        } => {
            let source = if let Some(url) = url {
                SourceSelect::Network {
                    source: NetworkSource::Address(url),
                    protocol,
                }
            } else if let Some(index) = stored {
                SourceSelect::Network {
                    source: NetworkSource::StoredIndex(index),
                    protocol,
                }
            } else {
                SourceSelect::Local {
                    index: device.unwrap_or(0),
                }
            };
            let request = PipelineRequest {
                source,
                flags: RunFlags {
                    visibility: !headless,
                    record: !no_record,
                    detect: !no_detect,
                },
                mode: parse_mode(&mode)?,
                sensitivity: parse_sensitivity(&sensitivity)?,
            };
            run_pipeline(cfg, request).await
        }

        Command::History {
            date,
            index,
            headless,
            no_detect,
            mode,
            sensitivity,
        } => {
            let request = PipelineRequest {
                source: SourceSelect::History { date, index },
                flags: RunFlags {
                    visibility: !headless,
                    record: false,
                    detect: !no_detect,
                },
                mode: parse_mode(&mode)?,
                sensitivity: parse_sensitivity(&sensitivity)?,
            };
            run_pipeline(cfg, request).await
        }

        Command::Probe { url, deadline } => {
            let deadline =
                Duration::from_secs(deadline.unwrap_or(cfg.capture.url_timeout_secs).min(15));
            let outcome = tokio::task::spawn_blocking(move || probe_url(&url, deadline)).await?;
            println!("{:?}", outcome);
            Ok(())
        }

        Command::Devices => {
            let devices = DeviceRegistry::scan(cfg.capture.device_scan_limit);
            if devices.is_empty() {
                println!("No local capture devices found.");
            } else {
                for (position, index) in devices.indices().iter().enumerate() {
                    println!("{:<3} capture index {}", position, index);
                }
            }
            Ok(())
        }

        Command::Urls => {
            let store = UrlStore::load(&cfg.storage.url_store)?;
            if store.is_empty() {
                println!("No stored network devices.");
            } else {
                println!("{:<5} {:<18} {:<6} url", "index", "host", "port");
                for dev in store.devices() {
                    println!("{:<5} {:<18} {:<6} {}", dev.index, dev.ip, dev.port, dev.url);
                }
            }
            Ok(())
        }
    }
}

async fn run_pipeline(cfg: AppConfig, request: PipelineRequest) -> Result<()> {
    let pipeline = Pipeline::new(cfg)?;
    let mut handle = pipeline.start(request);
    let code = wait_or_interrupt(&mut handle).await;
    info!("pipeline outcome code: {}", code);
    if code != Outcome::CleanStop.code() {
        std::process::exit(1);
    }
    Ok(())
}

/// Await the run, converting ctrl-c into a cooperative stop request.
async fn wait_or_interrupt(handle: &mut PipelineHandle) -> i32 {
    tokio::select! {
        joined = &mut handle.join => unwrap_join(joined),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping pipeline");
            handle.stop();
            unwrap_join((&mut handle.join).await)
        }
    }
}

fn unwrap_join(joined: std::result::Result<i32, tokio::task::JoinError>) -> i32 {
    joined.unwrap_or_else(|err| {
        error!("pipeline task failed: {}", err);
        Outcome::ReadFailed.code()
    })
}
