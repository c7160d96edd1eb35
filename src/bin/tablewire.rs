use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tablewire::service::setup_tracing;
use tablewire::{setup_local_tracing_with_level, AppResult, Dispatcher, TransportConfig};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file, defaults are used when it does not exist
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for rolling log files; console only when absent
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Host a table: relay every packet of a logged-in peer to all logged-in peers.
    Serve {
        /// overrides network.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Join a table: send stdin lines as packets, print packets received.
    Connect { host: String, port: u16 },
    PrintConfig,
}

const PACING: Duration = Duration::from_millis(20);

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline = CommandLine::parse();
    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _guard = match &commandline.log_dir {
        Some(dir) => Some(setup_tracing(dir, level)?),
        None => {
            setup_local_tracing_with_level(level)?;
            None
        }
    };

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = if config_path.exists() {
        TransportConfig::set_up_config(&config_path)?
    } else {
        warn!("config file {} not found, using defaults", config_path.display());
        TransportConfig::default()
    };

    match commandline.command {
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
        Command::Serve { port } => serve(&config, port.unwrap_or(config.network.port)),
        Command::Connect { host, port } => join(&config, &host, port),
    }
}

fn serve(config: &TransportConfig, port: u16) -> AppResult<()> {
    let dispatcher = Dispatcher::start(config)?;
    let addr = dispatcher.listen(port)?;
    println!("listening on {}", addr);

    while dispatcher.is_running() {
        for packet in dispatcher.drain_all_packets() {
            let (payload, source) = packet.into_parts();
            if !source.is_logged_in() {
                // the first packet of a peer is its greeting
                source.mark_logged_in();
                info!(id = source.id(), peer = %source.peer_addr(), "peer joined the table");
            }
            let recipients = dispatcher.broadcast(&payload);
            info!(id = source.id(), len = payload.len(), recipients, "relayed packet");
        }
        for lost in dispatcher.poll_lost_connections() {
            info!(
                id = lost.id(),
                peer = %lost.peer_addr(),
                reason = lost.close_reason().as_deref().unwrap_or("closed"),
                "peer left the table"
            );
        }
        thread::sleep(PACING);
    }
    dispatcher.shutdown()
}

fn join(config: &TransportConfig, host: &str, port: u16) -> AppResult<()> {
    let dispatcher = Arc::new(Dispatcher::start(config)?);
    let connection = dispatcher.connect(host, port)?;

    let printer = {
        let dispatcher = dispatcher.clone();
        thread::Builder::new()
            .name("printer".to_string())
            .spawn(move || {
                while dispatcher.is_running() {
                    for packet in dispatcher.drain_all_packets() {
                        println!("{}", String::from_utf8_lossy(packet.payload()));
                    }
                    if !dispatcher.poll_lost_connections().is_empty() {
                        println!("disconnected");
                        break;
                    }
                    thread::sleep(PACING);
                }
            })?
    };

    for line in io::stdin().lock().lines() {
        let line = line?;
        if let Err(e) = dispatcher.send_to(line.as_bytes(), &connection) {
            error!("send failed: {}", e);
            break;
        }
    }

    // stdin closed: flush what is queued, then leave
    connection.close();
    while connection.is_connected() {
        thread::sleep(PACING);
    }
    let result = dispatcher.shutdown();
    if printer.join().is_err() {
        error!("printer thread panicked");
    }
    result
}
