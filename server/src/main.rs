//! Relay server binary.
//!
//! Run with: cargo run --bin roomlink-server -- --port 4600

use std::net::IpAddr;

use clap::Parser;
use roomlink_server::console::{self, DebugControl};
use roomlink_server::RelayConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "roomlink-server", version, about = "Relay server for peer game sessions")]
struct Args {
    /// Port for both TCP and UDP.
    #[arg(long, default_value_t = 4600)]
    port: u16,

    /// Packets per connection per 3 s; 0 disables.
    #[arg(long)]
    spam_limit: Option<u32>,

    /// Join attempts per address per minute; 0 disables.
    #[arg(long)]
    join_limit: Option<u32>,

    /// Seconds between the closing notice and the shutdown.
    #[arg(long)]
    close_wait: Option<u64>,

    /// Skip the closing notice to rooms on shutdown.
    #[arg(long)]
    no_warn_closing: bool,

    /// Let clients without a game type join typed rooms.
    #[arg(long)]
    accept_no_type: bool,

    /// Addresses to blacklist from the start (repeatable).
    #[arg(long = "blacklist", value_name = "IP")]
    blacklist: Vec<IpAddr>,

    /// Start with debug logging.
    #[arg(long)]
    debug: bool,

    /// Run headless, without the stdin console.
    #[arg(long)]
    no_console: bool,
}

fn filter_for(debug: bool) -> EnvFilter {
    // RUST_LOG still wins when set.
    let default = if debug {
        "roomlink_server=debug,roomlink_protocol=debug,info"
    } else {
        "info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (filter_layer, filter_reload) = reload::Layer::new(filter_for(args.debug));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = RelayConfig {
        port: args.port,
        ..RelayConfig::default()
    };
    if let Some(limit) = args.spam_limit {
        config.spam_limit = limit;
    }
    if let Some(limit) = args.join_limit {
        config.join_limit = limit;
    }
    if let Some(secs) = args.close_wait {
        config.close_wait_secs = secs;
    }
    if args.no_warn_closing {
        config.warn_closing = false;
    }
    if args.accept_no_type {
        config.accept_no_type = true;
    }
    config.blacklist.extend(args.blacklist.iter().copied());

    let running = roomlink_server::start(config).await?;
    println!("roomlink relay on tcp+udp port {}.", running.local_addr.port());
    println!("Type 'help' for the command list.");

    let debug = DebugControl::new(args.debug, move |on| {
        let _ = filter_reload.modify(|filter| *filter = filter_for(on));
    });

    if !args.no_console {
        let handle = running.handle.clone();
        tokio::spawn(console::run(handle, debug));
    }

    let handle = running.handle.clone();
    let task = running.task;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            handle.stop().await;
        }
        result = task => {
            result?;
            return Ok(());
        }
    }

    Ok(())
}
