//! driftcache agent - command-line front end for the offline caching engine.
//!
//! Registers the worker against the configured origin and exposes the
//! maintenance operations (status, cache clearing, queueing and replaying
//! offline mutations) as one-shot commands.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use driftcache_core::{
    Capabilities, Config, Coordinator, HttpNetwork, LogReload, Method, Network, NetworkStatus,
    Notification, Notifier, Severity,
};

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Set up logging with environment-based filter
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

/// Notifier that prints engine banners to stderr.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notification: Notification) {
        let tag = match notification.severity {
            Severity::Info => "info",
            Severity::Success => "ok",
            Severity::Warning => "warn",
            Severity::Error => "error",
        };
        eprintln!("[{}] {}", tag, notification.message);
    }
}

fn usage() {
    eprintln!("Usage: driftcache <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  register                       Register the worker and pre-cache the manifest");
    eprintln!("  status                         Show registration and queue state");
    eprintln!("  queue <url> <method> [json]    Queue a mutation (add --offline to skip the direct send)");
    eprintln!("  replay                         Replay queued mutations now");
    eprintln!("  clear-cache                    Delete cached partitions (offline fallbacks kept)");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        usage();
        return Ok(());
    };

    let config = Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        Config::default()
    });
    let cache_dir = config.cache_dir()?;
    let engine = Arc::new(config.engine.clone());
    let network = Arc::new(HttpNetwork::new()?) as Arc<dyn Network>;
    let coordinator = Coordinator::new(
        &cache_dir,
        engine,
        network,
        Arc::new(ConsoleNotifier),
        Arc::new(LogReload),
        Capabilities::default(),
    );

    info!(command, "driftcache agent starting");
    match command {
        "register" => {
            coordinator.register().await?;
            if let Some(state) = coordinator.worker_state().await {
                println!("registered, worker state: {:?}", state);
            }
        }
        "status" => {
            let queue = coordinator.queue();
            println!("registered: {}", coordinator.is_registered());
            println!("queued mutations: {}", queue.len().await);
            for entry in queue.entries().await {
                println!(
                    "  #{} {} {} ({})",
                    entry.id,
                    entry.method.as_str(),
                    entry.url,
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        "queue" => {
            let (Some(url), Some(method)) = (args.get(2), args.get(3)) else {
                usage();
                bail!("queue requires <url> and <method>");
            };
            let method = parse_method(method)?;
            let body = match args.get(4).filter(|a| *a != "--offline") {
                Some(raw) => serde_json::from_str(raw)?,
                None => serde_json::Value::Null,
            };
            if args.iter().any(|a| a == "--offline") {
                coordinator.set_network_status(NetworkStatus::Offline);
            }
            let mutation = coordinator.queue_form_submission(url, method, body).await?;
            println!("queued #{}", mutation.id);
        }
        "replay" => {
            let report = coordinator.queue().replay().await?;
            println!(
                "attempted {}, succeeded {}, remaining {}",
                report.attempted, report.succeeded, report.remaining
            );
        }
        "clear-cache" => {
            coordinator.register().await?;
            let outcome = coordinator.clear_cache().await;
            println!("clear cache: {:?}", outcome);
        }
        _ => {
            usage();
            bail!("unknown command: {}", command);
        }
    }

    coordinator.stop().await;
    Ok(())
}

fn parse_method(raw: &str) -> Result<Method> {
    Ok(match raw.to_ascii_uppercase().as_str() {
        "GET" => Method::Get,
        "POST" => Method::Post,
        "PUT" => Method::Put,
        "DELETE" => Method::Delete,
        "PATCH" => Method::Patch,
        "HEAD" => Method::Head,
        _ => bail!("unsupported method: {}", raw),
    })
}
