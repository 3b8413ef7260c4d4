//! Tablet server binary.
//!
//! Reads the flag file named on the command line (or defaults), wires the
//! cache stack, registers the background tasks and waits for shutdown.
//! Exit codes: zero on clean shutdown, non-zero when initialisation
//! (including cache setup) fails; a coordinator kick exits hard without
//! unwinding, so a stale instance can never keep serving.

use std::path::PathBuf;
use std::sync::Arc;

use emberdb::dfs::LocalDfs;
use emberdb::scheduler::Scheduler;
use emberdb::server::tasks;
use emberdb::{CacheLayer, Flags, TabletServer};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let flags = match args.next() {
        Some(flag_file) => match Flags::load(&flag_file) {
            Ok(flags) => flags,
            Err(err) => {
                tracing::error!(flag_file, error = %err, "bad flag file");
                std::process::exit(2);
            }
        },
        None => Flags::default(),
    };

    let root = PathBuf::from(
        std::env::var("EMBERDB_ROOT").unwrap_or_else(|_| "./emberdb-data".to_string()),
    );
    let cache_dir = root.join("ssd-cache");
    let cache_layer = if flags.persistent_cache_enabled {
        CacheLayer::PersistentBlockCache
    } else {
        CacheLayer::None
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "runtime init failed");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let server =
            match TabletServer::open(flags, LocalDfs::new(), &root, &cache_dir, cache_layer) {
                Ok(server) => server,
                Err(err) => {
                    tracing::error!(error = %err, "server init failed");
                    std::process::exit(1);
                }
            };

        // The coordinator normally grants the session over its own channel;
        // standalone runs mint one from the pid for local testing.
        let session = format!("standalone-{}", std::process::id());
        server.grant_session(&session);

        let scheduler = Scheduler::new();
        tasks::register_all(&server, &scheduler);
        run_until_shutdown(&server).await;

        if let Err(err) = scheduler.shutdown().await {
            tracing::error!(error = %err, "scheduler shutdown failed");
        }
        for tablet in server.tablets() {
            if let Err(err) = tablet.unload() {
                tracing::error!(error = %err, "tablet unload at shutdown failed");
            }
        }
        tracing::info!("tablet server stopped");
    });
}

async fn run_until_shutdown(server: &Arc<TabletServer>) {
    let _ = server;
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(error = %err, "signal listener failed"),
    }
}
