//! Export service: queue worker, change detector and subscriber endpoint.
//!
//! Configuration is read from the file named by `CADEXPORT_CONFIG`, then
//! `~/.cadexport/config.json`, falling back to built-in defaults.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cadexport::broadcast::ws;
use cadexport::db::Database;
use cadexport::{
    load_config, telemetry, Broadcaster, CadExportError, ChangeDetector, Config, ConfigError,
    DetectorContext, JobQueue, JobStore, ScriptBridge, SqliteJobStore,
};

fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("CADEXPORT_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join(".cadexport").join("config.json"))
        .filter(|path| path.is_file())
}

fn load() -> Result<Config, ConfigError> {
    match config_path() {
        Some(path) => load_config(&path),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> cadexport::Result<()> {
    let config = match load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cadexport-server: {e}");
            return Err(e.into());
        }
    };
    telemetry::init(&config.logging);
    info!("Starting cadexport-server v{}", env!("CARGO_PKG_VERSION"));

    let db_path = config
        .resolved_database_path()
        .ok_or_else(|| ConfigError::Validation {
            message: "no database_path configured and no home directory found".to_string(),
        })?;
    let db = Database::open(&db_path)?;
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(db.clone()));

    let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&store), config.broadcast.clone()));
    let tool = Arc::new(ScriptBridge::new(config.tool.clone()));
    let queue = JobQueue::new(
        Arc::clone(&store),
        tool,
        Arc::clone(&broadcaster),
        config.queue.clone(),
        config.tool.alternate_extensions.clone(),
    );

    if let Err(e) = queue.recover() {
        warn!(error = %e, "Startup recovery failed");
    }

    let cancel = CancellationToken::new();
    let worker = queue.start(cancel.clone());

    let detector = ChangeDetector::from_config(
        &config.detector,
        &db,
        DetectorContext::new(Arc::clone(&store), Arc::clone(&broadcaster), queue.clone()),
    );
    let detector = tokio::spawn(detector.run(cancel.clone()));

    let listener = TcpListener::bind(&config.broadcast.bind)
        .await
        .map_err(CadExportError::Io)?;
    let endpoint = tokio::spawn(ws::serve(
        listener,
        Arc::clone(&broadcaster),
        config.broadcast.session_buffer,
        cancel.clone(),
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
    cancel.cancel();

    for (name, task) in [("worker", worker), ("detector", detector), ("endpoint", endpoint)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Task ended abnormally");
        }
    }

    info!("cadexport-server stopped");
    Ok(())
}
