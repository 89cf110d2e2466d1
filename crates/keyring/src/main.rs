//! `keyring`: key lifecycle daemon entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing, optional OTLP).
//! 3. Derive the master key; a missing secret aborts startup.
//! 4. Open the file-backed key store.
//! 5. Build the [`KeyManager`] and run one expiry sweep.
//! 6. Spawn the periodic sweep and wait for Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use keyring::config::Config;
use keyring::{sweep_task, telemetry, EnvelopeCipher, FileKeyStore, KeyManager, MasterKey};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        deployment_env = %cfg.deployment_env,
        key_store_dir = %cfg.key_store_dir,
        "keyring starting"
    );

    // -----------------------------------------------------------------------
    // 3. Master key
    // -----------------------------------------------------------------------
    let master = MasterKey::from_provider(&cfg).context("failed to derive master key")?;
    let cipher = EnvelopeCipher::new(master);
    info!(master_key_id = %cipher.current_key_id(), "master key ready");

    // -----------------------------------------------------------------------
    // 4. Key store
    // -----------------------------------------------------------------------
    let store = FileKeyStore::open(&cfg.key_store_dir)
        .await
        .with_context(|| format!("failed to open key store at {}", cfg.key_store_dir))?;

    // -----------------------------------------------------------------------
    // 5. Manager + startup sweep
    // -----------------------------------------------------------------------
    let manager = KeyManager::new(Arc::new(store), cipher, cfg.manager_settings());
    manager.check_expired_keys().await;

    // -----------------------------------------------------------------------
    // 6. Background sweep
    // -----------------------------------------------------------------------
    let sweep = sweep_task(
        manager.clone(),
        Duration::from_secs(cfg.sweep_interval_secs),
    );
    info!(interval_secs = cfg.sweep_interval_secs, "expiry sweep scheduled");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    sweep.abort();
    info!("keyring shutting down");

    Ok(())
}
