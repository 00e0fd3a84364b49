use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use saml_bridge::{
    AppState, build_app,
    config::AppConfig,
    jobs, observability,
    saml::{SamlError, SamlProvider},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "saml-bridge.toml";

/// Extensions `list-certs` treats as key material.
const CERT_EXTENSIONS: &[&str] = &["pem", "crt", "cer", "key"];

#[derive(Parser, Debug)]
#[command(version, about = "SAML 2.0 Service Provider bridge", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./saml-bridge.toml if it exists)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the HTTP server (default)
    Serve,
    /// Print the Service Provider metadata document
    Metadata {
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Load the configuration and key material, reporting any problem
    CheckConfig,
    /// List candidate certificate and key files in `saml.certs_dir`
    ListCerts,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config_path = args.config.as_deref();

    match args.command {
        Some(Command::Metadata { output }) => run_metadata(config_path, output),
        Some(Command::CheckConfig) => run_check_config(config_path),
        Some(Command::ListCerts) => run_list_certs(config_path),
        Some(Command::Serve) | None => run_server(config_path).await,
    }
}

/// Resolve and load the configuration file.
///
/// Without `--config`, `./saml-bridge.toml` is used when present; otherwise
/// the built-in defaults apply.
fn load_config(explicit_path: Option<&str>) -> Result<(AppConfig, Option<PathBuf>), String> {
    let path = match explicit_path {
        Some(path) => Some(PathBuf::from(path)),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };

    match path {
        Some(path) => AppConfig::from_file(&path)
            .map(|config| (config, Some(path.clone())))
            .map_err(|e| format!("Failed to load config from {}: {}", path.display(), e)),
        None => Ok((AppConfig::default(), None)),
    }
}

fn run_metadata(config_path: Option<&str>, output: Option<String>) -> ExitCode {
    let (config, _) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let metadata = match SamlProvider::from_config(config.saml).and_then(|p| p.metadata()) {
        Ok(metadata) => metadata,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &metadata) {
                eprintln!("Failed to write {}: {}", path, e);
                return ExitCode::FAILURE;
            }
            eprintln!("Wrote SP metadata to {}", path);
        }
        None => println!("{}", metadata),
    }
    ExitCode::SUCCESS
}

fn run_check_config(config_path: Option<&str>) -> ExitCode {
    let (config, path) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match &path {
        Some(path) => println!("Config:        {}", path.display()),
        None => println!("Config:        (built-in defaults)"),
    }

    let provider = match SamlProvider::from_config(config.saml.clone()) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("Key material:  {}", e);
            return ExitCode::FAILURE;
        }
    };
    let snapshot = match provider.snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let present = |loaded: bool| if loaded { "loaded" } else { "not configured" };
    println!("Issuer:        {}", or_unset(&config.saml.issuer));
    println!("Callback URL:  {}", or_unset(&config.saml.callback_url));
    println!("Entry point:   {}", or_unset(&config.saml.entry_point));
    println!("IdP cert:      {}", present(snapshot.keys.idp_cert.is_some()));
    println!("Signing key:   {}", present(snapshot.keys.signing.is_some()));
    println!("Decryption:    {}", present(snapshot.keys.decryption.is_some()));

    let mut ok = true;
    if snapshot.keys.idp_cert.is_none() {
        eprintln!("Warning: no IdP certificate; every SAML Response will be rejected");
        ok = false;
    }
    if let Err(e) = provider.metadata() {
        eprintln!("Warning: metadata cannot be generated: {}", e);
        ok = false;
    }

    if ok {
        println!("Configuration OK");
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn or_unset(value: &str) -> &str {
    if value.is_empty() { "(unset)" } else { value }
}

fn run_list_certs(config_path: Option<&str>) -> ExitCode {
    let (config, _) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let Some(dir) = config.saml.certs_dir.as_deref() else {
        eprintln!("Error: saml.certs_dir is not configured");
        return ExitCode::FAILURE;
    };

    match list_cert_files(dir) {
        Ok(files) => {
            for file in files {
                println!("{}", file);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to read {}: {}", dir.display(), e);
            ExitCode::FAILURE
        }
    }
}

/// File names in `dir` with a certificate or key extension, sorted.
fn list_cert_files(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_cert = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| CERT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_cert
            && path.is_file()
            && let Some(name) = path.file_name().and_then(|n| n.to_str())
        {
            files.push(name.to_string());
        }
    }
    files.sort();
    Ok(files)
}

async fn run_server(config_path: Option<&str>) -> ExitCode {
    let (config, path) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!(
        config_file = %path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "(defaults)".to_string()),
        "Starting SAML bridge"
    );

    let state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize application state");
            return ExitCode::FAILURE;
        }
    };
    if let Err(SamlError::Configuration(e)) = state.provider.metadata() {
        tracing::warn!(error = %e, "SP metadata is unavailable until the configuration is fixed");
    }

    let shutdown = CancellationToken::new();
    if config.saml.validate_in_response_to {
        state
            .task_tracker
            .spawn(jobs::start_request_cache_cleanup_worker(
                Arc::clone(&state.provider),
                Duration::from_secs(config.server.cleanup_interval_secs),
                shutdown.clone(),
            ));
    }

    let app = build_app(&config, state.clone());

    let bind_addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_addr, error = %e, "Failed to bind to address");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("Server listening on http://{}", bind_addr);

    // Graceful shutdown: wait for SIGINT/SIGTERM, then wait for background tasks
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.task_tracker.clone(), shutdown))
        .await
    {
        tracing::error!(error = %e, "Server error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn shutdown_signal(task_tracker: TaskTracker, shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, waiting for background tasks to complete...");

    shutdown.cancel();
    task_tracker.close();

    match tokio::time::timeout(Duration::from_secs(10), task_tracker.wait()).await {
        Ok(()) => tracing::info!("All background tasks completed"),
        Err(_) => {
            tracing::warn!("Timeout waiting for background tasks, some may not have completed")
        }
    }

    tracing::info!("Shutdown complete");
}
