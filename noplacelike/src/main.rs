use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use noplacelike::cli::{Cli, Commands};
use noplacelike::Platform;
use noplacelike_core::{init_tracing, resolve_config_path, PlatformConfig};

fn main() -> ExitCode {
    // clap exits with code 2 on invalid flags.
    let cli = Cli::parse();
    match cli.command {
        Commands::Version => {
            println!("noplacelike {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Commands::Config {
            add_dir,
            clear_dirs,
            config,
        } => run_config(add_dir, clear_dirs, config),
        Commands::Serve { host, port, config } => run_serve(host, port, config),
    }
}

fn run_config(
    add_dir: Option<String>,
    clear_dirs: bool,
    config_path: Option<PathBuf>,
) -> ExitCode {
    let path = resolve_config_path(config_path.as_deref());
    let mut config = match PlatformConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("noplacelike: {err}");
            return ExitCode::from(1);
        }
    };
    if clear_dirs {
        config.shared_dirs.clear();
    }
    if let Some(dir) = add_dir {
        if !config.shared_dirs.contains(&dir) {
            config.shared_dirs.push(dir);
        }
    }
    if let Err(err) = config.save(&path) {
        eprintln!("noplacelike: {err}");
        return ExitCode::from(1);
    }
    println!("config: {}", path.display());
    for dir in &config.shared_dirs {
        println!("shared dir: {dir}");
    }
    ExitCode::SUCCESS
}

fn run_serve(host: Option<String>, port: Option<u16>, config_path: Option<PathBuf>) -> ExitCode {
    let path = resolve_config_path(config_path.as_deref());
    let mut config = match PlatformConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("noplacelike: {err}");
            return ExitCode::from(1);
        }
    };
    config.apply_env();
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    init_tracing(&config.log_level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("noplacelike: failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };
    let result = runtime.block_on(async {
        let platform = Platform::build(config).await?;
        let token = platform.shutdown_token();
        tokio::spawn(async move {
            shutdown_signal().await;
            token.cancel();
        });
        platform.serve_until_shutdown().await
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("noplacelike: {err}");
            ExitCode::from(1)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl-C");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, starting graceful shutdown");
}
