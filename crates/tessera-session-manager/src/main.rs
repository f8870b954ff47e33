//! tessera-session-manager: authenticates users, launches graphical
//! backends and answers ICP calls from the RDP server.

mod auth;
mod config;
mod icp_server;
mod module;
mod monitor;
mod properties;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use auth::{AuthModuleRegistry, BuiltinAuth};
use config::Config;
use icp_server::SmServices;
use module::remote::RemoteModule;
use module::x11::X11Module;
use module::BackendModuleRegistry;
use monitor::ProcessMonitor;
use properties::PropertyStore;
use session::SessionRegistry;

#[derive(Debug, Parser)]
#[command(
    name = "tessera-session-manager",
    version,
    about = "Session manager for the tessera RDP server"
)]
struct Args {
    /// Configuration file.
    #[arg(long, default_value = "/etc/tessera/session-manager.toml")]
    config: PathBuf,

    /// Validate a configuration file and exit.
    #[arg(long, value_name = "FILE")]
    checkconfig: Option<PathBuf>,

    /// Run in the foreground (service supervision is expected to come
    /// from the init system).
    #[arg(long)]
    nodaemon: bool,

    /// Ask a running instance to terminate (handled by the init
    /// system; accepted for compatibility).
    #[arg(long)]
    kill: bool,

    /// Logging backend: console, syslog or journald.
    #[arg(long, default_value = "console")]
    log: String,

    /// Logging level: error, warn, info, debug or trace.
    #[arg(long, default_value = "warn")]
    loglevel: String,
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.loglevel.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match args.log.as_str() {
        "syslog" | "journald" => builder.without_time().init(),
        _ => builder.init(),
    }
}

fn build_services(config: Config) -> Arc<SmServices> {
    let store = Arc::new(PropertyStore::new());
    config.apply(&store);

    let monitor = Arc::new(ProcessMonitor::new());

    let mut auth_registry = AuthModuleRegistry::new();
    auth_registry.register(Arc::new(BuiltinAuth));

    let mut modules = BackendModuleRegistry::new();
    modules.register_local(Arc::new(X11Module::new(
        Arc::clone(&store),
        Arc::clone(&monitor),
    )));
    // Modules behind a launcher are available for every name with a
    // configured launcher program.
    if let Some(launcher) = store.get_string(0, "module.launcher") {
        modules.register_remote(Arc::new(RemoteModule::new(
            "x11",
            &launcher,
            Arc::clone(&store),
        )));
    }

    let services = Arc::new(SmServices {
        store,
        config: std::sync::RwLock::new(config),
        auth: auth_registry,
        modules,
        sessions: SessionRegistry::new(),
        monitor: Arc::clone(&monitor),
        peer: std::sync::Mutex::new(None),
    });

    let exit_services = Arc::clone(&services);
    monitor.set_session_exit_handler(move |session_id| {
        tracing::info!(session_id, "backend died, terminating session");
        icp_server::terminate_session(&exit_services, session_id);
    });

    services
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("unable to load {}", args.config.display()))?;
    let services = build_services(config);

    tokio::spawn(monitor::run_sigchld_task(Arc::clone(&services.monitor)));

    // SIGHUP reloads the configuration.
    let reload_services = Arc::clone(&services);
    let config_path = args.config.clone();
    tokio::spawn(async move {
        let Ok(mut sighup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            return;
        };
        while sighup.recv().await.is_some() {
            match Config::load(&config_path) {
                Ok(config) => {
                    config.apply(&reload_services.store);
                    *reload_services.config.write().expect("config lock") = config;
                    tracing::info!("configuration reloaded");
                }
                Err(e) => tracing::error!(error = %e, "config reload failed"),
            }
        }
    });

    let serve_services = Arc::clone(&services);
    let server = tokio::spawn(async move { icp_server::serve(serve_services).await });

    // SIGINT/SIGTERM end the process after stopping every session.
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        result = server => {
            result.context("icp server task failed")??;
        }
    }

    for session in services.sessions.all() {
        icp_server::terminate_session(&services, session.id);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    if let Some(path) = &args.checkconfig {
        return match Config::load(path) {
            Ok(_) => {
                println!("{}: configuration is valid", path.display());
                Ok(())
            }
            Err(e) => Err(e),
        };
    }
    if args.kill {
        eprintln!(
            "tessera-session-manager runs under service supervision; use systemctl to stop it"
        );
        return Ok(());
    }
    if !args.nodaemon {
        tracing::info!("daemonization is delegated to the init system; running in foreground");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "tessera-session-manager started"
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("unable to start the runtime")?
        .block_on(run(args))
}
