//! tessera-rdp-server: accepts RDP clients, brokers sessions through
//! the session manager, and streams backend framebuffers.

mod appctx;
mod backend;
mod bandwidth;
mod channels;
mod connection;
mod frontend;
mod rdp;
mod server;
mod state;
mod tls;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tessera_encode::CodecFactories;

#[derive(Debug, Parser)]
#[command(name = "tessera-rdp-server", version, about = "Multi-session RDP server")]
struct Args {
    /// Listening port.
    #[arg(long, default_value_t = 3389)]
    port: u16,

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
        // syslog/journald both capture stderr of services; emit without
        // timestamps there since the journal adds its own.
        "syslog" | "journald" => builder.without_time().init(),
        _ => builder.init(),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    if args.kill {
        eprintln!("tessera-rdp-server runs under service supervision; use systemctl to stop it");
        return Ok(());
    }
    if !args.nodaemon {
        tracing::info!("daemonization is delegated to the init system; running in foreground");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        "tessera-rdp-server started"
    );

    let icp = server::connect_icp()?;

    // Codec transforms (RemoteFX / H.264) register here when compiled
    // in; without them the encoder falls back to bitmap updates.
    let codecs = CodecFactories::default();

    // TLS: configured certificate, else self-signed.
    let cert = icp.property_string(0, "ssl.certificate").ok().flatten();
    let key = icp.property_string(0, "ssl.key").ok().flatten();
    let tls = match (cert, key) {
        (Some(cert), Some(key)) => {
            match tls::load_from_files(cert.as_ref(), key.as_ref()) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::error!(error = %e, "unable to load TLS files, generating self-signed");
                    Some(tls::generate_self_signed()?)
                }
            }
        }
        _ => Some(tls::generate_self_signed()?),
    };

    let app = appctx::AppContext::new(codecs, tls);
    server::install_icp(&app, icp);

    server::run(&app, args.port)?;

    tracing::debug!("terminating");
    Ok(())
}
