//! Manual bring-up tool for the CLAT coordinator.
//!
//! Starts translation on one uplink, prints the plane state, then tears
//! everything down again on SIGINT/SIGTERM.

use anyhow::Result;
use clap::Parser;

#[derive(Parser)]
#[command(name = "clatctl", about = "Bring up 464XLAT translation on an IPv6-only uplink")]
struct Cli {
    /// IPv6-only uplink interface to translate for.
    #[arg(short, long, env = "CLAT_INTERFACE")]
    interface: String,

    /// Numeric id of the uplink network, encoded into the socket fwmark.
    #[arg(short, long, env = "CLAT_NET_ID", default_value_t = 0)]
    net_id: u32,

    /// NAT64 prefix, e.g. 64:ff9b::/96.
    #[arg(short = 'p', long, env = "CLAT_NAT64_PREFIX")]
    nat64_prefix: ip_network::Ipv6Network,

    /// Translator daemon binary.
    #[arg(long, env = "CLAT_CLATD", default_value = "clatd")]
    clatd_path: std::path::PathBuf,
}

#[cfg(target_os = "linux")]
fn main() -> Result<()> {
    use clat_coordinator::{Coordinator, OsPlatform};
    use tracing_subscriber::EnvFilter;

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let platform = OsPlatform::with_clatd_path(cli.clatd_path)?;
    let mut coordinator = Coordinator::new(platform);

    let v6 = coordinator.start(&cli.interface, cli.net_id, cli.nat64_prefix)?;
    tracing::info!(%v6, "CLAT translation active");

    coordinator.dump(&mut std::io::stdout())?;

    wait_for_shutdown()?;

    coordinator.stop()?;
    tracing::info!("CLAT torn down");

    Ok(())
}

#[cfg(target_os = "linux")]
fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut terminate = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }

        Ok(())
    })
}

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    let _ = Cli::parse();

    anyhow::bail!("clatctl only runs on Linux");
}
