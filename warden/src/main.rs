use clap::Parser;
use std::{path::PathBuf, process};
use warden::{supervisor::Supervisor, worker::NullHooks, Config};

/// Privilege-separated multi-process network server.
#[derive(Debug, Parser)]
#[command(name = "warden", version, about)]
struct Args {
    /// Configuration file.
    #[arg(short = 'c', long = "config", default_value = "warden.conf")]
    config: PathBuf,

    /// Log to stderr instead of syslog.
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Skip the chroot (development only).
    #[arg(short = 'n', long)]
    skip_chroot: bool,

    /// Skip the user change (development only).
    #[arg(short = 'r', long)]
    skip_runas: bool,

    /// Suppress routine lifecycle output.
    #[arg(short = 'q', long)]
    quiet: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("warden: {}", err);
        process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::from_file(&args.config)?;
    config.foreground |= args.foreground;
    config.skip_chroot |= args.skip_chroot;
    config.skip_runas |= args.skip_runas;
    config.quiet |= args.quiet;

    let _log_guard = warden_log::async_logger("warden", config.foreground).await?;

    if !config.skip_runas && !nix::unistd::getuid().is_root() {
        return Err(warden::Error::PermissionDenied.into());
    }

    let supervisor = Supervisor::init(config, || NullHooks)?;
    supervisor.run().await?;

    Ok(())
}
