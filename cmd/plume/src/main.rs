//! plume server
//!
//! Loads `plume.toml`, starts the plugins that have a block in it, and runs
//! until SIGINT or SIGTERM.
//!
//! Usage:
//!     cargo build --release -p plume
//!     ./target/release/plume -c plume.toml [-t threads] [--check]
//!
//! Test with:
//!     echo hello | nc localhost 9999
//!     curl -v http://localhost:8080/

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use plume_core::{log, Config, Plugin, Server};
use plume_echo::EchoPlugin;
use plume_http::HttpPlugin;

#[derive(Parser)]
#[command(name = "plume")]
#[command(about = "Multi-threaded pluggable epoll server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "plume.toml")]
    config: PathBuf,

    /// Worker threads, overrides `work_thread_num`
    #[arg(short, long)]
    threads: Option<usize>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

// ── Signals ──

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: std::ffi::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(sig, &action) }?;
    }
    Ok(())
}

// ── Main ──

/// Plugins that own a block in the config, in a fixed order.
fn plugins_for(config: &Config) -> Vec<Box<dyn Plugin>> {
    let has = |name: &str| config.blocks.iter().any(|b| b.name == name);
    let mut plugins: Vec<Box<dyn Plugin>> = Vec::new();
    if has(plume_echo::NAME) {
        plugins.push(Box::new(EchoPlugin::new()));
    }
    if has(plume_http::plugin::NAME) {
        plugins.push(Box::new(HttpPlugin::new()));
    }
    plugins
}

fn run(args: Args) -> plume_core::Result<()> {
    let mut config = Config::load(&args.config)?.from_env();
    if let Some(n) = args.threads {
        config = config.work_threads(n);
    }
    config.validate().map_err(plume_core::Error::Invalid)?;

    let plugins = plugins_for(&config);
    let server = Server::new(config, plugins);
    if args.check {
        server?;
        println!("{}: ok", args.config.display());
        return Ok(());
    }
    let mut server = server?;

    let fresh = log::init(&server.context().config().log())?;
    if !fresh {
        eprintln!("plume: a log subscriber was already installed");
    }

    install_signal_handlers()?;
    server.start()?;
    tracing::info!(config = %args.config.display(), "plume running");

    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("signal received, shutting down");
    server.shutdown();
    server.join();
    Ok(())
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("plume: {e}");
            ExitCode::FAILURE
        }
    }
}
