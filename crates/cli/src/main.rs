//! The `kgd` daemon: argument parsing, configuration bootstrap, signal
//! handling, and (optionally) detaching from the terminal.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use kgd::{Config, Server, SharedConfig};

#[derive(Parser)]
#[command(name = "kgd", about = "Kinoglaz streaming server", disable_version_flag = true)]
struct Args {
    /// Print the daemon name and version, then exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Configuration file (INI)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Detach and run in the background
    #[arg(short = 'd', long = "daemonize")]
    daemonize: bool,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn on_reload(_signal: libc::c_int) {
    RELOAD.store(true, Ordering::SeqCst);
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.version {
        println!("kgd/{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Some(config_path) = args.config else {
        eprintln!("kgd: a configuration file is required (-c <file>)");
        return ExitCode::FAILURE;
    };
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kgd: cannot load {}: {e}", config_path.display());
            return ExitCode::FAILURE;
        }
    };
    let shared = SharedConfig::new(config);

    if args.daemonize && let Err(e) = daemonize() {
        eprintln!("kgd: daemonize failed: {e}");
        return ExitCode::FAILURE;
    }

    install_signal_handlers();

    let mut server = Server::with_shared_config(shared.clone());
    if let Err(e) = server.start() {
        tracing::error!(error = %e, "bootstrap failed");
        return ExitCode::FAILURE;
    }

    while !SHUTDOWN.load(Ordering::SeqCst) {
        if RELOAD.swap(false, Ordering::SeqCst) {
            tracing::info!(path = %config_path.display(), "reloading configuration");
            if let Err(e) = shared.reload(&config_path) {
                tracing::warn!(error = %e, "reload failed, keeping current configuration");
            }
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    tracing::info!("termination signal received");
    server.stop();
    ExitCode::SUCCESS
}

fn install_signal_handlers() {
    fn install(signal: libc::c_int, handler: extern "C" fn(libc::c_int)) {
        unsafe {
            libc::signal(signal, handler as usize);
        }
    }
    install(libc::SIGTERM, on_terminate);
    install(libc::SIGINT, on_terminate);
    install(libc::SIGHUP, on_reload);
    // a dead RTP peer must not kill the daemon
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Classic fork/setsid detach. The working directory is kept so relative
/// media base directories still resolve.
fn daemonize() -> std::io::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() == -1 {
            return Err(std::io::Error::last_os_error());
        }
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::dup2(devnull, libc::STDOUT_FILENO);
            libc::dup2(devnull, libc::STDERR_FILENO);
            if devnull > 2 {
                libc::close(devnull);
            }
        }
    }
    Ok(())
}
