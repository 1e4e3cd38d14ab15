//! The signing daemon front-end: parse arguments, set up logging and signal
//! handling, load the PKCS#11 module, and hand off to the event loop.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use efisign::alg::DigestAlgorithm;
use efisign::daemon::{self, Daemon, DaemonConfig};
use efisign::provider::pkcs11::Pkcs11Provider;

#[derive(Parser, Debug)]
#[command(name = "efisignd", version, about = "UEFI Secure Boot signing daemon")]
struct Args {
    /// PKCS#11 module to load
    #[arg(long, default_value = "/usr/lib64/pkcs11/libsofthsm2.so")]
    module: PathBuf,

    /// Socket to listen on
    #[arg(long, default_value = daemon::SOCKET_PATH)]
    socket: PathBuf,

    /// Pidfile location; --no-pidfile skips it
    #[arg(long, default_value = daemon::PIDFILE_PATH)]
    pidfile: PathBuf,
    #[arg(long)]
    no_pidfile: bool,

    /// Service user to drop to before accepting connections
    #[arg(long, default_value = daemon::SERVICE_USER)]
    user: String,

    /// Keep the invoking user; only sensible for development
    #[arg(long)]
    no_drop_privileges: bool,

    /// Digest algorithm for produced signatures
    #[arg(long, default_value = "sha256")]
    digest: String,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let digest = match DigestAlgorithm::from_name(&args.digest) {
        Ok(digest) => digest,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let config = DaemonConfig {
        socket_path: args.socket,
        pidfile: (!args.no_pidfile).then_some(args.pidfile),
        service_user: (!args.no_drop_privileges).then_some(args.user),
        default_digest: digest,
    };

    if let Err(err) = daemon::install_signal_handlers() {
        error!("could not install signal handlers: {err}");
        return ExitCode::FAILURE;
    }
    let provider = match Pkcs11Provider::new(&args.module) {
        Ok(provider) => provider,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match Daemon::new(config, Box::new(provider)).run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
