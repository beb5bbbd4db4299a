//! fim - Run multiple isolated Foundry VTT instances on one host
//!
//! Every instance gets its own container, port, admin key and data directory,
//! while sharing one image and one shared data area.

use std::process::ExitCode;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use foundry_instance_manager::cli::{self, Cli};
use foundry_instance_manager::{ManagerError, APP_NAME, APP_VERSION};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.debug);
    debug!("{} v{} starting", APP_NAME, APP_VERSION);

    match cli::execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let managed = e.chain().find_map(|c| c.downcast_ref::<ManagerError>());
            match managed {
                Some(m) => {
                    eprintln!("Error ({}): {:#}", m.kind(), e);
                    ExitCode::from(m.kind().exit_code())
                }
                None => {
                    eprintln!("Error: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Initialize the logging system; logs go to stderr so stdout stays parseable
fn init_logging(debug: bool) {
    let default_filter = if debug {
        "foundry_instance_manager=debug,fim=debug"
    } else {
        "foundry_instance_manager=info,fim=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
