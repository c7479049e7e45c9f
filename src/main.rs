use ble_field_logger::app::{self, Options};
use ble_field_logger::logging;
use ble_field_logger::monitor::RealScanner;
use clap::Parser;
use std::io;
use std::panic::{self, PanicHookInfo};
use tracing::instrument::WithSubscriber;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Resolves on the first Ctrl+C.
async fn interrupted() {
    if let Err(why) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %why, "cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();

    let dispatch = match logging::dispatch(&options.log_file, options.verbose) {
        Ok(dispatch) => dispatch,
        Err(why) => {
            eprintln!("error: cannot open {}: {}", options.log_file.display(), why);
            std::process::exit(EXIT_ERROR);
        }
    };

    let command = options.command();
    let stdin = io::stdin();
    let result = app::run(
        options,
        &RealScanner,
        interrupted(),
        &mut stdin.lock(),
        &mut io::stdout(),
    )
    .with_subscriber(dispatch.clone())
    .await;

    match result {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            tracing::dispatcher::with_default(&dispatch, || {
                tracing::error!(?command, error = %why, "command failed");
            });
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
