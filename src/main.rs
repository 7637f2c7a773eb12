use std::env;
use std::path::PathBuf;

use statbar::{App, Settings};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("Usage: statbar [SETTINGS_PATH]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  SETTINGS_PATH    Optional: settings file to load instead of the default");
    eprintln!("                   (<config dir>/statbar/settings.ini)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG         Log filter, e.g. statbar=debug");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  statbar                        # Monitor with the default settings file");
    eprintln!("  statbar ./statbar.ini          # Monitor with a specific settings file");
    eprintln!("  RUST_LOG=statbar=debug statbar # Also log the top processes");
}

fn settings_path(arg: Option<String>) -> Option<PathBuf> {
    arg.map(PathBuf::from).or_else(Settings::default_path)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let args: Vec<String> = env::args().collect();
    let path_arg = if args.len() > 1 {
        let arg = &args[1];
        if arg == "-h" || arg == "--help" {
            print_usage();
            std::process::exit(0);
        }
        Some(arg.clone())
    } else {
        None
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("statbar=info")),
        )
        .init();

    let settings = match settings_path(path_arg) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading settings");
            Settings::load(&path)?
        }
        None => Settings::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("statbar-worker")
        .build()?;

    runtime.block_on(async move {
        let mut app = App::new(settings);

        let shutdown = app.shutdown_token();
        ctrlc::set_handler(move || {
            tracing::info!("interrupt received, shutting down");
            shutdown.cancel();
        })?;

        app.run().await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
