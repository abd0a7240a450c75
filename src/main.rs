//! localqa command-line front-end
//!
//! Reads one question per line and prints the model's answer. `q` or Ctrl-C quits.

use std::process::ExitCode;
use std::time::{Duration, Instant};

use localqa::app::App;
use localqa::chat::{run_session, spawn_stdin_reader, SessionEnd};

/// How long shutdown waits for a generation to notice its stop flag
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run());
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    code
}

async fn run() -> ExitCode {
    let started = Instant::now();
    let app = match App::bootstrap().await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!(
        "Model initialized in {:.2}s ({} on {})",
        started.elapsed().as_secs_f64(),
        app.model_name,
        app.device
    );

    // Keep the guard alive for the whole session
    let _watcher = match app.watch_config() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!("Configuration changes will not be picked up: {}", e);
            None
        }
    };

    let handler = app.chat_handler();
    println!("{}", handler.on_chat_start());

    let mut lines = spawn_stdin_reader();
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let end = match run_session(&handler, &mut lines, interrupt, &mut std::io::stdout()).await {
        Ok(end) => end,
        Err(e) => {
            tracing::error!("Failed to write output: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if end == SessionEnd::Interrupted {
        println!();
    }

    tracing::debug!("Session metrics:\n{}", app.metrics.render_prometheus());
    println!("Bye!");
    ExitCode::SUCCESS
}
