//! # mvnd client - entry point
//!
//! Parses CLI arguments, resolves daemon parameters from the environment,
//! connects to (or spawns) a daemon through a [`Connector`], and streams the
//! build's output to stdout until it finishes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mvnd_client::cli::Args;
use mvnd_client::connector::{BuildRequest, Connector};
use mvnd_client::daemon::DaemonParameters;
use mvnd_client::registry::FileRegistry;
use mvnd_client::spawner::ProcessSpawner;
use mvnd_client::Message;
use mvnd_client::logging::ColorizedFormatter;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("mvnd.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "mvnd.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    info!("starting mvnd client");

    let params = DaemonParameters::from_env()?;
    let registry_dir = args
        .registry_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("mvnd-registry"));

    let registry = Arc::new(FileRegistry::new(registry_dir)?);
    let spawner = Arc::new(ProcessSpawner {
        program: PathBuf::from(&args.daemon_program),
        args: Vec::new(),
        poll_timeout: params.connect_timeout,
    });

    let connector = Connector::new(registry, spawner, params).with_max_retries(args.max_retries);

    let working_dir = args
        .project_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
        .to_string_lossy()
        .into_owned();

    let request = BuildRequest {
        working_dir,
        args: args.build_args.clone(),
    };

    let result = connector.run(request, stream_message);

    match result {
        Ok(outcome) => {
            info!(exit_code = outcome.exit_code, "build finished");
            std::process::exit(outcome.exit_code);
        }
        Err(e) => {
            error!("build failed: {e}");
            Err(e)
        }
    }
}

/// Renders inbound protocol messages as the user-facing stdout stream,
/// mirroring what a real daemon client shows while a build runs.
fn stream_message(message: &Message) {
    match message {
        Message::LogLine { text } => println!("{text}"),
        Message::ProjectEvent { project, description } => println!("[{project}] {description}"),
        Message::Prompt { message } => println!("? {message}"),
        Message::BuildStarted { daemon_pid } => info!(daemon_pid, "build started"),
        Message::BuildFinished { exit_code } => info!(exit_code, "build finished"),
        Message::KeepAlive | Message::CancelBuild | Message::BuildRequest { .. } | Message::PromptResponse { .. } => {}
    }
}
