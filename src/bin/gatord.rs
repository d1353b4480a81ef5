//! `gatord` entrypoint (spec §6 "CLI surface").
//!
//! Grounded on `cognitod/src/main.rs`'s shape: parse args, init logging,
//! dispatch into the engine, map the result to a process exit code. The
//! teacher's single long-lived tokio runtime becomes a two-way fork here:
//! `--output` runs one capture session in this process directly (no host,
//! no fork — spec §6's local-capture mode), anything else hands off to the
//! `Supervisor` (spec §4.10), which accepts host connections and forks a
//! `Child` per session.

use std::sync::Arc;

use clap::Parser;

use gatord::annotate::AnnotateListener;
use gatord::apc::{uname_string, CaptureDirectory};
use gatord::child::Child;
use gatord::config::{session_from_cli, Cli, XmlCatalog};
use gatord::error::ExitCode;
use gatord::metrics::Metrics;
use gatord::sender::{create_data_file, Sender, Transport};
use gatord::supervisor::Supervisor;

fn main() {
    gatord::logging::init();

    let cli = Cli::parse();
    if let Err(e) = cli.validate() {
        eprintln!("gatord: {e}");
        std::process::exit(ExitCode::Exception as i32);
    }

    let exit_code = if cli.local_capture() {
        run_local_capture(&cli).unwrap_or_else(|e| {
            log::error!("local capture failed: {e}");
            ExitCode::Exception
        })
    } else {
        run_daemon(cli).unwrap_or_else(|e| {
            log::error!("supervisor exited with error: {e}");
            ExitCode::Exception
        })
    };

    std::process::exit(exit_code as i32);
}

/// `--output DIR`: runs one session in this process, writing framed output
/// straight to `DIR/data` instead of waiting for a host connection (spec §6
/// "local capture").
fn run_local_capture(cli: &Cli) -> anyhow::Result<ExitCode> {
    let output = cli
        .output
        .as_ref()
        .expect("local_capture() implies --output is set");

    log::info!("gatord starting local capture into {}", output.display());

    let apc_dir = CaptureDirectory::create(output)?;
    let session = session_from_cli(cli, &XmlCatalog::new()).map_err(|e| anyhow::anyhow!(e))?;
    apc_dir.write_captured_xml(&session, &uname_string())?;
    apc_dir.write_counters_xml(&session)?;

    let data_file = create_data_file(apc_dir.root())?;
    let sender = Arc::new(Sender::new(Transport::File(data_file)));
    let metrics = Arc::new(Metrics::new());
    let annotate_listener = Arc::new(AnnotateListener::bind(false)?);

    let child = Child::new(Arc::new(session), metrics, sender, annotate_listener, None)?;
    child.run()
}

/// No `--output`: becomes the long-lived Capture Process Supervisor,
/// listening for host connections and forking a `Child` per capture (spec
/// §4.10).
fn run_daemon(cli: Cli) -> anyhow::Result<ExitCode> {
    log::info!("gatord starting in daemon mode on port {:?}", cli.port);
    let mut supervisor = Supervisor::new(cli)?;
    supervisor.run()
}
