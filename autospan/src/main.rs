//! # autospan - Main Entry Point
//!
//! Wires the pipeline together: the process finder feeds the lifecycle
//! manager, whose tracers push spans into the shared queue drained by the
//! export stage. Ctrl+C cancels discovery and every tracer, after which the
//! export stage drains what is left and exits.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::future::Future;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use autospan::cli::Args;
use autospan::clock::SystemClock;
use autospan::discovery::{LifecycleManager, ManagerConfig, ProcScanner, ProcessFinder};
use autospan::export::{ExportStage, SharedSink};
use autospan::preflight::run_preflight_checks;
use autospan::queue::span_queue;
use autospan::tracer::EbpfFactory;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// Discovered processes waiting for the manager
const DISCOVERY_BACKLOG: usize = 64;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Where finished spans are written
fn open_sink(args: &Args) -> Result<SharedSink> {
    let writer: Box<dyn Write + Send> = match args.spans_out {
        Some(ref path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create span output file {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(std::io::stdout()),
    };
    Ok(Arc::new(parking_lot::Mutex::new(writer)))
}

/// Cancel once `interrupt` fires; a signal handler that cannot be
/// installed leaves the run going
async fn cancel_on_interrupt(
    interrupt: impl Future<Output = std::io::Result<()>>,
    cancel: CancellationToken,
) {
    match interrupt.await {
        Ok(()) => {
            info!("Interrupted, shutting down");
            cancel.cancel();
        }
        Err(e) => warn!("⚠️  Cannot listen for Ctrl+C: {e}"),
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let criteria = args.criteria()?;
    run_preflight_checks(&args.bpf_object, &args.proc_root)?;

    if !quiet {
        eprintln!("autospan v{}", env!("CARGO_PKG_VERSION"));
        if let Some(ref exec) = args.exec {
            eprintln!("exec: {exec}");
        }
        if !criteria.ports.is_empty() {
            eprintln!("ports: {}", criteria.ports);
        }
        if let Some(ref path) = args.spans_out {
            eprintln!("spans: {}", path.display());
        }
    }

    let started = Instant::now();
    let clock = Arc::new(SystemClock::new());

    // Consumer side: one reader for the whole queue
    let (queue_tx, queue_rx) = span_queue(args.queue_capacity, args.queue_wait());
    let stage = Arc::new(ExportStage::new(
        open_sink(&args)?,
        args.reporter_cache_size,
        clock.clone(),
        args.metrics_ttl(),
    ));
    let consumer = tokio::spawn({
        let stage = Arc::clone(&stage);
        let every = args.collect_interval();
        async move { stage.run(queue_rx, every).await }
    });

    // Ctrl+C cancels discovery and every tracer
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(tokio::signal::ctrl_c(), cancel.clone()));

    let (found_tx, found_rx) = mpsc::channel(DISCOVERY_BACKLOG);
    let finder = ProcessFinder::new(
        ProcScanner::new(&args.proc_root),
        criteria,
        args.service_namespace.clone(),
    );
    let discovery = tokio::spawn({
        let cancel = cancel.clone();
        let every = args.discovery_interval();
        async move {
            // Tracers already running keep going without discovery
            if let Err(e) = finder.run(cancel, found_tx, every).await {
                warn!("⚠️  Discovery stopped: {e}");
            }
        }
    });

    let mut manager = LifecycleManager::new(
        EbpfFactory::new(&args.bpf_object, &args.proc_root),
        clock,
        ManagerConfig {
            correlation_ttl: args.correlation_ttl(),
            shutdown_timeout: args.shutdown_timeout(),
        },
        queue_tx,
    );
    let managed = manager.run(&cancel, found_rx).await;

    // Stop discovery whatever the reason the manager returned
    cancel.cancel();
    if let Err(e) = discovery.await {
        warn!("⚠️  Discovery task failed: {e}");
    }

    // Dropping the manager releases the last queue sender
    drop(manager);
    let exported = consumer.await.context("Export stage failed")?;

    let managed = managed?;
    if !quiet {
        eprintln!(
            "\nstopped: {:.1}s, {} tracers ({} failed to attach, {} lost), {} spans ({} written, {} unreported, {} write errors)",
            started.elapsed().as_secs_f64(),
            managed.started,
            managed.attach_failed,
            managed.lost,
            exported.spans,
            exported.written,
            exported.unreported,
            exported.write_errors,
        );
    }

    Ok(())
}
