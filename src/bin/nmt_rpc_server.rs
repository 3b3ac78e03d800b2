//! Translate RPC server
//!
//! Serves `translate` and `batch_translate` over Thrift binary RPC on top
//! of an external NMT engine.
//!
//! Usage:
//!   nmt_rpc_server --models MODEL_DIR [OPTIONS]
//!   nmt_rpc_server --echo --use-cpu --bpe-codes codes.bpe
//!
//! Run with --help for the full flag list.

use std::sync::atomic::Ordering;

use clap::Parser;

use nmt_rpc::config::ServerArgs;
use nmt_rpc::device::get_num_gpus;
use nmt_rpc::startup::{self, PreparedServer};

fn run(args: ServerArgs) -> nmt_rpc::Result<()> {
    let num_gpus = if args.use_cpu { 0 } else { get_num_gpus() };
    let PreparedServer { mut service, device } = startup::prepare(&args, num_gpus)?;

    let stop_handle = service.stop_handle();
    ctrlc::set_handler(move || {
        log::info!("Shutting down...");
        stop_handle.store(false, Ordering::SeqCst);
    })?;

    let addr = service.bind()?;
    log::info!("Listening on {} ({})", addr, device.device());

    let stats = service.run()?;
    log::info!(
        "Served {} request(s), {} sentence(s), {} fault(s)",
        stats.requests,
        stats.sentences,
        stats.faults
    );

    // Lease is released here, after the engine has shut down
    drop(device);
    Ok(())
}

fn main() {
    let args = ServerArgs::parse();

    let level = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(args) {
        eprintln!("Service error: {}", e);
        std::process::exit(1);
    }
}
