//! Translate RPC test client
//!
//! Sends sentences to a running server through a small connection pool and
//! prints the translations with the subword markers removed.
//!
//! Usage:
//!   nmt_rpc_client [OPTIONS] [SENTENCE]...

use std::time::Instant;

use clap::Parser;

use nmt_rpc::bpe::DEFAULT_SEPARATOR;
use nmt_rpc::config::ClientArgs;
use nmt_rpc::rpc::ClientPool;
use nmt_rpc::translation::strip_bpe_markers;

const SAMPLE_SENTENCES: [&str; 2] = [
    "Die Bundesregierung will die Energiewende beschleunigen .",
    "Am Montag beginnen in Berlin die Verhandlungen .",
];

fn run(args: ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let addr = args.server_addr()?;
    let pool = ClientPool::new(addr, args.max_streams);

    let sentences: Vec<String> = if args.sentences.is_empty() {
        SAMPLE_SENTENCES.iter().map(|s| s.to_string()).collect()
    } else {
        args.sentences.clone()
    };

    log::info!("Sending {} sentence(s) x {} to {}", sentences.len(), args.repeat, addr);
    let marker = format!("{} ", DEFAULT_SEPARATOR);
    let start = Instant::now();
    let mut calls = 0usize;

    for round in 0..args.repeat {
        let mut client = pool.get()?;
        let translations = if args.batch {
            calls += 1;
            client.batch_translate(&sentences)?
        } else {
            let mut out = Vec::with_capacity(sentences.len());
            for sentence in &sentences {
                calls += 1;
                out.push(client.translate(sentence)?);
            }
            out
        };

        for translation in translations {
            // Servers without segmentation return markers untouched
            println!("{}\t{}", round, strip_bpe_markers(&translation, &marker));
        }
    }

    let elapsed = start.elapsed();
    log::info!(
        "{} call(s) in {:.2}ms ({:.2}ms/call)",
        calls,
        elapsed.as_secs_f64() * 1000.0,
        elapsed.as_secs_f64() * 1000.0 / calls.max(1) as f64
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(ClientArgs::parse()) {
        eprintln!("Client error: {}", e);
        std::process::exit(1);
    }
}
