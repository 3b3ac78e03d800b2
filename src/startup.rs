//! Server startup
//!
//! Everything that can fail before the listening socket exists: device
//! selection, model validation, engine start and the segmentation tables.
//! A failure here drops whatever was acquired so far, including the GPU
//! lease.

use crate::bpe::Bpe;
use crate::config::ServerArgs;
use crate::device::{select_device, SelectedDevice};
use crate::error::Result;
use crate::rpc::RpcService;
use crate::translation::{load_models, IdentityEngine, ProcessEngine, TranslationAdapter, TranslationEngine};

/// A service ready to bind, plus the device it holds
pub struct PreparedServer {
    pub service: RpcService,
    pub device: SelectedDevice,
}

/// Build the service from command-line flags with `num_gpus` visible GPUs
pub fn prepare(args: &ServerArgs, num_gpus: usize) -> Result<PreparedServer> {
    let device = select_device(&args.device_config(), num_gpus)?;
    log::info!("Translating on {}", device.device());

    let engine: Box<dyn TranslationEngine> = if args.echo {
        log::warn!("Echo mode: no engine is started, inputs are returned as translations");
        Box::new(IdentityEngine)
    } else {
        let models = load_models(&args.model_config())?;
        Box::new(ProcessEngine::spawn(
            &args.engine_command,
            &models,
            device.device(),
            &args.decoding_config(),
        )?)
    };

    let bpe = match args.bpe_config() {
        Some(config) => {
            log::info!("Loading BPE codes from {}", config.codes.display());
            let bpe = Bpe::load(&config)?;
            log::info!("Loaded {} merge operations", bpe.merge_count());
            Some(bpe)
        }
        None => {
            log::info!("BPE segmentation disabled");
            None
        }
    };

    let adapter = TranslationAdapter::new(engine, bpe);
    let service = RpcService::new(args.service_config(), adapter)?;

    Ok(PreparedServer { service, device })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::error::Error;
    use crate::rpc::TranslateClient;
    use crate::translation::models::tests::write_model;
    use crate::translation::{EngineError, ModelError};
    use clap::Parser;
    use std::fs;
    use std::sync::atomic::Ordering;
    use std::thread;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> ServerArgs {
        let mut argv = vec!["nmt_rpc_server"];
        argv.extend_from_slice(args);
        ServerArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_no_gpu_fails_before_binding() {
        let args = parse(&["--echo", "--host", "127.0.0.1", "--port", "0"]);
        match prepare(&args, 0) {
            Err(Error::Device(DeviceError::NoGpus)) => {}
            Err(other) => panic!("Expected NoGpus, got {:?}", other),
            Ok(_) => panic!("Expected NoGpus, got a service"),
        }
    }

    #[test]
    fn test_model_failure_releases_gpu_lock() {
        let locks = TempDir::new().unwrap();
        let models = TempDir::new().unwrap();
        let lock_dir = locks.path().to_str().unwrap();
        let model_dir = models.path().join("missing").to_str().unwrap().to_string();

        let args = parse(&["-m", &model_dir, "--lock-dir", lock_dir, "--lock-timeout-secs", "0"]);
        match prepare(&args, 1) {
            Err(Error::Model(ModelError::MissingFile(_))) => {}
            Err(other) => panic!("Expected MissingFile, got {:?}", other),
            Ok(_) => panic!("Expected MissingFile, got a service"),
        }

        let leftover: Vec<_> = fs::read_dir(locks.path()).unwrap().collect();
        assert!(leftover.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_that_dies_fails_before_binding() {
        let tmp = TempDir::new().unwrap();
        let model_dir = tmp.path().join("model");
        write_model(&model_dir, "params.best", false);

        let args = parse(&[
            "-m",
            model_dir.to_str().unwrap(),
            "--use-cpu",
            "--engine-command",
            "false",
            "--host",
            "127.0.0.1",
            "--port",
            "0",
        ]);
        match prepare(&args, 0) {
            Err(Error::Engine(EngineError::Closed(_))) => {}
            Err(other) => panic!("Expected Closed, got {:?}", other),
            Ok(_) => panic!("Expected Closed, got a service"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_process_engine_server_round_trip() {
        let tmp = TempDir::new().unwrap();
        let model_dir = tmp.path().join("model");
        write_model(&model_dir, "params.best", false);
        let script = tmp.path().join("echo_engine.sh");
        fs::write(&script, "while IFS= read -r line; do printf '%s\\n' \"$line\"; done\n").unwrap();
        let command = format!("sh {}", script.display());

        let args = parse(&[
            "-m",
            model_dir.to_str().unwrap(),
            "--use-cpu",
            "--quiet",
            "--engine-command",
            &command,
            "--host",
            "127.0.0.1",
            "--port",
            "0",
        ]);
        let PreparedServer { mut service, .. } = prepare(&args, 0).unwrap();
        let addr = service.bind().unwrap();
        let stop = service.stop_handle();
        let server = thread::spawn(move || service.run());

        {
            let mut client = TranslateClient::connect(addr).unwrap();
            let sources: Vec<String> = vec!["eins".into(), "zwei".into()];
            assert_eq!(client.batch_translate(&sources).unwrap(), sources);
        }

        stop.store(false, Ordering::SeqCst);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_echo_server_with_bpe() {
        let dir = TempDir::new().unwrap();
        let codes = dir.path().join("codes.bpe");
        fs::write(&codes, "#version: 0.2\nl o\nlo w</w>\ne r</w>\n").unwrap();

        let args = parse(&[
            "--echo",
            "--use-cpu",
            "--quiet",
            "--host",
            "127.0.0.1",
            "--port",
            "0",
            "--bpe-codes",
            codes.to_str().unwrap(),
        ]);
        let PreparedServer { mut service, device } = prepare(&args, 0).unwrap();
        assert!(device.lease().is_none());

        let counter = service.request_counter();
        let addr = service.bind().unwrap();
        let stop = service.stop_handle();
        let server = thread::spawn(move || service.run());

        {
            let mut client = TranslateClient::connect(addr).unwrap();
            assert_eq!(client.translate("low lower").unwrap(), "low lower");
        }

        stop.store(false, Ordering::SeqCst);
        let stats = server.join().unwrap().unwrap();
        assert_eq!(stats.requests, 1);
        assert_eq!(counter.issued(), 1);
    }
}
