/// Wake-word listener binary
///
/// Runs the wake-word pipeline over a WAV file or raw 16-bit PCM on stdin and
/// logs every activation.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use wakeword_pipeline::{
    load_model, BackendConfig, DetectorConfig, Device, Listener, Params, Runner, RunnerConfig,
    RunnerError,
};

#[derive(Parser)]
#[command(name = "wakeword-listen")]
#[command(about = "Streaming wake-word detector", long_about = None)]
struct Cli {
    /// Model file
    #[arg(short, long, env = "WAKEWORD_MODEL_PATH")]
    model: PathBuf,

    /// Params JSON file (defaults are used when omitted)
    #[arg(short, long, env = "WAKEWORD_PARAMS_PATH")]
    params: Option<PathBuf>,

    /// Inference backend: onnx (ONNX Runtime) or candle (candle-onnx)
    #[arg(short, long, default_value = "onnx", env = "WAKEWORD_BACKEND")]
    backend: Backend,

    /// Execution device for the onnx backend: cpu, cuda or tensorrt
    #[arg(long, default_value = "cpu", value_parser = parse_device)]
    device: Device,

    /// Sensitivity (0.0 - 1.0)
    #[arg(short, long, default_value_t = 0.5, env = "WAKEWORD_SENSITIVITY")]
    sensitivity: f32,

    /// Confident chunks needed before an activation
    #[arg(long, default_value_t = 3)]
    trigger_level: u32,

    /// Bytes per audio chunk
    #[arg(long, default_value_t = 2048)]
    chunk_size: usize,

    /// WAV file, or `-` for raw little-endian PCM on stdin
    #[arg(default_value = "-")]
    input: String,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Backend {
    Onnx,
    Candle,
}

impl Cli {
    fn backend_config(&self) -> BackendConfig {
        match self.backend {
            Backend::Onnx => BackendConfig::Onnx {
                path: self.model.clone(),
                device: self.device,
            },
            Backend::Candle => {
                if self.device != Device::Cpu {
                    warn!("candle backend runs on CPU; ignoring --device {}", self.device);
                }
                BackendConfig::Candle {
                    path: self.model.clone(),
                }
            }
        }
    }
}

fn parse_device(value: &str) -> Result<Device, String> {
    match value.to_ascii_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::Cuda),
        "tensorrt" => Ok(Device::TensorRt),
        other => Err(format!("unknown device '{other}' (expected cpu, cuda or tensorrt)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakeword_pipeline=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let params = match &cli.params {
        Some(path) => Params::load(path)
            .with_context(|| format!("Failed to load params from {}", path.display()))?,
        None => Params::default(),
    };

    let model = load_model(&cli.backend_config()).context("Failed to load model")?;

    let listener = Listener::new(model, params.clone())?;

    let config = RunnerConfig {
        chunk_size: cli.chunk_size,
        detector: DetectorConfig {
            sensitivity: cli.sensitivity,
            trigger_level: cli.trigger_level,
        },
    };

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
    let runner = Runner::builder(listener)
        .config(config)
        .on_activation(|event| {
            info!(
                "Wake-word detected! confidence={:.2}, timestamp={}",
                event.confidence, event.timestamp
            );
        })
        .on_exit(move |err| {
            let _ = exit_tx.send(err);
        })
        .spawn()?;

    info!("Listening on {}", if cli.input == "-" { "stdin" } else { cli.input.as_str() });

    let fed = tokio::select! {
        result = feed(&runner, &cli.input, &params) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    if let Err(e) = &fed {
        if !matches!(e.downcast_ref::<RunnerError>(), Some(RunnerError::Faulted)) {
            error!("Audio input failed: {}", e);
        }
    }

    if let Err(e) = runner.stop().await {
        warn!("Error stopping runner: {}", e);
    }

    let stats = runner.stats().await;
    info!(
        "Processed {} batches, {} activations",
        stats.batches_processed, stats.activations
    );

    runner.close().await?;

    while let Ok(exit) = exit_rx.try_recv() {
        if let Some(e) = exit {
            return Err(e).context("Pipeline stopped with an error");
        }
    }

    fed
}

/// Push the selected input through the runner
async fn feed(runner: &Runner, input: &str, params: &Params) -> Result<()> {
    if input == "-" {
        let bytes = runner.read_from(tokio::io::stdin()).await?;
        info!("Read {} bytes from stdin", bytes);
        return Ok(());
    }

    let mut reader = hound::WavReader::open(input)
        .with_context(|| format!("Failed to open {}", input))?;
    let spec = reader.spec();

    if spec.channels != 1 || spec.bits_per_sample != 16 {
        bail!(
            "{}: expected mono 16-bit PCM, got {} channel(s) at {} bits",
            input,
            spec.channels,
            spec.bits_per_sample
        );
    }
    if spec.sample_rate as usize != params.sample_rate {
        bail!(
            "{}: sample rate {} Hz does not match params ({} Hz)",
            input,
            spec.sample_rate,
            params.sample_rate
        );
    }

    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<i16>, _>>()
        .with_context(|| format!("Failed to decode {}", input))?;

    for chunk in samples.chunks((runner.chunk_size() / 2).max(1)) {
        runner.queue(chunk.to_vec()).await?;
    }

    info!("Queued {} samples from {}", samples.len(), input);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_selection() {
        let cli = Cli::try_parse_from(["wakeword-listen", "-m", "hey.onnx", "--backend", "candle"]).unwrap();
        assert_eq!(
            cli.backend_config(),
            BackendConfig::Candle {
                path: PathBuf::from("hey.onnx")
            }
        );

        let cli = Cli::try_parse_from(["wakeword-listen", "-m", "hey.onnx", "--device", "cuda"]).unwrap();
        assert_eq!(
            cli.backend_config(),
            BackendConfig::Onnx {
                path: PathBuf::from("hey.onnx"),
                device: Device::Cuda,
            }
        );
    }
}
