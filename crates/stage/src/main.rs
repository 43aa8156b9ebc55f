//! One pipeline stage process.
//!
//! Stage 0 consumes token ids (and optional pixels), runs its block range
//! and forwards an activation packet. Middle stages receive, run and
//! forward. The last stage applies final norm + LM head and persists the
//! result.
//!
//! Exit codes: 0 success, 2 argument error, 3 missing requirement,
//! 4 no GPU, 5 internal forward error.

mod logging;

use std::collections::HashMap;
use std::process::ExitCode;

use candle_core::{Device, Tensor};
use clap::Parser;
use tracing::{error, info};

use pipelm_core::config::ModelConfig;
use pipelm_core::loader::{load_stage_weights, LoadOptions, SafetensorsWeightLoader};
use pipelm_core::model::{StageInput, StageOutput};
use pipelm_core::runtime::StageDriver;
use pipelm_core::sharding::{config_for_stage, make_plan_even_layers};
use pipelm_core::transport::{StageLink, StageListener};

#[derive(Parser)]
#[command(name = "pipelm-stage", about = "Pipeline-parallel inference stage")]
struct Cli {
    /// Path to the HF-style model config JSON.
    #[arg(long = "hf-config")]
    hf_config: String,

    /// Path to the safetensors weight archive for this stage.
    #[arg(long)]
    weights: Option<String>,

    /// Total number of pipeline stages.
    #[arg(long = "num-stages", default_value_t = 1)]
    num_stages: usize,

    /// Index of this stage within the pipeline.
    #[arg(long = "stage-idx", default_value_t = 0)]
    stage_idx: usize,

    /// GPU index.
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Override the planner: first block owned by this stage (inclusive).
    #[arg(long = "layer-begin")]
    layer_begin: Option<usize>,

    /// Override the planner: end of the block range (exclusive).
    #[arg(long = "layer-end")]
    layer_end: Option<usize>,

    /// Port to accept the previous stage on (required unless stage 0).
    #[arg(long)]
    listen: Option<u16>,

    /// Host of the next stage (required unless last stage).
    #[arg(long = "next-host")]
    next_host: Option<String>,

    /// Port of the next stage (required unless last stage).
    #[arg(long = "next-port")]
    next_port: Option<u16>,

    /// Safetensors file with an `input_ids` tensor (stage 0).
    #[arg(long = "input-ids")]
    input_ids: Option<String>,

    /// Safetensors file with an `images` pixel tensor (stage 0).
    #[arg(long)]
    images: Option<String>,

    /// Output path for logits (or hidden states) on the last stage.
    #[arg(long)]
    out: Option<String>,

    /// Downgrade loader mismatches to counted report entries.
    #[arg(long = "no-strict-load")]
    no_strict_load: bool,
}

struct Fatal {
    code: u8,
    message: String,
}

impl Fatal {
    fn missing(message: impl Into<String>) -> Self {
        Self {
            code: 3,
            message: message.into(),
        }
    }

    fn no_gpu(message: impl Into<String>) -> Self {
        Self {
            code: 4,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: 5,
            message: message.into(),
        }
    }
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            error!("{}", fatal.message);
            ExitCode::from(fatal.code)
        }
    }
}

fn run(cli: &Cli) -> Result<(), Fatal> {
    if cli.num_stages == 0 || cli.stage_idx >= cli.num_stages {
        return Err(Fatal::missing(format!(
            "stage-idx {} out of range for num-stages {}",
            cli.stage_idx, cli.num_stages
        )));
    }
    let is_first = cli.stage_idx == 0;
    let is_last = cli.stage_idx + 1 == cli.num_stages;

    if !is_first && cli.listen.is_none() {
        return Err(Fatal::missing("non-first stage requires --listen"));
    }
    if !is_last && (cli.next_host.is_none() || cli.next_port.is_none()) {
        return Err(Fatal::missing(
            "non-last stage requires --next-host and --next-port",
        ));
    }
    if is_last && cli.out.is_none() {
        return Err(Fatal::missing("last stage requires --out"));
    }

    let base_cfg = ModelConfig::from_json_file(&cli.hf_config)
        .map_err(|e| Fatal::missing(format!("hf-config: {e}")))?;

    let plan = make_plan_even_layers(&base_cfg, cli.num_stages, &[cli.device])
        .map_err(|e| Fatal::missing(format!("sharding: {e}")))?;
    let mut cfg = config_for_stage(&base_cfg, &plan.stages[cli.stage_idx]);
    if let Some(begin) = cli.layer_begin {
        cfg.layer_start = begin;
    }
    if let Some(end) = cli.layer_end {
        cfg.layer_end = end;
    }
    cfg.validate()
        .map_err(|e| Fatal::missing(format!("config: {e}")))?;

    info!(
        stage = cfg.stage_id,
        stages = cfg.stage_count,
        layer_start = cfg.layer_start,
        layer_end = cfg.layer_end,
        est_weight_bytes = plan.stages[cli.stage_idx].est_weight_bytes,
        est_kv_bytes_per_token = plan.stages[cli.stage_idx].est_kv_bytes_per_token,
        "starting stage"
    );

    let device = Device::new_cuda(cli.device)
        .map_err(|e| Fatal::no_gpu(format!("no CUDA device {}: {e}", cli.device)))?;

    let weights_path = cli
        .weights
        .as_ref()
        .ok_or_else(|| Fatal::missing("this stage owns parameters and requires --weights"))?;
    let archive = SafetensorsWeightLoader::open(weights_path)
        .map_err(|e| Fatal::missing(format!("weights: {e}")))?;
    let opts = LoadOptions {
        strict: !cli.no_strict_load,
        ..Default::default()
    };
    let (stage, report) = load_stage_weights(&cfg, &archive, &device, &opts)
        .map_err(|e| Fatal::missing(format!("load: {e}")))?;
    info!("weights: {}", report.summary());

    let mut driver = StageDriver::new(stage);

    let output = if is_first {
        let input_ids = cli
            .input_ids
            .as_ref()
            .map(|p| read_input_tensor(p, &["input_ids"], &device))
            .transpose()?;
        let images = cli
            .images
            .as_ref()
            .map(|p| read_input_tensor(p, &["images", "pixel_values"], &device))
            .transpose()?;
        if input_ids.is_none() && images.is_none() {
            return Err(Fatal::missing(
                "stage 0 requires --input-ids and/or --images",
            ));
        }
        let input = StageInput {
            input_ids,
            images,
            ..Default::default()
        };
        driver
            .run_local(&input)
            .map_err(|e| Fatal::internal(e.to_string()))?
    } else {
        let listener = StageListener::bind(cli.listen.unwrap())
            .map_err(|e| Fatal::internal(format!("listen: {e}")))?;
        let mut link = listener
            .accept()
            .map_err(|e| Fatal::internal(format!("accept: {e}")))?;
        let packet = link
            .recv_activation()
            .map_err(|e| Fatal::internal(format!("recv: {e}")))?;
        driver
            .run_from_activation(&packet, &device)
            .map_err(|e| Fatal::internal(e.to_string()))?
    };

    if !is_last {
        let mut link = StageLink::connect(
            cli.next_host.as_ref().unwrap(),
            cli.next_port.unwrap(),
        )
        .map_err(|e| Fatal::internal(format!("connect: {e}")))?;
        let packet = driver.to_activation(
            &output,
            cli.stage_idx as i32,
            (cli.stage_idx + 1) as i32,
            0,
            0,
        );
        link.send_activation(&packet)
            .map_err(|e| Fatal::internal(format!("send: {e}")))?;
        info!(next = cli.stage_idx + 1, "activation forwarded");
    } else {
        write_output(cli.out.as_ref().unwrap(), &output)?;
    }

    Ok(())
}

/// Read one tensor from a safetensors file, trying the given keys first and
/// falling back to a single-tensor archive.
fn read_input_tensor(path: &str, keys: &[&str], device: &Device) -> Result<Tensor, Fatal> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|e| Fatal::missing(format!("{path}: {e}")))?;
    let tensor = keys
        .iter()
        .find_map(|k| tensors.get(*k))
        .cloned()
        .or_else(|| {
            if tensors.len() == 1 {
                tensors.values().next().cloned()
            } else {
                None
            }
        })
        .ok_or_else(|| {
            Fatal::missing(format!("{path}: expected a tensor named one of {keys:?}"))
        })?;
    tensor
        .to_device(device)
        .map_err(|e| Fatal::internal(format!("{path}: {e}")))
}

/// Persist the last stage's result: logits when defined, else hidden_out.
fn write_output(path: &str, output: &StageOutput) -> Result<(), Fatal> {
    let (name, tensor) = match &output.logits {
        Some(logits) => ("logits", logits),
        None => ("hidden_out", &output.hidden_out),
    };
    let cpu = tensor
        .to_device(&Device::Cpu)
        .and_then(|t| t.contiguous())
        .map_err(|e| Fatal::internal(format!("out: {e}")))?;
    let mut map = HashMap::new();
    map.insert(name.to_string(), cpu);
    candle_core::safetensors::save(&map, path)
        .map_err(|e| Fatal::internal(format!("out {path}: {e}")))?;
    info!(path, tensor = name, "wrote output");
    Ok(())
}
