use clap::ValueEnum;
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use tracing::{info, warn};

use crate::errors::{Result, SegError};

/// How the execution device is picked at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DevicePolicy {
    /// Accelerator when one is usable, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    /// Accelerator or fail.
    Cuda,
}

/// The compute resource the model is bound to for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionDevice {
    Cpu,
    Cuda { device_id: i32 },
}

impl ExecutionDevice {
    /// Value for ONNX Runtime's `memory.enable_memory_arena_shrinkage` run
    /// option, naming every arena this device allocates from.
    pub fn arena_shrinkage_target(self) -> String {
        match self {
            Self::Cpu => "cpu:0".to_string(),
            Self::Cuda { device_id } => format!("cpu:0;gpu:{device_id}"),
        }
    }
}

impl std::fmt::Display for ExecutionDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

impl DevicePolicy {
    /// Resolve the policy given whether an accelerator is usable.
    pub fn resolve(self, device_id: i32, accelerator_available: bool) -> Result<ExecutionDevice> {
        match (self, accelerator_available) {
            (Self::Cpu, _) | (Self::Auto, false) => Ok(ExecutionDevice::Cpu),
            (Self::Auto, true) | (Self::Cuda, true) => Ok(ExecutionDevice::Cuda { device_id }),
            (Self::Cuda, false) => Err(SegError::model_load(
                "execution device acquisition",
                format!("CUDA device {device_id} requested but no CUDA execution provider is available"),
            )),
        }
    }

    /// Probe ONNX Runtime for an accelerator and resolve the policy.
    pub fn select(self, device_id: i32) -> Result<ExecutionDevice> {
        let available = match self {
            Self::Cpu => false,
            Self::Auto | Self::Cuda => probe_cuda(),
        };
        let device = self.resolve(device_id, available)?;
        info!(policy = ?self, %device, "selected execution device");
        Ok(device)
    }
}

fn probe_cuda() -> bool {
    match CUDAExecutionProvider::default().is_available() {
        Ok(available) => available,
        Err(e) => {
            warn!(error = %e, "could not query CUDA execution provider, falling back to cpu");
            false
        }
    }
}
