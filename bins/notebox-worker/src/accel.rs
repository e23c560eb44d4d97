/// Acceleration Engine Selector
///
/// Executions that set `enable_physics` get a physics engine injected into
/// their namespace. Which engine is decided here, once per execution, by a
/// fixed fallback chain:
///
/// 1. GPU backend: enabled by config AND a device node is visible
/// 2. CPU backend: enabled by config
/// 3. Software backend: always available
///
/// Selection never fails. Missing hardware degrades to software; it never
/// aborts the execution.

use crate::harness::HARNESS_VERSION;
use notebox_common::types::{Complexity, PhysicsRequirements};
use notebox_common::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Gpu,
    Cpu,
    Software,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Gpu => "gpu",
            BackendKind::Cpu => "cpu",
            BackendKind::Software => "software",
        }
    }
}

/// Inputs to simulation sizing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationParams {
    pub complexity: Complexity,
    pub memory_hint_mb: Option<u64>,
}

impl From<&PhysicsRequirements> for SimulationParams {
    fn from(requirements: &PhysicsRequirements) -> Self {
        Self {
            complexity: requirements.complexity,
            memory_hint_mb: requirements.memory_hint_mb,
        }
    }
}

/// What `create_simulation` hands to user code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationDescriptor {
    pub backend: BackendKind,
    pub device: String,
    pub precision: String,
    pub substeps: u32,
    pub max_bodies: u64,
}

/// Capability surface every backend exposes to injected code
pub trait PhysicsEngine {
    fn kind(&self) -> BackendKind;

    fn initialize_context(&self) -> bool;

    fn create_simulation(&self, params: &SimulationParams) -> SimulationDescriptor;
}

/// Closed set of backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhysicsBackend {
    Gpu { device: PathBuf },
    Cpu { threads: usize },
    Software,
}

impl PhysicsBackend {
    fn body_multiplier(&self) -> u64 {
        match self {
            PhysicsBackend::Gpu { .. } => 20,
            PhysicsBackend::Cpu { .. } => 4,
            PhysicsBackend::Software => 1,
        }
    }
}

impl PhysicsEngine for PhysicsBackend {
    fn kind(&self) -> BackendKind {
        match self {
            PhysicsBackend::Gpu { .. } => BackendKind::Gpu,
            PhysicsBackend::Cpu { .. } => BackendKind::Cpu,
            PhysicsBackend::Software => BackendKind::Software,
        }
    }

    fn initialize_context(&self) -> bool {
        match self {
            // device may vanish between detection and init (driver reload, hot unplug)
            PhysicsBackend::Gpu { device } => device.exists(),
            PhysicsBackend::Cpu { threads } => *threads > 0,
            PhysicsBackend::Software => true,
        }
    }

    fn create_simulation(&self, params: &SimulationParams) -> SimulationDescriptor {
        let (base_bodies, substeps) = match params.complexity {
            Complexity::Low => (500, 1),
            Complexity::Medium => (5_000, 2),
            Complexity::High => (50_000, 4),
        };

        let mut max_bodies = base_bodies * self.body_multiplier();
        // ~1 KiB of state per body
        if let Some(hint) = params.memory_hint_mb {
            max_bodies = max_bodies.min(hint.saturating_mul(1024)).max(1);
        }

        let (device, precision) = match self {
            PhysicsBackend::Gpu { device } => (device.display().to_string(), "f32"),
            PhysicsBackend::Cpu { threads } => (format!("cpu:{}", threads), "f64"),
            PhysicsBackend::Software => ("software".to_string(), "f64"),
        };

        SimulationDescriptor {
            backend: self.kind(),
            device,
            precision: precision.to_string(),
            substeps,
            max_bodies,
        }
    }
}

/// Capability object serialized into the sandbox
///
/// `simulation` is what a bare `create_simulation()` returns. `profiles` holds
/// the unhinted descriptor per complexity so the harness can resize when user
/// code passes its own params; the memory hint cap is applied there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicsInjection {
    pub version: u32,
    pub backend: BackendKind,
    pub context_ready: bool,
    pub simulation: SimulationDescriptor,
    pub complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_hint_mb: Option<u64>,
    pub profiles: BTreeMap<String, SimulationDescriptor>,
}

impl PhysicsInjection {
    pub fn needs_gpu(&self) -> bool {
        self.backend == BackendKind::Gpu
    }
}

/// Outcome of walking the chain
#[derive(Debug, Clone)]
pub struct Selection {
    pub backend: PhysicsBackend,
    pub context_ready: bool,
    pub params: SimulationParams,
    pub simulation: SimulationDescriptor,
    /// Backends tried first and why they were passed over
    pub skipped: Vec<(BackendKind, &'static str)>,
}

impl Selection {
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn injection(&self) -> PhysicsInjection {
        PhysicsInjection {
            version: HARNESS_VERSION,
            backend: self.kind(),
            context_ready: self.context_ready,
            simulation: self.simulation.clone(),
            complexity: self.params.complexity,
            memory_hint_mb: self.params.memory_hint_mb,
            profiles: Complexity::ALL
                .iter()
                .map(|&complexity| {
                    let params = SimulationParams {
                        complexity,
                        memory_hint_mb: None,
                    };
                    (
                        complexity.as_str().to_string(),
                        self.backend.create_simulation(&params),
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSelector {
    gpu_enabled: bool,
    cpu_enabled: bool,
    gpu_devices: Vec<PathBuf>,
    cpu_threads: usize,
}

impl EngineSelector {
    /// Preference order; the last link always succeeds
    pub const CHAIN: [BackendKind; 3] = [BackendKind::Gpu, BackendKind::Cpu, BackendKind::Software];

    pub fn new(gpu_enabled: bool, cpu_enabled: bool, gpu_devices: Vec<PathBuf>) -> Self {
        let cpu_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            gpu_enabled,
            cpu_enabled,
            gpu_devices,
            cpu_threads,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.physics_gpu_enabled,
            config.physics_cpu_enabled,
            config.physics_gpu_devices.clone(),
        )
    }

    fn detect(&self, kind: BackendKind) -> Result<PhysicsBackend, &'static str> {
        match kind {
            BackendKind::Gpu => {
                if !self.gpu_enabled {
                    return Err("disabled");
                }
                self.gpu_devices
                    .iter()
                    .find(|device| device.exists())
                    .map(|device| PhysicsBackend::Gpu {
                        device: device.clone(),
                    })
                    .ok_or("no visible device")
            }
            BackendKind::Cpu => {
                if self.cpu_enabled {
                    Ok(PhysicsBackend::Cpu {
                        threads: self.cpu_threads,
                    })
                } else {
                    Err("disabled")
                }
            }
            BackendKind::Software => Ok(PhysicsBackend::Software),
        }
    }

    pub fn select(&self, requirements: Option<&PhysicsRequirements>) -> Selection {
        let requirements = requirements.cloned().unwrap_or_default();
        let params = SimulationParams::from(&requirements);
        let mut skipped = Vec::new();

        for kind in Self::CHAIN {
            let backend = match self.detect(kind) {
                Ok(backend) => backend,
                Err(reason) => {
                    skipped.push((kind, reason));
                    continue;
                }
            };
            if !backend.initialize_context() {
                skipped.push((kind, "context initialization failed"));
                continue;
            }
            return self.finish(backend, &params, &requirements, skipped);
        }

        // unreachable in practice: software never fails detection or initialization
        self.finish(PhysicsBackend::Software, &params, &requirements, skipped)
    }

    fn finish(
        &self,
        backend: PhysicsBackend,
        params: &SimulationParams,
        requirements: &PhysicsRequirements,
        skipped: Vec<(BackendKind, &'static str)>,
    ) -> Selection {
        let simulation = backend.create_simulation(params);

        if requirements.needs_gpu && backend.kind() != BackendKind::Gpu {
            warn!(
                backend = backend.kind().as_str(),
                ?skipped,
                "GPU requested but unavailable, degrading"
            );
        } else {
            info!(
                backend = backend.kind().as_str(),
                device = %simulation.device,
                max_bodies = simulation.max_bodies,
                ?skipped,
                "Physics backend selected"
            );
        }

        Selection {
            context_ready: true,
            backend,
            params: *params,
            simulation,
            skipped,
        }
    }
}
