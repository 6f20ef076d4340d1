//! Platform identity and hardware detection.
//!
//! Platform identifiers look like `linux-x64` or `darwin-arm64`, which is the
//! vocabulary `compat.platforms` is written in.

use std::path::Path;

use nvml_wrapper::Nvml;
use serde::Serialize;
use sysinfo::{Disks, System};
use tracing::{debug, info, warn};

use crate::model_spec::Accelerator;

const GB: u64 = 1024 * 1024 * 1024;

/// Identifier of the platform this binary was built for.
pub fn current_platform() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    };
    format!("{}-{}", os, arch)
}

/// Resources available on this machine, in whole GB.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Resources {
    pub total_ram_gb: u64,
    pub available_disk_gb: u64,
    /// `None` when no GPU could be queried.
    pub vram_gb: Option<u64>,
    pub cpu_cores: usize,
}

/// What the loader filters specs against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Environment {
    pub platform: String,
    pub accelerators: Vec<Accelerator>,
    pub resources: Resources,
}

impl Environment {
    /// Probe the running machine.
    ///
    /// Touches NVML and the filesystem; call once at startup.
    pub fn detect() -> Self {
        let (accelerators, vram_gb) = detect_accelerators();
        let resources = Resources {
            total_ram_gb: total_ram_gb(),
            available_disk_gb: available_disk_gb(),
            vram_gb,
            cpu_cores: num_cpus::get(),
        };
        let env = Self {
            platform: current_platform(),
            accelerators,
            resources,
        };
        info!(
            "Detected environment: platform={}, accelerators={:?}, ram={}GB, disk={}GB, vram={:?}GB",
            env.platform,
            env.accelerators,
            env.resources.total_ram_gb,
            env.resources.available_disk_gb,
            env.resources.vram_gb
        );
        env
    }

    /// A fixed environment, for overrides and tests.
    pub fn fixed(platform: impl Into<String>, accelerators: Vec<Accelerator>) -> Self {
        Self {
            platform: platform.into(),
            accelerators,
            resources: Resources::default(),
        }
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn has_accelerator(&self, accelerator: Accelerator) -> bool {
        self.accelerators.contains(&accelerator)
    }
}

fn detect_accelerators() -> (Vec<Accelerator>, Option<u64>) {
    let mut found = Vec::new();
    let mut vram_gb = None;

    match Nvml::init() {
        Ok(nvml) => {
            if let Ok(count) = nvml.device_count() {
                if count > 0 {
                    found.push(Accelerator::Cuda);
                    if let Ok(device) = nvml.device_by_index(0) {
                        if let Ok(memory) = device.memory_info() {
                            vram_gb = Some(memory.total / GB);
                        }
                    }
                }
            }
        }
        Err(e) => debug!("NVML unavailable, skipping CUDA detection: {}", e),
    }

    if cfg!(target_os = "macos") {
        found.push(Accelerator::Metal);
    }

    // AMD Kernel Fusion Driver node
    if Path::new("/dev/kfd").exists() {
        found.push(Accelerator::Rocm);
    }

    if Path::new("/dev/dri/renderD128").exists() {
        found.push(Accelerator::Vulkan);
    }

    found.push(Accelerator::Cpu);
    (found, vram_gb)
}

fn total_ram_gb() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory() / GB
}

fn available_disk_gb() -> u64 {
    let cwd = std::env::current_dir().unwrap_or_default();
    let disks = Disks::new_with_refreshed_list();

    // Pick the disk with the longest mount point that contains the working dir.
    let best = disks
        .list()
        .iter()
        .filter(|d| cwd.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    match best {
        Some(disk) => disk.available_space() / GB,
        None => {
            warn!("Could not determine free disk space for {}", cwd.display());
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform_shape() {
        let platform = current_platform();
        let (os, arch) = platform.split_once('-').expect("os-arch");
        assert!(!os.is_empty());
        assert!(!arch.is_empty());
        assert_ne!(os, "macos");
    }

    #[test]
    fn test_fixed_environment() {
        let env = Environment::fixed("linux-x64", vec![Accelerator::Cpu, Accelerator::Cuda]);
        assert!(env.has_accelerator(Accelerator::Cuda));
        assert!(!env.has_accelerator(Accelerator::Metal));
        assert_eq!(env.resources.vram_gb, None);
    }

    #[test]
    fn test_detect_always_reports_cpu() {
        let env = Environment::detect();
        assert!(env.has_accelerator(Accelerator::Cpu));
        assert_eq!(env.platform, current_platform());
        assert!(env.resources.cpu_cores > 0);
    }
}
