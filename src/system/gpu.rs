//! GPU detection
//!
//! Detects an available accelerator so inference can offload layers to it.

use std::process::Command;

use crate::types::{Device, DevicePreference};

/// GPU information
#[derive(Debug, Clone, Default)]
pub struct GpuInfo {
    pub name: String,
    pub vram_total_mb: u64,
    pub is_available: bool,
}

impl GpuInfo {
    fn not_detected() -> Self {
        Self {
            name: "GPU not detected".to_string(),
            vram_total_mb: 0,
            is_available: false,
        }
    }
}

/// Pick the execution device for a preference
///
/// `Auto` and `Gpu` use a detected accelerator and fall back to CPU.
pub fn select_device(preference: DevicePreference) -> Device {
    select_device_with(preference, detect_gpu)
}

fn select_device_with(preference: DevicePreference, detect: impl FnOnce() -> GpuInfo) -> Device {
    if preference == DevicePreference::Cpu {
        tracing::info!("CPU inference forced by configuration");
        return Device::Cpu;
    }

    let gpu = detect();
    if gpu.is_available {
        tracing::info!("Using accelerator: {} ({} MB)", gpu.name, gpu.vram_total_mb);
        return Device::Accelerator { name: gpu.name };
    }

    if preference == DevicePreference::Gpu {
        tracing::warn!("GPU requested but none detected, falling back to CPU");
    } else {
        tracing::info!("No accelerator detected, using CPU");
    }
    Device::Cpu
}

/// Detect available GPU (best effort)
pub fn detect_gpu() -> GpuInfo {
    #[cfg(target_os = "macos")]
    {
        if let Some(info) = detect_gpu_system_profiler() {
            return info;
        }
    }

    #[cfg(any(target_os = "windows", target_os = "linux"))]
    {
        if let Some(info) = detect_gpu_nvidia_smi() {
            return info;
        }
    }

    GpuInfo::not_detected()
}

/// Run a command and return its stdout when it succeeds
fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Detect GPU using system_profiler SPDisplaysDataType
#[cfg(target_os = "macos")]
fn detect_gpu_system_profiler() -> Option<GpuInfo> {
    let stdout = command_stdout("system_profiler", &["SPDisplaysDataType"])?;
    parse_system_profiler(&stdout)
}

// Apple Silicon has unified memory and reports no VRAM line
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_system_profiler(stdout: &str) -> Option<GpuInfo> {
    let mut gpu_name: Option<String> = None;
    let mut vram_mb: Option<u64> = None;

    for line in stdout.lines() {
        let trimmed = line.trim();

        // "Chipset Model: Apple M2 Pro"
        if let Some(name) = trimmed.strip_prefix("Chipset Model:") {
            let name = name.trim();
            if !name.is_empty() {
                gpu_name = Some(name.to_string());
            }
        }

        // "VRAM (Total): 16 GB"
        if trimmed.starts_with("VRAM") {
            let after_colon = trimmed.split(':').nth(1).unwrap_or("").trim();
            let parts: Vec<&str> = after_colon.split_whitespace().collect();
            if parts.len() >= 2 {
                if let Ok(val) = parts[0].parse::<u64>() {
                    vram_mb = Some(match parts[1].to_uppercase().as_str() {
                        "GB" => val * 1024,
                        _ => val,
                    });
                }
            }
        }
    }

    let name = gpu_name?;
    Some(GpuInfo {
        name: format!("{} (Metal)", name),
        vram_total_mb: vram_mb.unwrap_or(0),
        is_available: true,
    })
}

#[cfg(any(target_os = "windows", target_os = "linux"))]
fn detect_gpu_nvidia_smi() -> Option<GpuInfo> {
    let stdout = command_stdout(
        "nvidia-smi",
        &["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"],
    )?;
    parse_nvidia_smi(&stdout)
}

#[cfg_attr(not(any(target_os = "windows", target_os = "linux")), allow(dead_code))]
fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() < 2 {
        return None;
    }

    Some(GpuInfo {
        name: format!("{} (CUDA)", parts[0]),
        vram_total_mb: parts[1].parse::<u64>().ok()?,
        is_available: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_preference_skips_detection() {
        let device = select_device_with(DevicePreference::Cpu, || {
            panic!("detection must not run when CPU is forced")
        });
        assert_eq!(device, Device::Cpu);
    }

    #[test]
    fn test_auto_prefers_accelerator() {
        let device = select_device_with(DevicePreference::Auto, || GpuInfo {
            name: "RTX 4070 (CUDA)".to_string(),
            vram_total_mb: 12282,
            is_available: true,
        });
        assert!(device.is_accelerator());
    }

    #[test]
    fn test_gpu_preference_falls_back_to_cpu() {
        let device = select_device_with(DevicePreference::Gpu, GpuInfo::not_detected);
        assert_eq!(device, Device::Cpu);
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let info = parse_nvidia_smi("NVIDIA GeForce RTX 4070, 12282\n").unwrap();
        assert_eq!(info.name, "NVIDIA GeForce RTX 4070 (CUDA)");
        assert_eq!(info.vram_total_mb, 12282);
        assert!(parse_nvidia_smi("\n").is_none());
    }

    #[test]
    fn test_parse_system_profiler() {
        let out = "Graphics/Displays:\n\n    Apple M2 Pro:\n\n      Chipset Model: Apple M2 Pro\n      Type: GPU\n";
        let info = parse_system_profiler(out).unwrap();
        assert_eq!(info.name, "Apple M2 Pro (Metal)");
        assert_eq!(info.vram_total_mb, 0);

        let out = "      Chipset Model: AMD Radeon Pro 5500M\n      VRAM (Total): 4 GB\n";
        assert_eq!(parse_system_profiler(out).unwrap().vram_total_mb, 4096);
    }
}
