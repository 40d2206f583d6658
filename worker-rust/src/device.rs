//! Device Catalog Provider.
//!
//! Device enumeration never runs in the long-lived pool process: driver
//! state touched during enumeration can poison later context creation. The
//! pool re-executes its own binary with `list-devices` and reads the JSON
//! device list back from the child's stdout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Hidden subcommand that prints the probed device list as JSON.
pub const LIST_DEVICES_SUBCOMMAND: &str = "list-devices";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Gpu,
    Cpu,
}

/// A compute device, ordered by (platform, device).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub platform_index: u32,
    pub device_index: u32,
    pub name: String,
    pub kind: DeviceKind,
}

impl Device {
    /// A (platform, device) slot not yet probed; `DeviceContext::acquire`
    /// replaces it with the real device.
    pub fn slot(platform_index: u32, device_index: u32) -> Self {
        Self {
            platform_index,
            device_index,
            name: format!("device {platform_index}.{device_index}"),
            kind: DeviceKind::Cpu,
        }
    }

    pub fn same_slot(&self, other: &Device) -> bool {
        self.platform_index == other.platform_index && self.device_index == other.device_index
    }
}

#[async_trait]
pub trait DeviceCatalog: Send + Sync {
    /// Ordered by platform then device, without duplicates.
    async fn enumerate(&self) -> Result<Vec<Device>>;
}

/// Enumerates devices in a child process.
pub struct IsolatedCatalog {
    program: PathBuf,
}

impl IsolatedCatalog {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

#[async_trait]
impl DeviceCatalog for IsolatedCatalog {
    async fn enumerate(&self) -> Result<Vec<Device>> {
        let output = tokio::process::Command::new(&self.program)
            .arg(LIST_DEVICES_SUBCOMMAND)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn device probe {}", self.program.display()))?;

        if !output.status.success() {
            anyhow::bail!("Device probe exited with {}", output.status);
        }

        let devices: Vec<Device> = serde_json::from_slice(&output.stdout)
            .context("Device probe returned malformed output")?;
        Ok(normalize(devices))
    }
}

/// Fixed device list, for driving a pool without probing hardware.
#[cfg(test)]
pub struct StaticCatalog(pub Vec<Device>);

#[cfg(test)]
#[async_trait]
impl DeviceCatalog for StaticCatalog {
    async fn enumerate(&self) -> Result<Vec<Device>> {
        Ok(normalize(self.0.clone()))
    }
}

pub fn normalize(mut devices: Vec<Device>) -> Vec<Device> {
    devices.sort();
    devices.dedup_by(|a, b| a.same_slot(b));
    devices
}

/// Probe devices in this process. Only called from isolated processes.
pub fn probe_devices() -> Vec<Device> {
    let gpus = match run_nvidia_smi() {
        Ok(gpus) => gpus,
        Err(e) => {
            tracing::warn!("GPU detection failed: {e}");
            Vec::new()
        }
    };
    assemble(gpus, host_cpu_name())
}

/// Entry point of the `list-devices` child.
pub fn print_devices() -> Result<()> {
    let devices = probe_devices();
    serde_json::to_writer(std::io::stdout().lock(), &devices)
        .context("Failed to write device list")?;
    Ok(())
}

fn run_nvidia_smi() -> Result<Vec<(u32, String)>> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index,name", "--format=csv,noheader"])
        .output()?;

    if !output.status.success() {
        anyhow::bail!("nvidia-smi failed");
    }

    Ok(parse_smi_gpus(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_smi_gpus(stdout: &str) -> Vec<(u32, String)> {
    let mut gpus: Vec<(u32, String)> = stdout
        .lines()
        .filter_map(|line| {
            let (index, name) = line.split_once(',')?;
            Some((index.trim().parse().ok()?, name.trim().to_string()))
        })
        .collect();
    gpus.sort();
    gpus.dedup_by_key(|(index, _)| *index);
    gpus
}

fn host_cpu_name() -> String {
    let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    format!("Host CPU ({threads} threads)")
}

/// GPU platform first when present, host CPU platform last.
fn assemble(gpus: Vec<(u32, String)>, cpu_name: String) -> Vec<Device> {
    let mut devices = Vec::with_capacity(gpus.len() + 1);
    let mut platform = 0;
    if !gpus.is_empty() {
        devices.extend(gpus.into_iter().map(|(index, name)| Device {
            platform_index: platform,
            device_index: index,
            name,
            kind: DeviceKind::Gpu,
        }));
        platform += 1;
    }
    devices.push(Device {
        platform_index: platform,
        device_index: 0,
        name: cpu_name,
        kind: DeviceKind::Cpu,
    });
    devices
}

/// Exclusive binding of a worker process to its device.
#[derive(Clone)]
pub struct DeviceContext {
    pub device: Device,
    #[cfg(feature = "cuda")]
    pub cuda: Option<std::sync::Arc<cudarc::driver::CudaDevice>>,
}

impl DeviceContext {
    /// Re-probe inside the worker process and bind the requested slot.
    pub fn acquire(wanted: &Device) -> Result<Self> {
        let device = probe_devices()
            .into_iter()
            .find(|d| d.same_slot(wanted))
            .with_context(|| {
                format!(
                    "Device {}:{} ({}) is not available",
                    wanted.platform_index, wanted.device_index, wanted.name
                )
            })?;

        #[cfg(feature = "cuda")]
        let cuda = match device.kind {
            DeviceKind::Gpu => Some(
                cudarc::driver::CudaDevice::new(device.device_index as usize).with_context(
                    || format!("Failed to open CUDA device {}", device.device_index),
                )?,
            ),
            DeviceKind::Cpu => None,
        };

        Ok(Self {
            device,
            #[cfg(feature = "cuda")]
            cuda,
        })
    }

    /// Context without probing, for in-process workers under test.
    #[cfg(test)]
    pub fn unchecked(device: Device) -> Self {
        Self {
            device,
            #[cfg(feature = "cuda")]
            cuda: None,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_device(platform_index: u32, device_index: u32) -> Device {
    Device {
        platform_index,
        device_index,
        name: format!("Test Device {platform_index}.{device_index}"),
        kind: DeviceKind::Gpu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(devices: &[Device]) -> Vec<(u32, u32, DeviceKind)> {
        devices
            .iter()
            .map(|d| (d.platform_index, d.device_index, d.kind))
            .collect()
    }

    #[test]
    fn test_parse_smi_output() {
        let out = "1, NVIDIA GeForce RTX 3060\n0, NVIDIA GeForce RTX 5070\nnot a gpu line\n";
        assert_eq!(
            parse_smi_gpus(out),
            vec![
                (0, "NVIDIA GeForce RTX 5070".to_string()),
                (1, "NVIDIA GeForce RTX 3060".to_string()),
            ]
        );
    }

    #[test]
    fn test_assemble_platform_order() {
        let devices = assemble(vec![(0, "gpu-a".into()), (1, "gpu-b".into())], "cpu".into());
        assert_eq!(
            slots(&devices),
            vec![
                (0, 0, DeviceKind::Gpu),
                (0, 1, DeviceKind::Gpu),
                (1, 0, DeviceKind::Cpu)
            ]
        );

        let cpu_only = assemble(vec![], "cpu".into());
        assert_eq!(cpu_only.len(), 1);
        assert_eq!((cpu_only[0].platform_index, cpu_only[0].kind), (0, DeviceKind::Cpu));
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let raw = vec![test_device(1, 0), test_device(0, 1), test_device(0, 0), test_device(0, 1)];
        let devices = normalize(raw);
        let slots: Vec<_> = devices.iter().map(|d| (d.platform_index, d.device_index)).collect();
        assert_eq!(slots, vec![(0, 0), (0, 1), (1, 0)]);
    }

    #[tokio::test]
    async fn test_enumeration_is_deterministic() {
        let catalog = StaticCatalog(vec![test_device(0, 1), test_device(1, 0), test_device(0, 0)]);
        let first = catalog.enumerate().await.unwrap();
        let second = catalog.enumerate().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_device_list_wire_format() {
        let json = serde_json::to_string(&[test_device(0, 2)]).unwrap();
        assert!(json.contains(r#""kind":"gpu""#));
        let back: Vec<Device> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![test_device(0, 2)]);
    }

    #[cfg(unix)]
    fn probe_script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("probe.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_isolated_catalog_normalizes_child_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = probe_script(
            dir.path(),
            r#"[ "$1" = "list-devices" ] || exit 3
echo '[{"platform_index":1,"device_index":0,"name":"Host CPU","kind":"cpu"},
{"platform_index":0,"device_index":1,"name":"gpu-b","kind":"gpu"},
{"platform_index":0,"device_index":0,"name":"gpu-a","kind":"gpu"},
{"platform_index":0,"device_index":1,"name":"gpu-b","kind":"gpu"}]'"#,
        );

        let devices = IsolatedCatalog::new(script).enumerate().await.unwrap();
        assert_eq!(
            slots(&devices),
            vec![
                (0, 0, DeviceKind::Gpu),
                (0, 1, DeviceKind::Gpu),
                (1, 0, DeviceKind::Cpu)
            ]
        );
        assert_eq!(devices[0].name, "gpu-a");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_isolated_catalog_fails_on_child_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = probe_script(dir.path(), "echo '[]'; exit 2");
        let err = IsolatedCatalog::new(script).enumerate().await.unwrap_err();
        assert!(err.to_string().contains("Device probe exited"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_isolated_catalog_rejects_malformed_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = probe_script(dir.path(), "echo 'GPU 0: something'");
        let err = IsolatedCatalog::new(script).enumerate().await.unwrap_err();
        assert!(format!("{err:#}").contains("malformed output"));
    }
}
