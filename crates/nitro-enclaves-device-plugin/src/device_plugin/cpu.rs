use std::collections::HashMap;
use std::path::Path;

use tracing::error;
use tracing::info;
use tracing::warn;

use super::api::ContainerAllocateRequest;
use super::api::ContainerAllocateResponse;
use super::api::Device;
use super::NitroEnclavesDevicePlugin;
use super::PluginDefinition;
use super::PluginPaths;
use super::HEALTHY;
use crate::config::PluginConfig;
use crate::cpu_range::offline_cpu_count;
use crate::device_id::DeviceIdGenerator;

const DEVICE_NAME: &str = "nitro_enclaves_cpus";
const RESOURCE_NAME: &str = "aws.ec2.nitro/nitro_enclaves_cpus";
/// Tells the container how many enclave CPUs it was given.
pub const CPU_COUNT_ENV: &str = "NITRO_ENCLAVES_CPUS";

/// CPUs taken offline on the host and reserved for enclaves.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnclaveCpu;

impl PluginDefinition for EnclaveCpu {
    fn device_name(&self) -> &str {
        DEVICE_NAME
    }

    fn resource_name(&self) -> &str {
        RESOURCE_NAME
    }

    fn allocate(&self, request: &ContainerAllocateRequest) -> ContainerAllocateResponse {
        ContainerAllocateResponse {
            envs: HashMap::from([(
                CPU_COUNT_ENV.to_string(),
                request.devices_ids.len().to_string(),
            )]),
            ..Default::default()
        }
    }
}

pub type EnclaveCpuPlugin = NitroEnclavesDevicePlugin<EnclaveCpu>;

impl NitroEnclavesDevicePlugin<EnclaveCpu> {
    /// Advertises one device per offline CPU listed in `offline_cpus_path`.
    ///
    /// Nothing is advertised when CPU advertisement is disabled. A missing or
    /// malformed CPU list is logged and treated as zero CPUs.
    pub fn new(
        config: &PluginConfig,
        paths: PluginPaths,
        offline_cpus_path: &Path,
        ids: &DeviceIdGenerator,
    ) -> Self {
        let mut config = config.clone();
        if let Err(e) = config.validate() {
            error!("invalid CPU plugin config: {e}");
        }
        info!(
            "initializing Nitro Enclaves CPU device plugin with following params: {:?}",
            config
        );

        let mut devices = Vec::new();
        if config.enclave_cpu_advertisement {
            let available = available_enclave_cpus(offline_cpus_path);
            devices.extend((0..available).map(|_| Device {
                id: ids.next_id(DEVICE_NAME),
                health: HEALTHY.to_string(),
                topology: None,
            }));
            info!("reserved CPUs for enclaves added: {available}");
        }

        Self::with_devices(EnclaveCpu, devices, paths)
    }
}

fn available_enclave_cpus(offline_cpus_path: &Path) -> usize {
    let data = std::fs::read_to_string(offline_cpus_path).unwrap_or_else(|e| {
        warn!(
            "error reading offline CPU file {}: {e}",
            offline_cpus_path.display()
        );
        String::new()
    });

    match offline_cpu_count(&data) {
        Ok(count) => usize::try_from(count).unwrap_or_else(|_| {
            warn!("offline CPU list {data:?} yields a negative count: {count}");
            0
        }),
        Err(e) => {
            warn!("error while determining advisable CPUs on the instance: {e}");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::device_plugin::DevicePlugin;

    fn config(enclave_cpu_advertisement: bool) -> PluginConfig {
        PluginConfig {
            max_enclaves_per_node: 4,
            enclave_cpu_advertisement,
        }
    }

    fn offline_file(content: &str) -> NamedTempFile {
        let file = NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), content).expect("write offline cpus");
        file
    }

    #[test]
    fn advertisement_disabled_creates_no_devices() {
        let file = offline_file("0-7\n");
        let plugin = EnclaveCpuPlugin::new(
            &config(false),
            PluginPaths::default(),
            file.path(),
            &DeviceIdGenerator::new(),
        );

        assert!(plugin.devices().is_empty());
    }

    #[test]
    fn one_device_per_offline_cpu() {
        let file = offline_file("0,2-3,7\n");
        let plugin = EnclaveCpuPlugin::new(
            &config(true),
            PluginPaths::default(),
            file.path(),
            &DeviceIdGenerator::new(),
        );

        let ids: Vec<&str> = plugin.devices().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "nitro_enclaves_cpus_0",
                "nitro_enclaves_cpus_1",
                "nitro_enclaves_cpus_2",
                "nitro_enclaves_cpus_3",
            ]
        );
        assert!(plugin.devices().iter().all(|d| d.health == HEALTHY));
        assert_eq!(plugin.resource_name(), "aws.ec2.nitro/nitro_enclaves_cpus");
    }

    #[test]
    fn malformed_cpu_list_falls_back_to_zero() {
        for content in ["1,2,", "1-3-4", "a-b", "5-3", "0-9223372036854775807"] {
            let file = offline_file(content);
            let plugin = EnclaveCpuPlugin::new(
                &config(true),
                PluginPaths::default(),
                file.path(),
                &DeviceIdGenerator::new(),
            );
            assert!(plugin.devices().is_empty(), "{content:?}");
        }
    }

    #[test]
    fn missing_cpu_list_falls_back_to_zero() {
        let dir = tempfile::tempdir().expect("temp dir");
        let plugin = EnclaveCpuPlugin::new(
            &config(true),
            PluginPaths::default(),
            &dir.path().join("offline"),
            &DeviceIdGenerator::new(),
        );

        assert!(plugin.devices().is_empty());
    }

    #[test]
    fn allocate_reports_requested_cpu_count() {
        let request = ContainerAllocateRequest {
            devices_ids: vec![
                "nitro_enclaves_cpus_0".to_string(),
                "nitro_enclaves_cpus_5".to_string(),
            ],
        };
        let response = EnclaveCpu.allocate(&request);

        assert_eq!(
            response.envs.get(CPU_COUNT_ENV).map(String::as_str),
            Some("2")
        );
        assert!(response.devices.is_empty());
    }
}
