use tracing::error;
use tracing::info;

use super::api::ContainerAllocateRequest;
use super::api::ContainerAllocateResponse;
use super::api::Device;
use super::api::DeviceSpec;
use super::NitroEnclavesDevicePlugin;
use super::PluginDefinition;
use super::PluginPaths;
use super::HEALTHY;
use crate::config::PluginConfig;
use crate::device_id::DeviceIdGenerator;

const DEVICE_NAME: &str = "nitro_enclaves";
const RESOURCE_NAME: &str = "aws.ec2.nitro/nitro_enclaves";
const DEVICE_PATH: &str = "/dev/nitro_enclaves";

/// The Nitro Enclaves device file, shared by every pod that runs an enclave.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnclaveDevice;

impl PluginDefinition for EnclaveDevice {
    fn device_name(&self) -> &str {
        DEVICE_NAME
    }

    fn resource_name(&self) -> &str {
        RESOURCE_NAME
    }

    fn allocate(&self, _request: &ContainerAllocateRequest) -> ContainerAllocateResponse {
        ContainerAllocateResponse {
            devices: vec![DeviceSpec {
                container_path: DEVICE_PATH.to_string(),
                host_path: DEVICE_PATH.to_string(),
                permissions: "rw".to_string(),
            }],
            ..Default::default()
        }
    }
}

pub type EnclaveDevicePlugin = NitroEnclavesDevicePlugin<EnclaveDevice>;

impl NitroEnclavesDevicePlugin<EnclaveDevice> {
    /// Advertises `max_enclaves_per_node` slots.
    ///
    /// A slot is not a device file of its own: every slot mounts the same
    /// host `/dev/nitro_enclaves`, so the slot count is the number of pods
    /// that can run an enclave on this node at the same time.
    pub fn new(config: &PluginConfig, paths: PluginPaths, ids: &DeviceIdGenerator) -> Self {
        let mut config = config.clone();
        if let Err(e) = config.validate() {
            error!("invalid plugin config: {e}");
        }
        info!(
            "initializing Nitro Enclaves device plugin with following params: {:?}",
            config
        );

        let devices: Vec<Device> = (0..config.max_enclaves_per_node)
            .map(|_| Device {
                id: ids.next_id(DEVICE_NAME),
                health: HEALTHY.to_string(),
                topology: None,
            })
            .collect();
        info!("enclave devices added: {}", devices.len());

        Self::with_devices(EnclaveDevice, devices, paths)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::device_plugin::DevicePlugin;

    #[test]
    fn device_names_continue_the_generator_sequence() {
        let ids = DeviceIdGenerator::starting_at(50);
        let plugin =
            EnclaveDevicePlugin::new(&PluginConfig::default(), PluginPaths::default(), &ids);

        assert_eq!(plugin.devices()[0].id, "nitro_enclaves_50");
    }

    #[test]
    fn default_config_creates_four_devices() {
        let ids = DeviceIdGenerator::new();
        let plugin =
            EnclaveDevicePlugin::new(&PluginConfig::default(), PluginPaths::default(), &ids);

        assert_eq!(plugin.devices().len(), 4);
    }

    #[test]
    fn custom_number_of_devices() {
        let ids = DeviceIdGenerator::new();
        let config = PluginConfig {
            max_enclaves_per_node: 3,
            enclave_cpu_advertisement: false,
        };
        let plugin = EnclaveDevicePlugin::new(&config, PluginPaths::default(), &ids);

        let ids: Vec<&str> = plugin.devices().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["nitro_enclaves_0", "nitro_enclaves_1", "nitro_enclaves_2"]);
        assert!(plugin.devices().iter().all(|d| d.health == HEALTHY));
    }

    #[test]
    fn out_of_range_config_is_clamped() {
        let ids = DeviceIdGenerator::new();
        for max_enclaves_per_node in [0, -3, 9] {
            let config = PluginConfig {
                max_enclaves_per_node,
                enclave_cpu_advertisement: false,
            };
            let plugin = EnclaveDevicePlugin::new(&config, PluginPaths::default(), &ids);
            assert_eq!(plugin.devices().len(), 4, "{max_enclaves_per_node}");
        }
    }

    #[test]
    fn resource_and_socket_names() {
        let plugin = EnclaveDevicePlugin::new(
            &PluginConfig::default(),
            PluginPaths::default(),
            &DeviceIdGenerator::new(),
        );

        assert_eq!(plugin.resource_name(), "aws.ec2.nitro/nitro_enclaves");
        assert_eq!(
            plugin.socket_path().to_str(),
            Some("/var/lib/kubelet/device-plugins/nitro_enclaves.sock")
        );
    }

    #[test]
    fn allocate_mounts_the_enclave_device() {
        let request = ContainerAllocateRequest {
            devices_ids: vec!["nitro_enclaves_0".to_string(), "nitro_enclaves_1".to_string()],
        };
        let response = EnclaveDevice.allocate(&request);

        assert_eq!(
            response.devices,
            vec![DeviceSpec {
                container_path: "/dev/nitro_enclaves".to_string(),
                host_path: "/dev/nitro_enclaves".to_string(),
                permissions: "rw".to_string(),
            }]
        );
        assert!(response.envs.is_empty());
        assert!(response.mounts.is_empty());
    }
}
