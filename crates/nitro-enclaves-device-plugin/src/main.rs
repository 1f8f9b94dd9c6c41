use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use clap::Parser;
use nitro_enclaves_device_plugin::config::Cli;
use nitro_enclaves_device_plugin::config::PluginConfig;
use nitro_enclaves_device_plugin::device_id::DeviceIdGenerator;
use nitro_enclaves_device_plugin::device_plugin::EnclaveCpuPlugin;
use nitro_enclaves_device_plugin::device_plugin::EnclaveDevicePlugin;
use nitro_enclaves_device_plugin::device_plugin::PluginPaths;
use nitro_enclaves_device_plugin::logging;
use nitro_enclaves_device_plugin::monitor::MonitorConfig;
use nitro_enclaves_device_plugin::monitor::PluginMonitor;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Upper bound on the CPU plugin's teardown once the process is exiting.
const CPU_PLUGIN_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    logging::init(cli.log_level);

    tracing::info!(
        "Loading K8s Nitro Enclaves device plugin {}",
        env!("CARGO_PKG_VERSION")
    );

    let config = PluginConfig::from(&cli);
    let paths = PluginPaths {
        device_plugin_path: cli.device_plugin_path.clone(),
        kubelet_socket: cli.kubelet_socket.clone(),
    };
    let monitor_config = MonitorConfig {
        device_plugin_path: cli.device_plugin_path.clone(),
        kubelet_socket: cli.kubelet_socket.clone(),
    };

    let device_plugin = Arc::new(EnclaveDevicePlugin::new(
        &config,
        paths.clone(),
        &DeviceIdGenerator::new(),
    ));
    let monitor = PluginMonitor::new(device_plugin, monitor_config.clone())
        .map_err(|report| anyhow!("error while initializing NE plugin monitor: {report:?}"))?;

    // the CPU plugin runs beside the enclave plugin, its failures are only logged
    let shutdown = CancellationToken::new();
    let cpu_task = config.enclave_cpu_advertisement.then(|| {
        let cpu_plugin = Arc::new(EnclaveCpuPlugin::new(
            &config,
            paths,
            &cli.offline_cpus_path,
            &DeviceIdGenerator::new(),
        ));
        let cpu_monitor = PluginMonitor::new(cpu_plugin, monitor_config);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match cpu_monitor {
                Ok(cpu_monitor) => cpu_monitor.with_shutdown(shutdown).run().await,
                Err(report) => tracing::error!("error running the NE CPU plugin: {report:?}"),
            }
        })
    });

    // returns on SIGINT, SIGTERM or SIGQUIT; kubernetes restarts the
    // container if the process exits for any other reason
    monitor.run().await;

    shutdown.cancel();
    if let Some(mut cpu_task) = cpu_task {
        match timeout(CPU_PLUGIN_SHUTDOWN_TIMEOUT, &mut cpu_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("NE CPU plugin task failed: {e}"),
            Err(_) => {
                tracing::warn!("NE CPU plugin did not stop in time, aborting it");
                cpu_task.abort();
            }
        }
    }

    Ok(())
}
