use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use crate::cpu_range::OFFLINE_CPUS_PATH;
use crate::device_plugin::DEVICE_PLUGIN_PATH;
use crate::device_plugin::KUBELET_SOCKET;

/// Kubernetes device plugin for AWS Nitro Enclaves
#[derive(Parser, Debug)]
#[command(about, long_about, version)]
pub struct Cli {
    #[arg(
        long,
        env = "MAX_ENCLAVES_PER_NODE",
        help = "Number of pods that may share the Nitro Enclaves device on this node (1-4)"
    )]
    pub max_enclaves_per_node: Option<String>,

    #[arg(
        long,
        env = "ENCLAVE_CPU_ADVERTISEMENT",
        help = "Advertise offline CPUs reserved for enclaves as an extended resource"
    )]
    pub enclave_cpu_advertisement: Option<String>,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        default_value = DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the kubelet and device plugin sockets"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        default_value = KUBELET_SOCKET,
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        default_value = OFFLINE_CPUS_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "Kernel file listing offline CPUs"
    )]
    pub offline_cpus_path: PathBuf,

    #[arg(
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        help = "Log level for targets not named in RUST_LOG (off, error, warn, info, debug, trace)"
    )]
    pub log_level: LevelFilter,
}
