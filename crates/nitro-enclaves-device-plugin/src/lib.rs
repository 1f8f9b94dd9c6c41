pub mod config;
pub mod cpu_range;
pub mod device_id;
pub mod device_plugin;
pub mod logging;
pub mod monitor;
