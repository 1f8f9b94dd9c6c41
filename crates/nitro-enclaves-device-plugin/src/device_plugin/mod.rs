pub mod api {
    #![allow(clippy::doc_markdown, clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

mod cpu;
mod enclave;

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use api::device_plugin_client::DevicePluginClient;
use api::device_plugin_server::DevicePlugin as DevicePluginRpc;
use api::device_plugin_server::DevicePluginServer;
use api::registration_client::RegistrationClient;
use api::AllocateRequest;
use api::AllocateResponse;
use api::ContainerAllocateRequest;
use api::ContainerAllocateResponse;
use api::DevicePluginOptions;
use api::Empty;
use api::ListAndWatchResponse;
use api::PreStartContainerRequest;
use api::PreStartContainerResponse;
use api::PreferredAllocationRequest;
use api::PreferredAllocationResponse;
use api::RegisterRequest;
use async_trait::async_trait;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use cpu::EnclaveCpu;
pub use cpu::EnclaveCpuPlugin;
pub use cpu::CPU_COUNT_ENV;
pub use enclave::EnclaveDevice;
pub use enclave::EnclaveDevicePlugin;

/// Device plugin API version spoken with the kubelet.
pub const API_VERSION: &str = "v1beta1";
/// Directory where the kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";
/// Kubelet registration socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";
/// Health value reported for every advertised device.
pub const HEALTHY: &str = "Healthy";

/// Number of one second polls to wait for the gRPC server to answer.
const SERVER_READY_TIMEOUT: u32 = 10;
const SERVER_READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle operations a [`crate::monitor::PluginMonitor`] drives.
#[async_trait]
pub trait DevicePlugin: Send + Sync {
    /// Serves the plugin socket and registers it with the kubelet.
    async fn start(&self) -> anyhow::Result<()>;
    /// Stops serving and removes the plugin socket. Calling it on a stopped
    /// plugin is a no-op.
    async fn stop(&self);
    fn resource_name(&self) -> &str;
}

/// The parts that differ between the resources a plugin can advertise.
pub trait PluginDefinition: Send + Sync + 'static {
    /// Stem of the plugin socket name, `<device_name>.sock`.
    fn device_name(&self) -> &str;
    fn resource_name(&self) -> &str;
    /// Describes how the resource is exposed to one container.
    fn allocate(&self, request: &ContainerAllocateRequest) -> ContainerAllocateResponse;
}

/// Filesystem locations shared with the kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPaths {
    pub device_plugin_path: PathBuf,
    pub kubelet_socket: PathBuf,
}

impl Default for PluginPaths {
    fn default() -> Self {
        Self {
            device_plugin_path: PathBuf::from(DEVICE_PLUGIN_PATH),
            kubelet_socket: PathBuf::from(KUBELET_SOCKET),
        }
    }
}

impl PluginPaths {
    pub fn socket_path(&self, device_name: &str) -> PathBuf {
        self.device_plugin_path.join(format!("{device_name}.sock"))
    }
}

#[derive(Debug)]
struct RunningServer {
    /// fires once to end every ListAndWatch stream and shut the server down
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Device plugin server for one advertised resource.
#[derive(Debug)]
pub struct NitroEnclavesDevicePlugin<D> {
    definition: Arc<D>,
    devices: Arc<[api::Device]>,
    options: DevicePluginOptions,
    socket_path: PathBuf,
    kubelet_socket: PathBuf,
    server: Mutex<Option<RunningServer>>,
}

impl<D: PluginDefinition> NitroEnclavesDevicePlugin<D> {
    pub fn with_devices(definition: D, devices: Vec<api::Device>, paths: PluginPaths) -> Self {
        let socket_path = paths.socket_path(definition.device_name());
        Self {
            definition: Arc::new(definition),
            devices: devices.into(),
            options: DevicePluginOptions::default(),
            socket_path,
            kubelet_socket: paths.kubelet_socket,
            server: Mutex::new(None),
        }
    }

    pub fn devices(&self) -> &[api::Device] {
        &self.devices
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stops the running server, if any, and removes the socket file.
    async fn release_resources(&self, running: Option<RunningServer>) {
        if let Some(RunningServer {
            cancellation_token,
            handle,
        }) = running
        {
            cancellation_token.cancel();
            let abort_handle = handle.abort_handle();
            if timeout(SERVER_SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("gRPC server did not shut down in time, aborting it");
                abort_handle.abort();
            }
        }

        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => debug!("removed socket file: {}", self.socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!(
                "error removing socket file {}: {}",
                self.socket_path.display(),
                e
            ),
        }
    }

    /// Ensure that the gRPC server of the device plugin is ready to serve.
    async fn wait_for_server_ready(&self, attempts: u32) -> anyhow::Result<()> {
        for _ in 0..attempts {
            let exited = self
                .server
                .lock()
                .await
                .as_ref()
                .map_or(true, |server| server.handle.is_finished());
            if exited {
                bail!("gRPC server exited before becoming ready");
            }

            if let Ok(channel) = connect_unix_socket(&self.socket_path).await {
                let mut client = DevicePluginClient::new(channel);
                if client.get_device_plugin_options(Empty {}).await.is_ok() {
                    return Ok(());
                }
            }
            sleep(SERVER_READY_POLL_INTERVAL).await;
        }

        bail!("gRPC server initialization timed out")
    }

    /// register device plugin with kubelet
    async fn register_with_kubelet(&self) -> anyhow::Result<()> {
        info!(
            "attempting to connect to kubelet: {}",
            self.kubelet_socket.display()
        );

        let endpoint = self
            .socket_path
            .file_name()
            .and_then(|name| name.to_str())
            .context("device plugin socket has no file name")?
            .to_string();

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint,
            resource_name: self.definition.resource_name().to_string(),
            options: Some(self.options),
        };

        timeout(REGISTRATION_TIMEOUT, async {
            let channel = connect_unix_socket(&self.kubelet_socket)
                .await
                .context("couldn't connect to kubelet")?;
            info!("connected to kubelet");

            let mut client = RegistrationClient::new(channel);
            client
                .register(Request::new(request))
                .await
                .map_err(|e| anyhow!("registration failed: {e}"))?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("registration with kubelet timed out")?
    }
}

#[async_trait]
impl<D: PluginDefinition> DevicePlugin for NitroEnclavesDevicePlugin<D> {
    async fn start(&self) -> anyhow::Result<()> {
        {
            let mut server = self.server.lock().await;
            self.release_resources(server.take()).await;

            info!(
                "starting {} device plugin server: {}",
                self.resource_name(),
                self.socket_path.display()
            );
            let listener = UnixListener::bind(&self.socket_path).with_context(|| {
                format!("error while creating socket {}", self.socket_path.display())
            })?;

            let cancellation_token = CancellationToken::new();
            let service = DevicePluginService::new(
                self.definition.clone(),
                self.devices.clone(),
                self.options,
                cancellation_token.clone(),
            );
            let handle = tokio::spawn(serve(listener, service, cancellation_token.clone()));
            *server = Some(RunningServer {
                cancellation_token,
                handle,
            });
        }

        let registered = match self.wait_for_server_ready(SERVER_READY_TIMEOUT).await {
            Ok(()) => self.register_with_kubelet().await,
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            error!(
                "error while registering {} with kubelet! (reason: {e:#})",
                self.resource_name()
            );
            self.stop().await;
            return Err(e);
        }

        info!(
            "registered device plugin with kubelet: {}",
            self.resource_name()
        );
        Ok(())
    }

    async fn stop(&self) {
        let running = self.server.lock().await.take();
        let was_running = running.is_some();
        self.release_resources(running).await;
        if was_running {
            info!(
                "device plugin stopped. (socket: {})",
                self.socket_path.display()
            );
        }
    }

    fn resource_name(&self) -> &str {
        self.definition.resource_name()
    }
}

async fn serve<D: PluginDefinition>(
    listener: UnixListener,
    service: DevicePluginService<D>,
    cancellation_token: CancellationToken,
) {
    let shutdown = cancellation_token.clone();
    let result = tonic::transport::Server::builder()
        .add_service(DevicePluginServer::new(service))
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::UnixListenerStream::new(listener),
            async move {
                shutdown.cancelled().await;
                info!("shutting down gRPC server");
            },
        )
        .await;

    if let Err(e) = result {
        error!("error while serving device plugin: {e}");
        cancellation_token.cancel();
    }
}

/// create Unix Domain Socket client connection
pub async fn connect_unix_socket(socket_path: &Path) -> anyhow::Result<Channel> {
    let socket_path = socket_path.to_path_buf();

    // The HTTP URL is a placeholder, the connector always dials the socket
    let channel = Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await?;

    Ok(channel)
}

/// DevicePlugin service implementation
/// answers the kubelet's calls on the plugin socket
#[derive(Debug)]
pub struct DevicePluginService<D> {
    definition: Arc<D>,
    devices: Arc<[api::Device]>,
    options: DevicePluginOptions,
    /// ends ListAndWatch streams when the server stops
    cancellation_token: CancellationToken,
}

impl<D: PluginDefinition> DevicePluginService<D> {
    fn new(
        definition: Arc<D>,
        devices: Arc<[api::Device]>,
        options: DevicePluginOptions,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            definition,
            devices,
            options,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl<D: PluginDefinition> DevicePluginRpc for DevicePluginService<D> {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(self.options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// send the device list once, then hold the stream open until the
    /// server stops
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!(
            "starting to watch device list for {}",
            self.definition.resource_name()
        );

        let (tx, rx) = mpsc::unbounded_channel::<Result<ListAndWatchResponse, Status>>();
        let cancellation_token = self.cancellation_token.clone();
        let devices = self.devices.to_vec();

        tokio::spawn(async move {
            if let Err(e) = tx.send(Ok(ListAndWatchResponse { devices })) {
                error!("failed to send initial device list: {}", e);
                return;
            }

            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("device watch task stopped");
                }
                _ = tx.closed() => {
                    debug!("kubelet closed the device list stream");
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    /// get preferred device allocation
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    /// allocate devices to container
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        let known: HashSet<&str> = self.devices.iter().map(|d| d.id.as_str()).collect();

        let container_responses = req
            .container_requests
            .iter()
            .map(|container_req| {
                for id in &container_req.devices_ids {
                    if known.contains(id.as_str()) {
                        debug!("allocation request for device ID: {id}");
                    } else {
                        warn!("allocation request for unknown device ID: {id}");
                    }
                }
                self.definition.allocate(container_req)
            })
            .collect::<Vec<_>>();

        info!(
            "{} allocation completed for {} container(s)",
            self.definition.resource_name(),
            container_responses.len()
        );
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    /// pre-start container
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        let req = request.into_inner();
        debug!("pre-start container processing: {:?}", req);
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
