//! Keeps a device plugin registered with the kubelet.
//!
//! The kubelet wipes and recreates its registration socket whenever it
//! restarts, forgetting every plugin registered before. The monitor watches
//! the device plugin directory for that socket to reappear and restarts the
//! plugin so it registers again. A failed start is retried every few seconds
//! until it succeeds or the monitor is told to terminate, either by a
//! termination signal or by its shutdown token.

use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::device_plugin::DevicePlugin;
use crate::device_plugin::DEVICE_PLUGIN_PATH;
use crate::device_plugin::KUBELET_SOCKET;

const PLUGIN_START_RETRY_TIMEOUT: Duration = Duration::from_secs(3);
const FS_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PluginState {
    Idle,
    Running,
    Restarting,
}

/// Errors that prevent a monitor from being created.
#[derive(Debug, derive_more::Display)]
pub enum MonitorError {
    #[display("Failed to create file system watcher")]
    FsWatcher,
    #[display("Failed to watch the device plugin directory")]
    WatchPath,
    #[display("Failed to install termination signal handlers")]
    SignalHandler,
}

impl Error for MonitorError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// directory watched for kubelet socket recreation
    pub device_plugin_path: PathBuf,
    pub kubelet_socket: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device_plugin_path: PathBuf::from(DEVICE_PLUGIN_PATH),
            kubelet_socket: PathBuf::from(KUBELET_SOCKET),
        }
    }
}

/// SIGINT, SIGTERM and SIGQUIT listeners, plus a token for in-process
/// shutdown requests.
struct TerminationSignals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
    shutdown: CancellationToken,
}

impl TerminationSignals {
    fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            shutdown: CancellationToken::new(),
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
            _ = self.shutdown.cancelled() => "shutdown requested",
        }
    }
}

pub struct PluginMonitor<P> {
    device_plugin: Arc<P>,
    state: watch::Sender<PluginState>,
    kubelet_socket: PathBuf,
    fs_events: mpsc::Receiver<Event>,
    // dropping the watcher ends the event stream
    _fs_watcher: RecommendedWatcher,
    signals: TerminationSignals,
    retry_timeout: Duration,
}

impl<P: DevicePlugin> PluginMonitor<P> {
    /// Creates a monitor in the `Idle` state.
    ///
    /// Must be called within a tokio runtime. Fails when the device plugin
    /// directory cannot be watched, since kubelet restarts would then go
    /// unnoticed.
    pub fn new(
        device_plugin: Arc<P>,
        config: MonitorConfig,
    ) -> Result<Self, Report<MonitorError>> {
        info!(
            "creating plugin monitor for {}",
            device_plugin.resource_name()
        );

        let (fs_tx, fs_events) = mpsc::channel(FS_EVENT_BUFFER);
        let mut fs_watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    debug!("filesystem event: {:?}", event);
                    // a full buffer only happens while the plugin is not
                    // running, and the next start registers anyway
                    if let Err(e) = fs_tx.try_send(event) {
                        debug!("dropping filesystem event: {e}");
                    }
                }
                Err(e) => {
                    error!("filesystem watch error: {:?}", e);
                }
            },
            Config::default(),
        )
        .change_context(MonitorError::FsWatcher)?;

        fs_watcher
            .watch(&config.device_plugin_path, RecursiveMode::NonRecursive)
            .change_context(MonitorError::WatchPath)
            .attach_printable_lazy(|| {
                format!("path: {}", config.device_plugin_path.display())
            })?;

        let signals =
            TerminationSignals::install().change_context(MonitorError::SignalHandler)?;
        let (state, _) = watch::channel(PluginState::Idle);

        info!("plugin monitor has been successfully created");
        Ok(Self {
            device_plugin,
            state,
            kubelet_socket: config.kubelet_socket,
            fs_events,
            _fs_watcher: fs_watcher,
            signals,
            retry_timeout: PLUGIN_START_RETRY_TIMEOUT,
        })
    }

    /// Terminates the monitor once `shutdown` is cancelled, the same way a
    /// termination signal does.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.signals.shutdown = shutdown;
        self
    }

    /// Overrides the pause between failed start attempts.
    pub fn with_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = retry_timeout;
        self
    }

    pub fn state(&self) -> PluginState {
        *self.state.borrow()
    }

    /// Observes state changes while [`Self::run`] owns the monitor.
    pub fn subscribe(&self) -> watch::Receiver<PluginState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: PluginState) {
        self.state.send_replace(state);
    }

    /// Drives the plugin until a termination signal arrives.
    pub async fn run(mut self) {
        while self.tick().await {}
        info!(
            "plugin monitor for {} terminated",
            self.device_plugin.resource_name()
        );
    }

    /// One pass of the control loop. Returns `false` once the monitor should
    /// terminate.
    ///
    /// Termination is honored at every await point: while the plugin
    /// starts, while a failed start waits for its retry, and while running.
    pub async fn tick(&mut self) -> bool {
        if self.state() != PluginState::Running {
            let started = tokio::select! {
                biased;

                reason = self.signals.recv() => Err(reason),
                result = self.device_plugin.start() => Ok(result),
            };

            match started {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        "failed to start {}: {e:#}, retrying in {:?}",
                        self.device_plugin.resource_name(),
                        self.retry_timeout
                    );
                    let interrupted = tokio::select! {
                        biased;

                        reason = self.signals.recv() => Some(reason),
                        _ = sleep(self.retry_timeout) => None,
                    };
                    return match interrupted {
                        Some(reason) => self.terminate(reason).await,
                        None => true,
                    };
                }
                Err(reason) => return self.terminate(reason).await,
            }
        }

        self.set_state(PluginState::Running);
        info!(
            "{} plugin state is: {}",
            self.device_plugin.resource_name(),
            self.state()
        );

        tokio::select! {
            biased;

            reason = self.signals.recv() => self.terminate(reason).await,
            event = self.fs_events.recv() => match event {
                Some(event) => {
                    if self.is_kubelet_socket_created(&event) {
                        info!("kubelet socket has been re/created, the plugin needs a restart");
                        self.set_state(PluginState::Restarting);
                    }
                    true
                }
                None => {
                    error!("filesystem watcher closed, kubelet restarts can no longer be detected");
                    self.device_plugin.stop().await;
                    false
                }
            },
        }
    }

    /// Stops the plugin; the returned `false` ends the control loop.
    async fn terminate(&self, reason: &str) -> bool {
        info!("terminating plugin monitor... (reason: {reason})");
        self.device_plugin.stop().await;
        false
    }

    fn is_kubelet_socket_created(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_))
            && event.paths.iter().any(|path| *path == self.kubelet_socket)
    }
}
