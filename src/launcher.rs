use crate::{
    component::Component,
    config::{ConfigStore, InstallationConfig},
    disk, env_flags,
    error::{LauncherError, Result},
    ollama::OllamaInstaller,
    package::{PackageInstaller, WEBUI_PROCESS},
    plugin::{RepoPluginInstaller, PIPELINES_PROCESS},
    probe::{Controls, InstallationState, InstallationStateProbe},
    runtime::RuntimeProvisioner,
    status::StatusReporter,
    supervisor::{ProcessSupervisor, StopOutcome},
};
use log::{error, info, warn};
use std::{
    collections::HashSet,
    fmt::Display,
    future::Future,
    sync::{Arc, Mutex},
};
use tokio::{runtime::Handle, task::JoinHandle};

pub const UPDATE_CHECK_KEY: &str = "update-check";
pub const OLLAMA_KEY: &str = "ollama";

/// Keys of operations currently running. A key is released when its guard
/// drops, whatever the outcome.
#[derive(Clone, Debug, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<String>>>,
}

#[derive(Debug)]
pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<String>>>,
    held: Vec<String>,
}

impl InFlight {
    /// All-or-nothing: if any key is busy none are taken.
    pub fn acquire(&self, keys: &[&str]) -> Result<InFlightGuard> {
        let mut busy = self.keys.lock().expect("in-flight lock poisoned");
        if let Some(key) = keys.iter().find(|key| busy.contains(**key)) {
            return Err(LauncherError::OperationInFlight(key.to_string()));
        }
        let held: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        busy.extend(held.iter().cloned());
        Ok(InFlightGuard {
            keys: Arc::clone(&self.keys),
            held,
        })
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.keys
            .lock()
            .expect("in-flight lock poisoned")
            .contains(key)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut busy = self.keys.lock().expect("in-flight lock poisoned");
        for key in &self.held {
            busy.remove(key);
        }
    }
}

/// Runs the user-facing sequences: install, start, stop, update and the
/// update check. Each one publishes locked controls while it runs and the
/// re-derived controls when it finishes.
pub struct Launcher {
    handle: Handle,
    config: Arc<InstallationConfig>,
    settings: Arc<ConfigStore>,
    runtime: Arc<RuntimeProvisioner>,
    package: Arc<PackageInstaller>,
    plugin: Arc<RepoPluginInstaller>,
    ollama: Arc<OllamaInstaller>,
    supervisor: Arc<ProcessSupervisor>,
    probe: Arc<InstallationStateProbe>,
    reporter: StatusReporter,
    in_flight: InFlight,
}

impl Launcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: Handle,
        config: Arc<InstallationConfig>,
        settings: Arc<ConfigStore>,
        runtime: Arc<RuntimeProvisioner>,
        package: Arc<PackageInstaller>,
        plugin: Arc<RepoPluginInstaller>,
        ollama: Arc<OllamaInstaller>,
        supervisor: Arc<ProcessSupervisor>,
        probe: Arc<InstallationStateProbe>,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            handle,
            config,
            settings,
            runtime,
            package,
            plugin,
            ollama,
            supervisor,
            probe,
            reporter,
            in_flight: InFlight::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn runtime(&self) -> &Arc<RuntimeProvisioner> {
        &self.runtime
    }

    pub fn package(&self) -> &Arc<PackageInstaller> {
        &self.package
    }

    pub fn plugin(&self) -> &Arc<RepoPluginInstaller> {
        &self.plugin
    }

    pub fn ollama(&self) -> &Arc<OllamaInstaller> {
        &self.ollama
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running(WEBUI_PROCESS) || self.supervisor.is_running(PIPELINES_PROCESS)
    }

    /// Probes the installation and publishes the controls that follow from
    /// it. Remote lookups only happen with `check_remote`.
    pub async fn refresh(&self, check_remote: bool) -> InstallationState {
        let state = self.probe.probe(check_remote).await;
        self.reporter
            .controls(Controls::derive(&state, self.is_running()));
        state
    }

    /// Runtime, environment and package, strictly in that order.
    pub async fn install_webui(&self) -> Result<()> {
        let _guard = self.acquire(&[WEBUI_PROCESS])?;
        self.reporter.controls(Controls::locked());

        let result = self.install_webui_inner().await;
        self.refresh(false).await;
        result
    }

    async fn install_webui_inner(&self) -> Result<()> {
        self.ensure_disk_space()?;
        self.install_sequence(&[
            Component::Runtime(Arc::clone(&self.runtime)),
            Component::Package(Arc::clone(&self.package)),
        ])
        .await?;
        info!("Open WebUI installation finished.");
        Ok(())
    }

    pub async fn install_pipelines(&self) -> Result<()> {
        let _guard = self.acquire(&[PIPELINES_PROCESS])?;
        self.reporter.controls(Controls::locked());

        let result = self
            .install_sequence(&[
                Component::Runtime(Arc::clone(&self.runtime)),
                Component::Plugin(Arc::clone(&self.plugin)),
            ])
            .await;
        self.refresh(false).await;
        result
    }

    /// Skipped when Ollama already answers on its port.
    pub async fn install_ollama(&self) -> Result<()> {
        let _guard = self.acquire(&[OLLAMA_KEY])?;
        self.reporter.controls(Controls::locked());

        let result = self.install_ollama_inner().await;
        self.refresh(false).await;
        result
    }

    async fn install_ollama_inner(&self) -> Result<()> {
        if self.ollama.check_installed().await {
            info!("Ollama is already running.");
            self.reporter.progress(
                "Ollama Already Running",
                "Ollama is already installed and serving models.",
                100,
            );
            return Ok(());
        }
        if let Err(err) = self.ollama.check_requirements() {
            self.reporter.failure("Not Enough Disk Space.", &err);
            return Err(err);
        }
        self.ollama.install().await
    }

    async fn install_sequence(&self, components: &[Component]) -> Result<()> {
        for component in components {
            if component.check_installed().await {
                info!("{} is already installed.", component.name());
                continue;
            }
            if let Err(err) = component.check_requirements() {
                self.reporter
                    .failure(format!("Cannot Install {}.", component.name()), &err);
                return Err(err);
            }
            component.setup_environment().await?;
            component.install().await?;
        }
        Ok(())
    }

    /// Starts the web UI and, when installed, the pipelines server side by
    /// side, then waits for the web UI port. Returns whether it became
    /// reachable.
    pub async fn start_stack(&self) -> Result<bool> {
        let _guard = self.acquire(&[WEBUI_PROCESS, PIPELINES_PROCESS])?;
        self.reporter.controls(Controls::locked());

        let result = self.start_stack_inner().await;
        self.refresh(false).await;
        result
    }

    async fn start_stack_inner(&self) -> Result<bool> {
        self.reporter.progress(
            "Initializing Backend and Frontend...",
            "Determining the status of Open WebUI and Pipelines.",
            10,
        );

        if !self.package.check_installed().await {
            let err = LauncherError::NotInstalled(self.package.package_name());
            self.reporter.failure("Open WebUI Not Installed.", &err);
            return Err(err);
        }

        let (webui, pipelines) = tokio::join!(self.start_webui(), self.start_pipelines());
        if let Err(err) = pipelines {
            warn!("Pipelines did not start: {err}");
        }
        webui?;

        let settings = self.settings.settings();
        let ready = self
            .supervisor
            .wait_until_ready(
                &settings.webui_host,
                settings.webui_port,
                settings.readiness_attempts,
            )
            .await;
        if ready {
            self.reporter.progress(
                "Open WebUI Server Started",
                format!("Your browser should open shortly ({}).", settings.webui_url()),
                100,
            );
        }
        Ok(ready)
    }

    async fn start_webui(&self) -> Result<()> {
        if let Some(pid) = self.supervisor.running_pid(WEBUI_PROCESS) {
            info!("Open WebUI is already running with PID {pid}.");
            return Ok(());
        }
        self.reporter.progress(
            "Step: Starting Open WebUI...",
            "Launching the Open WebUI server. Please wait. (Sometimes this can take a few minutes)",
            50,
        );
        self.supervisor.start(&self.package.launch_spec()).await?;
        self.reporter.progress(
            "Step: Starting Open WebUI...",
            "Open WebUI server process found. Waiting for it to accept connections.",
            60,
        );
        Ok(())
    }

    async fn start_pipelines(&self) -> Result<()> {
        if !self.plugin.check_installed() {
            info!("Pipelines are not installed; starting Open WebUI alone.");
            return Ok(());
        }
        if let Some(pid) = self.supervisor.running_pid(PIPELINES_PROCESS) {
            info!("Pipelines are already running with PID {pid}.");
            return Ok(());
        }
        let spec = match self.plugin.launch_spec() {
            Ok(spec) => spec,
            Err(err) => {
                self.reporter.failure("Failed to Start Pipelines.", &err);
                return Err(err);
            }
        };
        self.supervisor.start(&spec).await?;
        self.reporter
            .progress("Step: Pipelines Started.", "Pipelines are now running.", 75);
        Ok(())
    }

    pub async fn stop_stack(&self) -> Result<()> {
        let _guard = self.acquire(&[WEBUI_PROCESS, PIPELINES_PROCESS])?;
        self.reporter.controls(Controls::locked());

        let result = self.stop_stack_inner().await;
        self.refresh(false).await;
        result
    }

    async fn stop_stack_inner(&self) -> Result<()> {
        let (webui, pipelines) = tokio::join!(
            self.supervisor.stop(WEBUI_PROCESS),
            self.supervisor.stop(PIPELINES_PROCESS)
        );
        let webui = webui?;
        let pipelines = pipelines?;

        if webui == StopOutcome::NotRunning && pipelines == StopOutcome::NotRunning {
            return Ok(());
        }
        self.reporter.progress(
            "Server Status: Stopped",
            "Open WebUI and Pipelines have been stopped.",
            100,
        );
        Ok(())
    }

    /// Stops anything running, then updates the runtime's package manager,
    /// the package and, if present, the pipelines checkout.
    pub async fn update_stack(&self) -> Result<()> {
        let _guard = self.acquire(&[WEBUI_PROCESS, PIPELINES_PROCESS])?;
        self.reporter.controls(Controls::locked());

        let result = self.update_stack_inner().await;
        self.refresh(false).await;
        result
    }

    async fn update_stack_inner(&self) -> Result<()> {
        if self.is_running() {
            self.reporter.progress(
                "Step: [1/2] Stopping Servers...",
                "Stopping Open WebUI and Pipelines before updating.",
                20,
            );
            self.stop_stack_inner().await?;
        }

        let mut components = vec![
            Component::Runtime(Arc::clone(&self.runtime)),
            Component::Package(Arc::clone(&self.package)),
        ];
        if self.plugin.check_installed() {
            components.push(Component::Plugin(Arc::clone(&self.plugin)));
        }
        for component in &components {
            info!("Updating {}.", component.name());
            component.update().await?;
        }

        self.reporter.progress(
            "Update Complete",
            "Open WebUI has been updated successfully.",
            100,
        );
        Ok(())
    }

    /// Full probe including the package index and the plugin remote.
    /// Skipped entirely when update checks are disabled.
    pub async fn check_updates(&self) -> Result<InstallationState> {
        let _guard = self.acquire(&[UPDATE_CHECK_KEY])?;
        let check_remote = env_flags::update_check_enabled();
        if !check_remote {
            info!("Update checks are disabled.");
        }
        let state = self.refresh(check_remote).await;
        if state.update_available {
            self.reporter.progress(
                "Update Available",
                format!(
                    "Open WebUI {} is available (installed {}).",
                    state.latest_version.as_deref().unwrap_or("?"),
                    state.installed_version.as_deref().unwrap_or("?"),
                ),
                100,
            );
        }
        Ok(state)
    }

    /// Outermost boundary for background operations: errors are logged and
    /// never escape the task. The handle resolves to whether `operation`
    /// succeeded.
    pub fn spawn<F, T, E>(&self, label: &'static str, operation: F) -> JoinHandle<bool>
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        self.handle.spawn(async move {
            match operation.await {
                Ok(_) => true,
                Err(err) => {
                    error!("{label} failed: {err}");
                    false
                }
            }
        })
    }

    fn ensure_disk_space(&self) -> Result<()> {
        let required_gb = self.settings.settings().required_disk_space_gb;
        if let Err(err) = disk::ensure_space(&self.config.base_dir, required_gb) {
            self.reporter.failure("Not Enough Disk Space.", &err);
            return Err(err);
        }
        Ok(())
    }

    fn acquire(&self, keys: &[&str]) -> Result<InFlightGuard> {
        self.in_flight.acquire(keys).map_err(|err| {
            self.reporter.failure("Operation In Progress.", &err);
            err
        })
    }
}
