use crate::{
    config::{ConfigStore, InstallationConfig},
    download::Downloader,
    environment::EnvironmentManager,
    error::{LauncherError, Result},
    runner::{CommandOutput, CommandRunner, CommandSpec},
    status::StatusReporter,
    supervisor::{LaunchSpec, WorkerMatch},
};
use log::{info, warn};
use serde::Deserialize;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{runtime::Handle, task::JoinHandle};

pub const WEBUI_ENV_NAME: &str = "env";
pub const WEBUI_PROCESS: &str = "webui";

const INDEX_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct IndexResponse {
    info: IndexInfo,
}

#[derive(Debug, Deserialize)]
struct IndexInfo {
    version: String,
}

/// Installs and upgrades the web application package inside its own
/// environment via `conda run ... pip`.
pub struct PackageInstaller {
    runtime: Handle,
    config: Arc<InstallationConfig>,
    settings: Arc<ConfigStore>,
    runner: Arc<dyn CommandRunner>,
    environments: Arc<EnvironmentManager>,
    downloader: Downloader,
    reporter: StatusReporter,
}

impl PackageInstaller {
    pub fn new(
        runtime: Handle,
        config: Arc<InstallationConfig>,
        settings: Arc<ConfigStore>,
        runner: Arc<dyn CommandRunner>,
        environments: Arc<EnvironmentManager>,
        downloader: Downloader,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            runtime,
            config,
            settings,
            runner,
            environments,
            downloader,
            reporter,
        }
    }

    pub fn env_dir(&self) -> PathBuf {
        self.config.webui_env_dir.clone()
    }

    pub fn package_name(&self) -> String {
        self.settings.settings().package_name
    }

    pub fn check_requirements(&self) -> Result<()> {
        if !self.config.conda_exe.exists() {
            return Err(LauncherError::RuntimeNotInstalled);
        }
        Ok(())
    }

    /// True only when the environment is complete and the package manager
    /// reports metadata for the expected package.
    pub async fn check_installed(&self) -> bool {
        if !EnvironmentManager::is_ready(&self.env_dir()) {
            info!("Conda environment for {} is not set up.", self.package_name());
            return false;
        }
        match self.show().await {
            Ok(output) => {
                let expected = self.package_name();
                parse_show_field(&output.stdout, "Name")
                    .map(|name| same_package(name, &expected))
                    .unwrap_or(false)
            }
            Err(err) => {
                info!("{} is not installed: {err}", self.package_name());
                false
            }
        }
    }

    pub async fn installed_version(&self) -> Option<String> {
        if !EnvironmentManager::is_ready(&self.env_dir()) {
            return None;
        }
        let output = self.show().await.ok()?;
        parse_show_field(&output.stdout, "Version").map(str::to_string)
    }

    /// Latest published version according to the package index JSON API.
    pub async fn latest_version(&self) -> Result<String> {
        let settings = self.settings.settings();
        let url = format!(
            "{}/{}/json",
            settings.package_index_url.trim_end_matches('/'),
            settings.package_name
        );
        let response: IndexResponse = self.downloader.get_json(&url, INDEX_TIMEOUT).await?;
        Ok(response.info.version.trim().to_string())
    }

    /// Plain string comparison: any textual difference counts as an update.
    /// Lookup failures read as "no update".
    pub async fn update_available(&self) -> bool {
        let Some(installed) = self.installed_version().await else {
            info!("Installed version unknown; assuming no update.");
            return false;
        };
        match self.latest_version().await {
            Ok(latest) => {
                let available = installed != latest;
                if available {
                    info!("Update available: installed {installed}, latest {latest}.");
                } else {
                    info!("{} is up to date ({installed}).", self.package_name());
                }
                available
            }
            Err(err) => {
                warn!("Error fetching latest version: {err}");
                false
            }
        }
    }

    /// Runs the update check in the background and hands the answer to
    /// `callback` exactly once.
    pub fn check_update<F>(self: &Arc<Self>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let installer = Arc::clone(self);
        self.runtime.spawn(async move {
            let available = installer.update_available().await;
            callback(available);
        })
    }

    pub async fn setup_environment(&self) -> Result<PathBuf> {
        self.environments
            .setup_environment(WEBUI_ENV_NAME, &[])
            .await
    }

    pub async fn install(&self) -> Result<()> {
        let package = self.package_name();
        if !EnvironmentManager::is_ready(&self.env_dir()) {
            self.setup_environment().await?;
        }

        self.reporter.progress(
            format!("Step: [1/2] Installing {package}..."),
            "Installing with pip. This can take 10-20 minutes depending on your computer.",
            50,
        );
        let command = self.pip(["install", package.as_str()]);
        if let Err(err) = self.runner.run(&command).await {
            self.reporter.failure("Installation Failed.", &err);
            return Err(err);
        }

        info!("{package} installation complete.");
        self.reporter.progress(
            "Step: [2/2] Installation Complete.",
            format!("{package} installed successfully."),
            100,
        );
        Ok(())
    }

    /// Upgrades in place. The resulting version is not re-checked.
    pub async fn update(&self) -> Result<()> {
        let package = self.package_name();
        if !EnvironmentManager::is_ready(&self.env_dir()) {
            let err = LauncherError::NotInstalled(package);
            self.reporter.failure("Update Failed", &err);
            return Err(err);
        }

        self.reporter.progress(
            "Step: [2/2] Updating...",
            format!("Updating {package}. Please wait."),
            50,
        );
        let command = self.pip(["install", "--upgrade", package.as_str()]);
        if let Err(err) = self.runner.run(&command).await {
            self.reporter.failure("Update Failed", &err);
            return Err(err);
        }
        info!("{package} updated successfully.");
        Ok(())
    }

    /// `conda run` wraps the server, so the worker is found by name among
    /// its descendants.
    pub fn launch_spec(&self) -> LaunchSpec {
        let settings = self.settings.settings();
        let command = CommandSpec::new(&self.config.conda_exe)
            .args(["run", "--prefix"])
            .arg(self.env_dir().display().to_string())
            .args(["--no-capture-output", "open-webui", "serve", "--host"])
            .arg(settings.webui_host)
            .arg("--port")
            .arg(settings.webui_port.to_string())
            .current_dir(&self.config.base_dir)
            .env("PYTHONUNBUFFERED", "1");
        LaunchSpec {
            name: WEBUI_PROCESS.to_string(),
            command,
            worker: WorkerMatch::Descendant("open-webui".to_string()),
        }
    }

    async fn show(&self) -> Result<CommandOutput> {
        let package = self.package_name();
        let command = self.pip(["show", package.as_str()]);
        self.runner.run(&command).await
    }

    fn pip<'a>(&self, pip_args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        CommandSpec::new(&self.config.conda_exe)
            .args(["run", "--prefix"])
            .arg(self.env_dir().display().to_string())
            .arg("pip")
            .args(pip_args)
            .timeout(self.settings.settings().command_timeout())
    }
}

/// Value of a `Key: value` line from `pip show` output.
pub fn parse_show_field<'a>(output: &'a str, field: &str) -> Option<&'a str> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(field)?.strip_prefix(':'))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn same_package(reported: &str, expected: &str) -> bool {
    let normalize = |name: &str| name.trim().to_ascii_lowercase().replace('_', "-");
    normalize(reported) == normalize(expected)
}
