use crate::{
    config::{ConfigStore, InstallationConfig},
    environment::EnvironmentManager,
    error::{LauncherError, Result},
    runner::{CommandRunner, CommandSpec},
    status::StatusReporter,
    supervisor::{LaunchSpec, WorkerMatch},
};
use log::{info, warn};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

pub const PIPELINES_ENV_NAME: &str = "env_pipelines";
pub const PIPELINES_PROCESS: &str = "pipelines";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Clones the pipelines repository into its own environment and keeps its
/// declared dependencies installed.
pub struct RepoPluginInstaller {
    config: Arc<InstallationConfig>,
    settings: Arc<ConfigStore>,
    runner: Arc<dyn CommandRunner>,
    environments: Arc<EnvironmentManager>,
    reporter: StatusReporter,
}

impl RepoPluginInstaller {
    pub fn new(
        config: Arc<InstallationConfig>,
        settings: Arc<ConfigStore>,
        runner: Arc<dyn CommandRunner>,
        environments: Arc<EnvironmentManager>,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            config,
            settings,
            runner,
            environments,
            reporter,
        }
    }

    pub fn env_dir(&self) -> &Path {
        &self.config.pipelines_env_dir
    }

    pub fn repo_dir(&self) -> &Path {
        &self.config.pipelines_repo_dir
    }

    /// Structural check only; the checkout contents are not verified.
    pub fn check_installed(&self) -> bool {
        EnvironmentManager::is_ready(self.env_dir()) && self.repo_dir().exists()
    }

    pub fn check_requirements(&self) -> Result<()> {
        if !self.config.conda_exe.exists() {
            return Err(LauncherError::RuntimeNotInstalled);
        }
        Ok(())
    }

    /// The pipelines environment carries its own `git`.
    pub async fn setup_environment(&self) -> Result<PathBuf> {
        self.environments
            .setup_environment(PIPELINES_ENV_NAME, &["git"])
            .await
    }

    pub async fn install(&self) -> Result<()> {
        match self.install_inner().await {
            Ok(()) => {
                self.reporter.progress(
                    "Step: [3/3] Pipelines Installed.",
                    "Pipelines installation complete.",
                    100,
                );
                Ok(())
            }
            Err(err) => {
                self.reporter.failure("Pipelines Installation Failed.", &err);
                Err(err)
            }
        }
    }

    /// Pulls the checkout and reinstalls dependencies, whether or not the
    /// manifest changed.
    pub async fn update(&self) -> Result<()> {
        match self.update_inner().await {
            Ok(()) => {
                self.reporter.progress(
                    "Update Complete",
                    "Pipelines have been updated successfully.",
                    100,
                );
                Ok(())
            }
            Err(err) => {
                self.reporter.failure("Pipelines Update Failed.", &err);
                Err(err)
            }
        }
    }

    /// Compares local HEAD with the fetched remote tip of the current
    /// branch. Fetch or git failures read as "no update".
    pub async fn update_available(&self) -> bool {
        if !self.repo_dir().join(".git").exists() {
            return false;
        }
        match self.remote_differs().await {
            Ok(differs) => differs,
            Err(err) => {
                warn!("Could not check pipelines for updates: {err}");
                false
            }
        }
    }

    pub fn interpreter_candidates(&self) -> Vec<PathBuf> {
        let env = self.env_dir();
        vec![
            env.join("python.exe"),
            env.join("bin").join("python"),
            env.join("Scripts").join("python.exe"),
            env.join("bin").join("python3"),
        ]
    }

    pub fn find_interpreter(&self) -> Result<PathBuf> {
        let candidates = self.interpreter_candidates();
        candidates
            .iter()
            .find(|candidate| candidate.exists())
            .cloned()
            .ok_or(LauncherError::InterpreterNotFound { tried: candidates })
    }

    /// ASGI server on the configured host/port, run from the checkout.
    pub fn launch_spec(&self) -> Result<LaunchSpec> {
        let settings = self.settings.settings();
        let python = self.find_interpreter()?;
        let command = CommandSpec::new(python)
            .args(["-m", "uvicorn", "main:app", "--host"])
            .arg(settings.pipelines_host)
            .arg("--port")
            .arg(settings.pipelines_port.to_string())
            .arg("--forwarded-allow-ips")
            .arg(settings.forwarded_allow_ips)
            .current_dir(self.repo_dir())
            .env("PYTHONUNBUFFERED", "1");
        Ok(LaunchSpec {
            name: PIPELINES_PROCESS.to_string(),
            command,
            worker: WorkerMatch::Spawned,
        })
    }

    async fn install_inner(&self) -> Result<()> {
        if !self.repo_dir().exists() {
            let url = self.settings.settings().pipelines_repo_url;
            self.reporter.progress(
                "Step: [1/3] Cloning Pipelines...",
                format!("Cloning the pipelines repository from {url}."),
                20,
            );
            let command = CommandSpec::new(self.git_program())
                .arg("clone")
                .arg(url)
                .arg(self.repo_dir().display().to_string())
                .current_dir(&self.config.base_dir)
                .timeout(self.settings.settings().command_timeout());
            self.runner.run(&command).await?;
            info!("Pipelines repository cloned successfully.");
        } else {
            info!("Pipelines repository already exists. Skipping cloning.");
        }

        self.install_dependencies("Step: [2/3] Installing Dependencies...", 60)
            .await
    }

    async fn update_inner(&self) -> Result<()> {
        if !self.repo_dir().exists() {
            return Err(LauncherError::RepoNotCloned(self.repo_dir().to_path_buf()));
        }

        self.reporter.progress(
            "Step: [1/2] Updating Pipelines...",
            "Pulling the latest changes.",
            30,
        );
        self.git(["pull", "--ff-only"]).await?;
        info!("Pipelines repository updated successfully.");

        self.install_dependencies("Step: [2/2] Updating Dependencies...", 70)
            .await
    }

    async fn install_dependencies(&self, headline: &str, progress: u8) -> Result<()> {
        let requirements = self.repo_dir().join(REQUIREMENTS_FILE);
        if !requirements.exists() {
            info!("No {REQUIREMENTS_FILE} found. Skipping dependency installation.");
            return Ok(());
        }

        let python = self.find_interpreter()?;
        self.reporter.progress(
            headline,
            format!("Installing dependencies from {}.", requirements.display()),
            progress,
        );
        let command = CommandSpec::new(python)
            .args(["-m", "pip", "install", "-r"])
            .arg(requirements.display().to_string())
            .current_dir(self.repo_dir())
            .timeout(self.settings.settings().command_timeout());
        self.runner.run(&command).await?;
        info!("Dependencies installed successfully.");
        Ok(())
    }

    async fn remote_differs(&self) -> Result<bool> {
        let branch = self.git(["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        self.git(["fetch", "origin", branch.as_str()]).await?;
        let local = self.git(["rev-parse", "HEAD"]).await?;
        let remote = self.git(["rev-parse", "FETCH_HEAD"]).await?;
        info!("Pipelines local {local}, remote {remote}.");
        Ok(local != remote)
    }

    /// Runs git inside the checkout and returns the first line of stdout.
    async fn git<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> Result<String> {
        let command = CommandSpec::new(self.git_program())
            .arg("-C")
            .arg(self.repo_dir().display().to_string())
            .args(args)
            .timeout(self.settings.settings().command_timeout());
        let output = self.runner.run(&command).await?;
        Ok(output.stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    fn git_program(&self) -> PathBuf {
        let env = self.env_dir();
        [
            env.join("Library").join("bin").join("git.exe"),
            env.join("bin").join("git"),
        ]
        .into_iter()
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from("git"))
    }
}
