use crate::{
    config::{ConfigStore, InstallationConfig},
    disk,
    download::Downloader,
    error::Result,
    runner::spawn_error,
    status::StatusReporter,
    supervisor::port_open,
};
use log::{info, warn};
use std::{fs, path::PathBuf, process::Stdio, sync::Arc};
use tokio::process::Command;

#[cfg(windows)]
const INSTALLER_FILE: &str = "OllamaSetup.exe";
#[cfg(not(windows))]
const INSTALLER_FILE: &str = "ollama-install.sh";

const INSTALLER_LOG: &str = "ollama-installer.log";

/// Hands the Ollama model server over to its own installer. Ollama manages
/// its service itself, so "installed" means its local port answers.
pub struct OllamaInstaller {
    config: Arc<InstallationConfig>,
    settings: Arc<ConfigStore>,
    downloader: Downloader,
    reporter: StatusReporter,
}

impl OllamaInstaller {
    pub fn new(
        config: Arc<InstallationConfig>,
        settings: Arc<ConfigStore>,
        downloader: Downloader,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            config,
            settings,
            downloader,
            reporter,
        }
    }

    pub fn installer_path(&self) -> PathBuf {
        self.config.downloads_dir.join(INSTALLER_FILE)
    }

    pub async fn check_installed(&self) -> bool {
        port_open("127.0.0.1", self.settings.settings().ollama_port).await
    }

    pub fn check_requirements(&self) -> Result<()> {
        let required_gb = self.settings.settings().ollama_required_disk_space_gb;
        disk::ensure_space(&self.config.base_dir, required_gb)
    }

    pub fn has_enough_space(&self) -> bool {
        let required_gb = self.settings.settings().ollama_required_disk_space_gb;
        disk::has_enough_space(&self.config.base_dir, required_gb)
    }

    /// Downloads the current installer and launches it without waiting; the
    /// installer finishes on its own.
    pub async fn install(&self) -> Result<()> {
        match self.download_and_launch().await {
            Ok(pid) => {
                info!("Ollama installer running with PID {pid}.");
                self.reporter.progress(
                    "Step: [3/3] Ollama Installation Started",
                    "The Ollama installer should be visible soon.",
                    100,
                );
                Ok(())
            }
            Err(err) => {
                self.reporter.failure("Ollama Installation Failed.", &err);
                Err(err)
            }
        }
    }

    async fn download_and_launch(&self) -> Result<u32> {
        self.reporter.progress(
            "Step: [1/3] Downloading Ollama...",
            "Downloading the Ollama installer. Please wait.",
            0,
        );
        let settings = self.settings.settings();
        let installer = self.installer_path();
        self.downloader
            .fetch_to_file(
                &settings.ollama_installer_url,
                &installer,
                settings.download_timeout(),
            )
            .await?;

        self.reporter.progress(
            "Step: [2/3] Running Installer...",
            "Running the Ollama installer. Follow the on-screen instructions.",
            50,
        );
        self.launch_installer()
    }

    fn launch_installer(&self) -> Result<u32> {
        fs::create_dir_all(&self.config.logs_dir)?;
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.config.logs_dir.join(INSTALLER_LOG))?;
        let log_err = log.try_clone()?;

        let mut cmd = self.installer_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false);
        let program = self.installer_path();
        let mut child = cmd.spawn().map_err(|err| spawn_error(&program, err))?;
        let pid = child.id().unwrap_or_default();

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("Ollama installer exited with {status}."),
                Err(err) => warn!("Failed to wait on the Ollama installer: {err}"),
            }
        });
        Ok(pid)
    }

    /// The Windows setup program is interactive and keeps its window.
    #[cfg(windows)]
    fn installer_command(&self) -> Command {
        Command::new(self.installer_path())
    }

    #[cfg(not(windows))]
    fn installer_command(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg(self.installer_path());
        cmd
    }
}
