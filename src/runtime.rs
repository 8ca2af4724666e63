use crate::{
    config::{ConfigStore, InstallationConfig},
    download::Downloader,
    error::{LauncherError, Result},
    runner::{CommandRunner, CommandSpec},
    status::StatusReporter,
};
use log::info;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

#[cfg(windows)]
const INSTALLER_FILE: &str = "MinicondaInstaller.exe";
#[cfg(not(windows))]
const INSTALLER_FILE: &str = "MinicondaInstaller.sh";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionState {
    NotInstalled,
    Downloading,
    Installing,
    Installed,
}

/// Ensures the self-contained Python distribution (Miniconda) exists under
/// the installation directory.
pub struct RuntimeProvisioner {
    config: Arc<InstallationConfig>,
    settings: Arc<ConfigStore>,
    runner: Arc<dyn CommandRunner>,
    downloader: Downloader,
    reporter: StatusReporter,
    state: Mutex<ProvisionState>,
    install_lock: tokio::sync::Mutex<()>,
}

impl RuntimeProvisioner {
    pub fn new(
        config: Arc<InstallationConfig>,
        settings: Arc<ConfigStore>,
        runner: Arc<dyn CommandRunner>,
        downloader: Downloader,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            config,
            settings,
            runner,
            downloader,
            reporter,
            state: Mutex::new(ProvisionState::NotInstalled),
            install_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Filesystem check only: the package manager executable is present.
    pub fn check_installed(&self) -> bool {
        self.config.conda_exe.exists()
    }

    pub fn state(&self) -> ProvisionState {
        if self.check_installed() {
            return ProvisionState::Installed;
        }
        *self.state.lock().expect("provision state poisoned")
    }

    pub fn conda_exe(&self) -> &Path {
        &self.config.conda_exe
    }

    pub fn installer_path(&self) -> PathBuf {
        self.config.downloads_dir.join(INSTALLER_FILE)
    }

    pub fn check_requirements(&self) -> Result<()> {
        if !self.config.base_dir.exists() {
            std::fs::create_dir_all(&self.config.base_dir)?;
            info!("Created base directory {:?}", self.config.base_dir);
        }
        Ok(())
    }

    /// Downloads (or reuses) the installer and runs it unattended. Failures
    /// are reported and returned; nothing is retried here.
    pub async fn install(&self) -> Result<()> {
        let _guard = self.install_lock.lock().await;

        if self.check_installed() {
            self.set_state(ProvisionState::Installed);
            self.reporter.progress(
                "Step: [3/3] Miniconda Already Installed.",
                "Miniconda is already installed. Skipping installation.",
                100,
            );
            return Ok(());
        }

        match self.provision().await {
            Ok(()) => {
                self.set_state(ProvisionState::Installed);
                self.reporter.progress(
                    "Step: [3/3] Installation Complete.",
                    "Miniconda installation completed successfully.",
                    100,
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(ProvisionState::NotInstalled);
                self.reporter.failure("Miniconda Installation Failed.", &err);
                Err(err)
            }
        }
    }

    /// Updates the runtime's own package manager.
    pub async fn update(&self) -> Result<()> {
        if !self.check_installed() {
            let err = LauncherError::RuntimeNotInstalled;
            self.reporter.failure("Miniconda Update Failed.", &err);
            return Err(err);
        }
        self.reporter.progress(
            "Step: Updating Miniconda...",
            "Updating conda in the base environment.",
            30,
        );
        let settings = self.settings.settings();
        let command = CommandSpec::new(&self.config.conda_exe)
            .args(["update", "-n", "base", "-c", "defaults", "conda", "-y"])
            .timeout(settings.command_timeout());
        if let Err(err) = self.runner.run(&command).await {
            self.reporter.failure("Miniconda Update Failed.", &err);
            return Err(err);
        }
        info!("Miniconda updated successfully.");
        Ok(())
    }

    async fn provision(&self) -> Result<()> {
        self.check_requirements()?;
        self.ensure_installer().await?;

        self.set_state(ProvisionState::Installing);
        self.reporter.progress(
            "Step: [2/3] Installing Miniconda...",
            "Running the Miniconda installer. Please wait.",
            60,
        );
        let settings = self.settings.settings();
        let command = self.installer_command().timeout(settings.command_timeout());
        self.runner.run(&command).await?;

        if !self.check_installed() {
            return Err(LauncherError::ExecutableNotFound(
                self.config.conda_exe.display().to_string(),
            ));
        }
        Ok(())
    }

    async fn ensure_installer(&self) -> Result<()> {
        let installer = self.installer_path();
        if installer.exists() {
            self.reporter.progress(
                "Step: [1/3] Installer Found.",
                "Miniconda installer already exists. Skipping download.",
                30,
            );
            return Ok(());
        }

        self.set_state(ProvisionState::Downloading);
        self.reporter.progress(
            "Step: [1/3] Downloading Miniconda...",
            "Downloading the Miniconda installer. This may take a few minutes.",
            10,
        );
        let settings = self.settings.settings();
        self.downloader
            .fetch_to_file(
                &settings.runtime_installer_url,
                &installer,
                settings.download_timeout(),
            )
            .await?;
        self.reporter.progress(
            "Step: [1/3] Download Complete.",
            "Miniconda installer downloaded successfully.",
            30,
        );
        Ok(())
    }

    /// Silent install: no shortcuts, no PATH changes, fixed target directory.
    #[cfg(windows)]
    pub fn installer_command(&self) -> CommandSpec {
        CommandSpec::new(self.installer_path()).args([
            "/S".to_string(),
            "/InstallationType=JustMe".to_string(),
            "/AddToPath=0".to_string(),
            "/RegisterPython=0".to_string(),
            "/NoShortcuts=1".to_string(),
            format!("/D={}", self.config.runtime_dir.display()),
        ])
    }

    /// Batch mode leaves shell profiles untouched.
    #[cfg(not(windows))]
    pub fn installer_command(&self) -> CommandSpec {
        CommandSpec::new("bash").args([
            self.installer_path().display().to_string(),
            "-b".to_string(),
            "-p".to_string(),
            self.config.runtime_dir.display().to_string(),
        ])
    }

    fn set_state(&self, state: ProvisionState) {
        *self.state.lock().expect("provision state poisoned") = state;
    }
}
