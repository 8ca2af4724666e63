use crate::{
    config::{ConfigStore, InstallationConfig},
    error::{LauncherError, Result},
    runner::{CommandRunner, CommandSpec},
    status::StatusReporter,
};
use log::{info, warn};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Written only after `conda create` succeeded. A directory without it is an
/// interrupted creation, not an environment.
pub const COMPLETION_MARKER: &str = ".webui-launcher-complete";

pub struct EnvironmentManager {
    config: Arc<InstallationConfig>,
    settings: Arc<ConfigStore>,
    runner: Arc<dyn CommandRunner>,
    reporter: StatusReporter,
}

impl EnvironmentManager {
    pub fn new(
        config: Arc<InstallationConfig>,
        settings: Arc<ConfigStore>,
        runner: Arc<dyn CommandRunner>,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            config,
            settings,
            runner,
            reporter,
        }
    }

    pub fn env_path(&self, name: &str) -> PathBuf {
        self.config.base_dir.join(name)
    }

    pub fn is_ready(env_dir: &Path) -> bool {
        env_dir.join(COMPLETION_MARKER).is_file()
    }

    /// Creates `<base>/<name>` with the pinned interpreter plus
    /// `extra_packages`. Idempotent: a completed environment is left alone.
    pub async fn setup_environment(&self, name: &str, extra_packages: &[&str]) -> Result<PathBuf> {
        let env_dir = self.env_path(name);

        if !self.config.conda_exe.exists() {
            let err = LauncherError::RuntimeNotInstalled;
            self.reporter
                .failure(format!("Environment `{name}` Not Created."), &err);
            return Err(err);
        }

        if Self::is_ready(&env_dir) {
            info!("Environment {name} already exists. Skipping setup.");
            self.reporter.progress(
                "Step: [2/2] Environment has been setup",
                format!("Environment `{name}` is already set up."),
                100,
            );
            return Ok(env_dir);
        }

        if env_dir.exists() {
            warn!("Environment {env_dir:?} has no completion marker; recreating it.");
            if let Err(err) = tokio::fs::remove_dir_all(&env_dir).await {
                let err = LauncherError::Io(err);
                self.reporter
                    .failure(format!("Environment `{name}` Setup Failed."), &err);
                return Err(err);
            }
        }

        self.reporter.progress(
            "Step: [1/2] Setting Up Environment...",
            format!("Creating a Conda environment `{name}`. This can take a few minutes."),
            50,
        );

        let settings = self.settings.settings();
        let command = CommandSpec::new(&self.config.conda_exe)
            .args(["create", "--prefix"])
            .arg(env_dir.display().to_string())
            .arg(format!("python={}", settings.python_version))
            .args(extra_packages.iter().copied())
            .arg("-y")
            .timeout(settings.command_timeout());

        if let Err(err) = self.runner.run(&command).await {
            self.reporter
                .failure(format!("Environment `{name}` Setup Failed."), &err);
            return Err(err);
        }

        tokio::fs::create_dir_all(&env_dir).await?;
        tokio::fs::write(env_dir.join(COMPLETION_MARKER), env!("CARGO_PKG_VERSION")).await?;
        info!("Environment {name} set up successfully.");
        self.reporter.progress(
            "Step: [2/2] Environment has been setup",
            format!("Created the Conda environment `{name}`."),
            100,
        );
        Ok(env_dir)
    }
}
