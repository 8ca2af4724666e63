use crate::{
    config::{ConfigStore, InstallationConfig},
    download::Downloader,
    environment::EnvironmentManager,
    launcher::Launcher,
    ollama::OllamaInstaller,
    package::PackageInstaller,
    plugin::RepoPluginInstaller,
    probe::InstallationStateProbe,
    runner::{CommandRunner, ProcessRunner},
    runtime::RuntimeProvisioner,
    status::StatusReporter,
    supervisor::ProcessSupervisor,
};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

pub const APP_NAME: &str = "WebUI Launcher";

/// Everything a front end needs, wired once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub runtime: Arc<Runtime>,
    pub config: Arc<InstallationConfig>,
    pub settings: Arc<ConfigStore>,
    pub launcher: Arc<Launcher>,
}

impl AppContext {
    /// Resolves the installation directory and builds every component on a
    /// fresh multi-threaded runtime with the real process runner.
    pub fn new(reporter: StatusReporter) -> Result<Self> {
        let config = Arc::new(InstallationConfig::resolve()?);
        let settings = Arc::new(ConfigStore::open(&config)?);
        Self::with_parts(config, settings, Arc::new(ProcessRunner::new()), reporter)
    }

    pub fn with_parts(
        config: Arc<InstallationConfig>,
        settings: Arc<ConfigStore>,
        runner: Arc<dyn CommandRunner>,
        reporter: StatusReporter,
    ) -> Result<Self> {
        let runtime = Arc::new(
            Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| anyhow!("failed to create Tokio runtime: {err}"))?,
        );
        let launcher = build_launcher(
            runtime.handle().clone(),
            Arc::clone(&config),
            Arc::clone(&settings),
            runner,
            reporter,
        )?;

        Ok(Self {
            runtime,
            config,
            settings,
            launcher: Arc::new(launcher),
        })
    }
}

/// Wires the installers, supervisor and probe around one runner and one
/// reporter. Callers that already own a runtime pass its handle.
pub fn build_launcher(
    handle: tokio::runtime::Handle,
    config: Arc<InstallationConfig>,
    settings: Arc<ConfigStore>,
    runner: Arc<dyn CommandRunner>,
    reporter: StatusReporter,
) -> Result<Launcher> {
    let downloader = Downloader::new().context("failed to build HTTP client")?;

    let environments = Arc::new(EnvironmentManager::new(
        Arc::clone(&config),
        Arc::clone(&settings),
        Arc::clone(&runner),
        reporter.clone(),
    ));
    let runtime = Arc::new(RuntimeProvisioner::new(
        Arc::clone(&config),
        Arc::clone(&settings),
        Arc::clone(&runner),
        downloader.clone(),
        reporter.clone(),
    ));
    let package = Arc::new(PackageInstaller::new(
        handle.clone(),
        Arc::clone(&config),
        Arc::clone(&settings),
        Arc::clone(&runner),
        Arc::clone(&environments),
        downloader.clone(),
        reporter.clone(),
    ));
    let plugin = Arc::new(RepoPluginInstaller::new(
        Arc::clone(&config),
        Arc::clone(&settings),
        runner,
        environments,
        reporter.clone(),
    ));
    let ollama = Arc::new(OllamaInstaller::new(
        Arc::clone(&config),
        Arc::clone(&settings),
        downloader,
        reporter.clone(),
    ));
    let supervisor = Arc::new(ProcessSupervisor::new(
        Arc::clone(&config),
        Arc::clone(&settings),
        reporter.clone(),
    ));
    let probe = Arc::new(InstallationStateProbe::new(
        Arc::clone(&config),
        Arc::clone(&settings),
        Arc::clone(&runtime),
        Arc::clone(&package),
        Arc::clone(&plugin),
        Arc::clone(&ollama),
    ));

    Ok(Launcher::new(
        handle, config, settings, runtime, package, plugin, ollama, supervisor, probe, reporter,
    ))
}
