use crate::{
    config::{ConfigStore, InstallationConfig},
    disk,
    environment::EnvironmentManager,
    ollama::OllamaInstaller,
    package::PackageInstaller,
    plugin::RepoPluginInstaller,
    runtime::RuntimeProvisioner,
};
use log::info;
use std::sync::Arc;

/// Snapshot of what is on disk (and, optionally, upstream) right now.
/// Recomputed on every probe; never cached.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallationState {
    pub runtime_installed: bool,
    pub environment_exists: bool,
    pub package_installed: bool,
    pub installed_version: Option<String>,
    pub latest_version: Option<String>,
    pub update_available: bool,
    pub repo_cloned: bool,
    pub repo_up_to_date: bool,
    pub enough_disk_space: bool,
    pub ollama_running: bool,
    pub enough_space_for_ollama: bool,
}

/// Which user actions are valid. Everything is off while an operation is
/// in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Controls {
    pub install: bool,
    pub start: bool,
    pub stop: bool,
    pub update: bool,
    pub install_pipelines: bool,
    pub update_pipelines: bool,
    pub install_ollama: bool,
}

impl Controls {
    pub fn locked() -> Self {
        Self::default()
    }

    pub fn derive(state: &InstallationState, running: bool) -> Self {
        let idle_and_installed = state.package_installed && !running;
        Self {
            install: !state.package_installed && state.enough_disk_space,
            start: idle_and_installed,
            stop: running,
            update: idle_and_installed && state.update_available,
            install_pipelines: idle_and_installed && !state.repo_cloned,
            update_pipelines: idle_and_installed && state.repo_cloned && !state.repo_up_to_date,
            install_ollama: !state.ollama_running && state.enough_space_for_ollama,
        }
    }
}

pub struct InstallationStateProbe {
    config: Arc<InstallationConfig>,
    settings: Arc<ConfigStore>,
    runtime: Arc<RuntimeProvisioner>,
    package: Arc<PackageInstaller>,
    plugin: Arc<RepoPluginInstaller>,
    ollama: Arc<OllamaInstaller>,
}

impl InstallationStateProbe {
    pub fn new(
        config: Arc<InstallationConfig>,
        settings: Arc<ConfigStore>,
        runtime: Arc<RuntimeProvisioner>,
        package: Arc<PackageInstaller>,
        plugin: Arc<RepoPluginInstaller>,
        ollama: Arc<OllamaInstaller>,
    ) -> Self {
        Self {
            config,
            settings,
            runtime,
            package,
            plugin,
            ollama,
        }
    }

    /// Local checks only unless `check_remote` is set, in which case the
    /// package index and the plugin remote are consulted as well.
    pub async fn probe(&self, check_remote: bool) -> InstallationState {
        let required_gb = self.settings.settings().required_disk_space_gb;
        let mut state = InstallationState {
            runtime_installed: self.runtime.check_installed(),
            environment_exists: EnvironmentManager::is_ready(&self.package.env_dir()),
            repo_cloned: self.plugin.check_installed(),
            enough_disk_space: disk::has_enough_space(&self.config.base_dir, required_gb),
            ollama_running: self.ollama.check_installed().await,
            enough_space_for_ollama: self.ollama.has_enough_space(),
            ..InstallationState::default()
        };

        if state.environment_exists {
            state.package_installed = self.package.check_installed().await;
        }
        if state.package_installed {
            state.installed_version = self.package.installed_version().await;
        }

        state.repo_up_to_date = state.repo_cloned;
        if check_remote {
            if state.package_installed {
                state.latest_version = self.package.latest_version().await.ok();
                state.update_available = match (&state.installed_version, &state.latest_version) {
                    (Some(installed), Some(latest)) => installed != latest,
                    _ => false,
                };
            }
            if state.repo_cloned {
                state.repo_up_to_date = !self.plugin.update_available().await;
            }
        }

        info!("Installation state: {state:?}");
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed() -> InstallationState {
        InstallationState {
            runtime_installed: true,
            environment_exists: true,
            package_installed: true,
            installed_version: Some("0.5.4".to_string()),
            enough_disk_space: true,
            ..InstallationState::default()
        }
    }

    #[test]
    fn fresh_machine_offers_install_only() {
        let state = InstallationState {
            enough_disk_space: true,
            ..InstallationState::default()
        };
        let controls = Controls::derive(&state, false);
        assert_eq!(
            controls,
            Controls {
                install: true,
                ..Controls::locked()
            }
        );
    }

    #[test]
    fn install_needs_disk_space() {
        let controls = Controls::derive(&InstallationState::default(), false);
        assert!(!controls.install);
    }

    #[test]
    fn installed_stack_can_start_and_add_pipelines() {
        let controls = Controls::derive(&installed(), false);
        assert!(controls.start);
        assert!(controls.install_pipelines);
        assert!(!controls.stop);
        assert!(!controls.update);
        assert!(!controls.update_pipelines);
    }

    #[test]
    fn running_stack_only_offers_stop() {
        let mut state = installed();
        state.update_available = true;
        state.repo_cloned = true;
        let controls = Controls::derive(&state, true);
        assert_eq!(
            controls,
            Controls {
                stop: true,
                ..Controls::locked()
            }
        );
    }

    #[test]
    fn ollama_install_follows_its_port_and_disk() {
        let mut state = installed();
        state.enough_space_for_ollama = true;
        assert!(Controls::derive(&state, false).install_ollama);
        assert!(Controls::derive(&state, true).install_ollama);

        state.ollama_running = true;
        assert!(!Controls::derive(&state, false).install_ollama);

        state.ollama_running = false;
        state.enough_space_for_ollama = false;
        assert!(!Controls::derive(&state, false).install_ollama);
    }

    #[test]
    fn updates_are_offered_when_idle() {
        let mut state = installed();
        state.update_available = true;
        state.repo_cloned = true;
        state.repo_up_to_date = false;
        let controls = Controls::derive(&state, false);
        assert!(controls.update);
        assert!(controls.update_pipelines);
        assert!(!controls.install_pipelines);
    }
}
