use crate::env_flags;
use anyhow::{anyhow, Context, Result};
use directories::BaseDirs;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

const SETTINGS_FILE: &str = "settings.json";
const DEFAULT_BASE_DIR_NAME: &str = "OpenWebUI";
const RUNTIME_DIR: &str = "miniconda3";
const WEBUI_ENV_DIR: &str = "env";
const PIPELINES_ENV_DIR: &str = "env_pipelines";
const PIPELINES_REPO_DIR: &str = "pipelines";
const DOWNLOADS_DIR: &str = "downloads";
const LOGS_DIR: &str = "logs";

/// Where everything lives on disk. Built once and shared read-only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallationConfig {
    pub base_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub webui_env_dir: PathBuf,
    pub pipelines_env_dir: PathBuf,
    pub pipelines_repo_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub conda_exe: PathBuf,
}

impl InstallationConfig {
    /// Resolves the base directory from `WEBUI_LAUNCHER_HOME`, falling back
    /// to `~/OpenWebUI`.
    pub fn resolve() -> Result<Self> {
        if let Some(base) = env_flags::launcher_home_override() {
            return Ok(Self::for_base(base));
        }
        let base = BaseDirs::new()
            .ok_or_else(|| anyhow!("unable to resolve the home directory"))?;
        Ok(Self::for_base(base.home_dir().join(DEFAULT_BASE_DIR_NAME)))
    }

    pub fn for_base(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let runtime_dir = base_dir.join(RUNTIME_DIR);
        let conda_exe = conda_executable(&runtime_dir);
        Self {
            webui_env_dir: base_dir.join(WEBUI_ENV_DIR),
            pipelines_env_dir: base_dir.join(PIPELINES_ENV_DIR),
            pipelines_repo_dir: base_dir.join(PIPELINES_REPO_DIR),
            downloads_dir: base_dir.join(DOWNLOADS_DIR),
            logs_dir: base_dir.join(LOGS_DIR),
            runtime_dir,
            conda_exe,
            base_dir,
        }
    }

    pub fn pid_file(&self, logical_name: &str) -> PathBuf {
        self.base_dir.join(format!("{logical_name}.pid"))
    }
}

#[cfg(windows)]
fn conda_executable(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("Scripts").join("conda.exe")
}

#[cfg(not(windows))]
fn conda_executable(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("bin").join("conda")
}

/// Persisted, user-editable settings next to the installation.
#[derive(Debug)]
pub struct ConfigStore {
    settings_path: PathBuf,
    settings: RwLock<LauncherSettings>,
}

impl ConfigStore {
    pub fn open(config: &InstallationConfig) -> Result<Self> {
        fs::create_dir_all(&config.base_dir).with_context(|| {
            format!("failed to create base directory {:?}", config.base_dir)
        })?;

        let settings_path = config.base_dir.join(SETTINGS_FILE);
        let settings = if settings_path.exists() {
            let data = fs::read(&settings_path)
                .with_context(|| format!("failed to read settings file {settings_path:?}"))?;
            serde_json::from_slice(&data)
                .with_context(|| format!("failed to parse settings from {settings_path:?}"))?
        } else {
            info!("No settings at {settings_path:?}; using defaults.");
            LauncherSettings::default()
        };

        Ok(Self {
            settings_path,
            settings: RwLock::new(settings),
        })
    }

    /// In-memory store, nothing is written unless `update_settings` is called.
    pub fn with_settings(config: &InstallationConfig, settings: LauncherSettings) -> Self {
        Self {
            settings_path: config.base_dir.join(SETTINGS_FILE),
            settings: RwLock::new(settings),
        }
    }

    pub fn settings(&self) -> LauncherSettings {
        self.settings
            .read()
            .expect("settings lock poisoned")
            .clone()
    }

    pub fn update_settings<F>(&self, mutate: F) -> Result<LauncherSettings>
    where
        F: FnOnce(&mut LauncherSettings),
    {
        let mut guard = self
            .settings
            .write()
            .expect("settings lock poisoned for write");
        mutate(&mut guard);
        let snapshot = guard.clone();
        self.persist_locked(&snapshot)?;
        Ok(snapshot)
    }

    fn persist_locked(&self, settings: &LauncherSettings) -> Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create settings directory {parent:?}"))?;
        }
        let data = serde_json::to_vec_pretty(settings)?;
        fs::write(&self.settings_path, data)
            .with_context(|| format!("failed to write settings to {:?}", self.settings_path))?;
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LauncherSettings {
    pub runtime_installer_url: String,
    pub python_version: String,
    pub package_name: String,
    pub package_index_url: String,
    pub pipelines_repo_url: String,
    pub webui_host: String,
    pub webui_port: u16,
    pub pipelines_host: String,
    pub pipelines_port: u16,
    pub forwarded_allow_ips: String,
    pub open_browser: bool,
    pub discovery_interval_ms: u64,
    pub discovery_attempts: u32,
    pub readiness_interval_ms: u64,
    pub readiness_attempts: u32,
    pub command_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub required_disk_space_gb: f64,
    pub ollama_installer_url: String,
    pub ollama_port: u16,
    pub ollama_required_disk_space_gb: f64,
}

impl LauncherSettings {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn webui_url(&self) -> String {
        format!("http://{}:{}", self.webui_host, self.webui_port)
    }
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            runtime_installer_url: default_runtime_installer_url().to_string(),
            python_version: "3.11".to_string(),
            package_name: "open-webui".to_string(),
            package_index_url: "https://pypi.org/pypi".to_string(),
            pipelines_repo_url: "https://github.com/open-webui/pipelines.git".to_string(),
            webui_host: "localhost".to_string(),
            webui_port: 8080,
            pipelines_host: "127.0.0.1".to_string(),
            pipelines_port: 9099,
            forwarded_allow_ips: "127.0.0.1".to_string(),
            open_browser: true,
            discovery_interval_ms: 3_000,
            discovery_attempts: 60,
            readiness_interval_ms: 2_000,
            readiness_attempts: 120,
            command_timeout_secs: 60 * 60,
            download_timeout_secs: 30 * 60,
            required_disk_space_gb: 4.5,
            ollama_installer_url: default_ollama_installer_url().to_string(),
            ollama_port: 11434,
            ollama_required_disk_space_gb: 3.5,
        }
    }
}

pub(crate) fn default_runtime_installer_url() -> &'static str {
    if cfg!(windows) {
        "https://repo.anaconda.com/miniconda/Miniconda3-latest-Windows-x86_64.exe"
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "https://repo.anaconda.com/miniconda/Miniconda3-latest-MacOSX-arm64.sh"
    } else if cfg!(target_os = "macos") {
        "https://repo.anaconda.com/miniconda/Miniconda3-latest-MacOSX-x86_64.sh"
    } else if cfg!(target_arch = "aarch64") {
        "https://repo.anaconda.com/miniconda/Miniconda3-latest-Linux-aarch64.sh"
    } else {
        "https://repo.anaconda.com/miniconda/Miniconda3-latest-Linux-x86_64.sh"
    }
}

pub(crate) fn default_ollama_installer_url() -> &'static str {
    if cfg!(windows) {
        "https://ollama.com/download/OllamaSetup.exe"
    } else {
        "https://ollama.com/install.sh"
    }
}
