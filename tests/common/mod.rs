#![allow(dead_code)]

use futures::future::{self, BoxFuture};
use std::{
    fs,
    path::Path,
    sync::{
        mpsc::{self, Receiver},
        Arc, Mutex,
    },
};
use tempfile::TempDir;
use webui_launcher::{
    config::{ConfigStore, InstallationConfig, LauncherSettings},
    error::Result,
    runner::{CommandOutput, CommandRunner, CommandSpec},
    status::{StatusEvent, StatusReporter, UiEvent},
};

type Handler = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync>;

/// Records every command and answers with `handler` instead of spawning
/// anything.
pub struct FakeRunner {
    calls: Mutex<Vec<CommandSpec>>,
    handler: Handler,
}

impl FakeRunner {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(|_| Ok(CommandOutput::ok("")))
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Number of recorded commands carrying `arg`.
    pub fn count_with_arg(&self, arg: &str) -> usize {
        self.calls().iter().filter(|call| call.has_arg(arg)).count()
    }
}

impl CommandRunner for FakeRunner {
    fn run<'a>(&'a self, command: &'a CommandSpec) -> BoxFuture<'a, Result<CommandOutput>> {
        self.calls.lock().expect("calls lock").push(command.clone());
        let result = (self.handler)(command);
        Box::pin(future::ready(result))
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: Arc<InstallationConfig>,
    pub settings: Arc<ConfigStore>,
    pub reporter: StatusReporter,
    events: Receiver<UiEvent>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    /// Fast polling and no browser; `mutate` adjusts the rest.
    pub fn with_settings(mutate: impl FnOnce(&mut LauncherSettings)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(InstallationConfig::for_base(dir.path().join("OpenWebUI")));
        fs::create_dir_all(&config.base_dir).expect("base dir");

        let mut settings = LauncherSettings {
            open_browser: false,
            discovery_interval_ms: 100,
            discovery_attempts: 50,
            readiness_interval_ms: 50,
            readiness_attempts: 40,
            command_timeout_secs: 30,
            download_timeout_secs: 30,
            required_disk_space_gb: 0.0,
            ollama_port: closed_port(),
            ollama_required_disk_space_gb: 0.0,
            ..LauncherSettings::default()
        };
        mutate(&mut settings);
        let settings = Arc::new(ConfigStore::with_settings(&config, settings));

        let (sender, events) = mpsc::channel();
        Self {
            dir,
            config,
            settings,
            reporter: StatusReporter::new(sender),
            events,
        }
    }

    /// Drains every event published so far, oldest first.
    pub fn events(&self) -> Vec<UiEvent> {
        self.events.try_iter().collect()
    }

    pub fn statuses(&self) -> Vec<StatusEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                UiEvent::Status(status) => Some(status),
                UiEvent::Controls(_) => None,
            })
            .collect()
    }

    pub fn install_fake_runtime(&self) {
        touch(&self.config.conda_exe);
    }
}

/// A loopback port nothing is listening on.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dir");
    }
    fs::write(path, b"").expect("touch file");
}

#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dir");
    }
    fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
}
