use crate::{
    config::{ConfigStore, InstallationConfig},
    env_flags,
    error::{LauncherError, Result},
    runner::{apply_background_command_flags, spawn_error, CommandSpec},
    status::StatusReporter,
};
use log::{debug, info, warn};
use std::{
    collections::{HashMap, VecDeque},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};
use sysinfo::{Pid, Process, ProcessStatus, Signal, System};
use tokio::{net::TcpStream, process::Command};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(100);

/// How the long-lived worker is found once the launch command is running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerMatch {
    /// The spawned process is the server itself.
    Spawned,
    /// The server is a descendant of the spawned wrapper whose process name
    /// contains this fragment (case-insensitive).
    Descendant(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub command: CommandSpec,
    pub worker: WorkerMatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedProcess {
    pub name: String,
    pub pid: u32,
    pub pid_file: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub command: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32 },
    /// The PID file pointed at a process that was already gone.
    AlreadyExited { pid: u32 },
}

/// Starts detached servers, tracks them through PID files and stops them
/// together with their descendants.
pub struct ProcessSupervisor {
    config: Arc<InstallationConfig>,
    settings: Arc<ConfigStore>,
    reporter: StatusReporter,
    states: Mutex<HashMap<String, ProcessState>>,
}

impl ProcessSupervisor {
    pub fn new(
        config: Arc<InstallationConfig>,
        settings: Arc<ConfigStore>,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            config,
            settings,
            reporter,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.config.pid_file(name)
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.config.logs_dir.join(format!("{name}.log"))
    }

    pub fn state(&self, name: &str) -> ProcessState {
        let recorded = self
            .states
            .lock()
            .expect("process state lock poisoned")
            .get(name)
            .copied();
        match recorded {
            Some(state @ (ProcessState::Starting | ProcessState::Stopping)) => state,
            _ if self.running_pid(name).is_some() => ProcessState::Running,
            _ => ProcessState::Stopped,
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running_pid(name).is_some()
    }

    /// PID recorded for `name` if that process is still alive. A PID file
    /// naming a dead or unparsable process is removed.
    pub fn running_pid(&self, name: &str) -> Option<u32> {
        let pid_file = self.pid_file(name);
        let contents = match fs::read_to_string(&pid_file) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("Failed to read PID file {pid_file:?}: {err}");
                return None;
            }
        };

        match contents.trim().parse::<u32>() {
            Ok(pid) if process_alive(pid) => Some(pid),
            Ok(pid) => {
                info!("Removing stale PID file {pid_file:?} (process {pid} is gone).");
                remove_pid_file(&pid_file);
                None
            }
            Err(_) => {
                warn!("Removing unreadable PID file {pid_file:?}.");
                remove_pid_file(&pid_file);
                None
            }
        }
    }

    /// Launches `spec` detached from the launcher, locates the worker process
    /// and records its PID. Without a worker no PID file is written and the
    /// spawned tree is torn down.
    pub async fn start(&self, spec: &LaunchSpec) -> Result<ManagedProcess> {
        self.set_state(&spec.name, ProcessState::Starting);
        let result = self.start_inner(spec).await;
        match &result {
            Ok(process) => {
                info!("{} running with PID {}.", process.name, process.pid);
                self.set_state(&spec.name, ProcessState::Running);
            }
            Err(err) => {
                self.reporter
                    .failure(format!("Failed to start {}.", spec.name), err);
                self.set_state(&spec.name, ProcessState::Stopped);
            }
        }
        result
    }

    async fn start_inner(&self, spec: &LaunchSpec) -> Result<ManagedProcess> {
        let launcher_pid = self.spawn_detached(spec)?;
        debug!("{} launch command has PID {launcher_pid}.", spec.name);

        let pid = match &spec.worker {
            WorkerMatch::Spawned => launcher_pid,
            WorkerMatch::Descendant(fragment) => {
                match self.discover_worker(launcher_pid, fragment).await {
                    Ok(pid) => pid,
                    Err(err) => {
                        warn!("Tearing down {} launch command ({launcher_pid}).", spec.name);
                        terminate_tree(launcher_pid, STOP_GRACE).await;
                        return Err(err);
                    }
                }
            }
        };

        let pid_file = self.pid_file(&spec.name);
        fs::write(&pid_file, pid.to_string())?;
        Ok(ManagedProcess {
            name: spec.name.clone(),
            pid,
            pid_file,
            working_dir: spec.command.working_dir.clone(),
            command: spec.command.display(),
        })
    }

    /// Output goes to `logs/<name>.log` so the server keeps running once the
    /// launcher exits.
    fn spawn_detached(&self, spec: &LaunchSpec) -> Result<u32> {
        fs::create_dir_all(&self.config.logs_dir)?;
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file(&spec.name))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&spec.command.program);
        cmd.args(&spec.command.args)
            .envs(spec.command.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false);
        if let Some(dir) = &spec.command.working_dir {
            cmd.current_dir(dir);
        }
        apply_background_command_flags(&mut cmd);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|err| spawn_error(&spec.command.program, err))?;
        let pid = child.id().ok_or_else(|| {
            LauncherError::Io(std::io::Error::other(format!(
                "{} launch command exited immediately",
                spec.name
            )))
        })?;

        // Reap the launch command; nothing else holds the handle.
        let name = spec.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("{name} launch command exited with {status}."),
                Err(err) => warn!("Failed to wait on {name} launch command: {err}"),
            }
        });
        Ok(pid)
    }

    async fn discover_worker(&self, root: u32, fragment: &str) -> Result<u32> {
        let settings = self.settings.settings();
        let attempts = settings.discovery_attempts.max(1);
        let interval = settings.discovery_interval();
        let needle = fragment.to_lowercase();

        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;
            let mut system = System::new();
            system.refresh_processes();
            if let Some(pid) = find_descendant(&system, Pid::from_u32(root), &needle) {
                info!("Found {fragment} worker {pid} after {attempt} attempt(s).");
                return Ok(pid.as_u32());
            }
            if !process_alive(root) {
                warn!("{fragment} launch command {root} exited before a worker appeared.");
                return Err(LauncherError::WorkerNotFound {
                    name: fragment.to_string(),
                    attempts: attempt,
                });
            }
            debug!("Attempt {attempt}/{attempts}: no {fragment} process under {root} yet.");
        }

        Err(LauncherError::WorkerNotFound {
            name: fragment.to_string(),
            attempts,
        })
    }

    /// Terminates the recorded process and its descendants. The PID file is
    /// removed on every path once it has been found.
    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        let pid_file = self.pid_file(name);
        if !pid_file.exists() {
            info!("No PID file for {name}; nothing to stop.");
            self.reporter.progress(
                format!("{name} Not Running"),
                format!("{name} is not running."),
                0,
            );
            self.set_state(name, ProcessState::Stopped);
            return Ok(StopOutcome::NotRunning);
        }

        self.set_state(name, ProcessState::Stopping);
        let outcome = stop_from_pid_file(&pid_file).await;
        remove_pid_file(&pid_file);
        self.set_state(name, ProcessState::Stopped);

        match &outcome {
            Ok(StopOutcome::Stopped { pid }) => info!("{name} ({pid}) stopped."),
            Ok(StopOutcome::AlreadyExited { pid }) => info!("{name} ({pid}) had already exited."),
            Ok(StopOutcome::NotRunning) => {}
            Err(err) => self.reporter.failure(format!("Failed to stop {name}."), err),
        }
        outcome
    }

    /// Polls until a TCP connection to `host:port` succeeds. Exhaustion is
    /// reported as a status event and returned as `false`.
    pub async fn wait_until_ready(&self, host: &str, port: u16, attempts: u32) -> bool {
        let settings = self.settings.settings();
        let interval = settings.readiness_interval();

        for attempt in 1..=attempts {
            if port_open(host, port).await {
                info!("{host}:{port} accepted a connection after {attempt} attempt(s).");
                if settings.open_browser && env_flags::browser_enabled() {
                    let url = format!("http://{host}:{port}");
                    if let Err(err) = open::that(&url) {
                        warn!("Failed to open {url} in a browser: {err}");
                    }
                }
                return true;
            }
            debug!("Attempt {attempt}/{attempts}: {host}:{port} is not accepting yet.");
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        warn!("{host}:{port} did not accept connections after {attempts} attempts.");
        self.reporter.failure(
            "Server Did Not Respond.",
            format!("Nothing is listening on {host}:{port} yet. Check the logs folder."),
        );
        false
    }

    fn set_state(&self, name: &str, state: ProcessState) {
        self.states
            .lock()
            .expect("process state lock poisoned")
            .insert(name.to_string(), state);
    }
}

async fn stop_from_pid_file(pid_file: &Path) -> Result<StopOutcome> {
    let contents = fs::read_to_string(pid_file)?;
    let pid = contents.trim().parse::<u32>().map_err(|err| {
        LauncherError::Io(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("PID file {pid_file:?} is not a process id: {err}"),
        ))
    })?;

    if terminate_tree(pid, STOP_GRACE).await {
        Ok(StopOutcome::Stopped { pid })
    } else {
        Ok(StopOutcome::AlreadyExited { pid })
    }
}

fn remove_pid_file(pid_file: &Path) {
    if let Err(err) = fs::remove_file(pid_file) {
        if err.kind() != ErrorKind::NotFound {
            warn!("Failed to remove PID file {pid_file:?}: {err}");
        }
    }
}

pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return false;
    }
    system
        .process(pid)
        .map(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}

/// Children first, then `root`. Anything still alive after `grace` is
/// killed outright. Returns false when `root` was not running.
/// One connection attempt with a short timeout.
pub async fn port_open(host: &str, port: u16) -> bool {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            debug!("{host}:{port}: {err}");
            false
        }
        Err(_) => false,
    }
}

async fn terminate_tree(root: u32, grace: Duration) -> bool {
    let root_pid = Pid::from_u32(root);
    let mut system = System::new();
    system.refresh_processes();
    let Some(root_process) = system.process(root_pid) else {
        return false;
    };

    let mut targets = descendants(&system, root_pid);
    for pid in &targets {
        if let Some(process) = system.process(*pid) {
            terminate(process);
        }
    }
    terminate(root_process);
    targets.push(root_pid);

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let survivors: Vec<Pid> = targets
            .iter()
            .copied()
            .filter(|pid| process_alive(pid.as_u32()))
            .collect();
        if survivors.is_empty() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("{} process(es) ignored termination; killing.", survivors.len());
            system.refresh_processes();
            for pid in survivors {
                if let Some(process) = system.process(pid) {
                    process.kill();
                }
            }
            return true;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}

fn terminate(process: &Process) {
    if process.kill_with(Signal::Term).is_none() {
        process.kill();
    }
}

fn descendants(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        for child in children.get(&current).into_iter().flatten() {
            if *child != root && !found.contains(child) {
                found.push(*child);
                queue.push_back(*child);
            }
        }
    }
    found
}

fn find_descendant(system: &System, root: Pid, needle: &str) -> Option<Pid> {
    descendants(system, root).into_iter().find(|pid| {
        system
            .process(*pid)
            .map(|process| process.name().to_lowercase().contains(needle))
            .unwrap_or(false)
    })
}
