use crate::error::{LauncherError, Result};
use futures::future::BoxFuture;
use log::{debug, warn};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};

const FAILURE_TAIL_LINES: usize = 8;

/// One external command invocation. The child inherits the parent's
/// environment; `envs` only adds or overrides variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|arg| arg == needle)
    }

    pub fn display(&self) -> String {
        let mut text = self.program.display().to_string();
        for arg in &self.args {
            text.push(' ');
            text.push_str(arg);
        }
        text
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Seam between the installers and the operating system.
///
/// Implementations return `CommandFailed` for a non-zero exit and
/// `ExecutableNotFound` when the program cannot be located.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, command: &'a CommandSpec) -> BoxFuture<'a, Result<CommandOutput>>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, command: &'a CommandSpec) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(execute(command))
    }
}

async fn execute(command: &CommandSpec) -> Result<CommandOutput> {
    let display = command.display();
    debug!("run_command: {display}");

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &command.envs {
        cmd.env(key, value);
    }
    apply_background_command_flags(&mut cmd);

    let mut child = cmd.spawn().map_err(|err| spawn_error(&command.program, err))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let program = command.program.display().to_string();
    let completion = async {
        let (status, stdout, stderr) = tokio::join!(
            child.wait(),
            collect_lines(stdout, &program, "stdout"),
            collect_lines(stderr, &program, "stderr"),
        );
        status.map(|status| (status, stdout, stderr))
    };

    let (status, stdout, stderr) = match command.timeout {
        Some(limit) => tokio::time::timeout(limit, completion)
            .await
            .map_err(|_| LauncherError::TimedOut {
                command: display.clone(),
                after: limit,
            })??,
        None => completion.await?,
    };

    let exit_code = status.code().unwrap_or(-1);
    if !status.success() {
        let tail = failure_tail(&stdout, &stderr);
        warn!("Command failed ({exit_code}): {display}\n{tail}");
        return Err(LauncherError::CommandFailed {
            command: display,
            exit_code,
            stderr: tail,
        });
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
    })
}

pub(crate) fn spawn_error(program: &Path, err: std::io::Error) -> LauncherError {
    if err.kind() == ErrorKind::NotFound {
        LauncherError::ExecutableNotFound(program.display().to_string())
    } else {
        LauncherError::Io(err)
    }
}

async fn collect_lines<R>(reader: Option<R>, program: &str, stream: &str) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut collected = String::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                debug!("[{program} {stream}] {line}");
                collected.push_str(line);
                collected.push('\n');
            }
            Err(err) => {
                warn!("[{program} {stream}] read failed: {err}");
                break;
            }
        }
    }
    collected
}

/// Last few lines of stderr, or of stdout when the tool wrote its complaint
/// there instead.
pub(crate) fn failure_tail(stdout: &str, stderr: &str) -> String {
    let source = if stderr.trim().is_empty() {
        stdout
    } else {
        stderr
    };
    let lines: Vec<&str> = source.lines().collect();
    let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(windows)]
pub(crate) fn apply_background_command_flags(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
pub(crate) fn apply_background_command_flags(_cmd: &mut Command) {}
