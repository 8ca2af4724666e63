use anyhow::{anyhow, Result};
use env_logger::Env;
use std::{str::FromStr, sync::mpsc, sync::Arc, thread};
use webui_launcher::{
    app::{AppContext, APP_NAME},
    launcher::Launcher,
    probe::Controls,
    status::{StatusReporter, UiEvent},
};

const USAGE: &str = "usage: webui-launcher <status|install|install-pipelines|install-ollama|start|stop|update|check-update>";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Status,
    Install,
    InstallPipelines,
    InstallOllama,
    Start,
    Stop,
    Update,
    CheckUpdate,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "status" => Ok(Command::Status),
            "install" => Ok(Command::Install),
            "install-pipelines" => Ok(Command::InstallPipelines),
            "install-ollama" => Ok(Command::InstallOllama),
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "update" => Ok(Command::Update),
            "check-update" => Ok(Command::CheckUpdate),
            other => Err(anyhow!("unknown command `{other}`\n{USAGE}")),
        }
    }
}

impl Command {
    fn label(self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Install => "install",
            Command::InstallPipelines => "install-pipelines",
            Command::InstallOllama => "install-ollama",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Update => "update",
            Command::CheckUpdate => "check-update",
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let command = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<Command>()?,
        None => Command::Status,
    };

    let (sender, receiver) = mpsc::channel();
    let printer = thread::spawn(move || {
        for event in receiver {
            match event {
                UiEvent::Status(status) => {
                    println!("[{:>3}%] {} - {}", status.progress, status.headline, status.detail)
                }
                UiEvent::Controls(controls) => log::debug!("Controls: {controls:?}"),
            }
        }
    });

    let context = AppContext::new(StatusReporter::new(sender))?;
    log::info!("{APP_NAME} using {:?}", context.config.base_dir);
    let launcher = Arc::clone(&context.launcher);
    let job = context
        .launcher
        .spawn(command.label(), run(command, launcher));
    let outcome = context.runtime.block_on(job);

    // Closes the event channel so the printer drains and exits.
    drop(context);
    if printer.join().is_err() {
        log::warn!("Status printer thread panicked.");
    }
    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => Err(anyhow!("`{}` did not complete", command.label())),
        Err(err) => Err(anyhow!("`{}` was aborted: {err}", command.label())),
    }
}

async fn run(command: Command, launcher: Arc<Launcher>) -> Result<()> {
    match command {
        Command::Status => {
            let state = launcher.refresh(false).await;
            println!("runtime installed:   {}", state.runtime_installed);
            println!("environment ready:   {}", state.environment_exists);
            println!(
                "package installed:   {} ({})",
                state.package_installed,
                state.installed_version.as_deref().unwrap_or("unknown version")
            );
            println!("pipelines installed: {}", state.repo_cloned);
            println!("ollama running:      {}", state.ollama_running);
            println!("running:             {}", launcher.is_running());
            print_controls(&Controls::derive(&state, launcher.is_running()));
        }
        Command::Install => launcher.install_webui().await?,
        Command::InstallPipelines => launcher.install_pipelines().await?,
        Command::InstallOllama => launcher.install_ollama().await?,
        Command::Start => {
            if !launcher.start_stack().await? {
                return Err(anyhow!("Open WebUI did not become reachable"));
            }
        }
        Command::Stop => launcher.stop_stack().await?,
        Command::Update => launcher.update_stack().await?,
        Command::CheckUpdate => {
            let state = launcher.check_updates().await?;
            println!(
                "installed {} / latest {} / update available: {}",
                state.installed_version.as_deref().unwrap_or("-"),
                state.latest_version.as_deref().unwrap_or("-"),
                state.update_available
            );
            println!("pipelines up to date: {}", state.repo_up_to_date);
        }
    }
    Ok(())
}

fn print_controls(controls: &Controls) {
    let mut available: Vec<&str> = [
        (controls.install, "install"),
        (controls.start, "start"),
        (controls.stop, "stop"),
        (controls.update, "update"),
        (controls.update_pipelines, "update"),
        (controls.install_pipelines, "install-pipelines"),
        (controls.install_ollama, "install-ollama"),
    ]
    .into_iter()
    .filter_map(|(enabled, name)| enabled.then_some(name))
    .collect();
    available.dedup();
    println!("available actions:   {}", available.join(", "));
}
