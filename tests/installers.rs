mod common;

use common::{touch, FakeRunner, Fixture};
use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use webui_launcher::{
    download::Downloader,
    environment::{EnvironmentManager, COMPLETION_MARKER},
    error::LauncherError,
    package::PackageInstaller,
    plugin::RepoPluginInstaller,
    runner::{CommandOutput, CommandRunner},
    runtime::{ProvisionState, RuntimeProvisioner},
};

fn provisioner(fx: &Fixture, runner: Arc<dyn CommandRunner>) -> RuntimeProvisioner {
    RuntimeProvisioner::new(
        Arc::clone(&fx.config),
        Arc::clone(&fx.settings),
        runner,
        Downloader::new().expect("http client"),
        fx.reporter.clone(),
    )
}

fn environments(fx: &Fixture, runner: Arc<dyn CommandRunner>) -> Arc<EnvironmentManager> {
    Arc::new(EnvironmentManager::new(
        Arc::clone(&fx.config),
        Arc::clone(&fx.settings),
        runner,
        fx.reporter.clone(),
    ))
}

fn package(fx: &Fixture, runner: Arc<dyn CommandRunner>) -> PackageInstaller {
    PackageInstaller::new(
        tokio::runtime::Handle::current(),
        Arc::clone(&fx.config),
        Arc::clone(&fx.settings),
        Arc::clone(&runner),
        environments(fx, Arc::clone(&runner)),
        Downloader::new().expect("http client"),
        fx.reporter.clone(),
    )
}

fn plugin(fx: &Fixture, runner: Arc<dyn CommandRunner>) -> RepoPluginInstaller {
    RepoPluginInstaller::new(
        Arc::clone(&fx.config),
        Arc::clone(&fx.settings),
        Arc::clone(&runner),
        environments(fx, runner),
        fx.reporter.clone(),
    )
}

fn command_failed(command: &str) -> LauncherError {
    LauncherError::CommandFailed {
        command: command.to_string(),
        exit_code: 1,
        stderr: "boom".to_string(),
    }
}

fn is_installer_run(command: &webui_launcher::runner::CommandSpec) -> bool {
    command.has_arg("-b") || command.has_arg("/S")
}

#[tokio::test]
async fn runtime_is_downloaded_then_installed() {
    let mut server = mockito::Server::new_async().await;
    let download = server
        .mock("GET", "/Miniconda3-latest.sh")
        .with_status(200)
        .with_body("#!/bin/sh\necho installer\n")
        .expect(1)
        .create_async()
        .await;
    let url = format!("{}/Miniconda3-latest.sh", server.url());
    let fx = Fixture::with_settings(|settings| settings.runtime_installer_url = url);

    let conda = fx.config.conda_exe.clone();
    let runner = FakeRunner::new(move |command| {
        if is_installer_run(command) {
            touch(&conda);
        }
        Ok(CommandOutput::ok(""))
    });
    let runtime = provisioner(&fx, runner.clone());

    assert!(!runtime.check_installed());
    runtime.install().await.expect("install runtime");

    assert!(runtime.check_installed());
    assert_eq!(runtime.state(), ProvisionState::Installed);
    assert!(runtime.installer_path().is_file());
    assert_eq!(runner.calls().len(), 1);
    download.assert_async().await;

    let statuses = fx.statuses();
    assert!(statuses.iter().all(|status| !status.is_failure()));
    assert_eq!(statuses.last().map(|status| status.progress), Some(100));
}

#[tokio::test]
async fn cached_installer_is_reused() {
    let mut server = mockito::Server::new_async().await;
    let download = server
        .mock("GET", "/Miniconda3-latest.sh")
        .expect(0)
        .create_async()
        .await;
    let url = format!("{}/Miniconda3-latest.sh", server.url());
    let fx = Fixture::with_settings(|settings| settings.runtime_installer_url = url);

    let conda = fx.config.conda_exe.clone();
    let runner = FakeRunner::new(move |command| {
        if is_installer_run(command) {
            touch(&conda);
        }
        Ok(CommandOutput::ok(""))
    });
    let runtime = provisioner(&fx, runner);
    touch(&runtime.installer_path());

    runtime.install().await.expect("install runtime");
    assert!(runtime.check_installed());
    download.assert_async().await;
}

#[tokio::test]
async fn installed_runtime_is_left_alone() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    let runner = FakeRunner::succeeding();
    let runtime = provisioner(&fx, runner.clone());

    runtime.install().await.expect("no-op install");

    assert!(runner.calls().is_empty());
    let statuses = fx.statuses();
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].headline.contains("Already Installed"));
}

#[tokio::test]
async fn failed_download_leaves_no_partial_installer() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/Miniconda3-latest.sh")
        .with_status(404)
        .create_async()
        .await;
    let url = format!("{}/Miniconda3-latest.sh", server.url());
    let fx = Fixture::with_settings(|settings| settings.runtime_installer_url = url);
    let runner = FakeRunner::succeeding();
    let runtime = provisioner(&fx, runner.clone());

    let err = runtime.install().await.unwrap_err();

    assert!(matches!(err, LauncherError::Network(_)));
    assert!(!runtime.installer_path().exists());
    assert!(!runtime.installer_path().with_extension("download").exists());
    assert!(runner.calls().is_empty());
    assert_eq!(runtime.state(), ProvisionState::NotInstalled);
    assert!(fx.statuses().last().expect("status").is_failure());
}

#[tokio::test]
async fn failing_installer_is_reported_and_returned() {
    let fx = Fixture::new();
    let runner = FakeRunner::new(|_| Err(command_failed("bash installer")));
    let runtime = provisioner(&fx, runner);
    touch(&runtime.installer_path());

    let err = runtime.install().await.unwrap_err();

    assert!(matches!(err, LauncherError::CommandFailed { .. }));
    assert!(!runtime.check_installed());
    let last = fx.statuses().pop().expect("status");
    assert!(last.is_failure());
    assert!(last.detail.contains("boom"));
    assert_eq!(last.progress, 0);
}

#[tokio::test]
async fn environment_setup_runs_create_once() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    let runner = FakeRunner::succeeding();
    let environments = environments(&fx, runner.clone());

    let first = environments.setup_environment("env", &[]).await.expect("create");
    let second = environments.setup_environment("env", &[]).await.expect("reuse");

    assert_eq!(first, second);
    assert_eq!(runner.count_with_arg("create"), 1);
    assert!(EnvironmentManager::is_ready(&first));
    assert_eq!(fx.statuses().last().map(|status| status.progress), Some(100));
}

#[tokio::test]
async fn environment_requests_pinned_python_and_extras() {
    let fx = Fixture::with_settings(|settings| settings.python_version = "3.12".to_string());
    fx.install_fake_runtime();
    let runner = FakeRunner::succeeding();
    let environments = environments(&fx, runner.clone());

    environments
        .setup_environment("env_pipelines", &["git"])
        .await
        .expect("create");

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, fx.config.conda_exe);
    assert!(calls[0].has_arg("python=3.12"));
    assert!(calls[0].has_arg("git"));
    assert!(calls[0].has_arg("-y"));
}

#[tokio::test]
async fn interrupted_environment_is_recreated() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    let runner = FakeRunner::succeeding();
    let environments = environments(&fx, runner.clone());
    let env_dir = environments.env_path("env");
    touch(&env_dir.join("half-written"));

    environments.setup_environment("env", &[]).await.expect("recreate");

    assert_eq!(runner.count_with_arg("create"), 1);
    assert!(!env_dir.join("half-written").exists());
    assert!(env_dir.join(COMPLETION_MARKER).is_file());
}

#[cfg(unix)]
#[tokio::test]
async fn unremovable_leftover_is_reported() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    let runner = FakeRunner::succeeding();
    let environments = environments(&fx, runner.clone());
    // A plain file where the environment directory should be.
    touch(&environments.env_path("env"));

    let err = environments.setup_environment("env", &[]).await.unwrap_err();

    assert!(matches!(err, LauncherError::Io(_)));
    assert_eq!(runner.count_with_arg("create"), 0);
    assert!(fx.statuses().last().expect("status").is_failure());
}

#[tokio::test]
async fn environment_needs_the_runtime() {
    let fx = Fixture::new();
    let runner = FakeRunner::succeeding();
    let environments = environments(&fx, runner.clone());

    let err = environments.setup_environment("env", &[]).await.unwrap_err();

    assert!(matches!(err, LauncherError::RuntimeNotInstalled));
    assert!(runner.calls().is_empty());
    assert!(fx.statuses().last().expect("status").is_failure());
}

#[tokio::test]
async fn failed_create_leaves_environment_unmarked() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    let runner = FakeRunner::new(|_| Err(command_failed("conda create")));
    let environments = environments(&fx, runner);

    assert!(environments.setup_environment("env", &[]).await.is_err());
    assert!(!EnvironmentManager::is_ready(&environments.env_path("env")));
}

#[tokio::test]
async fn package_is_installed_only_after_install() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    let installed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&installed);
    let runner = FakeRunner::new(move |command| {
        if command.has_arg("show") {
            return if flag.load(Ordering::SeqCst) {
                Ok(CommandOutput::ok("Name: open-webui\nVersion: 0.9.0\n"))
            } else {
                Err(command_failed("pip show open-webui"))
            };
        }
        if command.has_arg("install") {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(CommandOutput::ok(""))
    });
    let package = package(&fx, runner.clone());

    assert!(!package.check_installed().await);
    package.install().await.expect("install package");

    assert!(package.check_installed().await);
    assert_eq!(package.installed_version().await.as_deref(), Some("0.9.0"));
    assert_eq!(runner.count_with_arg("create"), 1);

    let install = runner
        .calls()
        .into_iter()
        .find(|call| call.has_arg("install"))
        .expect("pip install call");
    assert_eq!(install.program, fx.config.conda_exe);
    assert!(install.has_arg("open-webui"));
    assert!(install.has_arg("--prefix"));
}

#[tokio::test]
async fn other_package_metadata_does_not_count() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    let runner = FakeRunner::new(|_| Ok(CommandOutput::ok("Name: something-else\nVersion: 1.0\n")));
    let package = package(&fx, runner);
    package.setup_environment().await.expect("env");

    assert!(!package.check_installed().await);
}

#[tokio::test]
async fn package_update_requires_an_environment() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    let runner = FakeRunner::succeeding();
    let package = package(&fx, runner.clone());

    let err = package.update().await.unwrap_err();

    assert!(matches!(err, LauncherError::NotInstalled(_)));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn package_update_upgrades_in_place() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    let runner = FakeRunner::succeeding();
    let package = package(&fx, runner.clone());
    package.setup_environment().await.expect("env");

    package.update().await.expect("update");

    assert_eq!(runner.count_with_arg("--upgrade"), 1);
}

#[tokio::test]
async fn pipelines_install_clones_and_installs_requirements() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    let repo = fx.config.pipelines_repo_dir.clone();
    let python = fx.config.pipelines_env_dir.join("bin").join("python");
    let env_python = python.clone();
    let runner = FakeRunner::new(move |command| {
        if command.has_arg("create") {
            touch(&env_python);
        }
        if command.has_arg("clone") {
            touch(&repo.join("requirements.txt"));
        }
        Ok(CommandOutput::ok(""))
    });
    let plugin = plugin(&fx, runner.clone());

    assert!(!plugin.check_installed());
    plugin.setup_environment().await.expect("env");
    plugin.install().await.expect("install");

    assert!(plugin.check_installed());
    assert_eq!(runner.count_with_arg("clone"), 1);
    let requirements = runner
        .calls()
        .into_iter()
        .find(|call| call.has_arg("-r"))
        .expect("pip install -r");
    assert_eq!(requirements.program, python);
    assert_eq!(requirements.working_dir.as_deref(), Some(fx.config.pipelines_repo_dir.as_path()));
}

#[tokio::test]
async fn existing_checkout_is_not_cloned_again() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    fs::create_dir_all(&fx.config.pipelines_repo_dir).expect("repo dir");
    let runner = FakeRunner::succeeding();
    let plugin = plugin(&fx, runner.clone());

    plugin.install().await.expect("install");

    assert_eq!(runner.count_with_arg("clone"), 0);
    assert_eq!(runner.count_with_arg("-r"), 0);
}

#[tokio::test]
async fn missing_interpreter_is_reported() {
    let fx = Fixture::new();
    fx.install_fake_runtime();
    touch(&fx.config.pipelines_repo_dir.join("requirements.txt"));
    let runner = FakeRunner::succeeding();
    let plugin = plugin(&fx, runner);

    let err = plugin.install().await.unwrap_err();

    match err {
        LauncherError::InterpreterNotFound { tried } => assert_eq!(tried.len(), 4),
        other => panic!("unexpected error: {other}"),
    }
    assert!(fx.statuses().last().expect("status").is_failure());
}

#[tokio::test]
async fn pipelines_update_needs_a_checkout() {
    let fx = Fixture::new();
    let runner = FakeRunner::succeeding();
    let plugin = plugin(&fx, runner.clone());

    let err = plugin.update().await.unwrap_err();

    assert!(matches!(err, LauncherError::RepoNotCloned(_)));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn pipelines_update_pulls_then_reinstalls() {
    let fx = Fixture::new();
    touch(&fx.config.pipelines_repo_dir.join("requirements.txt"));
    touch(&fx.config.pipelines_env_dir.join("bin").join("python"));
    let runner = FakeRunner::succeeding();
    let plugin = plugin(&fx, runner.clone());

    plugin.update().await.expect("update");

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].has_arg("pull"));
    assert!(calls[1].has_arg("-r"));
}

#[tokio::test]
async fn pipelines_update_check_fails_safe() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.config.pipelines_repo_dir.join(".git")).expect("git dir");
    let runner = FakeRunner::new(|_| Err(command_failed("git fetch")));
    let plugin = plugin(&fx, runner);

    assert!(!plugin.update_available().await);
}

#[tokio::test]
async fn pipelines_update_check_compares_heads() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.config.pipelines_repo_dir.join(".git")).expect("git dir");
    let runner = FakeRunner::new(|command| {
        let stdout = if command.has_arg("--abbrev-ref") {
            "main\n"
        } else if command.has_arg("FETCH_HEAD") {
            "bbbbbbb\n"
        } else if command.has_arg("HEAD") {
            "aaaaaaa\n"
        } else {
            ""
        };
        Ok(CommandOutput::ok(stdout))
    });
    let plugin = plugin(&fx, runner.clone());

    assert!(plugin.update_available().await);
    assert_eq!(runner.count_with_arg("fetch"), 1);
}
