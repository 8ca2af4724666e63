use crate::{
    error::Result, package::PackageInstaller, plugin::RepoPluginInstaller,
    runtime::RuntimeProvisioner,
};
use std::sync::Arc;

/// The installable pieces of the stack behind one capability set.
#[derive(Clone)]
pub enum Component {
    Runtime(Arc<RuntimeProvisioner>),
    Package(Arc<PackageInstaller>),
    Plugin(Arc<RepoPluginInstaller>),
}

impl Component {
    pub fn name(&self) -> &'static str {
        match self {
            Component::Runtime(_) => "runtime",
            Component::Package(_) => "webui",
            Component::Plugin(_) => "pipelines",
        }
    }

    pub async fn check_installed(&self) -> bool {
        match self {
            Component::Runtime(runtime) => runtime.check_installed(),
            Component::Package(package) => package.check_installed().await,
            Component::Plugin(plugin) => plugin.check_installed(),
        }
    }

    pub fn check_requirements(&self) -> Result<()> {
        match self {
            Component::Runtime(runtime) => runtime.check_requirements(),
            Component::Package(package) => package.check_requirements(),
            Component::Plugin(plugin) => plugin.check_requirements(),
        }
    }

    /// The runtime has no environment of its own.
    pub async fn setup_environment(&self) -> Result<()> {
        match self {
            Component::Runtime(_) => Ok(()),
            Component::Package(package) => package.setup_environment().await.map(drop),
            Component::Plugin(plugin) => plugin.setup_environment().await.map(drop),
        }
    }

    pub async fn install(&self) -> Result<()> {
        match self {
            Component::Runtime(runtime) => runtime.install().await,
            Component::Package(package) => package.install().await,
            Component::Plugin(plugin) => plugin.install().await,
        }
    }

    pub async fn update(&self) -> Result<()> {
        match self {
            Component::Runtime(runtime) => runtime.update().await,
            Component::Package(package) => package.update().await,
            Component::Plugin(plugin) => plugin.update().await,
        }
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Component").field(&self.name()).finish()
    }
}
