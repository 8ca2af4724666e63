pub mod app;
pub mod component;
pub mod config;
pub mod disk;
pub mod download;
pub mod env_flags;
pub mod environment;
pub mod error;
pub mod launcher;
pub mod ollama;
pub mod package;
pub mod plugin;
pub mod probe;
pub mod runner;
pub mod runtime;
pub mod status;
pub mod supervisor;
