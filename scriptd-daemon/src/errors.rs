use std::path::PathBuf;

use scriptd_protocol::RequestError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to read script directory {path}: {source}")]
    ScriptDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read script {path}: {source}")]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid default for param {param} in {script}: {source}")]
    BadDefault {
        script: String,
        param: String,
        #[source]
        source: RequestError,
    },

    #[error("Failed to compile template for {script}: {source}")]
    TemplateCompile {
        script: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("Failed to render template for {script}: {source}")]
    TemplateRender {
        script: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("Failed to spawn bash for run {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No child process for run {id}")]
    NoProcess { id: String },

    #[error("Failed to kill run {id}: {source}")]
    Kill {
        id: String,
        #[source]
        source: nix::Error,
    },
}

pub type Result<T> = std::result::Result<T, DaemonError>;
