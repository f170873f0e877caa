use thiserror::Error;

/// Errors that can occur while configuring or running the server.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read config file {path}: {cause}")]
    ConfigFile { path: String, cause: String },

    #[error("failed to load TLS material: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
