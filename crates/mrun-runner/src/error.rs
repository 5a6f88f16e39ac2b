use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported resource request: {kind}")]
    UnsupportedResource { kind: String },

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("remote command failed (exit status {exit_status}): {command}{}", stderr_suffix(.stderr))]
    RemoteCommand {
        command: String,
        exit_status: i32,
        stderr: String,
    },

    #[error("{kind}/{name}: {message}")]
    ApiObject {
        kind: String,
        name: String,
        message: String,
    },

    #[error("{kind}/{name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    let tail = stderr.lines().rev().find(|l| !l.trim().is_empty());
    match tail {
        Some(line) => format!(": {}", line.trim()),
        None => String::new(),
    }
}

impl DeployError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }

    pub fn api_object(kind: &str, name: &str, message: impl Into<String>) -> Self {
        Self::ApiObject {
            kind: kind.to_string(),
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Errors raised before any remote call is made.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnsupportedResource { .. }
        )
    }

    /// Stable machine-readable name of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::UnsupportedResource { .. } => "unsupported_resource",
            Self::Authentication(_) => "authentication_error",
            Self::RemoteCommand { .. } => "remote_command_error",
            Self::ApiObject { .. } | Self::AlreadyExists { .. } => "api_object_error",
            Self::Transfer(_) => "transfer_error",
            Self::Io(_) => "io_error",
            Self::Json(_) | Self::Yaml(_) => "serialization_error",
        }
    }
}
