use thiserror::Error;

use crate::outcome::error_type_name;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    SshError(#[from] openssh::Error),
    #[error("Local I/O failed: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Malformed JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Malformed YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Failed to render template: {0}")]
    TemplateError(#[from] handlebars::RenderError),
    #[error("Invalid template: {0}")]
    TemplateSyntaxError(#[from] handlebars::TemplateError),
    #[error("Cloud API call '{op}' failed: {message}")]
    CloudError { op: &'static str, message: String },
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Recruitment yielded no usable nodes")]
    NoNodesRecruited,
    #[error("Installation left no good nodes")]
    NoGoodNodes,
}

impl FleetError {
    /// Short name of the underlying error, as recorded in `exception` events.
    pub fn type_name(&self) -> String {
        match self {
            FleetError::SshError(e) => error_type_name(e),
            FleetError::IoError(e) => format!("{:?}", e.kind()),
            other => error_type_name(other),
        }
    }

    /// Message of the underlying error, without this crate's wrapping.
    pub fn message(&self) -> String {
        match self {
            FleetError::SshError(e) => e.to_string(),
            FleetError::IoError(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
