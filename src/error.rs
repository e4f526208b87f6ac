use thiserror::Error;

/// Main error type for Faultline operations
#[derive(Error, Debug)]
pub enum FaultlineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parser error: {0}")]
    Parser(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Application object '{attribute}' not found in module '{module}'")]
    AppNotFound { module: String, attribute: String },

    #[error("Invalid application reference '{0}': expected the form module.path:attribute")]
    InvalidAppRef(String),
}

pub type Result<T> = std::result::Result<T, FaultlineError>;
