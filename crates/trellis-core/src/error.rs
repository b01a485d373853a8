use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    // Graph construction errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Build failed for {node}: {message}")]
    Build { node: String, message: String },

    #[error("Invalid node config: {0}")]
    InvalidConfig(String),

    #[error("Unknown node class: {0}")]
    UnknownClass(String),

    #[error("Function not registered: {0}")]
    FunctionNotFound(String),

    #[error("Model not registered: {0}")]
    ModelNotFound(String),

    #[error("Node {0} is not attached to a registry")]
    Detached(String),

    // Node runtime errors
    #[error("Missing context key: {0}")]
    MissingKey(String),

    #[error("No match found for pattern {pattern} in {key}")]
    NoMatch { pattern: String, key: String },

    #[error("Type error: {0}")]
    Type(String),

    #[error("Function {name} failed: {message}")]
    Function { name: String, message: String },

    #[error("Model request failed: {0}")]
    Model(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Input error: {0}")]
    Input(String),

    #[error("Task failed: {0}")]
    Task(String),

    // Prefetch errors
    #[error("Node {0} already has a pending prefetch")]
    AlreadyPrefetched(String),

    #[error("Node {0} cannot be prefetched")]
    PrefetchUnsupported(String),

    #[error("No active execution for node {0}")]
    NoExecution(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrellisError>;
