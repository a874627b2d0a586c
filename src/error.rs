use thiserror::Error;

/// Failure taxonomy for the particle/shadow core.
///
/// `Resource` and `Compile` are fatal to this core but recoverable by the
/// caller (the scene degrades to "no particles / no shadows"); `Configuration`
/// is a programmer error surfaced at setup time, never at first render.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("resource error: {0}")]
    Resource(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("pipeline compilation failed: {0}")]
    Compile(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
