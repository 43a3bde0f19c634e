//! Crate-wide error type. Every failure in the pipeline is fatal; nothing is
//! downgraded to a warning and no partially-built output survives an error.

use std::result;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad or unsupported configuration: unknown platform, unknown method,
    /// a tool that could not be found.
    #[error("configuration error: {0}")]
    Config(String),
    /// Malformed input: assembler source we cannot make sense of, linker
    /// output missing an expected marker.
    #[error("parse error: {0}")]
    Parse(String),
    /// Data we do not know how to handle: an unknown library symbol, an
    /// address size we cannot resolve.
    #[error("data error: {0}")]
    Data(String),
    /// An external tool exited nonzero; carries the captured stderr.
    #[error("command '{command}' failed with status {status}:\n{stderr}")]
    Tool {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Error::Data(msg.into())
    }
}
