use std::io;

use thiserror::Error;
use unicorn_engine::unicorn_const::uc_error;

#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("unicorn error {0:?}")]
    Uc(uc_error),
    #[error("loader error {0}")]
    Loader(#[from] goblin::error::Error),
    #[error("io error {0}")]
    Io(#[from] io::Error),
    #[error("unsupported file load type {0}")]
    UnsupportedLoadType(u16),
    #[error("unsupported architecture {0}")]
    UnsupportedArch(String),
    #[error("unknown os {0} for architecture {1}")]
    UnknownOs(String, String),
    #[error("Interpreter arch mismatch: {expected} != {found}")]
    InterpArchMismatch { expected: String, found: String },
    #[error("exit status {0}")]
    ExitStatus(i32),
    #[error("custom error {0}")]
    Custom(#[from] anyhow::Error),
}

impl From<uc_error> for EmulatorError {
    fn from(e: uc_error) -> Self {
        Self::Uc(e)
    }
}

pub type Result<T> = std::result::Result<T, EmulatorError>;
