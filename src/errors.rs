use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("IO Error")]
    IoError(#[from] std::io::Error),
    #[error("Could not read game config: {0}")]
    ConfigError(String),
    #[error("Unknown symbol alias `{0}`")]
    UnknownAlias(String),
    #[error("The library `{0}` could not be opened")]
    LibraryNotFound(String),
    #[error("Could not find symbol `{1}` in `{0}`")]
    SymbolNotFound(String, String),
    #[error("Could not create pattern `{0}`")]
    PatternError(String),
    #[error("No occurence of the patch signature has been found for `{0}`")]
    PatternNotFound(String),
    #[error("Replacement is {got} bytes but the match region for `{name}` is {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("Could not change memory protection")]
    ProtectionError(#[from] region::Error),
    #[error("Could not install hook for `{0}`")]
    HookError(String),
    #[error("{0} patches failed to apply")]
    PartialFailure(usize),
}

impl From<hex::FromHexError> for PatchError {
    fn from(error: hex::FromHexError) -> PatchError {
        PatchError::PatternError(format!("{}", error))
    }
}

impl From<regex::Error> for PatchError {
    fn from(error: regex::Error) -> PatchError {
        PatchError::PatternError(format!("{}", error))
    }
}

impl From<serde_json::Error> for PatchError {
    fn from(error: serde_json::Error) -> PatchError {
        PatchError::ConfigError(format!("{}", error))
    }
}
