use thiserror::Error;

use std::path::Path;

#[derive(Error, Debug)]
pub enum WalkError {
    /// The named module could not be located
    #[error("{0}")]
    NotFound(String),

    /// The located file is not a PE image we can read (bad signature, unsupported architecture,
    /// offsets pointing outside of the file)
    #[error("{0}")]
    Validation(String),

    /// A name could not be converted between the encodings used by the image and by us
    #[error("{0}")]
    Encoding(String),

    #[error("Unsupported format '{0}'")]
    UnsupportedFormat(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    PEError(#[from] pelite::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

impl WalkError {
    /// Errors that only concern a single module, and after which the walk can go on
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Validation(_) | Self::Encoding(_) | Self::PEError(_)
        )
    }
}

/// Canonical form of a module name, used as key everywhere in the graph
pub fn lower(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// ASCII case insensitive `str::starts_with`
pub fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Lossy display of a path, for messages and output
pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_string_lossy().into_owned()
}
