use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// An option is out of range or contradicts another option or the network.
    #[error("invalid configuration `{option}`: {reason}")]
    Configuration { option: &'static str, reason: String },

    /// The network itself is malformed.
    #[error("invalid input `{field}`: {reason}")]
    Input { field: String, reason: String },

    #[error("numerical failure in {stage}: {reason}")]
    Numerical { stage: &'static str, reason: String },

    #[error("{0}")]
    Logic(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(option: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            option,
            reason: reason.into(),
        }
    }

    pub(crate) fn input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Input {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn numerical(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Numerical {
            stage,
            reason: reason.into(),
        }
    }
}
