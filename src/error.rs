//! Error kinds surfaced by effect fusion, program compilation and buffer management.

use thiserror::Error;

/// Failures detected at construction, mutation or recompilation time.
///
/// None of these are raised mid-frame: a frame either starts with every
/// program ready or does not start at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Effects that cannot share one fused program (mutually exclusive
    /// attributes, invalid identifiers, disposed members).
    #[error("configuration error in {context}: {message}")]
    Configuration { context: String, message: String },

    /// The graphics driver rejected a generated program.
    #[error("compile error in {label}: {message}")]
    Compile { label: String, message: String },

    /// Invalid buffer request (zero size) or an unknown/released handle.
    #[error("resource error: {0}")]
    Resource(String),
}

impl Error {
    pub fn configuration(context: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Configuration {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn compile(label: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Compile {
            label: label.into(),
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Error::Resource(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration { .. })
    }

    pub fn is_compile(&self) -> bool {
        matches!(self, Error::Compile { .. })
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, Error::Resource(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
