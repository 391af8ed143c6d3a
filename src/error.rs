//! Error taxonomy of the generator.\
//! Every parse- or normalize-failure aborts generation with one of these kinds.
//! Child-parsing failures during the child→parent event closure are demoted
//! to warnings by the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenError {
    /// XML parse error, unexpected root element or illegal document structure.
    #[error("{path}: document malformed: {reason}")]
    DocumentMalformed { path: String, reason: String },

    /// The root element is not `<scxml>` in the SCXML namespace.
    #[error("{path}: root element is not in the SCXML namespace")]
    NamespaceMismatch { path: String },

    /// A `<script src=…>` could not be loaded or resolves outside the input
    /// directory. W3C says such a document MUST be rejected.
    #[error("{path}: external script '{src}' unavailable: {reason}")]
    ExternalScriptUnavailable {
        path: String,
        src: String,
        reason: String,
    },

    /// An `initial` attribute references a state that does not exist.
    #[error("{path}: invalid initial target '{target}' in state '{state}'")]
    InvalidInitialTarget {
        path: String,
        state: String,
        target: String,
    },

    /// History default resolution exceeded the depth limit.
    #[error("{path}: history default of '{id}' did not resolve to a leaf state")]
    HistoryCycle { path: String, id: String },

    /// Deep-initial resolution exceeded the depth limit.
    #[error("{path}: initial chain starting at '{id}' did not resolve to a leaf state")]
    InitialCycle { path: String, id: String },

    /// An `<invoke>` type URI outside the SCXML family where a static child
    /// was required.
    #[error("{path}: unsupported invoke type '{type_uri}' for invoke '{id}'")]
    UnsupportedInvokeType {
        path: String,
        id: String,
        type_uri: String,
    },

    /// Template binding or output write error.
    #[error("{path}: emitter failure: {reason}")]
    EmitterFailure { path: String, reason: String },
}

impl GenError {
    pub fn malformed(path: &str, reason: impl Into<String>) -> GenError {
        GenError::DocumentMalformed {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

pub type GenResult<T> = Result<T, GenError>;
