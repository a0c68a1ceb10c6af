//! Error types, grouped by the phase that can produce them.
//!
//! Configuration errors abort startup; validation errors are scoped to a
//! single dispatch attempt and never tear down shared state.

use crate::params::ParamSource;
use thiserror::Error;

/// Startup-time configuration failures. All fatal: `build` aborts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Two registrations claim the same path.
    #[error("duplicate handler registration for path `{path}`")]
    DuplicateRoute {
        /// The path registered twice.
        path: String,
    },

    /// A registration was built with an empty path.
    #[error("handler registration requires a non-empty path")]
    EmptyPath,

    /// Two evaluators were registered for one parameter source.
    #[error("duplicate binding evaluator for source `{source}`; only one evaluator per source is legal")]
    DuplicateEvaluator {
        /// The contested source kind.
        r#source: ParamSource,
    },

    /// One descriptor declares more than one binding source.
    #[error("ambiguous binding sources on parameter `{key}` at handler `{handler}`; only one declared source is legal")]
    AmbiguousParamSource {
        /// Parameter source key.
        key: String,
        /// Declaring handler name.
        handler: String,
    },

    /// A descriptor declares no binding source at all.
    #[error("parameter `{key}` at handler `{handler}` declares no binding source")]
    MissingParamSource {
        /// Parameter source key.
        key: String,
        /// Declaring handler name.
        handler: String,
    },

    /// A descriptor's source has no registered evaluator.
    #[error("no binding evaluator registered for source `{source}` (parameter `{key}` at handler `{handler}`)")]
    UnsupportedSource {
        /// The source kind without an evaluator.
        r#source: ParamSource,
        /// Parameter source key.
        key: String,
        /// Declaring handler name.
        handler: String,
    },
}

impl ConfigError {
    /// Stable label for logs and metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::DuplicateRoute { .. } => "duplicate_route",
            Self::EmptyPath => "empty_path",
            Self::DuplicateEvaluator { .. } => "duplicate_evaluator",
            Self::AmbiguousParamSource { .. } => "ambiguous_param_source",
            Self::MissingParamSource { .. } => "missing_param_source",
            Self::UnsupportedSource { .. } => "unsupported_source",
        }
    }
}

/// A single string-to-target conversion failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("could not convert `{raw}` to `{target}`")]
pub struct ConvertError {
    /// The raw text that failed to parse.
    pub raw: String,
    /// Human-readable target type name.
    pub target: String,
}

impl ConvertError {
    /// Build a conversion failure record.
    pub fn new(raw: impl Into<String>, target: impl ToString) -> Self {
        Self { raw: raw.into(), target: target.to_string() }
    }
}

/// Dispatch-scoped binding failures. One kind, distinguished by message:
/// the target type never changes the error's identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required parameter had no value and no default.
    #[error("request {source} `{key}` at handler `{handler}` was marked as `required` but was not found on the request")]
    RequiredMissing {
        /// Source phrase ("header" / "query parameter").
        r#source: &'static str,
        /// Parameter source key.
        key: String,
        /// Declaring handler name.
        handler: String,
    },

    /// A present value (or declared default) failed conversion.
    #[error("request {source} `{key}` at handler `{handler}` failed conversion: {cause}")]
    Conversion {
        /// Source phrase ("header" / "query parameter").
        r#source: &'static str,
        /// Parameter source key.
        key: String,
        /// Declaring handler name.
        handler: String,
        /// The underlying conversion failure.
        cause: ConvertError,
    },
}

impl ValidationError {
    /// Required-and-missing failure for one parameter.
    pub fn required_missing(
        source: ParamSource,
        key: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self::RequiredMissing {
            source: source_phrase(source),
            key: key.into(),
            handler: handler.into(),
        }
    }

    /// Conversion failure for one parameter.
    pub fn conversion(
        source: ParamSource,
        key: impl Into<String>,
        handler: impl Into<String>,
        cause: ConvertError,
    ) -> Self {
        Self::Conversion {
            source: source_phrase(source),
            key: key.into(),
            handler: handler.into(),
            cause,
        }
    }

    /// The offending parameter's source key.
    pub fn key(&self) -> &str {
        match self {
            Self::RequiredMissing { key, .. } | Self::Conversion { key, .. } => key,
        }
    }

    /// The declaring handler's name.
    pub fn handler(&self) -> &str {
        match self {
            Self::RequiredMissing { handler, .. } | Self::Conversion { handler, .. } => handler,
        }
    }

    /// Stable label for logs and metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::RequiredMissing { .. } => "required_missing",
            Self::Conversion { .. } => "conversion",
        }
    }
}

fn source_phrase(source: ParamSource) -> &'static str {
    match source {
        ParamSource::Header => "header",
        ParamSource::Query => "query parameter",
    }
}
