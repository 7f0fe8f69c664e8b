//! Error types for the layer mapper

use thiserror::Error;

/// Result type for planning, encoding and verification
pub type MapResult<T> = Result<T, MapError>;

/// Mapping errors
///
/// Planning and encoding errors are fatal for the layer they occur in.
/// Verification mismatches are not errors; they are reported as data by
/// [`crate::verify::Comparison`].
#[derive(Debug, Error)]
pub enum MapError {
    #[error("Lexer error at position {position}: {message}")]
    LexerError { position: usize, message: String },

    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("Invalid accelerator configuration: {message}")]
    ConfigError { message: String },

    #[error("Layer cannot be mapped: {dimension} = {value} exceeds the limit of {limit}")]
    PlanningError {
        dimension: String,
        value: usize,
        limit: usize,
    },

    #[error("Unsupported kernel width {width}")]
    UnsupportedKernel { width: usize },

    #[error("Unsupported output width {width} for {pe_cols} PE columns")]
    UnsupportedOutputWidth { width: usize, pe_cols: usize },

    #[error("Value {value} does not fit the {width}-bit {field} field")]
    EncodingOverflow {
        field: String,
        value: i64,
        width: u32,
    },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("Invalid layer: {message}")]
    InvalidLayer { message: String },

    #[error("Stream error: {message}")]
    StreamError { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MapError {
    pub fn parse_error(msg: impl Into<String>) -> Self {
        MapError::ParseError { message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        MapError::ConfigError { message: msg.into() }
    }

    pub fn planning(dimension: impl Into<String>, value: usize, limit: usize) -> Self {
        MapError::PlanningError {
            dimension: dimension.into(),
            value,
            limit,
        }
    }

    pub fn overflow(field: impl Into<String>, value: i64, width: u32) -> Self {
        MapError::EncodingOverflow {
            field: field.into(),
            value,
            width,
        }
    }

    pub fn shape(expected: impl Into<String>, got: impl Into<String>) -> Self {
        MapError::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn invalid_layer(msg: impl Into<String>) -> Self {
        MapError::InvalidLayer { message: msg.into() }
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        MapError::StreamError { message: msg.into() }
    }

    /// True for errors that mean the accelerator cannot run the layer at all
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            MapError::PlanningError { .. }
                | MapError::UnsupportedKernel { .. }
                | MapError::UnsupportedOutputWidth { .. }
        )
    }
}
