//! Error types for rill-resolver

use thiserror::Error;

/// Result type for resolver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced while turning a query id into a live stream.
///
/// Messages travel verbatim to the client in the `error` frame; [`code`](Error::code)
/// supplies the machine-readable discriminant.
#[derive(Error, Debug)]
pub enum Error {
    /// No stored query with the requested id
    #[error("query not found: {0}")]
    QueryNotFound(String),

    /// The query references a connector that no longer exists
    #[error("connector not found: {0}")]
    ConnectorNotFound(String),

    /// The query template failed to parse
    #[error("template parse error: {0}")]
    TemplateParse(String),

    /// The query template failed to render with the supplied data
    #[error("template render error: {0}")]
    TemplateRender(String),

    /// Metadata store request failed
    #[error("metadata store error: {0}")]
    Store(String),

    /// Driver build, connect, query or stream failure
    #[error(transparent)]
    Driver(#[from] rill_driver::Error),
}

impl Error {
    /// Stable discriminant for the wire `error.code` field
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueryNotFound(_) => "QueryNotFound",
            Self::ConnectorNotFound(_) => "ConnectorNotFound",
            Self::TemplateParse(_) => "TemplateParseError",
            Self::TemplateRender(_) => "TemplateRenderError",
            Self::Store(_) => "MetadataStoreError",
            Self::Driver(e) => e.code(),
        }
    }
}
