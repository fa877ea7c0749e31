//! Query template rendering
//!
//! Stored query text is a minijinja template with named placeholders
//! (`{{ region }}`) and simple iteration (`{% for ... %}`). Rendering is
//! pure: the same content and data always produce the same text.

use crate::error::{Error, Result};
use minijinja::Environment;

/// Render stored query content with caller-supplied template data.
pub fn render(content: &str, data: &serde_json::Value) -> Result<String> {
    let env = Environment::new();
    let template = env
        .template_from_str(content)
        .map_err(|e| Error::TemplateParse(e.to_string()))?;

    template
        .render(data)
        .map_err(|e| Error::TemplateRender(e.to_string()))
}
