use crate::error::ControllerError;
use crate::upstream::UpstreamDefinition;
use handlebars::Handlebars;

const TEMPLATE_NAME: &str = "upstream";

/// Deterministic text rendering of an `UpstreamDefinition` through the
/// user-supplied template. Parse failures are fatal at startup; render
/// failures are surfaced per change and retried by the reconcile loop.
pub struct Renderer {
    registry: Handlebars<'static>,
}

impl Renderer {
    pub fn new(source: &str) -> Result<Self, ControllerError> {
        let mut registry = Handlebars::new();
        // Proxy config is plain text, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(TEMPLATE_NAME, source)
            .map_err(|e| ControllerError::Template(e.to_string()))?;
        Ok(Renderer { registry })
    }

    pub fn render(&self, definition: &UpstreamDefinition) -> Result<String, ControllerError> {
        self.registry
            .render(TEMPLATE_NAME, definition)
            .map_err(|e| ControllerError::Render(e.to_string()))
    }
}
