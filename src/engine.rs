//! Template engine seam.
//!
//! The CLI looks engines up by name. The built-in POML engine is compiled
//! in through the default `builtin-engine` feature; without it the lookup
//! fails with an installation hint.

use crate::error::{PomlError, Result};
use crate::formats::Format;
use crate::normalize::Rendered;
use crate::render::RenderConfig;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Name the CLI asks for
pub const POML_ENGINE: &str = "poml";

/// Shown when no engine is registered under [`POML_ENGINE`]
pub const INSTALL_HINT: &str = "Install it with `cargo install poml-render --features builtin-engine`, \
     or register a TemplateEngine named 'poml'.";

/// Renders document source text into one output shape.
pub trait TemplateEngine: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Returns parse, template and rendering errors for `source`.
    fn render(&self, source: &str, format: Format, config: &RenderConfig) -> Result<Rendered>;
}

/// Thread-safe name-keyed set of engines.
#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, Arc<dyn TemplateEngine>>>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.names())
            .finish()
    }
}

fn engine_key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an engine under its own name.
    ///
    /// # Errors
    ///
    /// Returns `PomlError::EngineExists` if the name is already taken.
    pub fn register(&self, engine: impl TemplateEngine + 'static) -> Result<()> {
        let key = engine_key(engine.name());
        let mut engines = self.engines.write().unwrap_or_else(PoisonError::into_inner);
        if engines.contains_key(&key) {
            return Err(PomlError::EngineExists { name: key });
        }
        tracing::debug!(engine = %key, "registered template engine");
        engines.insert(key, Arc::new(engine));
        Ok(())
    }

    /// Looks an engine up by name.
    ///
    /// # Errors
    ///
    /// Returns `PomlError::EngineUnavailable` with an installation hint
    /// when nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn TemplateEngine>> {
        let engines = self.engines.read().unwrap_or_else(PoisonError::into_inner);
        engines
            .get(&engine_key(name))
            .cloned()
            .ok_or_else(|| PomlError::EngineUnavailable {
                name: name.to_string(),
                hint: INSTALL_HINT.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let engines = self.engines.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = engines.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Built-in engine: parse, render, shape.
#[cfg(feature = "builtin-engine")]
#[derive(Debug, Default, Clone, Copy)]
pub struct PomlEngine;

#[cfg(feature = "builtin-engine")]
impl TemplateEngine for PomlEngine {
    fn name(&self) -> &str {
        POML_ENGINE
    }

    fn render(&self, source: &str, format: Format, config: &RenderConfig) -> Result<Rendered> {
        let doc = crate::document::Document::parse(source)?;
        let conversation = crate::render::render_document(&doc, config)?;
        tracing::debug!(format = %format, "shaping output");
        Ok(crate::formats::convert(conversation, format))
    }
}

/// Registry holding every engine compiled into this build.
pub fn default_registry() -> EngineRegistry {
    let registry = EngineRegistry::new();
    #[cfg(feature = "builtin-engine")]
    {
        // A fresh registry cannot hold a duplicate
        let _ = registry.register(PomlEngine);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use serde_json::json;

    struct EchoEngine;

    impl TemplateEngine for EchoEngine {
        fn name(&self) -> &str {
            "Echo"
        }

        fn render(&self, source: &str, format: Format, _config: &RenderConfig) -> Result<Rendered> {
            Ok(Rendered::Value(json!({ "source": source, "format": format.as_str() })))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = EngineRegistry::new();
        registry.register(EchoEngine).unwrap();
        let engine = registry.get("echo").unwrap();
        let rendered = engine
            .render("x", Format::Dict, &RenderConfig::default())
            .unwrap();
        assert_eq!(
            Normalizer::new().normalize(&rendered),
            json!({"source": "x", "format": "dict"})
        );
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = EngineRegistry::new();
        registry.register(EchoEngine).unwrap();
        assert!(matches!(
            registry.register(EchoEngine),
            Err(PomlError::EngineExists { .. })
        ));
    }

    #[test]
    fn test_missing_engine_carries_hint() {
        let err = EngineRegistry::new().get(POML_ENGINE).err().unwrap();
        assert!(matches!(err, PomlError::EngineUnavailable { .. }));
        let message = err.to_string();
        assert!(message.contains("'poml' is not available"));
        assert!(message.contains("cargo install"));
    }

    #[cfg(feature = "builtin-engine")]
    #[test]
    fn test_default_registry_renders_poml() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec![POML_ENGINE.to_string()]);
        let rendered = registry
            .get(POML_ENGINE)
            .unwrap()
            .render(
                "<poml><human-msg>Hi</human-msg></poml>",
                Format::MessageDict,
                &RenderConfig::default(),
            )
            .unwrap();
        assert_eq!(
            Normalizer::new().to_json_line(&rendered).unwrap(),
            r#"[{"speaker":"human","content":"Hi"}]"#
        );
    }
}
