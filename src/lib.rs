//! # poml-render
//!
//! Renders POML prompt documents into chat-ready JSON. A document is parsed
//! into a typed model, its `{{ }}` templates and `if`/`for` directives are
//! resolved against a context, and the resulting conversation is shaped for
//! one of five consumers before being normalized to JSON.
//!
//! ## Features
//!
//! - Output shapes: `message_dict`, `dict`, `openai_chat`, `langchain`, `pydantic`
//! - Intention blocks rendered as Markdown, chat messages, tool calls, media
//! - Output schemas, tool definitions and runtime settings
//! - `src=` references confined to the document's base directory
//!
//! ## Usage
//!
//! ### As a Library
//!
//! ```no_run
//! use poml_render::{Format, Normalizer, RenderConfig, default_registry};
//!
//! let source = "<poml><role>Tutor</role><human-msg>Explain lifetimes</human-msg></poml>";
//! let registry = default_registry();
//!
//! match registry
//!     .get("poml")
//!     .and_then(|engine| engine.render(source, Format::OpenAiChat, &RenderConfig::default()))
//! {
//!     Ok(rendered) => println!("{}", Normalizer::new().normalize(&rendered)),
//!     Err(e) => eprintln!("Error: {e}"),
//! }
//! ```
//!
//! ### As a CLI Tool
//!
//! ```bash
//! poml-render --format openai_chat --file prompt.poml
//! poml-render --format dict --file prompt.poml --var topic=ownership
//! ```

pub mod document;
pub mod engine;
pub mod error;
pub mod expr;
pub mod formats;
pub mod fs_utils;
pub mod markup;
pub mod normalize;
pub mod render;
pub mod template;

pub use document::{Builder, Document, Speaker};
pub use engine::{EngineRegistry, POML_ENGINE, TemplateEngine, default_registry};
#[cfg(feature = "builtin-engine")]
pub use engine::PomlEngine;
pub use error::{PomlError, Result};
pub use formats::Format;
pub use normalize::{Converter, Normalizer, Rendered, RenderedObject};
pub use render::{Conversation, RenderConfig, render_document};
