use crate::document::{BlockKind, Document, MediaKind, Node, NodeKind, Speaker, ToolOutcomeKind};
use crate::error::{PomlError, Result};
use crate::expr::parse_expression;
use crate::fs_utils::{guess_mime, parse_data_uri, read_limited, resolve_reference_path};
use crate::markup::{Markup, MarkupElement};
use crate::template::{RenderContext, evaluate_attribute, for_each_instance, interpolate};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::LazyLock;

/// A blank line, possibly holding spaces, separates paragraphs.
static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[^\S\n]*\n\s*").expect("blank-line pattern is valid"));

/// Default limit for files pulled in through `src=` (8 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 8 * 1024 * 1024;

/// Configuration for rendering a document
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Directory that `src=` references are resolved against
    pub base_dir: PathBuf,
    /// Largest referenced file that will be read
    pub max_file_size: u64,
    /// Variables visible to `{{ }}` expressions
    pub context: Map<String, Value>,
    /// Validate the document structure before rendering
    pub strict: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            context: Map::new(),
            strict: false,
        }
    }
}

/// Inline binary content, already base64 encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPart {
    pub mime: String,
    pub base64: String,
    pub alt: Option<String>,
}

impl MediaPart {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Media(MediaPart),
    ToolRequest {
        id: String,
        name: String,
        parameters: Value,
    },
    ToolResponse {
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub speaker: Speaker,
    pub parts: Vec<Part>,
}

impl ConversationMessage {
    /// Text parts joined by blank lines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Format-neutral result of rendering a document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    pub messages: Vec<ConversationMessage>,
    pub schema: Option<Value>,
    pub tools: Vec<ToolSpec>,
    pub runtime: Option<Map<String, Value>>,
}

/// Renders `doc` against `config.context`.
///
/// Content outside explicit messages accumulates into a single human
/// message that is emitted whenever an explicit message or tool event
/// follows it.
///
/// # Errors
///
/// - `PomlError::Validation` when `config.strict` is set and the document is inconsistent.
/// - Template, file and JSON errors raised while rendering individual nodes.
pub fn render_document(doc: &Document, config: &RenderConfig) -> Result<Conversation> {
    if config.strict {
        doc.validate()?;
    }

    let mut ctx = RenderContext::new(config.context.clone());
    let mut renderer = Renderer::new(config);
    for node in &doc.nodes {
        for_each_instance(node.condition(), node.repeat(), &mut ctx, |ctx| {
            renderer.render_node(node, ctx)
        })?;
    }
    let conversation = renderer.finish();

    tracing::debug!(
        messages = conversation.messages.len(),
        tools = conversation.tools.len(),
        has_schema = conversation.schema.is_some(),
        "rendered document"
    );
    Ok(conversation)
}

struct Renderer<'a> {
    config: &'a RenderConfig,
    pending: Writer<'a>,
    conversation: Conversation,
    /// Previous node was a tool request, so the next one joins its message
    in_tool_calls: bool,
}

impl<'a> Renderer<'a> {
    fn new(config: &'a RenderConfig) -> Self {
        Self {
            config,
            pending: Writer::new(config),
            conversation: Conversation::default(),
            in_tool_calls: false,
        }
    }

    fn render_node(&mut self, node: &Node, ctx: &mut RenderContext) -> Result<()> {
        tracing::trace!(tag = node.tag(), "rendering node");
        match &node.kind {
            NodeKind::Meta(_) | NodeKind::Style { .. } => {}
            NodeKind::Let => bind_let(&node.element, ctx, self.config)?,
            NodeKind::Message(speaker) => {
                let mut writer = Writer::new(self.config);
                writer.write_children(node.body(), ctx, 1)?;
                self.push_message(*speaker, writer.finish());
            }
            NodeKind::ToolDefinition => {
                let tool = tool_spec(&node.element, ctx)?;
                self.conversation.tools.push(tool);
            }
            NodeKind::ToolRequest => {
                let part = tool_request(&node.element, ctx)?;
                self.flush_pending();
                if self.in_tool_calls
                    && let Some(last) = self.conversation.messages.last_mut()
                {
                    last.parts.push(part);
                } else {
                    self.conversation.messages.push(ConversationMessage {
                        speaker: Speaker::Ai,
                        parts: vec![part],
                    });
                }
                self.in_tool_calls = true;
            }
            NodeKind::ToolOutcome(kind) => {
                let part = tool_outcome(*kind, &node.element, ctx, self.config)?;
                self.push_message(Speaker::Tool, vec![part]);
            }
            NodeKind::OutputSchema => {
                let schema = json_value(&node.element.text(), ctx, "output-schema")?;
                self.conversation.schema = Some(schema);
            }
            NodeKind::Runtime => {
                let settings = runtime_settings(&node.element, ctx)?;
                self.conversation
                    .runtime
                    .get_or_insert_with(Map::new)
                    .extend(settings);
            }
            NodeKind::Block(_)
            | NodeKind::DocumentRef { .. }
            | NodeKind::Object
            | NodeKind::Media(_)
            | NodeKind::Unknown => {
                self.pending.write_element(&node.element, ctx, 1)?;
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self) {
        let writer = std::mem::replace(&mut self.pending, Writer::new(self.config));
        let parts = writer.finish();
        if !parts.is_empty() {
            self.conversation.messages.push(ConversationMessage {
                speaker: Speaker::Human,
                parts,
            });
            self.in_tool_calls = false;
        }
    }

    fn push_message(&mut self, speaker: Speaker, parts: Vec<Part>) {
        self.flush_pending();
        self.conversation
            .messages
            .push(ConversationMessage { speaker, parts });
        self.in_tool_calls = false;
    }

    fn finish(mut self) -> Conversation {
        self.flush_pending();
        self.conversation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptionStyle {
    Header,
    Bold,
    Plain,
    Hidden,
}

impl CaptionStyle {
    fn parse(value: Option<&str>) -> Self {
        match value {
            None | Some("header") => CaptionStyle::Header,
            Some("bold") => CaptionStyle::Bold,
            Some("plain") => CaptionStyle::Plain,
            Some("hidden") => CaptionStyle::Hidden,
            Some(other) => {
                tracing::warn!(style = other, "unknown caption style, using header");
                CaptionStyle::Header
            }
        }
    }
}

fn heading(depth: usize) -> String {
    "#".repeat(depth.clamp(1, 6))
}

/// Markdown writer for element bodies.
///
/// Text is collected into paragraphs; media elements split the output
/// into separate parts.
struct Writer<'a> {
    config: &'a RenderConfig,
    parts: Vec<Part>,
    blocks: Vec<String>,
    current: String,
}

impl<'a> Writer<'a> {
    fn new(config: &'a RenderConfig) -> Self {
        Self {
            config,
            parts: Vec::new(),
            blocks: Vec::new(),
            current: String::new(),
        }
    }

    fn finish(mut self) -> Vec<Part> {
        self.flush_text();
        self.parts
    }

    /// Rendered text only, media dropped.
    fn finish_text(self) -> String {
        self.finish()
            .into_iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn end_paragraph(&mut self) {
        let paragraph = self
            .current
            .lines()
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("\n");
        let paragraph = paragraph.trim();
        if !paragraph.is_empty() {
            self.blocks.push(paragraph.to_string());
        }
        self.current.clear();
    }

    fn flush_text(&mut self) {
        self.end_paragraph();
        if !self.blocks.is_empty() {
            self.parts.push(Part::Text(self.blocks.join("\n\n")));
            self.blocks.clear();
        }
    }

    fn push_block(&mut self, block: String) {
        self.end_paragraph();
        if !block.trim().is_empty() {
            self.blocks.push(block);
        }
    }

    fn push_part(&mut self, part: Part) {
        self.flush_text();
        self.parts.push(part);
    }

    fn push_raw(&mut self, text: &str) {
        self.current.push_str(text);
    }

    fn push_collapsed(&mut self, text: &str) {
        let words = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let at_boundary = self.current.is_empty() || self.current.ends_with(char::is_whitespace);
        let leading = text.starts_with(char::is_whitespace);
        let trailing = text.ends_with(char::is_whitespace);

        if words.is_empty() {
            if (leading || trailing) && !at_boundary {
                self.current.push(' ');
            }
            return;
        }
        if leading && !at_boundary {
            self.current.push(' ');
        }
        self.current.push_str(&words);
        if trailing {
            self.current.push(' ');
        }
    }

    fn write_text(&mut self, raw: &str, ctx: &RenderContext) -> Result<()> {
        let text = interpolate(raw, ctx)?;
        for (i, chunk) in BLANK_LINE.split(&text).enumerate() {
            if i > 0 {
                self.end_paragraph();
            }
            self.push_collapsed(chunk);
        }
        Ok(())
    }

    fn write_children(
        &mut self,
        children: &[Markup],
        ctx: &mut RenderContext,
        depth: usize,
    ) -> Result<()> {
        for child in children {
            match child {
                Markup::Text(text) => self.write_text(text, ctx)?,
                Markup::Element(el) => {
                    for_each_instance(el.attr(&["if"]), el.attr(&["for"]), ctx, |ctx| {
                        self.write_element(el, ctx, depth)
                    })?;
                }
            }
        }
        Ok(())
    }

    fn write_element(
        &mut self,
        el: &MarkupElement,
        ctx: &mut RenderContext,
        depth: usize,
    ) -> Result<()> {
        let tag = el.name.as_str();
        if let Some(kind) = BlockKind::from_tag(tag) {
            return self.write_block(kind, el, ctx, depth);
        }
        if let Some(kind) = MediaKind::from_tag(tag) {
            let media = load_media(kind, el, ctx, self.config)?;
            self.push_part(Part::Media(media));
            return Ok(());
        }

        match tag {
            "p" | "paragraph" => {
                self.end_paragraph();
                self.write_children(&el.children, ctx, depth)?;
                self.end_paragraph();
            }
            "b" | "strong" => self.write_wrapped("**", el, ctx, depth)?,
            "i" | "em" => self.write_wrapped("*", el, ctx, depth)?,
            "code" => {
                let code = interpolate(&el.text(), ctx)?;
                if code.contains('\n') || el.attr(&["inline"]) == Some("false") {
                    let lang = el.attr(&["lang"]).unwrap_or_default();
                    self.push_block(format!("```{lang}\n{}\n```", code.trim_matches('\n')));
                } else {
                    self.push_raw(&format!("`{}`", code.trim()));
                }
            }
            "br" => self.push_raw("\n"),
            "h" | "header" => {
                let mut inner = Writer::new(self.config);
                inner.write_children(&el.children, ctx, depth)?;
                let title = inner.finish_text();
                self.push_block(format!("{} {}", heading(depth), title));
            }
            "section" => {
                self.end_paragraph();
                self.write_children(&el.children, ctx, depth + 1)?;
                self.end_paragraph();
            }
            "list" => self.write_list(el, ctx, depth)?,
            "document" | "Document" => {
                let text = load_document(el, ctx, self.config)?;
                self.push_block(text.trim().to_string());
            }
            "object" | "Object" | "obj" => {
                let block = render_object(el, ctx)?;
                self.push_block(block);
            }
            "let" => bind_let(el, ctx, self.config)?,
            _ => self.write_children(&el.children, ctx, depth)?,
        }
        Ok(())
    }

    fn write_wrapped(
        &mut self,
        marker: &str,
        el: &MarkupElement,
        ctx: &mut RenderContext,
        depth: usize,
    ) -> Result<()> {
        self.push_raw(marker);
        self.write_children(&el.children, ctx, depth)?;
        let trimmed_len = self.current.trim_end().len();
        self.current.truncate(trimmed_len);
        self.push_raw(marker);
        Ok(())
    }

    fn write_block(
        &mut self,
        kind: BlockKind,
        el: &MarkupElement,
        ctx: &mut RenderContext,
        depth: usize,
    ) -> Result<()> {
        self.end_paragraph();
        let caption = match el.attr(&["caption"]) {
            Some(caption) => interpolate(caption, ctx)?,
            None => kind.default_caption().to_string(),
        };
        if !caption.is_empty() {
            match CaptionStyle::parse(el.attr(&["captionStyle", "caption-style"])) {
                CaptionStyle::Header => self.push_block(format!("{} {caption}", heading(depth))),
                CaptionStyle::Bold => self.push_block(format!("**{caption}:**")),
                CaptionStyle::Plain => self.push_block(format!("{caption}:")),
                CaptionStyle::Hidden => {}
            }
        }
        self.write_children(&el.children, ctx, depth + 1)?;
        self.end_paragraph();
        Ok(())
    }

    fn write_list(
        &mut self,
        el: &MarkupElement,
        ctx: &mut RenderContext,
        depth: usize,
    ) -> Result<()> {
        let decimal = el.attr(&["listStyle", "list-style"]) == Some("decimal");
        let config = self.config;
        let mut items = Vec::new();
        for item in el.child_elements().filter(|c| c.name == "item") {
            for_each_instance(item.attr(&["if"]), item.attr(&["for"]), ctx, |ctx| {
                let mut inner = Writer::new(config);
                inner.write_children(&item.children, ctx, depth)?;
                items.push(inner.finish_text());
                Ok(())
            })?;
        }

        let lines = items
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let marker = if decimal {
                    format!("{}. ", i + 1)
                } else {
                    "- ".to_string()
                };
                let indent = " ".repeat(marker.len());
                let body = text.replace('\n', &format!("\n{indent}"));
                format!("{marker}{body}")
            })
            .collect::<Vec<_>>();
        self.push_block(lines.join("\n"));
        Ok(())
    }
}

/// Parses `raw` as JSON after template evaluation. A body that is exactly
/// one `{{ expression }}` yields the expression result directly.
fn json_value(raw: &str, ctx: &RenderContext, context: &str) -> Result<Value> {
    match evaluate_attribute(raw.trim(), ctx)? {
        Value::String(text) if text.trim().is_empty() => Ok(Value::Null),
        Value::String(text) => {
            serde_json::from_str(text.trim()).map_err(|e| PomlError::InvalidJson {
                context: context.to_string(),
                message: e.to_string(),
            })
        }
        other => Ok(other),
    }
}

fn json_or_string(text: &str) -> Value {
    serde_json::from_str(text.trim()).unwrap_or_else(|_| Value::String(text.trim().to_string()))
}

fn attr_text(el: &MarkupElement, names: &[&str], ctx: &RenderContext) -> Result<String> {
    el.attr(names)
        .map_or_else(|| Ok(String::new()), |raw| interpolate(raw, ctx))
}

fn tool_spec(el: &MarkupElement, ctx: &RenderContext) -> Result<ToolSpec> {
    let name = attr_text(el, &["name"], ctx)?;
    let parameters = match json_value(&el.text(), ctx, &format!("tool-definition '{name}'"))? {
        Value::Null => json!({ "type": "object", "properties": {} }),
        other => other,
    };
    Ok(ToolSpec {
        description: attr_text(el, &["description"], ctx)?,
        name,
        parameters,
    })
}

fn tool_request(el: &MarkupElement, ctx: &RenderContext) -> Result<Part> {
    let id = attr_text(el, &["id"], ctx)?;
    let parameters = match el.attr(&["parameters"]) {
        None => Value::Object(Map::new()),
        Some(raw) => match json_value(raw, ctx, &format!("tool-request '{id}' parameters"))? {
            Value::Null => Value::Object(Map::new()),
            other => other,
        },
    };
    Ok(Part::ToolRequest {
        name: attr_text(el, &["name"], ctx)?,
        id,
        parameters,
    })
}

fn tool_outcome(
    kind: ToolOutcomeKind,
    el: &MarkupElement,
    ctx: &mut RenderContext,
    config: &RenderConfig,
) -> Result<Part> {
    let mut writer = Writer::new(config);
    writer.write_children(&el.children, ctx, 1)?;
    Ok(Part::ToolResponse {
        id: attr_text(el, &["id"], ctx)?,
        name: attr_text(el, &["name"], ctx)?,
        content: writer.finish_text(),
        is_error: kind == ToolOutcomeKind::Error,
    })
}

/// Converts `maxTokens` and `max-tokens` to `max_tokens`.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch == '-' || ch == ' ' {
            out.push('_');
            prev_lower = false;
        } else if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// Interprets a runtime attribute value as bool, integer, float or JSON
/// array/object; anything else stays a string.
pub fn coerce_runtime_value(text: &str) -> Value {
    let trimmed = text.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = trimmed.parse::<f64>()
        && float.is_finite()
    {
        return Value::from(float);
    }
    if (trimmed.starts_with('[') || trimmed.starts_with('{'))
        && let Ok(value) = serde_json::from_str::<Value>(trimmed)
    {
        return value;
    }
    Value::String(text.to_string())
}

fn runtime_settings(el: &MarkupElement, ctx: &RenderContext) -> Result<Map<String, Value>> {
    let mut settings = Map::new();
    for attr in &el.attributes {
        if crate::document::DIRECTIVE_ATTRIBUTES.contains(&attr.name.as_str()) {
            continue;
        }
        let value = match evaluate_attribute(&attr.value, ctx)? {
            Value::String(text) => coerce_runtime_value(&text),
            other => other,
        };
        settings.insert(snake_case(&attr.name), value);
    }
    Ok(settings)
}

fn media_mime(kind: MediaKind, syntax: &str) -> String {
    let syntax = syntax.trim().to_lowercase();
    if syntax.contains('/') {
        return syntax;
    }
    let subtype = match syntax.as_str() {
        "jpg" => "jpeg",
        "mp3" => "mpeg",
        other => other,
    };
    let family = match kind {
        MediaKind::Image => "image",
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    };
    format!("{family}/{subtype}")
}

fn load_media(
    kind: MediaKind,
    el: &MarkupElement,
    ctx: &RenderContext,
    config: &RenderConfig,
) -> Result<MediaPart> {
    let src = attr_text(el, &["src"], ctx)?;
    let alt = el
        .attr(&["alt"])
        .map(|alt| interpolate(alt, ctx))
        .transpose()?
        .filter(|alt| !alt.trim().is_empty());

    let (bytes, detected) = match parse_data_uri(&src)? {
        Some(uri) => (uri.bytes, uri.mime),
        None => {
            let path = resolve_reference_path(&src, &config.base_dir)?;
            let bytes = read_limited(&path, config.max_file_size)?;
            (bytes, Some(guess_mime(&path)))
        }
    };
    let mime = el
        .attr(&["syntax", "type"])
        .map(|syntax| media_mime(kind, syntax))
        .or(detected)
        .unwrap_or_else(|| "application/octet-stream".to_string());

    tracing::trace!(src = %src, mime = %mime, bytes = bytes.len(), "loaded media");
    Ok(MediaPart {
        mime,
        base64: STANDARD.encode(bytes),
        alt,
    })
}

fn load_document(el: &MarkupElement, ctx: &RenderContext, config: &RenderConfig) -> Result<String> {
    let src = attr_text(el, &["src"], ctx)?;
    let path = resolve_reference_path(&src, &config.base_dir)?;
    let bytes = read_limited(&path, config.max_file_size)?;
    tracing::debug!(path = %path.display(), "inlined document");
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn render_object(el: &MarkupElement, ctx: &RenderContext) -> Result<String> {
    let data = match el.attr(&["data"]) {
        Some(raw) => match evaluate_attribute(raw, ctx)? {
            Value::String(text) => json_or_string(&text),
            other => other,
        },
        None => json_or_string(&interpolate(&el.text(), ctx)?),
    };
    let syntax = el.attr(&["syntax"]).unwrap_or("json");
    let body = match syntax {
        "json" => serde_json::to_string_pretty(&data)?,
        "yaml" | "yml" => serde_yaml::to_string(&data)?.trim_end().to_string(),
        other => {
            return Err(PomlError::InvalidDirective {
                directive: "object".to_string(),
                message: format!("unsupported syntax '{other}' (expected json or yaml)"),
            });
        }
    };
    Ok(format!("```{syntax}\n{body}\n```"))
}

fn bind_let(el: &MarkupElement, ctx: &mut RenderContext, config: &RenderConfig) -> Result<()> {
    let name = el
        .attr(&["name"])
        .map(|n| interpolate(n, ctx))
        .transpose()?;

    let value = if let Some(src) = el.attr(&["src"]) {
        let src = interpolate(src, ctx)?;
        let path = resolve_reference_path(&src, &config.base_dir)?;
        let text = String::from_utf8_lossy(&read_limited(&path, config.max_file_size)?).into_owned();
        if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&text).map_err(|e| PomlError::InvalidJson {
                context: format!("let src '{src}'"),
                message: e.to_string(),
            })?
        } else {
            Value::String(text)
        }
    } else if let Some(raw) = el.attr(&["value"]) {
        if raw.contains("{{") {
            evaluate_attribute(raw, ctx)?
        } else {
            parse_expression(raw)?.evaluate(ctx)?
        }
    } else {
        json_or_string(&interpolate(&el.text(), ctx)?)
    };

    match (name, value) {
        (Some(name), value) => ctx.set(name, value),
        (None, Value::Object(map)) => ctx.extend(map),
        (None, _) => {
            return Err(PomlError::InvalidDirective {
                directive: "let".to_string(),
                message: "a binding without a name must hold a JSON object".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Builder;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn render(source: &str) -> Conversation {
        render_with(source, RenderConfig::default())
    }

    fn render_with(source: &str, config: RenderConfig) -> Conversation {
        let doc = Document::parse(source).unwrap();
        render_document(&doc, &config).unwrap()
    }

    fn text_of(message: &ConversationMessage) -> String {
        message.text()
    }

    #[test]
    fn test_blocks_render_as_markdown() {
        let conv = render(
            r#"<poml>
  <role>You are a helpful assistant.</role>
  <task>Explain <b>ownership</b>   in
     <i>Rust</i>.</task>
</poml>"#,
        );
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].speaker, Speaker::Human);
        assert_eq!(
            text_of(&conv.messages[0]),
            "# Role\n\nYou are a helpful assistant.\n\n# Task\n\nExplain **ownership** in *Rust*."
        );
    }

    #[test]
    fn test_caption_styles_and_nesting() {
        let conv = render(
            r#"<poml>
  <task caption="Job" captionStyle="bold">Do it.</task>
  <hint caption-style="plain">Be brief.</hint>
  <role captionStyle="hidden">Silent</role>
  <task>Outer<hint>Inner</hint></task>
</poml>"#,
        );
        assert_eq!(
            text_of(&conv.messages[0]),
            "**Job:**\n\nDo it.\n\nHint:\n\nBe brief.\n\nSilent\n\n# Task\n\nOuter\n\n## Hint\n\nInner"
        );
    }

    #[test]
    fn test_lists_and_paragraphs() {
        let conv = render(
            r#"<poml><cp><p>First</p><p>Second</p><list listStyle="decimal"><item>one</item><item>two</item></list><list><item>x</item></list></cp></poml>"#,
        );
        assert_eq!(
            text_of(&conv.messages[0]),
            "First\n\nSecond\n\n1. one\n2. two\n\n- x"
        );
    }

    #[test]
    fn test_blank_lines_split_paragraphs() {
        let conv = render("<poml><cp>alpha\n   beta\n\n   gamma</cp></poml>");
        assert_eq!(text_of(&conv.messages[0]), "alpha beta\n\ngamma");
    }

    #[test]
    fn test_blank_lines_with_spaces_in_every_text_node() {
        let conv = render(
            "<poml><cp>one\n \t \ntwo<b>bold</b>three\n\n\n  four</cp><cp>five\n  \nsix</cp></poml>",
        );
        assert_eq!(
            text_of(&conv.messages[0]),
            "one\n\ntwo**bold**three\n\nfour\n\nfive\n\nsix"
        );
    }

    #[test]
    fn test_templating_and_directives() {
        let mut config = RenderConfig::default();
        config.context.insert("name".into(), json!("Ada"));
        config.context.insert("items".into(), json!(["a", "b"]));
        let conv = render_with(
            r#"<poml>
  <let name="greeting" value="'Hello ' + name"/>
  <p>{{ greeting }}</p>
  <p for="item in items">{{ loop.index }}={{ item }}</p>
  <p if="missing">hidden</p>
  <list><item for="i in items" if="i == 'b'">{{ i }}</item></list>
</poml>"#,
            config,
        );
        assert_eq!(text_of(&conv.messages[0]), "Hello Ada\n\n0=a\n\n1=b\n\n- b");
    }

    #[test]
    fn test_let_body_and_object_binding() {
        let conv = render(
            r#"<poml><let name="cfg">{"n": 2}</let><let>{"who": "you"}</let><p>{{ cfg.n * 2 }} for {{ who }}</p></poml>"#,
        );
        assert_eq!(text_of(&conv.messages[0]), "4 for you");
    }

    #[test]
    fn test_undefined_variable_errors() {
        let doc = Document::parse("<poml><p>{{ nope }}</p></poml>").unwrap();
        let err = render_document(&doc, &RenderConfig::default()).unwrap_err();
        assert!(matches!(err, PomlError::UndefinedVariable { ref name } if name == "nope"));
    }

    #[test]
    fn test_messages_flush_loose_content() {
        let conv = render(
            r#"<poml>
  <system-msg>Be terse.</system-msg>
  <task>Loose task</task>
  <ai-msg>Sure.</ai-msg>
  <human-msg>Thanks</human-msg>
</poml>"#,
        );
        let speakers: Vec<_> = conv.messages.iter().map(|m| m.speaker).collect();
        assert_eq!(
            speakers,
            vec![Speaker::System, Speaker::Human, Speaker::Ai, Speaker::Human]
        );
        assert_eq!(text_of(&conv.messages[1]), "# Task\n\nLoose task");
    }

    #[test]
    fn test_tool_requests_aggregate() {
        let conv = render(
            r#"<poml>
  <tool-definition name="search" description="Search">{"type": "object"}</tool-definition>
  <human-msg>Find it</human-msg>
  <tool-request id="c1" name="search" parameters='{"q": "a"}'/>
  <tool-request id="c2" name="search" parameters="{{ { q: 'b' } }}"/>
  <tool-response id="c1" name="search">found a</tool-response>
  <tool-error id="c2" name="search">boom</tool-error>
</poml>"#,
        );
        assert_eq!(conv.tools.len(), 1);
        assert_eq!(conv.tools[0].parameters, json!({"type": "object"}));
        assert_eq!(conv.messages.len(), 4);
        assert_eq!(conv.messages[1].speaker, Speaker::Ai);
        assert_eq!(
            conv.messages[1].parts,
            vec![
                Part::ToolRequest {
                    id: "c1".into(),
                    name: "search".into(),
                    parameters: json!({"q": "a"}),
                },
                Part::ToolRequest {
                    id: "c2".into(),
                    name: "search".into(),
                    parameters: json!({"q": "b"}),
                },
            ]
        );
        assert_eq!(
            conv.messages[3].parts,
            vec![Part::ToolResponse {
                id: "c2".into(),
                name: "search".into(),
                content: "boom".into(),
                is_error: true,
            }]
        );
    }

    #[test]
    fn test_schema_and_runtime() {
        let conv = render(
            r#"<poml>
  <output-schema>{"type": "object", "properties": {"a": {"type": "string"}}}</output-schema>
  <runtime temperature="0.5" maxTokens="100" stream="true" stop='["x"]' model="gpt-x" top-p="1"/>
</poml>"#,
        );
        assert_eq!(conv.schema.unwrap()["properties"]["a"]["type"], "string");
        assert_eq!(
            Value::Object(conv.runtime.unwrap()),
            json!({
                "temperature": 0.5,
                "max_tokens": 100,
                "stream": true,
                "stop": ["x"],
                "model": "gpt-x",
                "top_p": 1,
            })
        );
        assert!(conv.messages.is_empty());
    }

    #[test]
    fn test_invalid_schema_json() {
        let doc = Document::parse("<poml><output-schema>{not json</output-schema></poml>").unwrap();
        let err = render_document(&doc, &RenderConfig::default()).unwrap_err();
        assert!(matches!(err, PomlError::InvalidJson { .. }));
    }

    #[test]
    fn test_media_and_documents_from_files() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("cat.png"), [1u8, 2, 3]).unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "Line one\nLine two\n").unwrap();
        let config = RenderConfig {
            base_dir: temp_dir.path().to_path_buf(),
            ..RenderConfig::default()
        };
        let conv = render_with(
            r#"<poml>
  <human-msg>Look <img src="cat.png" alt="a cat"/> then <audio src="data:audio/wav;base64,AAE="/></human-msg>
  <document src="notes.txt"/>
</poml>"#,
            config,
        );
        assert_eq!(
            conv.messages[0].parts,
            vec![
                Part::Text("Look".into()),
                Part::Media(MediaPart {
                    mime: "image/png".into(),
                    base64: "AQID".into(),
                    alt: Some("a cat".into()),
                }),
                Part::Text("then".into()),
                Part::Media(MediaPart {
                    mime: "audio/wav".into(),
                    base64: "AAE=".into(),
                    alt: None,
                }),
            ]
        );
        assert_eq!(text_of(&conv.messages[1]), "Line one\nLine two");
    }

    #[test]
    fn test_media_outside_base_dir_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = RenderConfig {
            base_dir: temp_dir.path().to_path_buf(),
            ..RenderConfig::default()
        };
        let doc = Document::parse(r#"<poml><img src="../../etc/passwd"/></poml>"#).unwrap();
        let err = render_document(&doc, &config).unwrap_err();
        assert!(matches!(
            err,
            PomlError::PathTraversal { .. } | PomlError::FileNotFound { .. }
        ));
    }

    #[test]
    fn test_object_syntaxes() {
        let conv = render(
            r#"<poml><object data='{"a": 1}'/><object syntax="yaml" data="{{ [1, 2] }}"/></poml>"#,
        );
        assert_eq!(
            text_of(&conv.messages[0]),
            "```json\n{\n  \"a\": 1\n}\n```\n\n```yaml\n- 1\n- 2\n```"
        );
    }

    #[test]
    fn test_strict_mode_validates() {
        let doc = Builder::new()
            .tool_response("orphan", "search", "x")
            .build();
        let strict = RenderConfig {
            strict: true,
            ..RenderConfig::default()
        };
        assert!(matches!(
            render_document(&doc, &strict),
            Err(PomlError::Validation { .. })
        ));
        assert!(render_document(&doc, &RenderConfig::default()).is_ok());
    }

    #[test]
    fn test_snake_case_and_coercion() {
        assert_eq!(snake_case("maxTokens"), "max_tokens");
        assert_eq!(snake_case("max-tokens"), "max_tokens");
        assert_eq!(snake_case("top_p"), "top_p");
        assert_eq!(coerce_runtime_value("42"), json!(42));
        assert_eq!(coerce_runtime_value("0.25"), json!(0.25));
        assert_eq!(coerce_runtime_value("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(coerce_runtime_value("[oops"), json!("[oops"));
        assert_eq!(coerce_runtime_value("gpt-4o"), json!("gpt-4o"));
    }
}
