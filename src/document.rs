//! Typed POML document model.
//!
//! Parsing keeps attribute values and bodies exactly as written; `{{ }}`
//! expressions and `if`/`for` directives are resolved later by the renderer
//! against a context.

use crate::error::{PomlError, Result};
use crate::markup::{Markup, MarkupElement, parse_markup};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Root element name
pub const POML_ROOT: &str = "poml";

/// Who is speaking in a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speaker {
    Human,
    Ai,
    System,
    Tool,
}

impl Speaker {
    pub fn as_str(self) -> &'static str {
        match self {
            Speaker::Human => "human",
            Speaker::Ai => "ai",
            Speaker::System => "system",
            Speaker::Tool => "tool",
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captioned intention blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Role,
    Task,
    Hint,
    Example,
    OutputFormat,
    ContentPart,
    Input,
}

impl BlockKind {
    /// Maps a tag name to a block kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "role" => BlockKind::Role,
            "task" => BlockKind::Task,
            "hint" => BlockKind::Hint,
            "example" => BlockKind::Example,
            "output-format" | "OutputFormat" => BlockKind::OutputFormat,
            "cp" => BlockKind::ContentPart,
            "input" => BlockKind::Input,
            _ => return None,
        })
    }

    pub fn default_caption(self) -> &'static str {
        match self {
            BlockKind::Role => "Role",
            BlockKind::Task => "Task",
            BlockKind::Hint => "Hint",
            BlockKind::Example => "Example",
            BlockKind::OutputFormat => "Output Format",
            BlockKind::ContentPart => "",
            BlockKind::Input => "Input",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcomeKind {
    Response,
    Result,
    Error,
}

impl ToolOutcomeKind {
    pub fn tag(self) -> &'static str {
        match self {
            ToolOutcomeKind::Response => "tool-response",
            ToolOutcomeKind::Result => "tool-result",
            ToolOutcomeKind::Error => "tool-error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "img" | "image" => Some(MediaKind::Image),
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            MediaKind::Image => "img",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// `<meta>` identification fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    pub id: String,
    pub version: String,
    pub owner: String,
}

/// One `<output format="...">` entry inside `<style>`
#[derive(Debug, Clone, PartialEq)]
pub struct StyleOutput {
    pub format: Option<String>,
    pub body: String,
}

/// What a top-level element means.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Meta(Meta),
    Block(BlockKind),
    DocumentRef { src: Option<String> },
    Style { outputs: Vec<StyleOutput> },
    Object,
    Message(Speaker),
    ToolDefinition,
    ToolRequest,
    ToolOutcome(ToolOutcomeKind),
    OutputSchema,
    Runtime,
    Media(MediaKind),
    Let,
    Unknown,
}

/// A top-level element: its meaning plus the element it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub element: MarkupElement,
}

/// Attributes consumed by the engine itself, never forwarded as data.
pub const DIRECTIVE_ATTRIBUTES: &[&str] = &["if", "for"];

impl Node {
    pub fn new(kind: NodeKind, element: MarkupElement) -> Self {
        Self { kind, element }
    }

    pub fn tag(&self) -> &str {
        &self.element.name
    }

    pub fn attr(&self, names: &[&str]) -> Option<&str> {
        self.element.attr(names)
    }

    pub fn body(&self) -> &[Markup] {
        &self.element.children
    }

    pub fn condition(&self) -> Option<&str> {
        self.attr(&["if"])
    }

    pub fn repeat(&self) -> Option<&str> {
        self.attr(&["for"])
    }
}

/// A parsed POML document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub meta: Option<Meta>,
    pub nodes: Vec<Node>,
}

impl Document {
    /// Parses POML source text.
    ///
    /// # Errors
    ///
    /// - `PomlError::Xml`/`PomlError::UnexpectedEof` for malformed markup.
    /// - `PomlError::MissingRoot` when the root element is not `<poml>`.
    pub fn parse(source: &str) -> Result<Self> {
        let root = parse_markup(source)?;
        Self::from_markup(root)
    }

    /// Builds a document from an already parsed `<poml>` element.
    ///
    /// # Errors
    ///
    /// Returns `PomlError::MissingRoot` when `root` is not a `<poml>` element.
    pub fn from_markup(root: MarkupElement) -> Result<Self> {
        if root.name != POML_ROOT {
            return Err(PomlError::MissingRoot { found: root.name });
        }

        let mut doc = Document::default();
        let mut loose_text = String::new();
        for child in root.children {
            match child {
                Markup::Element(element) => {
                    flush_loose_text(&mut doc, &mut loose_text);
                    let kind = classify(&element);
                    if let NodeKind::Meta(meta) = &kind {
                        doc.meta = Some(meta.clone());
                    }
                    doc.nodes.push(Node::new(kind, element));
                }
                Markup::Text(text) => loose_text.push_str(&text),
            }
        }
        flush_loose_text(&mut doc, &mut loose_text);

        tracing::debug!(nodes = doc.nodes.len(), "parsed POML document");
        Ok(doc)
    }

    pub fn nodes_of<'a>(&'a self, pred: impl Fn(&NodeKind) -> bool + 'a) -> impl Iterator<Item = &'a Node> {
        self.nodes.iter().filter(move |n| pred(&n.kind))
    }

    pub fn tool_definitions(&self) -> impl Iterator<Item = &Node> {
        self.nodes_of(|k| matches!(k, NodeKind::ToolDefinition))
    }

    /// Checks structural consistency of inputs, references and tool events.
    ///
    /// # Errors
    ///
    /// Returns `PomlError::Validation` listing every problem found.
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();

        let mut input_names = HashSet::new();
        let mut tool_names = HashSet::new();
        let mut requests: HashMap<String, String> = HashMap::new();
        let defined: HashSet<&str> = self
            .tool_definitions()
            .filter_map(|n| non_empty(n.attr(&["name"])))
            .collect();

        for (index, node) in self.nodes.iter().enumerate() {
            match &node.kind {
                NodeKind::Meta(meta) => {
                    for (field, value) in [
                        ("id", &meta.id),
                        ("version", &meta.version),
                        ("owner", &meta.owner),
                    ] {
                        if value.trim().is_empty() {
                            issues.push(format!("meta.{field} is required"));
                        }
                    }
                }
                NodeKind::Block(BlockKind::Input) => match non_empty(node.attr(&["name"])) {
                    None => issues.push("input.name is required".to_string()),
                    Some(name) => {
                        if !input_names.insert(name.to_string()) {
                            issues.push(format!("duplicate input name \"{name}\""));
                        }
                    }
                },
                NodeKind::DocumentRef { src } => {
                    if non_empty(src.as_deref()).is_none() {
                        issues.push("document src is required".to_string());
                    }
                }
                NodeKind::Style { outputs } => {
                    if outputs
                        .iter()
                        .any(|o| non_empty(o.format.as_deref()).is_none())
                    {
                        issues.push("style output format is required".to_string());
                    }
                }
                NodeKind::Object => {
                    if node.attr(&["data"]).is_none() && node.element.text().trim().is_empty() {
                        issues.push("object requires a data attribute or body".to_string());
                    }
                }
                NodeKind::Media(kind) => {
                    if non_empty(node.attr(&["src"])).is_none() {
                        issues.push(format!("{} src is required", kind.tag()));
                    }
                }
                NodeKind::ToolDefinition => match non_empty(node.attr(&["name"])) {
                    None => issues.push("tool-definition name is required".to_string()),
                    Some(name) => {
                        if !tool_names.insert(name.to_string()) {
                            issues.push(format!("duplicate tool-definition name \"{name}\""));
                        }
                    }
                },
                NodeKind::ToolRequest => {
                    let id = non_empty(node.attr(&["id"]));
                    let name = non_empty(node.attr(&["name"]));
                    let label = id.map_or_else(|| format!("#{index}"), str::to_string);
                    if id.is_none() {
                        issues.push("tool-request id is required".to_string());
                    }
                    match name {
                        None => issues.push("tool-request name is required".to_string()),
                        Some(name) if !defined.is_empty() && !defined.contains(name) => {
                            issues.push(format!(
                                "tool-request \"{label}\" references unknown tool-definition \"{name}\""
                            ));
                        }
                        Some(_) => {}
                    }
                    if let Some(id) = id
                        && requests
                            .insert(id.to_string(), name.unwrap_or_default().to_string())
                            .is_some()
                    {
                        issues.push(format!("duplicate tool-request id \"{id}\""));
                    }
                }
                NodeKind::ToolOutcome(kind) => {
                    let tag = kind.tag();
                    let id = non_empty(node.attr(&["id"]));
                    let name = non_empty(node.attr(&["name"]));
                    match id {
                        None => issues.push(format!("{tag} id is required")),
                        Some(id) => match requests.get(id) {
                            None => issues
                                .push(format!("{tag} id \"{id}\" does not match a tool-request")),
                            Some(requested) => {
                                if let Some(name) = name
                                    && !requested.is_empty()
                                    && requested != name
                                {
                                    issues.push(format!(
                                        "{tag} id \"{id}\" uses tool \"{name}\" but request used \"{requested}\""
                                    ));
                                }
                            }
                        },
                    }
                    if name.is_none() {
                        issues.push(format!("{tag} name is required"));
                    }
                }
                NodeKind::Let => {
                    if node.attr(&["name"]).is_none() && node.attr(&["src"]).is_none() {
                        issues.push("let requires a name or src attribute".to_string());
                    }
                }
                _ => {}
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(PomlError::Validation { issues })
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Bare text directly under `<poml>` becomes an anonymous paragraph node.
fn flush_loose_text(doc: &mut Document, text: &mut String) {
    if !text.trim().is_empty() {
        let element = MarkupElement::new("p").with_text(std::mem::take(text));
        doc.nodes.push(Node::new(NodeKind::Unknown, element));
    }
    text.clear();
}

fn classify(element: &MarkupElement) -> NodeKind {
    let tag = element.name.as_str();
    if let Some(kind) = BlockKind::from_tag(tag) {
        return NodeKind::Block(kind);
    }
    if let Some(kind) = MediaKind::from_tag(tag) {
        return NodeKind::Media(kind);
    }
    match tag {
        "meta" => NodeKind::Meta(read_meta(element)),
        "document" | "Document" => NodeKind::DocumentRef {
            src: element.attr(&["src"]).map(str::to_string),
        },
        "style" => NodeKind::Style {
            outputs: element
                .child_elements()
                .filter(|c| c.name == "output")
                .map(|c| StyleOutput {
                    format: c.attr(&["format"]).map(str::to_string),
                    body: c.text().trim().to_string(),
                })
                .collect(),
        },
        "object" | "Object" | "obj" => NodeKind::Object,
        "human-msg" | "user-msg" => NodeKind::Message(Speaker::Human),
        "ai-msg" | "assistant-msg" => NodeKind::Message(Speaker::Ai),
        "system-msg" => NodeKind::Message(Speaker::System),
        "tool-definition" | "tool" => NodeKind::ToolDefinition,
        "tool-request" => NodeKind::ToolRequest,
        "tool-response" => NodeKind::ToolOutcome(ToolOutcomeKind::Response),
        "tool-result" => NodeKind::ToolOutcome(ToolOutcomeKind::Result),
        "tool-error" => NodeKind::ToolOutcome(ToolOutcomeKind::Error),
        "output-schema" | "OutputSchema" => NodeKind::OutputSchema,
        "runtime" => NodeKind::Runtime,
        "let" => NodeKind::Let,
        _ => NodeKind::Unknown,
    }
}

fn read_meta(element: &MarkupElement) -> Meta {
    let field = |name: &str| {
        element
            .child_elements()
            .find(|c| c.name == name)
            .map(|c| c.text().trim().to_string())
            .or_else(|| element.attr(&[name]).map(str::to_string))
            .unwrap_or_default()
    };
    Meta {
        id: field("id"),
        version: field("version"),
        owner: field("owner"),
    }
}

/// Fluent construction of a `Document` in code.
#[derive(Debug, Default)]
pub struct Builder {
    doc: Document,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> Document {
        self.doc
    }

    fn push(mut self, kind: NodeKind, element: MarkupElement) -> Self {
        self.doc.nodes.push(Node::new(kind, element));
        self
    }

    fn text_node(self, kind: NodeKind, tag: &str, body: &str) -> Self {
        self.push(kind, MarkupElement::new(tag).with_text(body))
    }

    pub fn meta(mut self, id: &str, version: &str, owner: &str) -> Self {
        let meta = Meta {
            id: id.to_string(),
            version: version.to_string(),
            owner: owner.to_string(),
        };
        self.doc.meta = Some(meta.clone());
        let element = MarkupElement::new("meta")
            .with_attr("id", id)
            .with_attr("version", version)
            .with_attr("owner", owner);
        self.push(NodeKind::Meta(meta), element)
    }

    pub fn role(self, body: &str) -> Self {
        self.text_node(NodeKind::Block(BlockKind::Role), "role", body)
    }

    pub fn task(self, body: &str) -> Self {
        self.text_node(NodeKind::Block(BlockKind::Task), "task", body)
    }

    pub fn hint(self, body: &str) -> Self {
        self.text_node(NodeKind::Block(BlockKind::Hint), "hint", body)
    }

    pub fn example(self, body: &str) -> Self {
        self.text_node(NodeKind::Block(BlockKind::Example), "example", body)
    }

    pub fn output_format(self, body: &str) -> Self {
        self.text_node(
            NodeKind::Block(BlockKind::OutputFormat),
            "output-format",
            body,
        )
    }

    pub fn input(self, name: &str, required: bool, body: &str) -> Self {
        let element = MarkupElement::new("input")
            .with_attr("name", name)
            .with_attr("required", required.to_string())
            .with_text(body);
        self.push(NodeKind::Block(BlockKind::Input), element)
    }

    pub fn document_ref(self, src: &str) -> Self {
        let element = MarkupElement::new("document").with_attr("src", src);
        self.push(
            NodeKind::DocumentRef {
                src: Some(src.to_string()),
            },
            element,
        )
    }

    pub fn human(self, body: &str) -> Self {
        self.text_node(NodeKind::Message(Speaker::Human), "human-msg", body)
    }

    pub fn assistant(self, body: &str) -> Self {
        self.text_node(NodeKind::Message(Speaker::Ai), "ai-msg", body)
    }

    pub fn system(self, body: &str) -> Self {
        self.text_node(NodeKind::Message(Speaker::System), "system-msg", body)
    }

    pub fn tool_definition(self, name: &str, description: &str, parameters: &Value) -> Self {
        let element = MarkupElement::new("tool-definition")
            .with_attr("name", name)
            .with_attr("description", description)
            .with_text(parameters.to_string());
        self.push(NodeKind::ToolDefinition, element)
    }

    pub fn tool_request(self, id: &str, name: &str, parameters: &Value) -> Self {
        let element = MarkupElement::new("tool-request")
            .with_attr("id", id)
            .with_attr("name", name)
            .with_attr("parameters", parameters.to_string());
        self.push(NodeKind::ToolRequest, element)
    }

    pub fn tool_outcome(self, kind: ToolOutcomeKind, id: &str, name: &str, body: &str) -> Self {
        let element = MarkupElement::new(kind.tag())
            .with_attr("id", id)
            .with_attr("name", name)
            .with_text(body);
        self.push(NodeKind::ToolOutcome(kind), element)
    }

    pub fn tool_response(self, id: &str, name: &str, body: &str) -> Self {
        self.tool_outcome(ToolOutcomeKind::Response, id, name, body)
    }

    /// Sets the output schema, replacing any earlier one.
    pub fn output_schema(mut self, schema: &Value) -> Self {
        self.doc.nodes.retain(|n| n.kind != NodeKind::OutputSchema);
        self.text_node(NodeKind::OutputSchema, "output-schema", &schema.to_string())
    }

    pub fn runtime(self, settings: &Map<String, Value>) -> Self {
        let element = settings
            .iter()
            .fold(MarkupElement::new("runtime"), |el, (key, value)| {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                el.with_attr(key.as_str(), text)
            });
        self.push(NodeKind::Runtime, element)
    }

    pub fn media(self, kind: MediaKind, src: &str, alt: Option<&str>) -> Self {
        let mut element = MarkupElement::new(kind.tag()).with_attr("src", src);
        if let Some(alt) = alt {
            element = element.with_attr("alt", alt);
        }
        self.push(NodeKind::Media(kind), element)
    }

    pub fn let_value(self, name: &str, value: &Value) -> Self {
        let element = MarkupElement::new("let")
            .with_attr("name", name)
            .with_text(value.to_string());
        self.push(NodeKind::Let, element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"<poml>
  <meta><id>demo</id><version>1.0.0</version><owner>me</owner></meta>
  <role>You are a helpful assistant.</role>
  <task>Explain <b>ownership</b>.</task>
  <input name="topic" required="true">borrowing</input>
  <document src="notes.txt"/>
  <style><output format="markdown"/></style>
  <human-msg>Hi</human-msg>
  <ai-msg>Hello</ai-msg>
  <custom-tag>kept</custom-tag>
</poml>"#;

    #[test]
    fn test_parse_preserves_order_and_kinds() {
        let doc = Document::parse(SAMPLE).unwrap();
        let kinds: Vec<_> = doc.nodes.iter().map(|n| n.kind.clone()).collect();
        assert!(matches!(kinds[0], NodeKind::Meta(_)));
        assert_eq!(kinds[1], NodeKind::Block(BlockKind::Role));
        assert_eq!(kinds[2], NodeKind::Block(BlockKind::Task));
        assert_eq!(kinds[3], NodeKind::Block(BlockKind::Input));
        assert!(matches!(kinds[4], NodeKind::DocumentRef { .. }));
        assert!(matches!(kinds[5], NodeKind::Style { .. }));
        assert_eq!(kinds[6], NodeKind::Message(Speaker::Human));
        assert_eq!(kinds[7], NodeKind::Message(Speaker::Ai));
        assert_eq!(kinds[8], NodeKind::Unknown);
        assert_eq!(doc.meta.as_ref().unwrap().owner, "me");
        assert_eq!(doc.nodes[1].element.text().trim(), "You are a helpful assistant.");
        assert_eq!(
            doc.nodes_of(|k| matches!(k, NodeKind::Message(_))).count(),
            2
        );
        doc.validate().unwrap();
    }

    #[test]
    fn test_parse_rejects_foreign_root() {
        let err = Document::parse("<html><body/></html>").unwrap_err();
        assert!(matches!(err, PomlError::MissingRoot { ref found } if found == "html"));
    }

    #[test]
    fn test_tag_aliases() {
        let doc = Document::parse(
            r#"<poml><tool name="a">{}</tool><Document src="x"/><assistant-msg>x</assistant-msg><Object data="1"/></poml>"#,
        )
        .unwrap();
        assert_eq!(doc.nodes[0].kind, NodeKind::ToolDefinition);
        assert!(matches!(doc.nodes[1].kind, NodeKind::DocumentRef { .. }));
        assert_eq!(doc.nodes[2].kind, NodeKind::Message(Speaker::Ai));
        assert_eq!(doc.nodes[3].kind, NodeKind::Object);
    }

    #[test]
    fn test_loose_text_becomes_paragraph() {
        let doc = Document::parse("<poml>Just some text</poml>").unwrap();
        assert_eq!(doc.nodes.len(), 1);
        assert_eq!(doc.nodes[0].tag(), "p");
        assert_eq!(doc.nodes[0].element.text(), "Just some text");
    }

    #[test]
    fn test_validate_tool_events() {
        let doc = Document::parse(
            r#"<poml>
  <tool-definition name="search">{}</tool-definition>
  <tool-request id="c1" name="search" parameters="{}"/>
  <tool-response id="c1" name="search">ok</tool-response>
  <tool-result id="c2" name="search">orphan</tool-result>
  <tool-error id="c1" name="calc">mismatch</tool-error>
  <tool-request id="c1" name="nope"/>
</poml>"#,
        )
        .unwrap();
        let Err(PomlError::Validation { issues }) = doc.validate() else {
            panic!("expected validation failure");
        };
        assert!(issues.iter().any(|i| i.contains("\"c2\" does not match a tool-request")));
        assert!(issues.iter().any(|i| i.contains("uses tool \"calc\" but request used \"search\"")));
        assert!(issues.iter().any(|i| i.contains("unknown tool-definition \"nope\"")));
        assert!(issues.iter().any(|i| i.contains("duplicate tool-request id \"c1\"")));
    }

    #[test]
    fn test_validate_requests_without_definitions() {
        let doc = Document::parse(
            r#"<poml><tool-request id="c1" name="search" parameters="{}"/></poml>"#,
        )
        .unwrap();
        doc.validate().unwrap();
    }

    #[test]
    fn test_validate_missing_names_and_meta() {
        let doc = Document::parse(
            r#"<poml><meta><id>x</id></meta><input>no name</input><input name="a"/><input name="a"/><tool-definition>{}</tool-definition><img/><style><output/></style></poml>"#,
        )
        .unwrap();
        let Err(PomlError::Validation { issues }) = doc.validate() else {
            panic!("expected validation failure");
        };
        assert!(issues.contains(&"meta.version is required".to_string()));
        assert!(issues.contains(&"meta.owner is required".to_string()));
        assert!(issues.contains(&"input.name is required".to_string()));
        assert!(issues.contains(&"duplicate input name \"a\"".to_string()));
        assert!(issues.contains(&"tool-definition name is required".to_string()));
        assert!(issues.contains(&"img src is required".to_string()));
        assert!(issues.contains(&"style output format is required".to_string()));
    }

    #[test]
    fn test_builder_creates_tooling_and_schema() {
        let doc = Builder::new()
            .meta("builder.demo", "1.0.0", "me")
            .role("role")
            .task("t")
            .human("hi")
            .tool_definition("search", "Search for things", &json!({"type": "object"}))
            .tool_request("call_1", "search", &json!({"query": "python"}))
            .tool_response("call_1", "search", "result")
            .output_schema(&json!({"type": "string"}))
            .output_schema(&json!({"type": "object"}))
            .runtime(json!({"temperature": 0.2}).as_object().unwrap())
            .build();
        doc.validate().unwrap();
        assert_eq!(
            doc.nodes_of(|k| *k == NodeKind::OutputSchema).count(),
            1
        );
        assert_eq!(doc.tool_definitions().count(), 1);
        let runtime = doc.nodes_of(|k| *k == NodeKind::Runtime).next().unwrap();
        assert_eq!(runtime.attr(&["temperature"]), Some("0.2"));
    }
}
