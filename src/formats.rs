//! The five output shapes.
//!
//! `openai_chat` is plain JSON. `message_dict` and `dict` carry speakers
//! as opaque values. `langchain` messages are objects exposing their
//! fields; the `pydantic` frame dumps itself to a mapping.

use crate::document::Speaker;
use crate::error::PomlError;
use crate::normalize::{Rendered, RenderedObject};
use crate::render::{Conversation, ConversationMessage, MediaPart, Part, ToolSpec};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;

pub const TOOL_REQUEST_TYPE: &str = "application/vnd.poml.toolrequest";
pub const TOOL_RESPONSE_TYPE: &str = "application/vnd.poml.toolresponse";

/// Output shape requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Format {
    #[value(name = "message_dict")]
    MessageDict,
    #[value(name = "dict")]
    Dict,
    #[value(name = "openai_chat")]
    OpenAiChat,
    #[value(name = "langchain")]
    LangChain,
    #[value(name = "pydantic")]
    Pydantic,
}

impl Format {
    pub const ALL: [Format; 5] = [
        Format::MessageDict,
        Format::Dict,
        Format::OpenAiChat,
        Format::LangChain,
        Format::Pydantic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Format::MessageDict => "message_dict",
            Format::Dict => "dict",
            Format::OpenAiChat => "openai_chat",
            Format::LangChain => "langchain",
            Format::Pydantic => "pydantic",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = PomlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Format::ALL
            .into_iter()
            .find(|f| f.as_str() == s.trim())
            .ok_or_else(|| PomlError::UnsupportedFormat {
                value: s.to_string(),
            })
    }
}

/// Shapes `conversation` for `format`.
pub fn convert(conversation: Conversation, format: Format) -> Rendered {
    match format {
        Format::MessageDict => message_dict(&conversation.messages),
        Format::Dict => dict(conversation),
        Format::OpenAiChat => Rendered::Value(openai_chat(&conversation)),
        Format::LangChain => langchain(conversation),
        Format::Pydantic => Rendered::object(PromptFrame::from(conversation)),
    }
}

// Speakers reach the output through their textual representation.
impl RenderedObject for Speaker {}

fn media_json(media: &MediaPart) -> Value {
    let mut part = Map::new();
    part.insert("type".into(), json!(media.mime));
    part.insert("base64".into(), json!(media.base64));
    if let Some(alt) = &media.alt {
        part.insert("alt".into(), json!(alt));
    }
    Value::Object(part)
}

fn part_json(part: &Part) -> Value {
    match part {
        Part::Text(text) => json!(text),
        Part::Media(media) => media_json(media),
        Part::ToolRequest {
            id,
            name,
            parameters,
        } => json!({
            "type": TOOL_REQUEST_TYPE,
            "id": id,
            "name": name,
            "parameters": parameters,
        }),
        Part::ToolResponse {
            id,
            name,
            content,
            is_error,
        } => {
            let mut value = json!({
                "type": TOOL_RESPONSE_TYPE,
                "id": id,
                "name": name,
                "content": content,
            });
            if *is_error {
                value["error"] = json!(true);
            }
            value
        }
    }
}

/// String for a single text part, a bare object for a single other part,
/// a list otherwise.
fn message_content(message: &ConversationMessage) -> Value {
    match message.parts.as_slice() {
        [] => json!(""),
        [only] => part_json(only),
        parts => Value::Array(parts.iter().map(part_json).collect()),
    }
}

fn message_dict(messages: &[ConversationMessage]) -> Rendered {
    Rendered::Seq(
        messages
            .iter()
            .map(|message| {
                Rendered::map([
                    ("speaker", Rendered::object(message.speaker)),
                    ("content", Rendered::Value(message_content(message))),
                ])
            })
            .collect(),
    )
}

fn tool_json(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

fn tools_json(tools: &[ToolSpec]) -> Option<Value> {
    (!tools.is_empty()).then(|| Value::Array(tools.iter().map(tool_json).collect()))
}

/// Appends `schema`, `tools` and `runtime` when present.
fn with_extras(mut entries: Vec<(String, Rendered)>, conversation: Conversation) -> Rendered {
    if let Some(schema) = conversation.schema {
        entries.push(("schema".into(), Rendered::Value(schema)));
    }
    if let Some(tools) = tools_json(&conversation.tools) {
        entries.push(("tools".into(), Rendered::Value(tools)));
    }
    if let Some(runtime) = conversation.runtime {
        entries.push(("runtime".into(), Rendered::Value(Value::Object(runtime))));
    }
    Rendered::Map(entries)
}

fn dict(conversation: Conversation) -> Rendered {
    let messages = message_dict(&conversation.messages);
    with_extras(vec![("messages".into(), messages)], conversation)
}

fn openai_role(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::Human => "user",
        Speaker::Ai => "assistant",
        Speaker::System => "system",
        Speaker::Tool => "tool",
    }
}

fn media_subtype(mime: &str) -> &str {
    mime.split_once('/').map_or(mime, |(_, sub)| sub)
}

fn openai_content_parts(parts: &[Part]) -> Vec<Value> {
    let mut content = Vec::new();
    for part in parts {
        match part {
            Part::Text(text) => content.push(json!({ "type": "text", "text": text })),
            Part::Media(media) if media.mime.starts_with("image/") => {
                if let Some(alt) = &media.alt {
                    content.push(json!({ "type": "text", "text": alt }));
                }
                content.push(json!({
                    "type": "image_url",
                    "image_url": { "url": media.data_url() },
                }));
            }
            Part::Media(media) if media.mime.starts_with("audio/") => {
                content.push(json!({
                    "type": "input_audio",
                    "input_audio": {
                        "data": media.base64,
                        "format": media_subtype(&media.mime),
                    },
                }));
            }
            Part::Media(media) => content.push(json!({
                "type": "file",
                "file": { "file_data": media.data_url() },
            })),
            Part::ToolRequest { .. } | Part::ToolResponse { .. } => {}
        }
    }
    content
}

fn openai_message(message: &ConversationMessage) -> Vec<Value> {
    let role = openai_role(message.speaker);

    let responses: Vec<_> = message
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::ToolResponse { id, content, .. } => Some(json!({
                "role": "tool",
                "tool_call_id": id,
                "content": content,
            })),
            _ => None,
        })
        .collect();
    if !responses.is_empty() {
        return responses;
    }

    let calls: Vec<_> = message
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::ToolRequest {
                id,
                name,
                parameters,
            } => Some(json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": parameters.to_string(),
                },
            })),
            _ => None,
        })
        .collect();

    let only_text = message.parts.iter().all(|p| !matches!(p, Part::Media(_)));
    let content = if only_text {
        let text = message.text();
        if text.is_empty() && !calls.is_empty() {
            Value::Null
        } else {
            json!(text)
        }
    } else {
        Value::Array(openai_content_parts(&message.parts))
    };

    let mut out = json!({ "role": role, "content": content });
    if !calls.is_empty() {
        out["tool_calls"] = Value::Array(calls);
    }
    vec![out]
}

/// Bare message list, or a request body when the document declares
/// tools, an output schema or runtime settings.
fn openai_chat(conversation: &Conversation) -> Value {
    let messages = Value::Array(
        conversation
            .messages
            .iter()
            .flat_map(openai_message)
            .collect(),
    );
    if conversation.tools.is_empty()
        && conversation.schema.is_none()
        && conversation.runtime.is_none()
    {
        return messages;
    }

    let mut out = Map::new();
    out.insert("messages".into(), messages);
    if !conversation.tools.is_empty() {
        let tools = conversation
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    },
                })
            })
            .collect();
        out.insert("tools".into(), Value::Array(tools));
    }
    if let Some(schema) = &conversation.schema {
        out.insert(
            "response_format".into(),
            json!({
                "type": "json_schema",
                "json_schema": { "name": "schema", "schema": schema, "strict": true },
            }),
        );
    }
    if let Some(runtime) = &conversation.runtime {
        for (key, value) in runtime {
            out.insert(key.clone(), value.clone());
        }
    }
    Value::Object(out)
}

/// Chat message in LangChain's serialized layout.
#[derive(Debug, Clone, PartialEq)]
pub struct LangChainMessage {
    pub speaker: Speaker,
    pub content: Value,
    pub tool_calls: Vec<Value>,
    pub tool_call_id: Option<String>,
    pub is_error: bool,
}

impl LangChainMessage {
    pub fn kind(&self) -> &'static str {
        self.speaker.as_str()
    }

    fn from_message(message: &ConversationMessage) -> Vec<Self> {
        let responses: Vec<_> = message
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolResponse {
                    id,
                    content,
                    is_error,
                    ..
                } => Some(LangChainMessage {
                    speaker: Speaker::Tool,
                    content: json!(content),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(id.clone()),
                    is_error: *is_error,
                }),
                _ => None,
            })
            .collect();
        if !responses.is_empty() {
            return responses;
        }

        let tool_calls = message
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolRequest {
                    id,
                    name,
                    parameters,
                } => Some(json!({
                    "name": name,
                    "args": parameters,
                    "id": id,
                    "type": "tool_call",
                })),
                _ => None,
            })
            .collect();

        let content = if message.parts.iter().any(|p| matches!(p, Part::Media(_))) {
            Value::Array(message.parts.iter().filter_map(langchain_part).collect())
        } else {
            json!(message.text())
        };

        vec![LangChainMessage {
            speaker: message.speaker,
            content,
            tool_calls,
            tool_call_id: None,
            is_error: false,
        }]
    }
}

fn langchain_part(part: &Part) -> Option<Value> {
    match part {
        Part::Text(text) => Some(json!({ "type": "text", "text": text })),
        Part::Media(media) => {
            let family = media.mime.split('/').next().unwrap_or_default();
            let kind = match family {
                "image" | "audio" | "video" => family,
                _ => "file",
            };
            Some(json!({
                "type": kind,
                "source_type": "base64",
                "data": media.base64,
                "mime_type": media.mime,
            }))
        }
        Part::ToolRequest { .. } | Part::ToolResponse { .. } => None,
    }
}

impl fmt::Display for LangChainMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.content {
            Value::String(text) => write!(f, "{}: {}", self.kind(), text),
            other => write!(f, "{}: {}", self.kind(), other),
        }
    }
}

impl RenderedObject for LangChainMessage {
    fn can_list_fields(&self) -> bool {
        true
    }

    fn fields(&self) -> Option<Vec<(String, Rendered)>> {
        let mut data = Map::new();
        data.insert("content".into(), self.content.clone());
        data.insert("additional_kwargs".into(), json!({}));
        data.insert("response_metadata".into(), json!({}));
        data.insert("type".into(), json!(self.kind()));
        data.insert("name".into(), Value::Null);
        data.insert("id".into(), Value::Null);
        match self.speaker {
            Speaker::Human => {
                data.insert("example".into(), json!(false));
            }
            Speaker::Ai => {
                data.insert("example".into(), json!(false));
                data.insert("tool_calls".into(), Value::Array(self.tool_calls.clone()));
                data.insert("invalid_tool_calls".into(), json!([]));
                data.insert("usage_metadata".into(), Value::Null);
            }
            Speaker::Tool => {
                data.insert("tool_call_id".into(), json!(self.tool_call_id));
                data.insert("artifact".into(), Value::Null);
                let status = if self.is_error { "error" } else { "success" };
                data.insert("status".into(), json!(status));
            }
            Speaker::System => {}
        }
        Some(vec![
            ("type".into(), Rendered::Value(json!(self.kind()))),
            ("data".into(), Rendered::Value(Value::Object(data))),
        ])
    }
}

fn langchain(conversation: Conversation) -> Rendered {
    let messages = conversation
        .messages
        .iter()
        .flat_map(LangChainMessage::from_message)
        .map(Rendered::object)
        .collect();
    with_extras(vec![("messages".into(), Rendered::Seq(messages))], conversation)
}

/// Frame object returned for the `pydantic` format.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptFrame {
    pub messages: Vec<ConversationMessage>,
    pub output_schema: Option<Value>,
    pub tools: Vec<ToolSpec>,
    pub runtime: Option<Map<String, Value>>,
}

impl From<Conversation> for PromptFrame {
    fn from(conversation: Conversation) -> Self {
        Self {
            messages: conversation.messages,
            output_schema: conversation.schema,
            tools: conversation.tools,
            runtime: conversation.runtime,
        }
    }
}

impl fmt::Display for PromptFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PromptFrame(messages={}, tools={})",
            self.messages.len(),
            self.tools.len()
        )
    }
}

impl RenderedObject for PromptFrame {
    fn can_dump(&self) -> bool {
        true
    }

    fn model_dump(&self) -> Option<Map<String, Value>> {
        let messages = self
            .messages
            .iter()
            .map(|m| json!({ "speaker": m.speaker.as_str(), "content": message_content(m) }))
            .collect();
        let mut dump = Map::new();
        dump.insert("messages".into(), Value::Array(messages));
        dump.insert(
            "output_schema".into(),
            self.output_schema.clone().unwrap_or(Value::Null),
        );
        dump.insert(
            "tools".into(),
            tools_json(&self.tools).unwrap_or(Value::Null),
        );
        dump.insert(
            "runtime".into(),
            self.runtime.clone().map_or(Value::Null, Value::Object),
        );
        Some(dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::normalize::Normalizer;
    use crate::render::{RenderConfig, render_document};
    use pretty_assertions::assert_eq;

    fn shaped(source: &str, format: Format) -> Value {
        let doc = Document::parse(source).unwrap();
        let conversation = render_document(&doc, &RenderConfig::default()).unwrap();
        Normalizer::new().normalize(&convert(conversation, format))
    }

    const CHAT: &str = r#"<poml>
  <system-msg>Be terse.</system-msg>
  <human-msg>Search for Python</human-msg>
  <tool-request id="call_123" name="search" parameters="{{ { query: 'Python' } }}"/>
  <tool-response id="call_123" name="search">Python is a language.</tool-response>
</poml>"#;

    #[test]
    fn test_format_names_round_trip() {
        for format in Format::ALL {
            assert_eq!(format.as_str().parse::<Format>().unwrap(), format);
        }
        assert!(matches!(
            "yaml".parse::<Format>(),
            Err(PomlError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_message_dict_simple() {
        let value = shaped("<poml><human-msg>Hello world</human-msg></poml>", Format::MessageDict);
        assert_eq!(value, json!([{"speaker": "human", "content": "Hello world"}]));
    }

    #[test]
    fn test_message_dict_media_content() {
        let value = shaped(
            r#"<poml><img src="data:image/png;base64,AA==" alt="tiny"/></poml>"#,
            Format::MessageDict,
        );
        assert_eq!(
            value,
            json!([{"speaker": "human", "content": {"type": "image/png", "base64": "AA==", "alt": "tiny"}}])
        );
    }

    #[test]
    fn test_dict_with_schema_tools_runtime() {
        let value = shaped(
            r#"<poml>
  <output-schema>{"type": "object", "properties": {"answer": {"type": "string"}}}</output-schema>
  <tool-definition name="search" description="Search for information">
    {"type": "object", "properties": {"query": {"type": "string"}}}
  </tool-definition>
  <runtime temperature="0.5" max-tokens="150"/>
  <human-msg>What is AI?</human-msg>
</poml>"#,
            Format::Dict,
        );
        assert_eq!(value["messages"], json!([{"speaker": "human", "content": "What is AI?"}]));
        assert_eq!(value["schema"]["type"], "object");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["name"], "search");
        assert_eq!(value["runtime"], json!({"temperature": 0.5, "max_tokens": 150}));
    }

    #[test]
    fn test_dict_omits_absent_extras() {
        let value = shaped("<poml><human-msg>Hi</human-msg></poml>", Format::Dict);
        assert_eq!(value, json!({"messages": [{"speaker": "human", "content": "Hi"}]}));
    }

    #[test]
    fn test_openai_chat_tool_calls() {
        let value = shaped(CHAT, Format::OpenAiChat);
        let messages = value.as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], json!({"role": "system", "content": "Be terse."}));
        assert_eq!(messages[1], json!({"role": "user", "content": "Search for Python"}));
        assert_eq!(
            messages[2],
            json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_123",
                    "type": "function",
                    "function": {"name": "search", "arguments": "{\"query\":\"Python\"}"},
                }],
            })
        );
        assert_eq!(
            messages[3],
            json!({"role": "tool", "tool_call_id": "call_123", "content": "Python is a language."})
        );
    }

    #[test]
    fn test_openai_chat_extras() {
        let value = shaped(
            r#"<poml>
  <tool-definition name="get_weather" description="Get weather">{"type": "object"}</tool-definition>
  <output-schema>{"type": "string"}</output-schema>
  <runtime maxTokens="1000" topP="0.95" stop-sequences='["END","STOP"]'/>
  <human-msg>What's the weather?</human-msg>
</poml>"#,
            Format::OpenAiChat,
        );
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(
            value["response_format"],
            json!({"type": "json_schema", "json_schema": {"name": "schema", "schema": {"type": "string"}, "strict": true}})
        );
        assert_eq!(value["max_tokens"], 1000);
        assert_eq!(value["top_p"], 0.95);
        assert_eq!(value["stop_sequences"], json!(["END", "STOP"]));
    }

    #[test]
    fn test_openai_chat_media_parts() {
        let value = shaped(
            r#"<poml><img src="data:image/png;base64,AA==" alt="tiny"/><audio src="data:audio/mp3;base64,AQ=="/></poml>"#,
            Format::OpenAiChat,
        );
        assert_eq!(
            value[0]["content"],
            json!([
                {"type": "text", "text": "tiny"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA=="}},
                {"type": "input_audio", "input_audio": {"data": "AQ==", "format": "mp3"}},
            ])
        );
    }

    #[test]
    fn test_langchain_shape() {
        let value = shaped(CHAT, Format::LangChain);
        let messages = value["messages"].as_array().unwrap();
        let kinds: Vec<_> = messages.iter().map(|m| m["type"].clone()).collect();
        assert_eq!(kinds, vec![json!("system"), json!("human"), json!("ai"), json!("tool")]);
        assert_eq!(messages[1]["data"]["content"], "Search for Python");
        assert_eq!(messages[1]["data"]["additional_kwargs"], json!({}));
        assert_eq!(
            messages[2]["data"]["tool_calls"],
            json!([{"name": "search", "args": {"query": "Python"}, "id": "call_123", "type": "tool_call"}])
        );
        assert_eq!(messages[3]["data"]["tool_call_id"], "call_123");
        assert_eq!(messages[3]["data"]["status"], "success");
        assert!(value.get("tools").is_none());
    }

    #[test]
    fn test_langchain_aggregates_tool_calls_and_errors() {
        let value = shaped(
            r#"<poml>
  <tool-request id="c1" name="calc" parameters="{{ { x: 1 } }}"/>
  <tool-request id="c2" name="search" parameters="{{ { q: 'hi' } }}"/>
  <tool-error id="c1" name="calc">division by zero</tool-error>
</poml>"#,
            Format::LangChain,
        );
        let messages = value["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["data"]["tool_calls"].as_array().unwrap().len(), 2);
        assert_eq!(messages[1]["data"]["status"], "error");
    }

    #[test]
    fn test_pydantic_frame_dump() {
        let value = shaped("<poml><human-msg>Hello world</human-msg></poml>", Format::Pydantic);
        assert_eq!(
            value,
            json!({
                "messages": [{"speaker": "human", "content": "Hello world"}],
                "output_schema": null,
                "tools": null,
                "runtime": null,
            })
        );
    }

    #[test]
    fn test_frame_display() {
        let frame = PromptFrame::from(Conversation::default());
        assert_eq!(frame.to_string(), "PromptFrame(messages=0, tools=0)");
    }
}
