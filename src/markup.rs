//! Owned XML element tree built from quick-xml events.
//!
//! POML bodies mix text with inline markup (`<b>`, `<list>`, `<img>`), so
//! element contents are kept as a tree instead of raw strings and rendered
//! later once template variables are known.

use crate::error::{PomlError, Result};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// A node inside an element body.
#[derive(Debug, Clone, PartialEq)]
pub enum Markup {
    Element(MarkupElement),
    Text(String),
}

/// A single `name="value"` pair, kept in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// An element with its attributes and children.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarkupElement {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Markup>,
    /// Byte offset of the opening `<`.
    pub position: u64,
}

impl MarkupElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns the first attribute matching any of `names`.
    ///
    /// POML accepts both `captionStyle` and `caption-style` spellings, so
    /// callers pass every accepted alias.
    pub fn attr(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| {
            self.attributes
                .iter()
                .find(|a| a.name == *name)
                .map(|a| a.value.as_str())
        })
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Markup::Text(text.into()));
        self
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &MarkupElement> {
        self.children.iter().filter_map(|child| match child {
            Markup::Element(el) => Some(el),
            Markup::Text(_) => None,
        })
    }

    /// Concatenated text of all descendants, markup stripped.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }
}

fn collect_text(children: &[Markup], out: &mut String) {
    for child in children {
        match child {
            Markup::Text(text) => out.push_str(text),
            Markup::Element(el) => collect_text(&el.children, out),
        }
    }
}

/// Deepest element nesting accepted, root included.
pub const MAX_NESTING: usize = 128;

struct Frame {
    element: MarkupElement,
}

/// Parses `source` and returns its single root element.
///
/// # Errors
///
/// - `PomlError::Xml` for malformed markup or content after the root element.
/// - `PomlError::UnexpectedEof` when an element is left open.
pub fn parse_markup(source: &str) -> Result<MarkupElement> {
    let mut reader = Reader::from_str(source);
    reader.config_mut().trim_text_start = false;
    reader.config_mut().trim_text_end = false;

    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<MarkupElement> = None;

    loop {
        let event_start = reader.buffer_position();
        let event = reader.read_event().map_err(|e| PomlError::Xml {
            message: e.to_string(),
            position: Some(reader.error_position()),
        })?;

        match event {
            Event::Start(e) => {
                ensure_single_root(&root, event_start)?;
                if stack.len() >= MAX_NESTING {
                    return Err(PomlError::Xml {
                        message: format!("elements nested deeper than {MAX_NESTING} levels"),
                        position: Some(event_start),
                    });
                }
                let element = start_element(&e, event_start)?;
                stack.push(Frame { element });
            }
            Event::Empty(e) => {
                ensure_single_root(&root, event_start)?;
                let element = start_element(&e, event_start)?;
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                // quick-xml already verified that the end tag matches
                if let Some(frame) = stack.pop() {
                    attach(&mut stack, &mut root, frame.element);
                }
            }
            Event::Text(e) => {
                let text = e.unescape().map_err(|err| PomlError::Xml {
                    message: format!("Invalid text content: {err}"),
                    position: Some(event_start),
                })?;
                push_text(&mut stack, &root, text.into_owned(), event_start)?;
            }
            Event::CData(e) => {
                let text = String::from_utf8_lossy(e.as_ref()).into_owned();
                push_text(&mut stack, &root, text, event_start)?;
            }
            Event::Comment(_) | Event::PI(_) | Event::Decl(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }

    if let Some(frame) = stack.last() {
        return Err(PomlError::UnexpectedEof {
            expected: format!("closing tag </{}>", frame.element.name),
        });
    }

    root.ok_or_else(|| PomlError::UnexpectedEof {
        expected: "a root element".to_string(),
    })
}

fn ensure_single_root(root: &Option<MarkupElement>, position: u64) -> Result<()> {
    if root.is_some() {
        return Err(PomlError::Xml {
            message: "content after the root element".to_string(),
            position: Some(position),
        });
    }
    Ok(())
}

fn start_element(e: &BytesStart<'_>, position: u64) -> Result<MarkupElement> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value().map_err(|err| PomlError::Xml {
            message: format!("Invalid attribute value: {err}"),
            position: Some(position),
        })?;
        attributes.push(Attribute {
            name: String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            value: value.into_owned(),
        });
    }
    Ok(MarkupElement {
        name,
        attributes,
        children: Vec::new(),
        position,
    })
}

fn attach(stack: &mut [Frame], root: &mut Option<MarkupElement>, element: MarkupElement) {
    match stack.last_mut() {
        Some(parent) => parent.element.children.push(Markup::Element(element)),
        None => *root = Some(element),
    }
}

fn push_text(
    stack: &mut [Frame],
    root: &Option<MarkupElement>,
    text: String,
    position: u64,
) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            // Merge adjacent runs (text split around CDATA or entities)
            if let Some(Markup::Text(prev)) = parent.element.children.last_mut() {
                prev.push_str(&text);
            } else {
                parent.element.children.push(Markup::Text(text));
            }
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(PomlError::Xml {
            message: if root.is_some() {
                "text after the root element".to_string()
            } else {
                "text before the root element".to_string()
            },
            position: Some(position),
        }),
    }
}
