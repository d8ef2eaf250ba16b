//! Output normalization.
//!
//! Rendered output is a mix of plain JSON and opaque objects. Opaque
//! objects are turned into JSON by an ordered chain of converters: the
//! first converter whose predicate accepts an object transforms it, and
//! the result is normalized again. The last converter in the default
//! chain accepts every object, so normalization never fails.

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Nesting limit for converter results; deeper objects become strings.
pub const MAX_DEPTH: usize = 64;

/// Capabilities an opaque output object may expose.
pub trait RenderedObject: fmt::Debug + fmt::Display + Send + Sync {
    fn can_dump(&self) -> bool {
        false
    }

    /// Dumps the object to a plain mapping.
    fn model_dump(&self) -> Option<Map<String, Value>> {
        None
    }

    fn can_list_fields(&self) -> bool {
        false
    }

    /// Field names and values, in declaration order.
    fn fields(&self) -> Option<Vec<(String, Rendered)>> {
        None
    }
}

/// Value produced by a template engine for one output format.
#[derive(Debug)]
pub enum Rendered {
    Value(Value),
    Seq(Vec<Rendered>),
    Map(Vec<(String, Rendered)>),
    Object(Box<dyn RenderedObject>),
}

impl Rendered {
    pub fn object(object: impl RenderedObject + 'static) -> Self {
        Rendered::Object(Box::new(object))
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Rendered)>) -> Self {
        Rendered::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<Value> for Rendered {
    fn from(value: Value) -> Self {
        Rendered::Value(value)
    }
}

/// One step of the fallback chain.
pub trait Converter: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_convert(&self, object: &dyn RenderedObject) -> bool;
    fn convert(&self, object: &dyn RenderedObject) -> Rendered;
}

/// Uses the object's own mapping dump.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelDump;

impl Converter for ModelDump {
    fn name(&self) -> &'static str {
        "model_dump"
    }

    fn can_convert(&self, object: &dyn RenderedObject) -> bool {
        object.can_dump()
    }

    fn convert(&self, object: &dyn RenderedObject) -> Rendered {
        Rendered::Value(Value::Object(object.model_dump().unwrap_or_default()))
    }
}

/// Builds a mapping from the object's fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldAccess;

impl Converter for FieldAccess {
    fn name(&self) -> &'static str {
        "fields"
    }

    fn can_convert(&self, object: &dyn RenderedObject) -> bool {
        object.can_list_fields()
    }

    fn convert(&self, object: &dyn RenderedObject) -> Rendered {
        Rendered::Map(object.fields().unwrap_or_default())
    }
}

/// Textual representation; accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisplayString;

impl Converter for DisplayString {
    fn name(&self) -> &'static str {
        "display"
    }

    fn can_convert(&self, _object: &dyn RenderedObject) -> bool {
        true
    }

    fn convert(&self, object: &dyn RenderedObject) -> Rendered {
        Rendered::Value(Value::String(object.to_string()))
    }
}

pub struct Normalizer {
    converters: Vec<Box<dyn Converter>>,
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.converters.iter().map(|c| c.name()))
            .finish()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    /// Default chain: model dump, field access, string fallback.
    pub fn new() -> Self {
        Self::with_converters(vec![
            Box::new(ModelDump),
            Box::new(FieldAccess),
            Box::new(DisplayString),
        ])
    }

    /// Custom chain. Objects no converter accepts still fall back to
    /// their textual representation.
    pub fn with_converters(converters: Vec<Box<dyn Converter>>) -> Self {
        Self { converters }
    }

    pub fn converter_names(&self) -> Vec<&'static str> {
        self.converters.iter().map(|c| c.name()).collect()
    }

    fn convert_object(&self, object: &dyn RenderedObject, depth: usize) -> Rendered {
        if depth >= MAX_DEPTH {
            tracing::warn!(object = %object, "normalization depth exceeded");
            return DisplayString.convert(object);
        }
        let converter = self
            .converters
            .iter()
            .find(|c| c.can_convert(object))
            .map_or(&DisplayString as &dyn Converter, |c| c.as_ref());
        tracing::trace!(converter = converter.name(), object = ?object, "converting object");
        converter.convert(object)
    }

    /// Converts `value` into plain JSON.
    pub fn normalize(&self, value: &Rendered) -> Value {
        self.normalize_at(value, 0)
    }

    fn normalize_at(&self, value: &Rendered, depth: usize) -> Value {
        match value {
            Rendered::Value(v) => v.clone(),
            Rendered::Seq(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.normalize_at(item, depth))
                    .collect(),
            ),
            Rendered::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.normalize_at(v, depth)))
                    .collect(),
            ),
            Rendered::Object(object) => {
                let converted = self.convert_object(object.as_ref(), depth);
                self.normalize_at(&converted, depth + 1)
            }
        }
    }

    /// Serializable view; objects are converted while serializing.
    pub fn view<'a>(&'a self, value: &'a Rendered) -> Normalized<'a> {
        Normalized {
            normalizer: self,
            value,
            depth: 0,
        }
    }

    /// Serializes `value` as one line of JSON.
    ///
    /// # Errors
    ///
    /// Returns `PomlError::Json` if serialization fails.
    pub fn to_json_line(&self, value: &Rendered) -> crate::Result<String> {
        Ok(serde_json::to_string(&self.view(value))?)
    }

    /// Serializes `value` as indented JSON.
    ///
    /// # Errors
    ///
    /// Returns `PomlError::Json` if serialization fails.
    pub fn to_json_pretty(&self, value: &Rendered) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(&self.view(value))?)
    }
}

/// `Rendered` borrowed together with the chain that converts its objects.
pub struct Normalized<'a> {
    normalizer: &'a Normalizer,
    value: &'a Rendered,
    depth: usize,
}

impl Normalized<'_> {
    fn child<'b>(&'b self, value: &'b Rendered, depth: usize) -> Normalized<'b> {
        Normalized {
            normalizer: self.normalizer,
            value,
            depth,
        }
    }
}

impl Serialize for Normalized<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.value {
            Rendered::Value(v) => v.serialize(serializer),
            Rendered::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&self.child(item, self.depth))?;
                }
                seq.end()
            }
            Rendered::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, &self.child(value, self.depth))?;
                }
                map.end()
            }
            Rendered::Object(object) => {
                let converted = self
                    .normalizer
                    .convert_object(object.as_ref(), self.depth);
                self.child(&converted, self.depth + 1).serialize(serializer)
            }
        }
    }
}
