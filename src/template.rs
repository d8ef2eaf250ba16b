use crate::error::{PomlError, Result};
use crate::expr::{Expr, Scope, display_value, is_truthy, parse_expression, parse_prefix};
use regex::Regex;
use serde_json::{Map, Value};

/// Variable scopes visible to template expressions.
///
/// The innermost scope wins; `let` bindings land in the innermost scope so
/// they are visible to following siblings but vanish with a `for` iteration.
#[derive(Debug, Clone)]
pub struct RenderContext {
    scopes: Vec<Map<String, Value>>,
}

impl Default for RenderContext {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

impl RenderContext {
    pub fn new(globals: Map<String, Value>) -> Self {
        Self {
            scopes: vec![globals],
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), value);
        }
    }

    /// Merges every key of `object` into the innermost scope.
    pub fn extend(&mut self, object: Map<String, Value>) {
        for (key, value) in object {
            self.set(key, value);
        }
    }

    pub fn push_scope(&mut self, scope: Map<String, Value>) {
        self.scopes.push(scope);
    }

    pub fn pop_scope(&mut self) {
        // The global scope is never popped
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }
}

impl Scope for RenderContext {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).cloned())
    }
}

/// Represents a `{{ expression }}` found in text
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateExpression {
    /// The full match including {{ and }}
    pub full_match: String,
    /// Source text between the braces, trimmed
    pub source: String,
    pub expression: Expr,
    /// Starting byte position in the text
    pub start: usize,
    /// Ending byte position in the text
    pub end: usize,
}

/// Finds all `{{ expression }}` occurrences in the given text
///
/// # Errors
///
/// Returns `PomlError::Expression` if an expression is malformed or its
/// closing braces are missing.
pub fn find_expressions(text: &str) -> Result<Vec<TemplateExpression>> {
    let mut expressions = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find("{{") {
        let start = cursor + offset;
        let (expression, after) = parse_prefix(text, start + 2)?;
        if !text[after..].starts_with("}}") {
            return Err(PomlError::Expression {
                expression: text[start..].chars().take(40).collect(),
                position: after - start,
                message: "expected '}}'".to_string(),
            });
        }
        let end = after + 2;
        expressions.push(TemplateExpression {
            full_match: text[start..end].to_string(),
            source: text[start + 2..after].trim().to_string(),
            expression,
            start,
            end,
        });
        cursor = end;
    }

    Ok(expressions)
}

/// Replaces every `{{ expression }}` in `text` with its evaluated value
///
/// # Errors
///
/// Returns errors from `find_expressions` or from evaluating an expression.
pub fn interpolate(text: &str, ctx: &RenderContext) -> Result<String> {
    let expressions = find_expressions(text)?;

    // Replace from end to beginning to keep positions valid
    let mut result = text.to_string();
    for found in expressions.iter().rev() {
        let value = evaluate_found(found, ctx)?;
        result.replace_range(found.start..found.end, &display_value(&value));
    }

    Ok(result)
}

/// Evaluates an attribute value.
///
/// A value that is exactly one `{{ expression }}` keeps the JSON type of
/// the result; anything else is interpolated into a string.
///
/// # Errors
///
/// Returns errors from parsing or evaluating the embedded expressions.
pub fn evaluate_attribute(value: &str, ctx: &RenderContext) -> Result<Value> {
    let trimmed = value.trim();
    let expressions = find_expressions(trimmed)?;
    if let [only] = expressions.as_slice()
        && only.start == 0
        && only.end == trimmed.len()
    {
        return evaluate_found(only, ctx);
    }
    interpolate(value, ctx).map(Value::String)
}

fn evaluate_found(found: &TemplateExpression, ctx: &RenderContext) -> Result<Value> {
    found.expression.evaluate(ctx).map_err(|err| match err {
        PomlError::Expression {
            position, message, ..
        } => PomlError::Expression {
            expression: found.source.clone(),
            position,
            message,
        },
        other => other,
    })
}

/// Strips optional `{{ }}` around a directive expression.
fn directive_source(source: &str) -> &str {
    let trimmed = source.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map_or(trimmed, str::trim)
}

/// Evaluates an `if=` condition. Undefined variables count as false.
///
/// # Errors
///
/// Returns `PomlError::InvalidDirective` when the condition does not parse.
pub fn evaluate_condition(source: &str, ctx: &RenderContext) -> Result<bool> {
    let expr = parse_expression(directive_source(source)).map_err(|e| {
        PomlError::InvalidDirective {
            directive: "if".to_string(),
            message: e.to_string(),
        }
    })?;
    match expr.evaluate(ctx) {
        Ok(value) => Ok(is_truthy(&value)),
        Err(PomlError::UndefinedVariable { .. }) => Ok(false),
        Err(other) => Err(other),
    }
}

/// Parsed `for="item in items"` directive
#[derive(Debug, Clone, PartialEq)]
pub struct LoopDirective {
    pub variable: String,
    pub iterable: Expr,
}

/// Parses a `for=` directive.
///
/// # Errors
///
/// Returns `PomlError::InvalidDirective` when the directive is not of the
/// form `name in expression`.
pub fn parse_loop(source: &str) -> Result<LoopDirective> {
    let pattern = Regex::new(r"^\s*([A-Za-z_$][\w$]*)\s+in\s+(.+?)\s*$")?;
    let captures = pattern
        .captures(source)
        .ok_or_else(|| PomlError::InvalidDirective {
            directive: "for".to_string(),
            message: format!("expected `name in expression`, got `{source}`"),
        })?;
    let iterable = parse_expression(directive_source(&captures[2])).map_err(|e| {
        PomlError::InvalidDirective {
            directive: "for".to_string(),
            message: e.to_string(),
        }
    })?;
    Ok(LoopDirective {
        variable: captures[1].to_string(),
        iterable,
    })
}

/// Runs `body` once per instance of an element carrying optional `if=` and
/// `for=` directives. Loop iterations get a fresh scope holding the loop
/// variable and `loop` (`index`, `length`, `first`, `last`); the condition
/// is checked per iteration.
///
/// # Errors
///
/// Propagates directive errors and errors returned by `body`.
pub fn for_each_instance(
    condition: Option<&str>,
    repeat: Option<&str>,
    ctx: &mut RenderContext,
    mut body: impl FnMut(&mut RenderContext) -> Result<()>,
) -> Result<()> {
    let Some(repeat) = repeat else {
        if let Some(cond) = condition
            && !evaluate_condition(cond, ctx)?
        {
            return Ok(());
        }
        return body(ctx);
    };

    let directive = parse_loop(repeat)?;
    let items = match directive.iterable.evaluate(ctx)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        Value::Object(map) => map.into_values().collect(),
        other => {
            return Err(PomlError::InvalidDirective {
                directive: "for".to_string(),
                message: format!("cannot iterate over {other}"),
            });
        }
    };

    let length = items.len();
    for (index, item) in items.into_iter().enumerate() {
        let mut scope = Map::new();
        scope.insert(directive.variable.clone(), item);
        scope.insert(
            "loop".to_string(),
            serde_json::json!({
                "index": index,
                "length": length,
                "first": index == 0,
                "last": index + 1 == length,
            }),
        );
        ctx.push_scope(scope);
        let outcome = match condition {
            Some(cond) => match evaluate_condition(cond, ctx) {
                Ok(true) => body(ctx),
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            },
            None => body(ctx),
        };
        ctx.pop_scope();
        outcome?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> RenderContext {
        RenderContext::new(value.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_find_expressions_basic() {
        let text = "Hello {{ name }}, you are {{ age + 1 }}";
        let found = find_expressions(text).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].source, "name");
        assert_eq!(found[0].full_match, "{{ name }}");
        assert_eq!(found[1].source, "age + 1");
        assert_eq!(&text[found[1].start..found[1].end], "{{ age + 1 }}");
    }

    #[test]
    fn test_find_expressions_nested_braces() {
        let text = "{{ { a: { b: 1 } } }}";
        let found = find_expressions(text).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].end, text.len());
    }

    #[test]
    fn test_find_expressions_empty() {
        assert!(find_expressions("").unwrap().is_empty());
        assert!(find_expressions("no templates { here }").unwrap().is_empty());
    }

    #[test]
    fn test_find_expressions_unterminated() {
        let err = find_expressions("Hi {{ name").unwrap_err();
        assert!(matches!(err, PomlError::Expression { .. }));
    }

    #[test]
    fn test_interpolate_position_preservation() {
        let context = ctx(json!({"x": "TEST"}));
        let result = interpolate("A{{ x }}B{{ x }}C", &context).unwrap();
        assert_eq!(result, "ATESTBTESTC");
    }

    #[test]
    fn test_interpolate_non_string_values() {
        let context = ctx(json!({"n": 3, "list": [1, 2], "none": null}));
        assert_eq!(
            interpolate("{{ n }} {{ list }} [{{ none }}]", &context).unwrap(),
            "3 [1,2] []"
        );
    }

    #[test]
    fn test_interpolate_undefined_variable() {
        let err = interpolate("{{ missing }}", &RenderContext::default()).unwrap_err();
        assert!(matches!(err, PomlError::UndefinedVariable { .. }));
    }

    #[test]
    fn test_evaluate_attribute_keeps_type() {
        let context = RenderContext::default();
        assert_eq!(
            evaluate_attribute("{{ { query: 'Python' } }}", &context).unwrap(),
            json!({"query": "Python"})
        );
        assert_eq!(
            evaluate_attribute("plain", &context).unwrap(),
            json!("plain")
        );
        assert_eq!(
            evaluate_attribute("n={{ 1 + 1 }}", &context).unwrap(),
            json!("n=2")
        );
    }

    #[test]
    fn test_scopes_shadow_and_pop() {
        let mut context = ctx(json!({"x": 1}));
        context.push_scope(Map::new());
        context.set("x", json!(2));
        assert_eq!(context.lookup("x"), Some(json!(2)));
        context.pop_scope();
        assert_eq!(context.lookup("x"), Some(json!(1)));
        // Global scope survives extra pops
        context.pop_scope();
        assert_eq!(context.lookup("x"), Some(json!(1)));
    }

    #[test]
    fn test_evaluate_condition() {
        let context = ctx(json!({"flag": true, "count": 0}));
        assert!(evaluate_condition("flag", &context).unwrap());
        assert!(!evaluate_condition("{{ count }}", &context).unwrap());
        assert!(!evaluate_condition("undefinedThing", &context).unwrap());
        assert!(matches!(
            evaluate_condition("flag &&", &context),
            Err(PomlError::InvalidDirective { .. })
        ));
    }

    #[test]
    fn test_parse_loop() {
        let directive = parse_loop("item in items").unwrap();
        assert_eq!(directive.variable, "item");
        assert!(parse_loop("items").is_err());
    }

    #[test]
    fn test_for_each_instance_loop_and_condition() {
        let mut context = ctx(json!({"items": ["a", "b", "c"]}));
        let mut seen = Vec::new();
        for_each_instance(
            Some("item != 'b'"),
            Some("item in items"),
            &mut context,
            |c| {
                let item = c.lookup("item").unwrap();
                let last = c.lookup("loop").unwrap()["last"].clone();
                seen.push((item, last));
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(
            seen,
            vec![(json!("a"), json!(false)), (json!("c"), json!(true))]
        );
        // Loop variable does not leak
        assert_eq!(context.lookup("item"), None);
    }

    #[test]
    fn test_for_each_instance_rejects_scalar() {
        let mut context = ctx(json!({"n": 3}));
        let err = for_each_instance(None, Some("x in n"), &mut context, |_| Ok(())).unwrap_err();
        assert!(matches!(err, PomlError::InvalidDirective { .. }));
    }
}
