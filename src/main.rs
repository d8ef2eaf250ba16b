use clap::Parser;
use poml_render::fs_utils::read_file_contents;
use poml_render::{
    EngineRegistry, Format, Normalizer, POML_ENGINE, PomlError, RenderConfig, Result,
    default_registry,
};
use serde_json::{Map, Value};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const LONG_HELP: &str = r#"
Formats:
  message_dict   - List of {speaker, content} messages
  dict           - {messages, schema?, tools?, runtime?}
  openai_chat    - OpenAI Chat Completions request body
  langchain      - LangChain serialized messages
  pydantic       - Prompt frame dump {messages, output_schema, tools, runtime}

Examples:
  # Render a prompt for the OpenAI API
  poml-render --format openai_chat --file prompt.poml
  # Supply template variables
  poml-render --format dict --file prompt.poml --var topic=ownership --var 'items=["a","b"]'
  # Load variables from a JSON file
  poml-render --format dict --file prompt.poml --context-file context.json
  # Resolve src= references against another directory
  poml-render --format message_dict --file prompt.poml --base-dir ./assets
  # Check document structure before rendering
  poml-render --format langchain --file prompt.poml --strict

Exit codes:
  0  success
  1  missing engine, missing file, or rendering failure
  2  invalid arguments
"#;

/// Render POML prompt documents into chat-message JSON.
#[derive(Parser, Debug)]
#[command(
    name = "poml-render",
    version,
    author = "0x484558 @ aleph0 s.r.o.",
    about = "Render POML prompt documents into chat-message JSON.",
    after_long_help = LONG_HELP,
    after_help = "Run with --help for formats and examples."
)]
struct Cli {
    /// Output shape
    #[arg(long, value_enum, value_name = "FORMAT")]
    format: Format,

    /// POML document to render
    #[arg(long, value_name = "FILE")]
    file: PathBuf,

    /// JSON object merged into the template context
    #[arg(long, value_name = "FILE", env = "POML_CONTEXT_FILE")]
    context_file: Option<PathBuf>,

    /// Template variable (repeatable). VALUE is parsed as JSON when possible
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var, action = clap::ArgAction::Append)]
    vars: Vec<(String, Value)>,

    /// Base directory for resolving src= references (defaults to the document's directory)
    #[arg(short, long, value_name = "DIR", env = "POML_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Validate document structure before rendering
    #[arg(long)]
    strict: bool,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,

    /// Increase verbosity (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all logging except errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn parse_var(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);

    let result = run(&cli, &default_registry(), &mut io::stdout().lock());
    std::process::exit(exit_code(result, &mut io::stderr()));
}

/// Reports a failure on `stderr`; every error exits with 1.
fn exit_code(result: Result<()>, stderr: &mut impl Write) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            let _ = writeln!(stderr, "Error: {e}");
            1
        }
    }
}

fn init_tracing(quiet: bool, verbose: u8) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli, registry: &EngineRegistry, out: &mut impl Write) -> Result<()> {
    let engine = registry.get(POML_ENGINE)?;

    tracing::info!(file = %cli.file.display(), "reading document");
    let source = read_file_contents(&cli.file)?;
    let config = build_config(cli)?;

    let rendered = engine.render(&source, cli.format, &config)?;
    let normalizer = Normalizer::new();
    let output = if cli.pretty {
        normalizer.to_json_pretty(&rendered)?
    } else {
        normalizer.to_json_line(&rendered)?
    };

    writeln!(out, "{output}")?;
    out.flush()?;
    tracing::info!(format = %cli.format, "rendering complete");
    Ok(())
}

fn build_config(cli: &Cli) -> Result<RenderConfig> {
    let mut config = RenderConfig {
        strict: cli.strict,
        ..RenderConfig::default()
    };

    let base_dir = cli.base_dir.clone().unwrap_or_else(|| document_dir(&cli.file));
    config.base_dir = base_dir.canonicalize().unwrap_or(base_dir);

    if let Some(path) = &cli.context_file {
        config.context = load_context(path)?;
    }
    for (key, value) in &cli.vars {
        config.context.insert(key.clone(), value.clone());
    }

    tracing::debug!(
        base_dir = %config.base_dir.display(),
        variables = config.context.len(),
        strict = config.strict,
        "render configuration"
    );
    Ok(config)
}

fn document_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn load_context(path: &Path) -> Result<Map<String, Value>> {
    let text = read_file_contents(path)?;
    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        other => Err(PomlError::InvalidJson {
            context: path.display().to_string(),
            message: format!("expected a JSON object, found {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn cli_for(file: &Path) -> Cli {
        let file = file.to_str().unwrap();
        Cli::try_parse_from(["poml-render", "--format", "dict", "--file", file]).unwrap()
    }

    fn execute(cli: &Cli, registry: &EngineRegistry) -> (i32, String, String) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = exit_code(run(cli, registry, &mut stdout), &mut stderr);
        (
            code,
            String::from_utf8(stdout).unwrap(),
            String::from_utf8(stderr).unwrap(),
        )
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_var() {
        assert_eq!(parse_var("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(
            parse_var("items=[\"a\"]").unwrap(),
            ("items".to_string(), json!(["a"]))
        );
        assert_eq!(
            parse_var("topic=ownership").unwrap(),
            ("topic".to_string(), json!("ownership"))
        );
        assert_eq!(parse_var("eq=a=b").unwrap(), ("eq".to_string(), json!("a=b")));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_document_dir() {
        assert_eq!(document_dir(Path::new("prompt.poml")), PathBuf::from("."));
        assert_eq!(
            document_dir(Path::new("prompts/a.poml")),
            PathBuf::from("prompts")
        );
    }

    #[test]
    fn test_missing_engine_exits_with_install_hint() {
        let temp_dir = TempDir::new().unwrap();
        let doc = temp_dir.path().join("prompt.poml");
        fs::write(&doc, "<poml><task>hi</task></poml>").unwrap();

        let (code, stdout, stderr) = execute(&cli_for(&doc), &EngineRegistry::new());
        assert_eq!(code, 1);
        assert!(stdout.is_empty());
        assert!(stderr.starts_with("Error: "), "{stderr}");
        assert!(stderr.contains("cargo install"), "{stderr}");
    }

    #[test]
    fn test_missing_engine_checked_before_file() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("absent.poml");

        let (code, _, stderr) = execute(&cli_for(&missing), &EngineRegistry::new());
        assert_eq!(code, 1);
        assert!(stderr.contains("cargo install"), "{stderr}");
        assert!(!stderr.contains("absent.poml"), "{stderr}");
    }

    #[cfg(feature = "builtin-engine")]
    #[test]
    fn test_run_writes_one_json_line() {
        let temp_dir = TempDir::new().unwrap();
        let doc = temp_dir.path().join("prompt.poml");
        fs::write(&doc, "<poml><task>hi</task></poml>").unwrap();

        let (code, stdout, stderr) = execute(&cli_for(&doc), &default_registry());
        assert_eq!(code, 0, "{stderr}");
        assert!(stderr.is_empty());
        assert_eq!(stdout.lines().count(), 1);
        let value: Value = serde_json::from_str(&stdout).unwrap();
        assert_eq!(value["messages"][0]["content"], "# Task\n\nhi");
    }
}
