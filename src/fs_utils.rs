use crate::error::{PomlError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

/// Reads the contents of a file at the given path
///
/// # Errors
///
/// - `PomlError::FileNotFound` if the path doesn't exist or isn't a file.
/// - `PomlError::Io` if there's an error reading the file.
pub fn read_file_contents(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(PomlError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    if !path.is_file() {
        return Err(PomlError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    fs::read_to_string(path).map_err(std::convert::Into::into)
}

/// Resolves a `src` attribute relative to the document base directory.
/// Ensures the path doesn't escape the base directory.
///
/// # Errors
///
/// - `PomlError::PathTraversal` if the resolved path escapes the base directory.
/// - `PomlError::Io` if there's an error canonicalizing paths.
pub fn resolve_reference_path(reference: &str, base_dir: &Path) -> Result<PathBuf> {
    let cleaned = reference
        .trim()
        .trim_start_matches('/')
        .trim_start_matches('\\');

    let path_str = if cleaned.is_empty() { "." } else { cleaned };
    let full_path = base_dir.join(path_str);

    let canonical = full_path.canonicalize().or_else(|_| {
        // Missing file: canonicalize the parent so the traversal check still applies
        full_path.parent().map_or_else(
            || {
                Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Invalid path",
                ))
            },
            |parent| {
                parent
                    .canonicalize()
                    .map(|p| p.join(full_path.file_name().unwrap_or_default()))
            },
        )
    })?;

    let base_canonical = base_dir.canonicalize()?;
    if !canonical.starts_with(&base_canonical) {
        return Err(PomlError::PathTraversal { path: canonical });
    }

    Ok(canonical)
}

/// Reads a referenced file as bytes, refusing files above `max_size`.
///
/// # Errors
///
/// - `PomlError::FileNotFound` if the path is missing or not a regular file.
/// - `PomlError::FileSizeExceeded` if the file is larger than `max_size`.
pub fn read_limited(path: &Path, max_size: u64) -> Result<Vec<u8>> {
    if !path.is_file() {
        return Err(PomlError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let size = fs::metadata(path)?.len();
    if size > max_size {
        return Err(PomlError::FileSizeExceeded {
            path: path.to_path_buf(),
            size,
            max_size,
        });
    }
    Ok(fs::read(path)?)
}

/// Decoded `data:` URI payload
#[derive(Debug, Clone, PartialEq)]
pub struct DataUri {
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

/// Parses a `data:` URI. Returns `Ok(None)` when `src` is not a data URI.
///
/// # Errors
///
/// Returns `PomlError::InvalidDataUri` when the URI is malformed or its
/// base64 payload cannot be decoded, `PomlError::Regex` if the pattern fails to compile.
pub fn parse_data_uri(src: &str) -> Result<Option<DataUri>> {
    let src = src.trim();
    if !src.starts_with("data:") {
        return Ok(None);
    }
    let pattern = Regex::new(r"(?s)^data:([^;,]*)((?:;[^;,]*)*?)(;base64)?,(.*)$")?;
    let captures = pattern
        .captures(src)
        .ok_or_else(|| PomlError::InvalidDataUri {
            reason: "missing ',' separator".to_string(),
        })?;
    let mime = captures
        .get(1)
        .map(|m| m.as_str().trim())
        .filter(|m| !m.is_empty())
        .map(str::to_string);
    let payload = captures.get(4).map_or("", |m| m.as_str());
    let bytes = if captures.get(3).is_some() {
        STANDARD
            .decode(payload.trim())
            .map_err(|e| PomlError::InvalidDataUri {
                reason: e.to_string(),
            })?
    } else {
        payload.as_bytes().to_vec()
    };
    Ok(Some(DataUri { mime, bytes }))
}

/// Guesses a MIME type from a file name, falling back to `application/octet-stream`.
pub fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}
