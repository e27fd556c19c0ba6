//! Placeholder rendering for migration templates.
//!
//! Supported expressions:
//!
//! - `{{.env.KEY}}` - local-then-global environment lookup
//! - `{{.auth.NAME}}` - auth token value
//! - `{{index .env "KEY"}}` / `{{index .auth "NAME"}}` - same, for keys that are not identifiers
//! - `{{.KEY}}` - flat lookup (environment, then auth by name)
//!
//! Whitespace and `-` trim markers inside the braces are accepted and ignored.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::error::{MigrateResult, MigrationError};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("placeholder pattern is valid"));

/// How undefined keys are treated during rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    /// An undefined key is an error.
    #[default]
    Strict,
    /// An undefined key leaves the input unchanged.
    Lenient,
}

/// A variable reference found inside a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    /// `.env.KEY`
    Env(&'a str),
    /// `.auth.NAME`
    Auth(&'a str),
    /// `.KEY`
    Flat(&'a str),
}

impl Reference<'_> {
    /// The referenced key.
    pub fn key(&self) -> &str {
        match self {
            Self::Env(k) | Self::Auth(k) | Self::Flat(k) => k,
        }
    }

    fn qualified(&self) -> String {
        match self {
            Self::Env(k) => format!("env.{k}"),
            Self::Auth(k) => format!("auth.{k}"),
            Self::Flat(k) => (*k).to_string(),
        }
    }
}

/// Whether the input contains any placeholder at all.
pub fn is_template(input: &str) -> bool {
    input.contains("{{")
}

/// Parse every placeholder in `input`.
pub fn references(input: &str) -> MigrateResult<Vec<Reference<'_>>> {
    PLACEHOLDER
        .captures_iter(input)
        .map(|caps| {
            let inner = caps.get(1).map_or("", |m| m.as_str());
            parse_expression(inner)
        })
        .collect()
}

/// Substitute every placeholder using `lookup`.
///
/// Fails with [`MigrationError::MissingKey`] on the first reference `lookup`
/// cannot resolve.
pub fn render<F>(input: &str, lookup: F) -> MigrateResult<String>
where
    F: Fn(&Reference<'_>) -> Option<String>,
{
    if !is_template(input) {
        return Ok(input.to_string());
    }

    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        let inner = caps.get(1).map_or("", |m| m.as_str());
        let reference = parse_expression(inner)?;

        let value =
            lookup(&reference).ok_or_else(|| MigrationError::MissingKey(reference.qualified()))?;

        out.push_str(&input[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }

    out.push_str(&input[last..]);
    Ok(out)
}

fn parse_expression(raw: &str) -> MigrateResult<Reference<'_>> {
    let expr = raw
        .trim()
        .trim_start_matches('-')
        .trim_end_matches('-')
        .trim();

    if let Some(rest) = expr.strip_prefix("index ") {
        return parse_index(rest.trim(), raw);
    }

    let path = expr
        .strip_prefix('.')
        .ok_or_else(|| MigrationError::template(format!("unsupported expression '{{{{{raw}}}}}'")))?;

    let reference = match path.split_once('.') {
        Some(("env", key)) => Reference::Env(key),
        Some(("auth", key)) => Reference::Auth(key),
        Some(_) => {
            return Err(MigrationError::template(format!(
                "unknown group in '{{{{{raw}}}}}'"
            )));
        }
        None => Reference::Flat(path),
    };

    if reference.key().is_empty() || reference.key().contains(char::is_whitespace) {
        return Err(MigrationError::template(format!(
            "invalid key in '{{{{{raw}}}}}'"
        )));
    }

    Ok(reference)
}

fn parse_index<'a>(rest: &'a str, raw: &str) -> MigrateResult<Reference<'a>> {
    let (group, key) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| MigrationError::template(format!("malformed index in '{{{{{raw}}}}}'")))?;

    let key = key.trim();
    let key = key
        .strip_prefix('"')
        .and_then(|k| k.strip_suffix('"'))
        .ok_or_else(|| MigrationError::template(format!("index key must be quoted in '{{{{{raw}}}}}'")))?;

    match group {
        ".env" => Ok(Reference::Env(key)),
        ".auth" => Ok(Reference::Auth(key)),
        _ => Err(MigrationError::template(format!(
            "unknown group in '{{{{{raw}}}}}'"
        ))),
    }
}
