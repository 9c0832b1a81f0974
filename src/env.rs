//! Launch environment helpers
//!
//! Command templates are expanded against the merged launch environment with
//! shell-like `$NAME` / `${NAME}` placeholders. Unknown names expand to the
//! empty string.

use crate::error::ManifestError;
use std::collections::BTreeMap;
use std::path::Path;

/// Merge the supervisor environment, extra pairs and `PORT`.
///
/// Later entries win, so `PORT` always reflects `port`.
pub fn merged_environment<I>(base: I, extra: &[(String, String)], port: u16) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = base.into_iter().collect();
    for (key, value) in extra {
        env.insert(key.clone(), value.clone());
    }
    env.insert("PORT".to_string(), port.to_string());
    env
}

/// The supervisor's own environment, skipping entries that are not valid UTF-8
pub fn process_environment() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
}

/// Replace `$NAME` and `${NAME}` in `template` with values from `env`.
pub fn expand(template: &str, env: &BTreeMap<String, String>) -> String {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    let mut copied = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' || i + 1 >= bytes.len() {
            i += 1;
            continue;
        }

        out.push_str(&template[copied..i]);
        let (name, width) = placeholder(&template[i + 1..]);
        match name {
            Some(name) => out.push_str(env.get(name).map(String::as_str).unwrap_or("")),
            // a lone `$` stays as is
            None if width == 0 => out.push('$'),
            // malformed `${`, `${}`: swallowed
            None => {}
        }
        i += 1 + width;
        copied = i;
    }

    out.push_str(&template[copied..]);
    out
}

/// Parse the placeholder name following a `$`.
///
/// Returns the name (if any) and how many bytes after the `$` it consumed.
fn placeholder(s: &str) -> (Option<&str>, usize) {
    let b = s.as_bytes();

    if b[0] == b'{' {
        if b.len() > 2 && is_special(b[1]) && b[2] == b'}' {
            return (Some(&s[1..2]), 3);
        }
        for j in 1..b.len() {
            if b[j] == b'}' {
                if j == 1 {
                    return (None, 2);
                }
                return (Some(&s[1..j]), j + 1);
            }
        }
        return (None, 1);
    }

    if is_special(b[0]) {
        return (Some(&s[0..1]), 1);
    }

    let len = b
        .iter()
        .take_while(|c| c.is_ascii_alphanumeric() || **c == b'_')
        .count();
    if len == 0 {
        (None, 0)
    } else {
        (Some(&s[..len]), len)
    }
}

fn is_special(c: u8) -> bool {
    matches!(c, b'*' | b'#' | b'$' | b'@' | b'!' | b'?' | b'-' | b'0'..=b'9')
}

/// Read a `KEY=VALUE` file.
///
/// Blank lines and `#` comments are skipped, as are lines without `=`.
/// Matching quotes around a value are removed.
pub fn load_env_file(path: &Path) -> Result<Vec<(String, String)>, ManifestError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut vars = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, raw)) = trimmed.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            vars.push((key.to_string(), unquote(raw.trim()).to_string()));
        }
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
