//! Pipeline environment
//!
//! An insertion-ordered set of variables exported into the guest shell.
//! Variables prefixed with `X_` in the operator environment are re-exposed
//! publicly without the prefix, `XXX_` ones the same way but hidden from logs.

use std::collections::HashMap;
use std::io;
use std::path::Path;

/// Prefix marking a variable that is passed through to the guest
pub const PUBLIC_PREFIX: &str = "X_";

/// Prefix marking a variable that is passed through but never logged
pub const HIDDEN_PREFIX: &str = "XXX_";

/// Insertion-ordered string map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Vars {
    map: HashMap<String, String>,
    order: Vec<String>,
}

impl Vars {
    fn add(&mut self, key: String, value: String) {
        if !self.map.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.map.insert(key, value);
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    fn ordered(&self) -> Vec<(String, String)> {
        self.order
            .iter()
            .map(|key| (key.clone(), self.map[key].clone()))
            .collect()
    }
}

/// Environment for a pipeline or a single step
///
/// Position in the ordering is decided by the first insertion of a key and
/// is kept when the value is later replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vars,
    public: Vars,
    hidden: Vars,
}

impl Environment {
    /// Creates an environment from `KEY=VALUE` strings
    ///
    /// Entries without `=` are stored with an empty value. Pass-through
    /// variables are mirrored into the public or hidden sets.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = Self::default();
        for entry in entries {
            let entry = entry.as_ref();
            let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
            env.add(key, value);
        }
        env
    }

    /// Creates an environment from the current process environment
    pub fn from_process() -> Self {
        let mut env = Self::default();
        for (key, value) in std::env::vars() {
            env.add(key, value);
        }
        env
    }

    /// Adds or replaces a variable
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        if let Some(stripped) = key.strip_prefix(HIDDEN_PREFIX) {
            if !stripped.is_empty() {
                self.hidden.add(stripped.to_string(), value.clone());
            }
        } else if let Some(stripped) = key.strip_prefix(PUBLIC_PREFIX) {
            if !stripped.is_empty() {
                self.public.add(stripped.to_string(), value.clone());
            }
        }

        self.vars.add(key, value);
    }

    /// Adds a variable that is exported to the guest but never shown in logs
    pub fn add_hidden(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.hidden.add(key.into(), value.into());
    }

    /// Adds every pair in order
    pub fn update<I, K, V>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in pairs {
            self.add(key, value);
        }
    }

    /// Looks a variable up in this environment, then public, then hidden
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .or_else(|| self.public.get(key))
            .or_else(|| self.hidden.get(key))
    }

    /// Returns true if the key is set in this environment itself
    pub fn contains(&self, key: &str) -> bool {
        self.vars.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vars.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.order.is_empty()
    }

    /// Own variables as `(key, value)` pairs in insertion order
    pub fn ordered(&self) -> Vec<(String, String)> {
        self.vars.ordered()
    }

    /// Alias kept for callers that mirror the environment into another one
    pub fn get_mirror(&self) -> Vec<(String, String)> {
        self.ordered()
    }

    /// Returns a new environment with only the named keys that are set
    pub fn collect<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Environment {
        let mut out = Environment::default();
        for key in keys {
            if let Some(value) = self.vars.get(key) {
                out.add(key, value);
            }
        }
        out
    }

    /// Public pass-through variables with the `X_` prefix stripped
    pub fn get_passthru(&self) -> Environment {
        Self::from_vars(&self.public)
    }

    /// Hidden variables, `XXX_` pass-through ones with the prefix stripped
    pub fn get_hidden_passthru(&self) -> Environment {
        Self::from_vars(&self.hidden)
    }

    fn from_vars(vars: &Vars) -> Environment {
        let mut out = Environment::default();
        for (key, value) in vars.ordered() {
            out.vars.add(key, value);
        }
        out
    }

    /// Shell statements exporting own variables in order
    pub fn export(&self) -> Vec<String> {
        self.ordered()
            .into_iter()
            .map(|(key, value)| format!("export {}={}", key, shell_quote(&value)))
            .collect()
    }

    /// Expands `$NAME` and `${NAME}` references
    ///
    /// Unknown variables expand to the empty string. A `$` not followed by a
    /// name is kept as is.
    pub fn interpolate(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.char_indices().peekable();

        while let Some((idx, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }

            match chars.peek() {
                Some((_, '{')) => {
                    let rest = &input[idx + 2..];
                    match rest.find('}') {
                        Some(end) => {
                            let name = &rest[..end];
                            out.push_str(self.get(name).unwrap_or(""));
                            // Skip '{', name and '}'
                            for _ in 0..name.chars().count() + 2 {
                                chars.next();
                            }
                        }
                        None => out.push(c),
                    }
                }
                Some((_, next)) if is_name_char(*next) => {
                    let start = idx + 1;
                    let mut end = start;
                    while let Some((i, n)) = chars.peek() {
                        if !is_name_char(*n) {
                            break;
                        }
                        end = i + n.len_utf8();
                        chars.next();
                    }
                    out.push_str(self.get(&input[start..end]).unwrap_or(""));
                }
                _ => out.push(c),
            }
        }

        out
    }

    /// Loads `KEY=VALUE` lines from a dotenv-style file
    ///
    /// Blank lines and `#` comments are skipped, a leading `export ` is
    /// accepted and surrounding quotes are removed from values.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> io::Result<()> {
        let contents = std::fs::read_to_string(path)?;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            self.add(key.trim(), unquote(value.trim()));
        }

        Ok(())
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Double-quotes a value so that a POSIX shell reads it back verbatim
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '`' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
