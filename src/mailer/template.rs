//! Mail templates
//!
//! A template is a TOML document with three sections, each of them a Jinja
//! template rendered by `minijinja`:
//!
//! ```toml
//! subject = "Welcome, {{ Name }}"
//! plain_body = "Your user ID is {{ ID }}."
//! html_body = "<p>Your user ID is {{ ID }}.</p>"
//! ```
//!
//! Variables are resolved against the JSON form of the data passed to
//! [`Mailer::send`]. Undefined variables are errors rather than empty
//! strings, and output in `html_body` is HTML-escaped.
//!
//! [`Mailer::send`]: crate::mailer::Mailer::send

use crate::error::RenderError;
use minijinja::{AutoEscape, Environment, ErrorKind, UndefinedBehavior};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// Template file extension
pub const TEMPLATE_EXTENSION: &str = "tmpl";

const SECTIONS: [&str; 3] = ["subject", "plain_body", "html_body"];

const BUILTIN: &[(&str, &str)] = &[
    ("user_welcome.tmpl", include_str!("templates/user_welcome.tmpl")),
    ("token_activation.tmpl", include_str!("templates/token_activation.tmpl")),
    (
        "token_password_reset.tmpl",
        include_str!("templates/token_password_reset.tmpl"),
    ),
];

/// The three rendered sections of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub plain_body: String,
    /// HTML body
    pub html_body: String,
}

/// Renders a named template against data
pub trait TemplateRenderer: Send + Sync {
    /// Render `name` with `data`
    ///
    /// Fails with [`RenderError::NotFound`] when no such template exists.
    fn render(&self, name: &str, data: &Value) -> Result<RenderedMessage, RenderError>;
}

#[derive(Debug, Deserialize)]
struct TemplateSource {
    subject: String,
    plain_body: String,
    html_body: String,
}

impl TemplateSource {
    fn sections(self) -> [(&'static str, String); 3] {
        [
            (SECTIONS[0], self.subject),
            (SECTIONS[1], self.plain_body),
            (SECTIONS[2], self.html_body),
        ]
    }
}

/// Key of one section inside the environment
fn section_key(name: &str, section: &str) -> String {
    format!("{}#{}", name, section)
}

/// Named set of compiled templates
pub struct TemplateSet {
    env: Environment<'static>,
    names: BTreeSet<String>,
}

impl std::fmt::Debug for TemplateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateSet")
            .field("names", &self.names)
            .finish()
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateSet {
    /// Empty set
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|key: &str| {
            if key.ends_with("#html_body") {
                AutoEscape::Html
            } else {
                AutoEscape::None
            }
        });
        Self {
            env,
            names: BTreeSet::new(),
        }
    }

    /// Set containing the templates embedded in the binary
    pub fn builtin() -> Self {
        let mut set = Self::new();
        for (name, source) in BUILTIN {
            // Embedded sources are covered by tests; a parse failure here is a build defect
            if let Err(e) = set.insert(name, source) {
                tracing::error!(template = name, error = %e, "Embedded template failed to parse");
            }
        }
        set
    }

    /// Built-in templates, with additions and overrides from `dir`
    ///
    /// Every `*.tmpl` file in `dir` is loaded under its file name.
    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self, RenderError> {
        let mut set = Self::builtin();
        set.load_dir(dir)?;
        Ok(set)
    }

    /// Load every `*.tmpl` file in `dir`, replacing same-named templates
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, RenderError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| RenderError::Malformed {
            name: dir.display().to_string(),
            message: e.to_string(),
        })?;

        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let source = std::fs::read_to_string(&path).map_err(|e| RenderError::Malformed {
                name: name.to_string(),
                message: e.to_string(),
            })?;
            self.insert(name, &source)?;
            debug!(template = name, path = %path.display(), "Loaded template");
            loaded += 1;
        }

        info!(dir = %dir.display(), loaded = loaded, "Loaded mail templates");
        Ok(loaded)
    }

    /// Parse, compile and register a template under `name`
    ///
    /// On error the set is left unchanged.
    pub fn insert(&mut self, name: &str, source: &str) -> Result<(), RenderError> {
        let malformed = |message: String| RenderError::Malformed {
            name: name.to_string(),
            message,
        };
        let parsed: TemplateSource =
            toml::from_str(source).map_err(|e| malformed(e.to_string()))?;
        let sections = parsed.sections();

        // Syntax-check every section before touching the live environment
        let scratch = Environment::new();
        for (section, body) in &sections {
            scratch
                .template_from_str(body)
                .map_err(|e| malformed(format!("{}: {}", section, e)))?;
        }

        for (section, body) in sections {
            self.env
                .add_template_owned(section_key(name, section), body)
                .map_err(|e| malformed(format!("{}: {}", section, e)))?;
        }
        self.names.insert(name.to_string());
        Ok(())
    }

    /// True if a template is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Registered template names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.names.iter().map(String::as_str).collect()
    }

    fn render_section(
        &self,
        name: &str,
        section: &'static str,
        data: &Value,
    ) -> Result<String, RenderError> {
        let template = self
            .env
            .get_template(&section_key(name, section))
            .map_err(|_| RenderError::NotFound(name.to_string()))?;

        let out = template.render(data).map_err(|e| {
            if e.kind() == ErrorKind::UndefinedError {
                let mut paths: Vec<String> = template.undeclared_variables(true).into_iter().collect();
                paths.sort();
                if let Some(field) = paths.into_iter().find(|path| lookup(data, path).is_none()) {
                    return RenderError::MissingField {
                        name: name.to_string(),
                        section,
                        field,
                    };
                }
            }
            RenderError::Malformed {
                name: name.to_string(),
                message: format!("{}: {}", section, e),
            }
        })?;

        if out.trim().is_empty() {
            return Err(RenderError::EmptySection {
                name: name.to_string(),
                section,
            });
        }
        Ok(out)
    }
}

impl TemplateRenderer for TemplateSet {
    fn render(&self, name: &str, data: &Value) -> Result<RenderedMessage, RenderError> {
        if !self.contains(name) {
            return Err(RenderError::NotFound(name.to_string()));
        }
        let data = without_nulls(data);

        Ok(RenderedMessage {
            subject: self
                .render_section(name, "subject", &data)?
                .trim()
                .to_string(),
            plain_body: self.render_section(name, "plain_body", &data)?,
            html_body: self.render_section(name, "html_body", &data)?,
        })
    }
}

/// Drop `null` entries so they render as undefined
fn without_nulls(data: &Value) -> Value {
    match data {
        Value::Null => Value::Object(Default::default()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_nulls).collect()),
        other => other.clone(),
    }
}

/// Resolve a dotted path
fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |value, key| value.get(key))
}
