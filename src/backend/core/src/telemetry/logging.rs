//! Structured logging and redaction of secrets in log output.
//!
//! JSON is the default output. In `development` it is swapped for the pretty
//! format unless another format was chosen explicitly.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

static REDACTOR: OnceLock<SensitiveFieldRedactor> = OnceLock::new();

/// Credentials embedded in `redis://` or `postgres://` style URLs.
const URL_CREDENTIALS: &str = r"(?P<scheme>[a-z][a-z0-9+.-]*://)[^/\s:@]*:[^/\s@]*@";

/// Field-name fragments that are always redacted.
const SENSITIVE_FIELDS: &[&str] = &[
    "secret",
    "signature",
    "password",
    "passwd",
    "token",
    "authorization",
];

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `courier_core=debug,tower_http=warn`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Extra per-module levels layered on top of `level`
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Include file and line
    #[serde(default = "default_true")]
    pub include_location: bool,

    /// Include the event target
    #[serde(default = "default_true")]
    pub include_target: bool,

    #[serde(default)]
    pub redaction: RedactionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: true,
            include_target: true,
            redaction: RedactionConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Field-name fragments redacted in addition to the built-in ones
    #[serde(default)]
    pub extra_fields: Vec<String>,

    #[serde(default = "default_replacement")]
    pub replacement: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_fields: Vec::new(),
            replacement: default_replacement(),
        }
    }
}

/// Masks secrets before they reach a log line.
#[derive(Debug, Clone)]
pub struct SensitiveFieldRedactor {
    fields: Vec<String>,
    url_credentials: Option<regex::Regex>,
    replacement: String,
    enabled: bool,
}

impl SensitiveFieldRedactor {
    pub fn new(config: &RedactionConfig) -> Self {
        let fields = SENSITIVE_FIELDS
            .iter()
            .map(|f| f.to_string())
            .chain(config.extra_fields.iter().map(|f| f.to_lowercase()))
            .collect();

        Self {
            fields,
            url_credentials: regex::Regex::new(URL_CREDENTIALS).ok(),
            replacement: config.replacement.clone(),
            enabled: config.enabled,
        }
    }

    /// Case-insensitive substring match against the sensitive field names.
    pub fn should_redact_field(&self, field_name: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let lower = field_name.to_lowercase();
        self.fields.iter().any(|f| lower.contains(f.as_str()))
    }

    /// Strip `user:password@` from any URL inside `value`.
    pub fn redact_value(&self, value: &str) -> String {
        match (&self.url_credentials, self.enabled) {
            (Some(regex), true) => {
                let replacement = format!("${{scheme}}{}@", self.replacement);
                regex.replace_all(value, replacement.as_str()).into_owned()
            }
            _ => value.to_string(),
        }
    }

    pub fn redact(&self, field_name: &str, value: &str) -> String {
        if self.should_redact_field(field_name) {
            self.replacement.clone()
        } else {
            self.redact_value(value)
        }
    }

    /// The redactor installed by [`init_logging`], or the default one.
    pub fn global() -> &'static SensitiveFieldRedactor {
        REDACTOR.get_or_init(|| SensitiveFieldRedactor::new(&RedactionConfig::default()))
    }
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_true() -> bool {
    true
}

fn default_replacement() -> String {
    "[REDACTED]".to_string()
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if a filter directive does not parse or a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let _ = REDACTOR.set(SensitiveFieldRedactor::new(&config.redaction));

    let mut filter = EnvFilter::try_new(&config.level)?;
    for (module, level) in &config.module_levels {
        filter = filter.add_directive(format!("{}={}", module, level).parse()?);
    }

    let format = match (environment, config.format) {
        ("development", LogFormat::Json) => LogFormat::Pretty,
        (_, format) => format,
    };

    let base = fmt::layer()
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_target(config.include_target);
    let output: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()?;

    Ok(())
}
