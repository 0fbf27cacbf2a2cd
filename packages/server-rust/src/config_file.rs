//! Configuration file loading.
//!
//! A config file is JSON, YAML or TOML, chosen by extension, and always yields a
//! JSON object keyed by module name. `${NAME}` and `${NAME:-default}`
//! placeholders are expanded from the environment before parsing.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid placeholder pattern")
});

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported config file extension: {0} (expected .json, .yaml, .yml or .toml)")]
    UnsupportedFormat(PathBuf),
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config root must be an object, got {0}")]
    NotAnObject(&'static str),
}

/// Supported file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Picks the format from a file extension, case-insensitively.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

/// Reads, expands and parses a config file.
///
/// # Errors
///
/// Fails on unknown extensions, unreadable files, parse errors, or a root
/// that is not an object.
pub fn load_config(path: &Path) -> Result<Value, ConfigError> {
    let format =
        ConfigFormat::from_path(path).ok_or_else(|| ConfigError::UnsupportedFormat(path.to_path_buf()))?;
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), ?format, "loading config file");
    parse_config(&text, format)
}

/// Expands placeholders in `text` and parses it.
///
/// # Errors
///
/// Fails on parse errors or a root that is not an object.
pub fn parse_config(text: &str, format: ConfigFormat) -> Result<Value, ConfigError> {
    let expanded = expand_env(text);
    let value: Value = match format {
        ConfigFormat::Json => serde_json::from_str(&expanded)?,
        ConfigFormat::Yaml => serde_yaml::from_str(&expanded)?,
        ConfigFormat::Toml => toml::from_str(&expanded)?,
    };
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Err(ConfigError::NotAnObject("null")),
        Value::Bool(_) => Err(ConfigError::NotAnObject("a boolean")),
        Value::Number(_) => Err(ConfigError::NotAnObject("a number")),
        Value::String(_) => Err(ConfigError::NotAnObject("a string")),
        Value::Array(_) => Err(ConfigError::NotAnObject("an array")),
    }
}

/// Replaces placeholders with values from the process environment.
#[must_use]
pub fn expand_env(text: &str) -> Cow<'_, str> {
    expand_with(text, |name| std::env::var(name).ok())
}

/// Unset variables without a default expand to the empty string.
fn expand_with(text: &str, lookup: impl Fn(&str) -> Option<String>) -> Cow<'_, str> {
    PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                debug!(variable = name, "config placeholder references unset variable");
                String::new()
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use serde_json::json;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn placeholders_expand() {
        let lookup = vars(&[("PORT", "9000"), ("EMPTY", "")]);
        assert_eq!(expand_with("listen=:${PORT}", &lookup), "listen=:9000");
        assert_eq!(expand_with("${HOST:-127.0.0.1}", &lookup), "127.0.0.1");
        assert_eq!(expand_with("${PORT:-80}", &lookup), "9000");
        assert_eq!(expand_with("[${MISSING}]", &lookup), "[]");
        // A set but empty variable is used as is.
        assert_eq!(expand_with("[${EMPTY:-x}]", &lookup), "[]");
    }

    #[test]
    fn text_without_placeholders_is_borrowed() {
        let lookup = vars(&[]);
        assert!(matches!(expand_with("plain $HOME {}", &lookup), Cow::Borrowed(_)));
    }

    #[test]
    fn every_format_yields_the_same_shape() {
        let from_json = parse_config(
            r#"{"server": {"listen": "127.0.0.1:0", "shutdown_timeout_ms": 500}}"#,
            ConfigFormat::Json,
        )
        .unwrap();
        let from_toml = parse_config(
            "[server]\nlisten = \"127.0.0.1:0\"\nshutdown_timeout_ms = 500\n",
            ConfigFormat::Toml,
        )
        .unwrap();
        let from_yaml = parse_config(
            "server:\n  listen: \"127.0.0.1:0\"\n  shutdown_timeout_ms: 500\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(from_json, from_toml);
        assert_eq!(from_json, from_yaml);
        assert_eq!(from_json["server"]["shutdown_timeout_ms"], json!(500));
    }

    #[test]
    fn non_object_root_is_rejected() {
        let err = parse_config("[1, 2]", ConfigFormat::Json).unwrap_err();
        assert!(matches!(err, ConfigError::NotAnObject("an array")));
        assert!(matches!(
            parse_config("{", ConfigFormat::Json).unwrap_err(),
            ConfigError::Json(_)
        ));
        assert!(matches!(
            parse_config("server = ", ConfigFormat::Toml).unwrap_err(),
            ConfigError::Toml(_)
        ));
        assert!(matches!(
            parse_config("- a\n- b\n", ConfigFormat::Yaml).unwrap_err(),
            ConfigError::NotAnObject("an array")
        ));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), Some(ConfigFormat::Json));
        assert_eq!(ConfigFormat::from_path(Path::new("a.TOML")), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.yaml")), Some(ConfigFormat::Yaml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), Some(ConfigFormat::Yaml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.ini")), None);
        assert_eq!(ConfigFormat::from_path(Path::new("config")), None);
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[log]\nlevel = \"${{MUXGATE_TEST_UNSET_LEVEL:-debug}}\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config, json!({ "log": { "level": "debug" } }));
    }

    #[test]
    fn load_rejects_unknown_extension_and_missing_file() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(
            load_config(file.path()).unwrap_err(),
            ConfigError::UnsupportedFormat(_)
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_config(&dir.path().join("missing.json")).unwrap_err(),
            ConfigError::Read { .. }
        ));
    }
}
