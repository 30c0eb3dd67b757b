use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides `base_url`.
pub const BASE_URL_ENV: &str = "ROWSTAGE_BASE_URL";

/// Client configuration, stored as `config.json` under the store root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Branch that never accepts writes from this client.
    pub protected_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 10,
            protected_branch: "main".to_string(),
            default_target: None,
            default_database: None,
            default_branch: None,
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Load `config.json`, falling back to defaults when the file is missing
    /// or unreadable, then apply environment overrides.
    pub fn load(path: &Path) -> Self {
        let mut config = match read_config(path) {
            Ok(map) if map.is_empty() => Self::default(),
            Ok(map) => Self::from_map(map, path),
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                Self::default()
            }
        };
        config.apply_env_overrides(std::env::var(BASE_URL_ENV).ok());
        config
    }

    /// Deserialize field by field so one bad value only costs that field.
    fn from_map(map: serde_json::Map<String, serde_json::Value>, path: &Path) -> Self {
        let mut kept = serde_json::Map::new();
        for (key, value) in map {
            let mut trial = kept.clone();
            trial.insert(key.clone(), value);
            match serde_json::from_value::<Self>(serde_json::Value::Object(trial.clone())) {
                Ok(_) => kept = trial,
                Err(e) => tracing::warn!("config {}: ignoring {key}: {e}", path.display()),
            }
        }
        serde_json::from_value(serde_json::Value::Object(kept)).unwrap_or_default()
    }

    fn apply_env_overrides(&mut self, base_url: Option<String>) {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url;
        }
    }
}

/// Read config as a raw JSON object. Returns an empty map if the file doesn't exist.
pub fn read_config(path: &Path) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    if !path.exists() {
        return Ok(serde_json::Map::new());
    }
    let content = std::fs::read_to_string(path)?;
    let val: serde_json::Value = serde_json::from_str(&content)?;
    match val {
        serde_json::Value::Object(map) => Ok(map),
        _ => Ok(serde_json::Map::new()),
    }
}

/// Write the raw config object atomically.
pub fn write_config(
    path: &Path,
    config: &serde_json::Map<String, serde_json::Value>,
) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&config)?;
    crate::write_atomic(path, json.as_bytes())
}

/// Keys that always hold strings, even when the text looks like a number.
pub const STRING_KEYS: &[&str] = &[
    "base_url",
    "protected_branch",
    "default_target",
    "default_database",
    "default_branch",
];

/// Parse a value for `key`: string keys keep the text as given.
pub fn parse_value_for(key: &str, s: &str) -> serde_json::Value {
    if STRING_KEYS.contains(&key) {
        serde_json::Value::String(s.to_string())
    } else {
        parse_value(s)
    }
}

/// Parse a string value into an appropriate JSON value (bool/number/string).
pub fn parse_value(s: &str) -> serde_json::Value {
    match s {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        "null" => serde_json::Value::Null,
        _ => {
            if let Ok(n) = s.parse::<i64>() {
                serde_json::Value::Number(n.into())
            } else if let Ok(f) = s.parse::<f64>() {
                serde_json::json!(f)
            } else {
                serde_json::Value::String(s.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = Config::load(&tmp.path().join("config.json"));
        cfg.apply_env_overrides(None);
        assert_eq!(cfg.protected_branch, "main");
        assert_eq!(cfg.timeout_secs, 10);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"protected_branch":"trunk","default_target":"local"}"#).unwrap();
        let cfg = Config::load(&path);
        assert_eq!(cfg.protected_branch, "trunk");
        assert_eq!(cfg.default_target.as_deref(), Some("local"));
        assert_eq!(cfg.timeout_secs, 10);
    }

    #[test]
    fn malformed_file_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let cfg = Config::load(&path);
        assert_eq!(cfg.protected_branch, Config::default().protected_branch);
    }

    #[test]
    fn wrong_type_drops_only_that_field() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"base_url":"http://db.internal:9000","default_target":1,"timeout_secs":"soon","protected_branch":"trunk"}"#,
        )
        .unwrap();
        let mut cfg = Config::load(&path);
        cfg.apply_env_overrides(None);
        assert_eq!(cfg.default_target, None);
        assert_eq!(cfg.timeout_secs, 10);
        assert_eq!(cfg.protected_branch, "trunk");
    }

    #[test]
    fn string_keys_keep_numeric_text() {
        assert_eq!(parse_value_for("default_target", "1"), serde_json::json!("1"));
        assert_eq!(parse_value_for("timeout_secs", "30"), serde_json::json!(30));
    }

    #[test]
    fn env_override_replaces_base_url() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(Some("http://db.internal:9000".into()));
        assert_eq!(cfg.base_url, "http://db.internal:9000");
        cfg.apply_env_overrides(Some("  ".into()));
        assert_eq!(cfg.base_url, "http://db.internal:9000");
    }

    #[test]
    fn timeout_never_zero() {
        let cfg = Config {
            timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn write_then_read_raw_map() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let mut map = serde_json::Map::new();
        map.insert("timeout_secs".into(), parse_value("30"));
        map.insert("base_url".into(), parse_value("http://x"));
        write_config(&path, &map).unwrap();
        let back = read_config(&path).unwrap();
        assert_eq!(back["timeout_secs"], 30);
        assert_eq!(back["base_url"], "http://x");
    }

    #[test]
    fn parse_value_types() {
        assert_eq!(parse_value("true"), serde_json::Value::Bool(true));
        assert_eq!(parse_value("42"), serde_json::json!(42));
        assert_eq!(parse_value("1.5"), serde_json::json!(1.5));
        assert_eq!(parse_value("null"), serde_json::Value::Null);
        assert_eq!(parse_value("wi/a/01"), serde_json::json!("wi/a/01"));
    }
}
