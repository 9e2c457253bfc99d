use std::{env, fmt, path::PathBuf, sync::Arc};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt};
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::FlowError;

/// Key/value settings used to resolve `${KEY}` placeholders in flow files.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn describe(&self) -> String;
}

#[derive(Clone)]
pub struct ConfigManager(pub Arc<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn env(env_file: Option<PathBuf>) -> Self {
        ConfigManager(Arc::new(EnvConfigManager::new(env_file)))
    }

    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        ConfigManager(Arc::new(MapConfigManager::from_entries(entries)))
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.describe())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Self {
        match &env_file {
            Some(path) if path.exists() => match dotenvy::from_path(path) {
                Ok(()) => info!("loaded .env from {}", path.display()),
                Err(e) => debug!("could not load .env from {}: {}", path.display(), e),
            },
            Some(path) => debug!("no .env at {}", path.display()),
            None => {}
        }
        Self { env_file }
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn describe(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvConfigManager({})", path.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

/// In-memory settings, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            map: entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn describe(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

fn placeholder_regex() -> Result<Regex, FlowError> {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.-]*)\}").map_err(|e| FlowError::Config(e.to_string()))
}

/// Replace every `${KEY}` in `text`. An unknown key is a configuration error.
pub async fn substitute_placeholders(text: &str, config: &ConfigManager) -> Result<String, FlowError> {
    let re = placeholder_regex()?;
    let keys: Vec<String> = re.captures_iter(text).map(|caps| caps[1].to_string()).collect();
    let mut values = Vec::with_capacity(keys.len());
    for key in keys {
        let value = config
            .get(&key)
            .await
            .ok_or_else(|| FlowError::Config(format!("unresolved placeholder `${{{}}}`", key)))?;
        values.push(value);
    }
    let mut values = values.into_iter();
    Ok(re
        .replace_all(text, |_: &Captures| values.next().unwrap_or_default())
        .into_owned())
}

/// Apply `substitute_placeholders` to every string inside a JSON tree.
pub fn resolve_value<'a>(value: Value, config: &'a ConfigManager) -> BoxFuture<'a, Result<Value, FlowError>> {
    async move {
        Ok(match value {
            Value::String(s) => Value::String(substitute_placeholders(&s, config).await?),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve_value(item, config).await?);
                }
                Value::Array(out)
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, resolve_value(v, config).await?);
                }
                Value::Object(out)
            }
            other => other,
        })
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_env_config_manager_loads_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "EIPFLOW_TEST_INPUT_DIR=/data/in\n").unwrap();

        let config = ConfigManager::env(Some(env_path));
        assert_eq!(config.get("EIPFLOW_TEST_INPUT_DIR").await, Some("/data/in".to_string()));
        assert_eq!(config.get("EIPFLOW_TEST_NOT_SET").await, None);
    }

    #[tokio::test]
    async fn test_substitute_placeholders() {
        let config = ConfigManager::map([("IN", "/tmp/in"), ("EXT", "csv")]);
        let out = substitute_placeholders("${IN}/*.${EXT}", &config).await.unwrap();
        assert_eq!(out, "/tmp/in/*.csv");
        assert_eq!(substitute_placeholders("no placeholders", &config).await.unwrap(), "no placeholders");

        let err = substitute_placeholders("${MISSING}", &config).await.unwrap_err();
        assert_eq!(err, FlowError::Config("unresolved placeholder `${MISSING}`".into()));
    }

    #[tokio::test]
    async fn test_resolve_value_walks_tree() {
        let config = ConfigManager::map([("DIR", "out")]);
        let resolved = resolve_value(json!({"sink": {"directory": "${DIR}", "n": 3}, "list": ["${DIR}/a"]}), &config)
            .await
            .unwrap();
        assert_eq!(resolved, json!({"sink": {"directory": "out", "n": 3}, "list": ["out/a"]}));
    }
}
