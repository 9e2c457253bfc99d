use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::SystemTime,
};
use async_trait::async_trait;
use dashmap::DashMap;
use handlebars::Handlebars;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{adapter::{AdapterError, SinkAdapter, SourceAdapter}, message::Message};

pub const FILE_NAME: &str = "file_name";
pub const FILE_PATH: &str = "file_path";
pub const FILE_SIZE: &str = "file_size";

/// Turn a `*.csv` style wildcard into an anchored regex.
pub fn wildcard_to_regex(pattern: &str) -> Result<Regex, AdapterError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| AdapterError::Other(format!("bad pattern `{}`: {}", pattern, e)))
}

/// Polls a directory and emits each matching file once, with its contents
/// as a string payload. A file that is modified later is emitted again.
pub struct FileSource {
    directory: PathBuf,
    pattern: Regex,
    seen: DashMap<PathBuf, SystemTime>,
}

impl FileSource {
    pub fn new(directory: impl Into<PathBuf>, pattern: &str, auto_create: bool) -> Result<Self, AdapterError> {
        let directory = directory.into();
        if !directory.exists() {
            if auto_create {
                std::fs::create_dir_all(&directory)?;
                info!("created input directory {}", directory.display());
            } else {
                return Err(AdapterError::Io(format!(
                    "input directory {} does not exist",
                    directory.display()
                )));
            }
        }
        Ok(Self {
            directory,
            pattern: wildcard_to_regex(pattern)?,
            seen: DashMap::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn is_new(&self, path: &Path, modified: SystemTime) -> bool {
        match self.seen.get(path) {
            Some(prev) => *prev < modified,
            None => true,
        }
    }

    async fn next_candidate(&self) -> Result<Option<(PathBuf, SystemTime)>, AdapterError> {
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        let mut candidates = Vec::new();
        let mut present = HashSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            if !self.pattern.is_match(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if self.is_new(&path, modified) {
                candidates.push((path.clone(), modified));
            }
            present.insert(path);
        }
        // Forget files that were removed from the directory.
        self.seen.retain(|path, _| present.contains(path));
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(candidates.into_iter().next())
    }
}

#[async_trait]
impl SourceAdapter for FileSource {
    fn name(&self) -> String {
        format!("file:{}", self.directory.display())
    }

    async fn fetch(&self) -> Result<Option<Message>, AdapterError> {
        let Some((path, modified)) = self.next_candidate().await? else {
            return Ok(None);
        };
        // Marked before reading so an unreadable file cannot block the ones after it.
        self.seen.insert(path.clone(), modified);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            warn!(file = %path.display(), error = %e, "skipping unreadable file");
            AdapterError::Io(format!("{}: {}", path.display(), e))
        })?;
        let contents = String::from_utf8(bytes).map_err(|e| {
            warn!(file = %path.display(), error = %e, "skipping file that is not UTF-8");
            AdapterError::InvalidPayload(format!("{}: {}", path.display(), e))
        })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        debug!(file = %path.display(), bytes = contents.len(), "picked up file");

        let msg = Message::text(contents.clone())
            .with_merged_headers([
                (FILE_NAME.to_string(), json!(name)),
                (FILE_PATH.to_string(), json!(path.to_string_lossy())),
                (FILE_SIZE.to_string(), json!(contents.len())),
            ]);
        Ok(Some(msg))
    }

    async fn requeue(&self, msg: Message) -> bool {
        match msg.header_str(FILE_PATH) {
            Some(path) => {
                self.seen.remove(Path::new(path));
                true
            }
            None => false,
        }
    }
}

/// What to do when the target file already exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileExistsMode {
    #[default]
    Append,
    Replace,
    Fail,
    Ignore,
}

pub const DEFAULT_FILE_NAME_TEMPLATE: &str = "processed_{{timestamp}}.txt";

/// Writes each payload to a file in `directory`.
///
/// The file name is a handlebars template rendered against
/// `{timestamp, id, headers}`; `timestamp` is epoch millis at delivery.
pub struct FileSink {
    directory: PathBuf,
    mode: FileExistsMode,
    template: String,
    registry: Handlebars<'static>,
}

impl FileSink {
    pub fn new(directory: impl Into<PathBuf>, mode: FileExistsMode) -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        Self {
            directory: directory.into(),
            mode,
            template: DEFAULT_FILE_NAME_TEMPLATE.to_string(),
            registry,
        }
    }

    pub fn with_file_name_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn file_name_for(&self, msg: &Message) -> Result<String, AdapterError> {
        let ctx = json!({
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "id": msg.id(),
            "headers": msg.headers(),
        });
        let name = self
            .registry
            .render_template(&self.template, &ctx)
            .map_err(|e| AdapterError::Other(format!("file name template: {}", e)))?;
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(AdapterError::Rejected(format!("invalid file name `{}`", name)));
        }
        Ok(name)
    }
}

fn payload_to_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SinkAdapter for FileSink {
    fn name(&self) -> String {
        format!("file:{}", self.directory.display())
    }

    async fn deliver(&self, msg: &Message) -> Result<(), AdapterError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.directory.join(self.file_name_for(msg)?);
        let exists = tokio::fs::try_exists(&path).await?;
        let text = payload_to_text(msg.payload());

        match (self.mode, exists) {
            (FileExistsMode::Fail, true) => {
                return Err(AdapterError::Rejected(format!("{} already exists", path.display())));
            }
            (FileExistsMode::Ignore, true) => {
                warn!(file = %path.display(), "target exists, message ignored");
                return Ok(());
            }
            (FileExistsMode::Append, true) => {
                let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await?;
                let non_empty = file.metadata().await?.len() > 0;
                if non_empty {
                    file.write_all(b"\n").await?;
                }
                file.write_all(text.as_bytes()).await?;
                file.flush().await?;
            }
            _ => {
                tokio::fs::write(&path, text.as_bytes()).await?;
            }
        }
        debug!(file = %path.display(), message_id = %msg.id(), "wrote message");
        Ok(())
    }
}
