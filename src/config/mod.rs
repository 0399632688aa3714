use anyhow::{bail, Context, Result};
use dirs::home_dir;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::export::{ExportField, ExportFormat};
use crate::sync::{ScreeningRules, DEFAULT_SUSPICIOUS_PATTERNS};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Runtime configuration. Layers, lowest priority first: built-in defaults,
/// an optional TOML file, `MAILKEEP_*` environment variables, then CLI flags
/// (applied by the caller).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Resolved by `load`/`from_file`; a file without `data_dir` keeps the
    /// default archive root.
    #[serde(skip)]
    pub data_dir: PathBuf,
    pub folder: String,
    pub concurrency: usize,
    pub verify_checksum: bool,
    /// Only sync the latest N messages of the folder.
    pub limit: Option<usize>,
    pub screening: ScreeningConfig,
    pub export_fields: Vec<ExportField>,
    pub export_format: ExportFormat,
    pub export_path: Option<PathBuf>,
    pub imap: ImapConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
}

/// Pre-download screening rules. Screened messages are counted as blocked
/// and looked at again on every pass.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    /// `None` disables the size check.
    pub max_message_mb: Option<f64>,
    pub blacklist_senders: Vec<String>,
    pub skip_suspicious: bool,
    pub suspicious_patterns: Vec<String>,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            max_message_mb: Some(100.0),
            blacklist_senders: Vec::new(),
            skip_suspicious: true,
            suspicious_patterns: DEFAULT_SUSPICIOUS_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl ScreeningConfig {
    pub fn rules(&self) -> ScreeningRules {
        ScreeningRules {
            max_message_bytes: self
                .max_message_mb
                .map(|mb| (mb * 1024.0 * 1024.0) as u64),
            blacklist_senders: self.blacklist_senders.clone(),
            suspicious_patterns: if self.skip_suspicious {
                self.suspicious_patterns.clone()
            } else {
                Vec::new()
            },
        }
    }
}

// Only the `data_dir` key, so its absence can be told apart from a default.
#[derive(Deserialize)]
struct DataDirKey {
    data_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("mailkeep-data"),
            folder: "INBOX".to_string(),
            concurrency: 4,
            verify_checksum: true,
            limit: None,
            screening: ScreeningConfig::default(),
            export_fields: ExportField::defaults(),
            export_format: ExportFormat::Csv,
            export_path: None,
            imap: ImapConfig::default(),
        }
    }
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: "imap.gmail.com".to_string(),
            port: 993,
            username: String::new(),
            password: None,
        }
    }
}

impl AppConfig {
    /// Loads `explicit` if given, else `config.toml` in the default data dir
    /// when present, then applies the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let base = match env::var("MAILKEEP_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_data_dir()?,
        };

        let file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let candidate = base.join(CONFIG_FILE_NAME);
                candidate.exists().then_some(candidate)
            }
        };

        let mut config = match file {
            Some(path) => Self::from_file(&path, &base)?,
            None => Self {
                data_dir: base.clone(),
                ..Self::default()
            },
        };

        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML config. Without a `data_dir` key the archive root stays
    /// `default_data_dir`; a relative one is anchored at the file's directory.
    pub fn from_file(path: &Path, default_data_dir: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        let key: DataDirKey = toml::from_str(&content)
            .with_context(|| format!("parsing data_dir in {}", path.display()))?;

        config.data_dir = match key.data_dir {
            Some(dir) if dir.is_relative() => path
                .parent()
                .map(|parent| parent.join(&dir))
                .unwrap_or(dir),
            Some(dir) => dir,
            None => default_data_dir.to_path_buf(),
        };
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("MAILKEEP_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(folder) = lookup("MAILKEEP_FOLDER") {
            self.folder = folder;
        }
        if let Some(raw) = lookup("MAILKEEP_CONCURRENCY") {
            self.concurrency = raw
                .parse()
                .with_context(|| format!("MAILKEEP_CONCURRENCY={:?} is not a number", raw))?;
        }
        if let Some(raw) = lookup("MAILKEEP_VERIFY_CHECKSUM") {
            self.verify_checksum = parse_bool(&raw);
        }
        if let Some(raw) = lookup("MAILKEEP_LIMIT") {
            self.limit = Some(
                raw.parse()
                    .with_context(|| format!("MAILKEEP_LIMIT={:?} is not a number", raw))?,
            );
        }
        if let Some(raw) = lookup("MAILKEEP_MAX_MESSAGE_MB") {
            self.screening.max_message_mb = if raw.trim().is_empty() || raw == "0" {
                None
            } else {
                Some(raw.parse().with_context(|| {
                    format!("MAILKEEP_MAX_MESSAGE_MB={:?} is not a number", raw)
                })?)
            };
        }
        if let Some(raw) = lookup("MAILKEEP_BLACKLIST_SENDERS") {
            self.screening.blacklist_senders = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = lookup("MAILKEEP_SKIP_SUSPICIOUS") {
            self.screening.skip_suspicious = parse_bool(&raw);
        }
        if let Some(raw) = lookup("MAILKEEP_EXPORT_FIELDS") {
            self.export_fields = ExportField::parse_list(&raw)?;
        }
        if let Some(raw) = lookup("MAILKEEP_EXPORT_FORMAT") {
            self.export_format = raw.parse()?;
        }
        if let Some(path) = lookup("MAILKEEP_EXPORT_PATH") {
            self.export_path = Some(PathBuf::from(path));
        }
        if let Some(host) = lookup("MAILKEEP_IMAP_HOST") {
            self.imap.host = host;
        }
        if let Some(raw) = lookup("MAILKEEP_IMAP_PORT") {
            self.imap.port = raw
                .parse()
                .with_context(|| format!("MAILKEEP_IMAP_PORT={:?} is not a port", raw))?;
        }
        if let Some(user) = lookup("MAILKEEP_IMAP_USERNAME") {
            self.imap.username = user;
        }
        if let Some(password) = lookup("MAILKEEP_IMAP_PASSWORD") {
            self.imap.password = Some(password);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.folder.trim().is_empty() {
            bail!("folder must not be empty");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.limit == Some(0) {
            bail!("limit must be at least 1");
        }
        if matches!(self.screening.max_message_mb, Some(mb) if mb.is_nan() || mb <= 0.0) {
            bail!("screening.max_message_mb must be positive");
        }
        if self.export_fields.is_empty() {
            bail!("export_fields must name at least one field");
        }
        Ok(())
    }

    /// Where `export` writes when no output path is given.
    pub fn default_export_path(&self) -> PathBuf {
        self.export_path.clone().unwrap_or_else(|| {
            self.data_dir
                .join(format!("export.{}", self.export_format.extension()))
        })
    }
}

fn parse_bool(raw: &str) -> bool {
    raw == "1" || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(home) = home_dir() {
        let path = home.join("mailkeep");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
        warn!(
            "Unable to create {}/mailkeep; falling back to workspace-local storage",
            home.display()
        );
    }

    let cwd = env::current_dir().context("determining current directory")?;
    Ok(cwd.join("mailkeep-data"))
}
