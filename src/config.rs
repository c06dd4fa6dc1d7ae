use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::NodeError;

/// Environment variable naming the GenTL producer directories.
pub const GENTL_PATH_ENV: &str = "GENICAM_GENTL64_PATH";
/// Scheme that selects the synthetic camera backend instead of real producers.
pub const STUB_SCHEME: &str = "stub://";

const CONFIG_PATH_ENV: &str = "GENICAM_NODE_CONFIG";
const DEFAULT_DISPLAY_WIDTH: u32 = 640;
const DEFAULT_DISPLAY_HEIGHT: u32 = 360;
const DEFAULT_TIMEOUT_MS: u64 = 3_000;
const PRODUCER_EXTENSION: &str = "cti";

#[derive(Debug, Deserialize, Default)]
struct NodeConfigFile {
    display: Option<DisplayConfigFile>,
    devices: Option<Vec<usize>>,
    use_pref_counter: Option<bool>,
    acquisition: Option<AcquisitionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AcquisitionConfigFile {
    timeout_ms: Option<u64>,
}

/// Settings shared by every node of the editor.
///
/// `device_no_list` feeds the selector; when empty the node offers the
/// indices of the devices found during discovery instead.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedConfig {
    pub display_width: u32,
    pub display_height: u32,
    pub device_no_list: Vec<usize>,
    pub use_pref_counter: bool,
    pub acquisition_timeout: Duration,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            display_width: DEFAULT_DISPLAY_WIDTH,
            display_height: DEFAULT_DISPLAY_HEIGHT,
            device_no_list: Vec::new(),
            use_pref_counter: false,
            acquisition_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl SharedConfig {
    /// Loads the optional config file named by `GENICAM_NODE_CONFIG`, then
    /// applies environment overrides and validates the result.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_PATH_ENV).ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: NodeConfigFile) -> Self {
        let defaults = Self::default();
        let display_width = file
            .display
            .as_ref()
            .and_then(|display| display.width)
            .unwrap_or(defaults.display_width);
        let display_height = file
            .display
            .as_ref()
            .and_then(|display| display.height)
            .unwrap_or(defaults.display_height);
        let acquisition_timeout = file
            .acquisition
            .and_then(|acquisition| acquisition.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.acquisition_timeout);
        Self {
            display_width,
            display_height,
            device_no_list: file.devices.unwrap_or_default(),
            use_pref_counter: file.use_pref_counter.unwrap_or(defaults.use_pref_counter),
            acquisition_timeout,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(width) = std::env::var("GENICAM_NODE_WIDTH") {
            self.display_width = width
                .trim()
                .parse()
                .map_err(|_| anyhow!("GENICAM_NODE_WIDTH must be a positive integer"))?;
        }
        if let Ok(height) = std::env::var("GENICAM_NODE_HEIGHT") {
            self.display_height = height
                .trim()
                .parse()
                .map_err(|_| anyhow!("GENICAM_NODE_HEIGHT must be a positive integer"))?;
        }
        if let Ok(devices) = std::env::var("GENICAM_NODE_DEVICES") {
            let parsed = split_csv(&devices)
                .into_iter()
                .map(|entry| {
                    entry
                        .parse::<usize>()
                        .map_err(|_| anyhow!("GENICAM_NODE_DEVICES entry '{}' is not an index", entry))
                })
                .collect::<Result<Vec<_>>>()?;
            if !parsed.is_empty() {
                self.device_no_list = parsed;
            }
        }
        if let Ok(flag) = std::env::var("GENICAM_NODE_PERF_COUNTER") {
            self.use_pref_counter = parse_bool(&flag)
                .ok_or_else(|| anyhow!("GENICAM_NODE_PERF_COUNTER must be true/false/1/0"))?;
        }
        if let Ok(timeout) = std::env::var("GENICAM_NODE_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("GENICAM_NODE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.acquisition_timeout = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.display_width == 0 || self.display_height == 0 {
            return Err(anyhow!(
                "display size must be non-zero (got {}x{})",
                self.display_width,
                self.display_height
            ));
        }
        if self.acquisition_timeout.is_zero() {
            return Err(anyhow!("acquisition timeout must be greater than zero"));
        }
        let mut seen = HashSet::new();
        self.device_no_list.retain(|index| seen.insert(*index));
        Ok(())
    }
}

/// Where GenTL producers are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenTlPath {
    /// `stub://...`: synthetic cameras, no producer files involved.
    Stub(String),
    /// One or more directories holding `.cti` producer files.
    Directories(Vec<PathBuf>),
}

impl GenTlPath {
    /// Reads `GENICAM_GENTL64_PATH`.
    pub fn from_env() -> Result<Self, NodeError> {
        let value = std::env::var_os(GENTL_PATH_ENV)
            .ok_or_else(|| NodeError::Configuration(format!("{GENTL_PATH_ENV} is not set")))?;
        let value = value.into_string().map_err(|_| {
            NodeError::Configuration(format!("{GENTL_PATH_ENV} is not valid unicode"))
        })?;
        Self::parse(&value)
    }

    /// Parses a path list as found in `GENICAM_GENTL64_PATH`.
    pub fn parse(value: &str) -> Result<Self, NodeError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(NodeError::Configuration(format!("{GENTL_PATH_ENV} is empty")));
        }
        if value.starts_with(STUB_SCHEME) {
            return Ok(GenTlPath::Stub(value.to_string()));
        }
        let directories: Vec<PathBuf> = std::env::split_paths(value)
            .filter(|path| !path.as_os_str().is_empty())
            .collect();
        if directories.is_empty() {
            return Err(NodeError::Configuration(format!(
                "{GENTL_PATH_ENV} lists no directories"
            )));
        }
        Ok(GenTlPath::Directories(directories))
    }

    /// Lists the `.cti` files of every readable directory, sorted per directory.
    ///
    /// Unreadable directories are skipped with a warning; if none can be read
    /// the path is a configuration error.
    pub fn producer_files(&self) -> Result<Vec<PathBuf>, NodeError> {
        let directories = match self {
            GenTlPath::Stub(_) => return Ok(Vec::new()),
            GenTlPath::Directories(directories) => directories,
        };
        let mut readable = 0usize;
        let mut files = Vec::new();
        for dir in directories {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) => {
                    log::warn!("GenTL path {} is not readable: {}", dir.display(), err);
                    continue;
                }
            };
            readable += 1;
            let mut found: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && is_producer_file(path))
                .collect();
            found.sort();
            files.extend(found);
        }
        if readable == 0 {
            return Err(NodeError::Configuration(format!(
                "none of the directories in {GENTL_PATH_ENV} could be read"
            )));
        }
        Ok(files)
    }
}

fn is_producer_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(PRODUCER_EXTENSION))
        .unwrap_or(false)
}

fn read_config_file(path: &Path) -> Result<NodeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
