use directories::ProjectDirs;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

static CONFIG: OnceCell<ConfigInner> = OnceCell::new();

#[derive(Debug)]
struct ConfigInner {
    config: Config,
    file_path: PathBuf,
}

struct LoadedConfig {
    config: Config,
    file_path: PathBuf,
    maybe_error: Option<toml::de::Error>,
}

/// Default location of `config.toml`.
///
/// Linux: ~/.config/mdit-preview/config.toml
/// macOS: ~/Library/Application\ Support/org.mdit.mdit-preview/config.toml
/// Windows: ~\AppData\Roaming\mdit\mdit-preview\config\config.toml
pub fn default_config_file() -> PathBuf {
    ProjectDirs::from("org", "mdit", "mdit-preview")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

fn load_config(specified_config_file: Option<PathBuf>) -> LoadedConfig {
    let config_file = specified_config_file.unwrap_or_else(default_config_file);

    let mut maybe_error = None;
    let config = match std::fs::read_to_string(&config_file) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
            maybe_error.replace(err);
            Config::default()
        }),
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(?err, path = %config_file.display(), "Failed to read config.toml");
            }
            Config::default()
        }
    };

    LoadedConfig {
        config,
        file_path: config_file,
        maybe_error,
    }
}

/// Initializes the global [`Config`] from `specified_config_file` or the
/// default location.
///
/// A malformed file yields the default config plus the parse error, which the
/// caller is expected to report. Calling this again after the config has been
/// initialized keeps the first config and returns no error.
pub fn load_config_on_startup(
    specified_config_file: Option<PathBuf>,
) -> (&'static Config, Option<toml::de::Error>) {
    let mut maybe_error = None;

    let inner = CONFIG.get_or_init(|| {
        let LoadedConfig {
            config,
            file_path,
            maybe_error: err,
        } = load_config(specified_config_file);
        maybe_error = err;
        ConfigInner { config, file_path }
    });

    (&inner.config, maybe_error)
}

fn inner() -> &'static ConfigInner {
    CONFIG.get_or_init(|| {
        let LoadedConfig {
            config, file_path, ..
        } = load_config(None);
        ConfigInner { config, file_path }
    })
}

/// [`Config`] is a global singleton, explicitly initialized with
/// [`load_config_on_startup`] when the program starts from the CLI, otherwise
/// lazily loaded from the default location.
pub fn config() -> &'static Config {
    &inner().config
}

pub fn config_file() -> &'static Path {
    &inner().file_path
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct LogConfig {
    /// Specify the log file path.
    ///
    /// This path must be an absolute path.
    pub log_file: Option<String>,

    /// Specify the max log level.
    pub max_level: String,

    /// Specify the log target to enable more detailed logging.
    ///
    /// ```toml
    /// [log]
    /// log-target = "preview_core=trace,preview_server=debug"
    /// ```
    pub log_target: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            max_level: "debug".into(),
            log_target: "".into(),
        }
    }
}

/// Preview behaviour.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct PreviewSettings {
    /// Port of the first preview server, `0` picks a free one.
    pub port: u16,

    /// Whether to open the preview page in the default browser.
    pub open_browser: bool,

    /// Open a preview automatically when an eligible document is opened.
    pub open_preview_on_open: bool,

    /// Location of the per-workspace configuration, relative to the
    /// workspace root.
    pub config_file_name: String,

    /// Where the page loads markdown-it from.
    pub markdown_it_cdn: String,

    /// Delay used to coalesce bursts of file changes, in milliseconds.
    pub debounce_ms: u64,

    /// How long the page may stay disconnected before the preview is
    /// considered closed, in milliseconds.
    pub close_grace_ms: u64,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            port: 0,
            open_browser: true,
            open_preview_on_open: false,
            config_file_name: ".vscode/markdown-it-custom-preview.json".into(),
            markdown_it_cdn: "https://cdn.jsdelivr.net/npm/markdown-it/dist/markdown-it.min.js"
                .into(),
            debounce_ms: 50,
            close_grace_ms: 3000,
        }
    }
}

impl PreviewSettings {
    pub fn config_file_name(&self) -> PathBuf {
        PathBuf::from(&self.config_file_name)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Log configuration.
    pub log: LogConfig,

    /// Preview configuration.
    pub preview: PreviewSettings,
}
