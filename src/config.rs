//! Toolchain configuration and per-platform resolution.
//!
//! The settings record is layered: a base toolchain plus optional overrides
//! keyed by platform. An override field that is present replaces the base
//! field wholesale, an absent field keeps the base value.
//!
//! ```json
//! {
//!     "path": "haxe",
//!     "arguments": ["-v"],
//!     "env": {"HAXE_STD_PATH": "/opt/haxe/std"},
//!     "windows": {"path": "C:\\HaxeToolkit\\haxe\\haxe.exe"}
//! }
//! ```

use crate::error::DisplayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

fn default_executable() -> String {
    "haxe".to_string()
}

/// Effective configuration used to spawn one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    #[serde(default = "default_executable", alias = "path", alias = "executablePath")]
    pub executable: String,
    #[serde(default, alias = "args")]
    pub arguments: Vec<String>,
    #[serde(default, alias = "env")]
    pub environment: BTreeMap<String, String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
        }
    }
}

/// Platform-specific replacement fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainOverride {
    #[serde(
        default,
        alias = "path",
        alias = "executablePath",
        skip_serializing_if = "Option::is_none"
    )]
    pub executable: Option<String>,
    #[serde(default, alias = "args", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
    #[serde(default, alias = "env", skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Windows,
    Linux,
    #[serde(alias = "macos")]
    Osx,
}

impl Platform {
    /// Platform of the running binary. Unix flavours other than macOS use the
    /// Linux overrides.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Osx
        } else {
            Platform::Linux
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Windows => write!(f, "windows"),
            Platform::Linux => write!(f, "linux"),
            Platform::Osx => write!(f, "osx"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<ToolchainOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<ToolchainOverride>,
    #[serde(default, alias = "macos", skip_serializing_if = "Option::is_none")]
    pub osx: Option<ToolchainOverride>,
}

impl PlatformOverrides {
    pub fn get(&self, platform: Platform) -> Option<&ToolchainOverride> {
        match platform {
            Platform::Windows => self.windows.as_ref(),
            Platform::Linux => self.linux.as_ref(),
            Platform::Osx => self.osx.as_ref(),
        }
    }
}

/// Layered settings as read from the settings source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayServerSettings {
    #[serde(flatten)]
    pub base: ToolchainConfig,
    #[serde(flatten)]
    pub overrides: PlatformOverrides,
}

impl DisplayServerSettings {
    pub fn resolve(&self, platform: Platform) -> ToolchainConfig {
        resolve(&self.base, &self.overrides, platform)
    }
}

/// Merge `base` with the override for `platform`, if any.
pub fn resolve(
    base: &ToolchainConfig,
    overrides: &PlatformOverrides,
    platform: Platform,
) -> ToolchainConfig {
    let mut config = base.clone();
    let Some(over) = overrides.get(platform) else {
        return config;
    };
    if let Some(executable) = &over.executable {
        config.executable = executable.clone();
    }
    if let Some(arguments) = &over.arguments {
        config.arguments = arguments.clone();
    }
    if let Some(environment) = &over.environment {
        config.environment = environment.clone();
    }
    config
}

/// Source of settings, consulted before every (re)start.
pub trait SettingsProvider: Send + Sync {
    fn load(&self) -> Result<DisplayServerSettings, DisplayError>;
}

impl SettingsProvider for DisplayServerSettings {
    fn load(&self) -> Result<DisplayServerSettings, DisplayError> {
        Ok(self.clone())
    }
}

/// JSON settings file, re-read on every load. A missing file means defaults.
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsProvider for SettingsFile {
    fn load(&self) -> Result<DisplayServerSettings, DisplayError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Settings file missing, using defaults");
                return Ok(DisplayServerSettings::default());
            }
            Err(e) => {
                return Err(DisplayError::Config(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&text)
            .map_err(|e| DisplayError::Config(format!("{}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base(path: &str) -> ToolchainConfig {
        ToolchainConfig {
            executable: path.to_string(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
        }
    }

    #[test]
    fn override_replaces_present_fields_only() {
        let overrides = PlatformOverrides {
            windows: Some(ToolchainOverride {
                executable: Some("b".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(resolve(&base("a"), &overrides, Platform::Windows), base("b"));
        assert_eq!(resolve(&base("a"), &overrides, Platform::Linux), base("a"));
    }

    #[test]
    fn empty_override_keeps_base() {
        let overrides = PlatformOverrides {
            windows: Some(ToolchainOverride::default()),
            ..Default::default()
        };
        assert_eq!(resolve(&base("a"), &overrides, Platform::Windows), base("a"));
    }

    #[test]
    fn empty_collection_is_an_explicit_override() {
        let mut with_args = base("a");
        with_args.arguments = vec!["-v".to_string()];
        with_args
            .environment
            .insert("HAXEPATH".to_string(), "/opt/haxe".to_string());
        let overrides = PlatformOverrides {
            osx: Some(ToolchainOverride {
                arguments: Some(Vec::new()),
                environment: Some(BTreeMap::new()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(resolve(&with_args, &overrides, Platform::Osx), base("a"));
    }

    #[test]
    fn deserialize_layered_settings() {
        let json = r#"{
            "path": "haxe",
            "args": ["-v"],
            "env": {"A": "1"},
            "windows": {"executablePath": "haxe.exe"},
            "macos": {"arguments": []}
        }"#;
        let settings: DisplayServerSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.base.executable, "haxe");
        assert_eq!(settings.base.arguments, vec!["-v".to_string()]);

        let windows = settings.resolve(Platform::Windows);
        assert_eq!(windows.executable, "haxe.exe");
        assert_eq!(windows.arguments, vec!["-v".to_string()]);

        let osx = settings.resolve(Platform::Osx);
        assert!(osx.arguments.is_empty());
        assert_eq!(osx.environment.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn defaults_when_fields_missing() {
        let settings: DisplayServerSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.base, ToolchainConfig::default());
        assert_eq!(settings.resolve(Platform::current()).executable, "haxe");
    }

    #[test]
    fn settings_file_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("display.json");
        let provider = SettingsFile::new(&path);

        assert_eq!(provider.load().unwrap(), DisplayServerSettings::default());

        std::fs::write(&path, r#"{"path": "/opt/haxe/haxe"}"#).unwrap();
        assert_eq!(provider.load().unwrap().base.executable, "/opt/haxe/haxe");

        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(provider.load(), Err(DisplayError::Config(_))));
    }
}
