//! Configuration file support for optiflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (OPTIFLASH_*)
//! 3. Local config file (./optiflash.toml)
//! 4. Global config file (~/.config/optiflash/config.toml)
//!
//! An explicit `--config PATH` replaces steps 3 and 4 and must parse.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use directories::ProjectDirs;
use log::{debug, warn};
use optiflash::{
    FlashGeometry, ModemLineReset, NoReset, ProgrammerConfig, ResetControl, ResetLine, Signature,
    Strictness, Target,
};
use serde::{Deserialize, Serialize};

use crate::CliError;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "optiflash.toml";

/// Default baud rate of optiboot builds.
pub const DEFAULT_BAUD: u32 = 115_200;

/// How the target's reset pin is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    /// Pulse DTR (Arduino-style auto-reset).
    Dtr,
    /// Pulse RTS.
    Rts,
    /// Pulse DTR and RTS together.
    Both,
    /// No reset wiring; reset the board by hand.
    None,
}

impl ResetMode {
    /// Build the reset controller for this mode.
    pub fn controller(self) -> Box<dyn ResetControl> {
        match self {
            Self::Dtr => Box::new(ModemLineReset::new(ResetLine::Dtr)),
            Self::Rts => Box::new(ModemLineReset::new(ResetLine::Rts)),
            Self::Both => Box::new(ModemLineReset::new(ResetLine::Both)),
            Self::None => Box::new(NoReset),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Reset wiring.
    pub reset: Option<ResetMode>,
}

/// Target description or overrides of a built-in profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Built-in profile or custom name.
    pub name: Option<String>,
    /// Expected signature, e.g. "1E9618".
    pub signature: Option<String>,
    /// Flash size in bytes.
    pub flash_size: Option<usize>,
    /// Page size in bytes.
    pub page_size: Option<usize>,
    /// Bootloader pages at the start of flash.
    pub protected_pages: Option<usize>,
}

/// Protocol behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Fail on protocol deviations instead of tolerating them.
    pub strict: Option<bool>,
    /// Program+verify cycles.
    pub attempts: Option<usize>,
    /// Reconnect attempts between cycles.
    pub reconnect_attempts: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Target settings.
    #[serde(default)]
    pub target: TargetConfig,
    /// Protocol settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    ///
    /// Unreadable files are reported and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::Usage(format!("cannot read config {}: {e}", path.display())))?;
        let config = toml::from_str(&content)
            .map_err(|e| CliError::Usage(format!("invalid config {}: {e}", path.display())))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "optiflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        let Self {
            connection,
            target,
            protocol,
        } = other;

        merge_opt(&mut self.connection.port, connection.port);
        merge_opt(&mut self.connection.baud, connection.baud);
        merge_opt(&mut self.connection.reset, connection.reset);

        merge_opt(&mut self.target.name, target.name);
        merge_opt(&mut self.target.signature, target.signature);
        merge_opt(&mut self.target.flash_size, target.flash_size);
        merge_opt(&mut self.target.page_size, target.page_size);
        merge_opt(&mut self.target.protected_pages, target.protected_pages);

        merge_opt(&mut self.protocol.strict, protocol.strict);
        merge_opt(&mut self.protocol.attempts, protocol.attempts);
        merge_opt(&mut self.protocol.reconnect_attempts, protocol.reconnect_attempts);
    }

    /// Resolve the target, with `name` (flag or environment) taking priority.
    pub fn resolve_target(&self, name: Option<&str>) -> Result<Target> {
        let section = &self.target;
        let name = name.or(section.name.as_deref()).unwrap_or("avr64db32");

        let mut target = match Target::from_name(name) {
            Some(target) => target,
            None => {
                let (Some(signature), Some(flash_size), Some(page_size)) =
                    (&section.signature, section.flash_size, section.page_size)
                else {
                    return Err(CliError::Usage(format!(
                        "unknown target '{name}' (built in: {}); describe it with \
                         signature, flash_size and page_size in [target]",
                        Target::BUILTIN.join(", ")
                    ))
                    .into());
                };
                let signature: Signature = signature.parse()?;
                let geometry = FlashGeometry::new(flash_size, page_size)?;
                Target::custom(name, signature, geometry)
            },
        };

        if let Some(signature) = &section.signature {
            target.signature = signature
                .parse::<Signature>()
                .with_context(|| format!("[target] signature '{signature}'"))?;
        }
        if section.flash_size.is_some() || section.page_size.is_some() {
            target.geometry = FlashGeometry::new(
                section.flash_size.unwrap_or(target.geometry.size()),
                section.page_size.unwrap_or(target.geometry.page_size()),
            )?;
        }
        if let Some(pages) = section.protected_pages {
            target = target.with_protected_pages(pages);
        }

        Ok(target)
    }

    /// Retry budget from `[protocol]`.
    pub fn programmer_config(&self) -> ProgrammerConfig {
        let mut config = ProgrammerConfig::default();
        if let Some(attempts) = self.protocol.attempts {
            config = config.with_attempts(attempts);
        }
        if let Some(attempts) = self.protocol.reconnect_attempts {
            config = config.with_reconnect_attempts(attempts);
        }
        config
    }

    /// Strictness, with the `--strict` flag taking priority.
    pub fn strictness(&self, strict_flag: bool) -> Strictness {
        if strict_flag || self.protocol.strict.unwrap_or(false) {
            Strictness::Strict
        } else {
            Strictness::Lenient
        }
    }
}

fn merge_opt<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}
