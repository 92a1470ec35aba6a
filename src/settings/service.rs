use crate::error::Result;
use crate::network::core::handle::{HandleConfig, DEFAULT_PRIORITY};
use crate::network::types::param::validate_priority;
use crate::network::types::{Layer, OpenFlags};
use crate::settings::queue::QueueOptions;
use clap::Parser;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How a service opens and tunes its handle.
///
/// Parsed from the command line or loaded from a TOML file. Missing TOML
/// keys take their defaults.
#[derive(Parser, Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[command(name = "divert", about = "Open a WinDivert handle")]
#[serde(default)]
pub struct ServiceOptions {
    /// Layer the handle observes
    #[arg(long, value_enum, default_value_t = Layer::Network)]
    pub layer: Layer,

    /// Handle priority, higher values see packets first (-3000 to 3000)
    #[arg(long, default_value_t = DEFAULT_PRIORITY, allow_negative_numbers = true)]
    pub priority: i16,

    /// Copy packets instead of diverting them
    #[arg(long)]
    pub sniff: bool,

    /// Drop matching packets without passing them to the service
    #[arg(long)]
    pub drop: bool,

    /// Only receive, never send
    #[arg(long)]
    pub recv_only: bool,

    /// Only send, never receive
    #[arg(long)]
    pub send_only: bool,

    /// Fail instead of installing the driver if it is not loaded
    #[arg(long)]
    pub no_install: bool,

    /// Receive IP fragments as well
    #[arg(long)]
    pub fragments: bool,

    #[command(flatten)]
    pub queue: QueueOptions,
}

impl ServiceOptions {
    /// Open flags selected by the boolean switches.
    pub fn flags(&self) -> OpenFlags {
        [
            (self.sniff, OpenFlags::SNIFF),
            (self.drop, OpenFlags::DROP),
            (self.recv_only, OpenFlags::RECV_ONLY),
            (self.send_only, OpenFlags::SEND_ONLY),
            (self.no_install, OpenFlags::NO_INSTALL),
            (self.fragments, OpenFlags::FRAGMENTS),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(OpenFlags::empty(), |flags, (_, flag)| flags | flag)
    }

    pub fn handle_config(&self) -> HandleConfig {
        HandleConfig::with_layer(self.layer)
            .priority(self.priority)
            .flags(self.flags())
    }

    /// Checks the priority and queue limits without touching the driver.
    pub fn validate(&self) -> Result<()> {
        validate_priority(self.priority)?;
        self.queue.validate()
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads options from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML file
    ///
    /// # Returns
    ///
    /// * `Ok(ServiceOptions)` - The loaded and validated options
    /// * `Err(DivertError)` - `Io`, `ConfigParse` or `ArgumentInvalid`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let options = Self::from_toml_str(&fs::read_to_string(path)?)?;
        options.validate()?;
        debug!("Loaded service options from {}", path.display());
        Ok(options)
    }

    /// Saves options to a TOML file, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        debug!("Saved service options to {}", path.display());
        Ok(())
    }

    /// `divert/service.toml` under the user's configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("divert").join("service.toml"))
    }
}
