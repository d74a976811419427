//! Configuration management for crabmeet
//!
//! Session mode, signaling/negotiation timeouts, default capture settings,
//! peer connection (ICE) settings and forwarding-mode simulcast layers.
//! Loaded from TOML, optionally layered with `CRABMEET_*` environment
//! overrides.

use crate::errors::{Result, SessionError};
use crate::quality::{QualityLevel, SimulcastConfig};
use crate::rtc::RtcConfiguration;
use crate::types::{FacingMode, SessionMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrabMeetConfig {
    pub session: SessionConfig,
    pub capture: CaptureConfig,
    pub rtc: RtcConfiguration,
    pub forwarding: ForwardingConfig,
}

/// Session behavior and timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Mesh (peer-to-peer) or forwarding (SFU)
    pub mode: SessionMode,
    /// Bound on every signaling request/acknowledgement round-trip
    pub signaling_timeout_ms: u64,
    /// How long a mesh link may stay in negotiation before it fails
    pub negotiation_timeout_ms: u64,
    /// Bound on the DTLS connect handshake of a forwarding transport
    pub transport_connect_timeout_ms: u64,
    /// Buffered session events per subscriber
    pub event_capacity: usize,
    /// Period of the negotiation watchdog in `run_until`
    pub tick_interval_ms: u64,
}

/// Local capture defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub default_quality: QualityLevel,
    pub facing_mode: FacingMode,
    /// Capture the microphone alongside the camera
    pub audio: bool,
}

/// Forwarding-mode settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingConfig {
    pub simulcast: SimulcastConfig,
}

impl Default for CrabMeetConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig {
                mode: SessionMode::Mesh,
                signaling_timeout_ms: 10_000,
                negotiation_timeout_ms: 15_000,
                transport_connect_timeout_ms: 10_000,
                event_capacity: 256,
                tick_interval_ms: 1_000,
            },
            capture: CaptureConfig {
                default_quality: QualityLevel::Medium,
                facing_mode: FacingMode::User,
                audio: true,
            },
            rtc: RtcConfiguration::default(),
            forwarding: ForwardingConfig {
                simulcast: SimulcastConfig::default(),
            },
        }
    }
}

impl SessionConfig {
    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn transport_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_connect_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl CrabMeetConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("Failed to read config file: {}", e)))?;

        let config: CrabMeetConfig = toml::from_str(&contents)
            .map_err(|e| SessionError::Config(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SessionError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| SessionError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| SessionError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("crabmeet.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Defaults, then the TOML file if it exists, then environment variables
    /// such as `CRABMEET_SESSION__MODE=forwarding`.
    pub fn load_layered<P: AsRef<Path>>(path: P) -> Result<Self> {
        let to_error = |e: config::ConfigError| SessionError::Config(e.to_string());

        let defaults = config::Config::try_from(&Self::default()).map_err(to_error)?;
        let layered = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::File::from(path.as_ref())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("CRABMEET")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_error)?;

        let config: CrabMeetConfig = layered.try_deserialize().map_err(to_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SessionError::Config(msg.to_string()));

        if self.session.signaling_timeout_ms == 0 {
            return invalid("Signaling timeout must be greater than zero");
        }
        if self.session.negotiation_timeout_ms == 0 {
            return invalid("Negotiation timeout must be greater than zero");
        }
        if self.session.transport_connect_timeout_ms == 0 {
            return invalid("Transport connect timeout must be greater than zero");
        }
        if self.session.event_capacity == 0 {
            return invalid("Event capacity must be at least 1");
        }
        if self.session.tick_interval_ms == 0 {
            return invalid("Tick interval must be greater than zero");
        }

        if self.rtc.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return invalid("Every ICE server needs at least one URL");
        }

        let simulcast = &self.forwarding.simulcast;
        if simulcast.enabled {
            if simulcast.layers.is_empty() {
                return invalid("Simulcast is enabled but has no layers");
            }
            if simulcast
                .layers
                .iter()
                .any(|l| l.scale_resolution_down_by < 1.0 || l.max_bitrate == 0)
            {
                return invalid("Simulcast layers need a scale of at least 1.0 and a bitrate");
            }
        }

        Ok(())
    }
}
