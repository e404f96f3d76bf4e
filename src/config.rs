use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScancamConfig {
    pub arbitration: ArbitrationConfig,
    pub cooldown: CooldownConfig,
    pub enrichment: EnrichmentConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ArbitrationConfig {
    /// Debounce window in milliseconds. Each observation re-arms the flush
    /// timer this far into the future; 1000-1500ms is the recommended band.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Barcode formats that always out-rank others within a window.
    #[serde(default = "default_high_priority_formats")]
    pub high_priority_formats: Vec<String>,
}

impl ArbitrationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CooldownConfig {
    /// Minimum elapsed time in milliseconds before the same value may be
    /// accepted again.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// When true, any new acceptance is suppressed while an enrichment call
    /// is still in flight. Default is concurrent enrichment correlated by
    /// scan id.
    #[serde(default = "default_single_flight")]
    pub single_flight: bool,
}

impl CooldownConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EnrichmentConfig {
    /// Text-extraction service endpoint.
    #[serde(default = "default_enrichment_endpoint")]
    pub endpoint: String,

    /// Fixed instruction prompt sent with every extraction request.
    #[serde(default = "default_enrichment_prompt")]
    pub prompt: String,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_enrichment_timeout_ms")]
    pub timeout_ms: u64,
}

impl EnrichmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Capacity of the raw-detection channel feeding the aggregator
    #[serde(default = "default_detection_channel_capacity")]
    pub detection_channel_capacity: usize,

    /// Capacity of the emitted-result broadcast channel
    #[serde(default = "default_result_channel_capacity")]
    pub result_channel_capacity: usize,
}

impl ScancamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("scancam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("arbitration.window_ms", default_window_ms())?
            .set_default(
                "arbitration.high_priority_formats",
                default_high_priority_formats(),
            )?
            .set_default("cooldown.cooldown_ms", default_cooldown_ms())?
            .set_default("cooldown.single_flight", default_single_flight())?
            .set_default("enrichment.endpoint", default_enrichment_endpoint())?
            .set_default("enrichment.prompt", default_enrichment_prompt())?
            .set_default("enrichment.timeout_ms", default_enrichment_timeout_ms())?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default(
                "system.detection_channel_capacity",
                default_detection_channel_capacity() as i64,
            )?
            .set_default(
                "system.result_channel_capacity",
                default_result_channel_capacity() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with SCANCAM_ prefix. Nested keys
            // use a double underscore so snake_case field names stay
            // addressable, e.g. SCANCAM_ARBITRATION__WINDOW_MS.
            .add_source(
                Environment::with_prefix("SCANCAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ScancamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arbitration.window_ms == 0 {
            return Err(ConfigError::Message(
                "Arbitration window_ms must be greater than 0".to_string(),
            ));
        }

        if self.cooldown.cooldown_ms == 0 {
            return Err(ConfigError::Message(
                "Cooldown cooldown_ms must be greater than 0".to_string(),
            ));
        }

        if self.enrichment.timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Enrichment timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.enrichment.endpoint.is_empty() {
            return Err(ConfigError::Message(
                "Enrichment endpoint must not be empty".to_string(),
            ));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        if self.system.detection_channel_capacity == 0 {
            return Err(ConfigError::Message(
                "Detection channel capacity must be greater than 0".to_string(),
            ));
        }

        if self.system.result_channel_capacity == 0 {
            return Err(ConfigError::Message(
                "Result channel capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ScancamConfig {
    fn default() -> Self {
        Self {
            arbitration: ArbitrationConfig {
                window_ms: default_window_ms(),
                high_priority_formats: default_high_priority_formats(),
            },
            cooldown: CooldownConfig {
                cooldown_ms: default_cooldown_ms(),
                single_flight: default_single_flight(),
            },
            enrichment: EnrichmentConfig {
                endpoint: default_enrichment_endpoint(),
                prompt: default_enrichment_prompt(),
                timeout_ms: default_enrichment_timeout_ms(),
            },
            system: SystemConfig {
                event_bus_capacity: default_event_bus_capacity(),
                detection_channel_capacity: default_detection_channel_capacity(),
                result_channel_capacity: default_result_channel_capacity(),
            },
        }
    }
}

// Default value functions
fn default_window_ms() -> u64 {
    1200
}
fn default_high_priority_formats() -> Vec<String> {
    vec!["code_128".to_string()]
}

fn default_cooldown_ms() -> u64 {
    3000
}
fn default_single_flight() -> bool {
    false
}

fn default_enrichment_endpoint() -> String {
    "http://localhost:8080/v1/extract-text".to_string()
}
fn default_enrichment_prompt() -> String {
    "Extract all legible text from this image. Respond with the text only.".to_string()
}
fn default_enrichment_timeout_ms() -> u64 {
    8000
}

fn default_event_bus_capacity() -> usize {
    100
}
fn default_detection_channel_capacity() -> usize {
    64
}
fn default_result_channel_capacity() -> usize {
    32
}
