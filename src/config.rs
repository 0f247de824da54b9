use crate::defaults;
use crate::error::{Result, SayshError};
use crate::player::SessionSettings;
use crate::protocol::{AudioFormat, SynthesisParameters};
use crate::transport::SessionTimeouts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub synthesis: SynthesisConfig,
    pub playback: PlaybackConfig,
    pub output: OutputConfig,
    pub timeouts: TimeoutConfig,
    pub queue: QueueConfig,
}

/// Remote synthesis service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub url: String,
    /// Falls back to `DASHSCOPE_API_KEY`.
    pub api_key: Option<String>,
    pub workspace: Option<String>,
    pub model: String,
    /// Extra connection headers.
    pub headers: BTreeMap<String, String>,
}

/// Voice and audio parameters sent with each task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthesisConfig {
    pub voice: String,
    pub format: AudioFormat,
    /// Synthesis loudness, 0-100.
    pub volume: u8,
    pub speech_rate: f32,
    pub pitch_rate: f32,
    pub seed: u32,
    pub instruction: Option<String>,
    pub language_hints: Option<Vec<String>>,
}

/// Local playback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub enabled: bool,
    /// Player reading raw 16 kHz mono s16le from stdin.
    pub command: String,
    /// Initial system volume, 0-100.
    pub volume: u8,
    pub volume_command: String,
}

/// Audio export
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub save_audio: bool,
    pub audio_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub start_ms: u64,
    pub complete_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub sync_capacity: usize,
    pub async_capacity: usize,
    pub async_ttl_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: defaults::SERVICE_URL.to_string(),
            api_key: None,
            workspace: None,
            model: defaults::DEFAULT_MODEL.to_string(),
            headers: BTreeMap::new(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            voice: defaults::DEFAULT_VOICE.to_string(),
            format: AudioFormat::Pcm16000HzMono16Bit,
            volume: defaults::VOLUME_PERCENT,
            speech_rate: 1.0,
            pitch_rate: 1.0,
            seed: 0,
            instruction: None,
            language_hints: None,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: format!("sox {}", crate::audio::sink::sox_args().join(" ")),
            volume: defaults::VOLUME_PERCENT,
            volume_command: crate::audio::volume::VOLUME_COMMAND.to_string(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_audio: false,
            audio_dir: PathBuf::from("output"),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: defaults::CONNECT_TIMEOUT.as_millis() as u64,
            start_ms: defaults::START_TIMEOUT.as_millis() as u64,
            complete_ms: defaults::COMPLETE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sync_capacity: defaults::SYNC_QUEUE_CAPACITY,
            async_capacity: defaults::ASYNC_QUEUE_CAPACITY,
            async_ttl_ms: defaults::ASYNC_QUEUE_TTL.as_millis() as u64,
        }
    }
}

fn invalid(key: &str, message: &str) -> SayshError {
    SayshError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration, returning defaults only if the file is missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(SayshError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(e) => Err(SayshError::ConfigParse {
                message: format!("Failed to load config from {}: {}", path.display(), e),
            }),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DASHSCOPE_API_KEY → service.api_key
    /// - SAYSH_MODEL → service.model
    /// - SAYSH_VOICE → synthesis.voice
    /// - SAYSH_URL → service.url
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var(defaults::API_KEY_ENV)
            && !key.is_empty()
        {
            self.service.api_key = Some(key);
        }

        if let Ok(model) = std::env::var("SAYSH_MODEL")
            && !model.is_empty()
        {
            self.service.model = model;
        }

        if let Ok(voice) = std::env::var("SAYSH_VOICE")
            && !voice.is_empty()
        {
            self.synthesis.voice = voice;
        }

        if let Ok(url) = std::env::var("SAYSH_URL")
            && !url.is_empty()
        {
            self.service.url = url;
        }

        self
    }

    /// Reject values no session or queue could work with.
    pub fn validate(&self) -> Result<()> {
        if self.service.url.trim().is_empty() {
            return Err(invalid("service.url", "must not be empty"));
        }
        if self.synthesis.volume > 100 {
            return Err(invalid("synthesis.volume", "must be between 0 and 100"));
        }
        if !(0.5..=2.0).contains(&self.synthesis.speech_rate) {
            return Err(invalid("synthesis.speech_rate", "must be between 0.5 and 2.0"));
        }
        if !(0.5..=2.0).contains(&self.synthesis.pitch_rate) {
            return Err(invalid("synthesis.pitch_rate", "must be between 0.5 and 2.0"));
        }
        if self.synthesis.format.sample_rate() == 0 {
            return Err(invalid("synthesis.format", "has no sample rate"));
        }
        if self.playback.volume > 100 {
            return Err(invalid("playback.volume", "must be between 0 and 100"));
        }
        if self.playback.enabled && self.playback.command.trim().is_empty() {
            return Err(invalid("playback.command", "must not be empty"));
        }
        if self.queue.sync_capacity == 0 {
            return Err(invalid("queue.sync_capacity", "must be at least 1"));
        }
        if self.queue.async_capacity == 0 {
            return Err(invalid("queue.async_capacity", "must be at least 1"));
        }
        if self.queue.async_ttl_ms == 0 {
            return Err(invalid("queue.async_ttl_ms", "must be positive"));
        }
        if self.timeouts.connect_ms == 0 || self.timeouts.start_ms == 0 || self.timeouts.complete_ms == 0
        {
            return Err(invalid("timeouts", "must be positive"));
        }
        Ok(())
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(self.timeouts.connect_ms),
            start: Duration::from_millis(self.timeouts.start_ms),
            complete: Duration::from_millis(self.timeouts.complete_ms),
        }
    }

    pub fn async_ttl(&self) -> Duration {
        Duration::from_millis(self.queue.async_ttl_ms)
    }

    /// Where session audio is saved, if saving is enabled.
    pub fn save_dir(&self) -> Option<PathBuf> {
        self.output
            .save_audio
            .then(|| self.output.audio_dir.clone())
    }

    /// Build session settings; fails without an API key.
    pub fn session_settings(&self) -> Result<SessionSettings> {
        let api_key = self
            .service
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| SayshError::CredentialMissing {
                name: defaults::API_KEY_ENV.to_string(),
            })?;

        let synthesis = &self.synthesis;
        let mut parameters = SynthesisParameters::new(synthesis.voice.clone());
        parameters.volume = synthesis.volume;
        parameters.speech_rate = synthesis.speech_rate;
        parameters.pitch_rate = synthesis.pitch_rate;
        parameters.seed = synthesis.seed;
        parameters.instruction = synthesis.instruction.clone();
        parameters.language_hints = synthesis.language_hints.clone();

        let mut settings = SessionSettings::new(api_key);
        settings.url = self.service.url.clone();
        settings.workspace = self.service.workspace.clone();
        settings.headers = self
            .service
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        settings.model = Some(self.service.model.clone());
        settings.format = Some(synthesis.format);
        settings.parameters = parameters;
        settings.timeouts = self.session_timeouts();
        Ok(settings)
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/saysh/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("saysh").join("config.toml"))
    }
}
