//! Player configuration: destination hint and playback policies.
//!
//! Values come from a JSON file, the environment, or both (environment
//! wins). Every field has a default, so an empty file is a valid config.

use crate::error::MidiError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Fallback client name when nothing better is known.
pub const DEFAULT_APP_NAME: &str = "midiplay";

const ENV_OUTPUT_PORTS: &str = "MIDIPLAY_OUTPUT_PORTS";
const ENV_ALSA_OUTPUT_PORTS: &str = "ALSA_OUTPUT_PORTS";
const ENV_NO_CONNECT: &str = "MIDIPLAY_NO_CONNECT_PORTS";
const ENV_ALLOW_PAUSE: &str = "MIDIPLAY_ALLOW_PAUSE";
const ENV_APP_NAME: &str = "MIDIPLAY_APP_NAME";

/// Settings consumed when a song is loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Explicit destination port (`client:port`, `client` or a client name).
    pub output_ports: Option<String>,

    /// Do not connect to any port; events only reach existing subscribers.
    pub no_connect_ports: bool,

    /// Allow pause/resume. Off by default: many synthesizers leave notes
    /// hanging across a transport stop, so playback keeps running instead.
    pub allow_pause: bool,

    /// Client and port name shown to other sequencer clients.
    pub app_name: Option<String>,
}

impl PlayerConfig {
    /// Builds a config from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.merge_env_with(|key| std::env::var(key).ok());
        config
    }

    /// Loads a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns `MidiError::Config` if the file cannot be read or parsed.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, MidiError> {
        let path = path.as_ref();
        let config_error = |message: String| MidiError::Config {
            path: path.to_path_buf(),
            message,
        };
        let text = fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| config_error(e.to_string()))
    }

    /// Overrides fields with any environment variables that are set.
    pub fn merge_env(&mut self) {
        self.merge_env_with(|key| std::env::var(key).ok());
    }

    fn merge_env_with(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(ports) = var(ENV_OUTPUT_PORTS).or_else(|| var(ENV_ALSA_OUTPUT_PORTS)) {
            self.output_ports = Some(ports);
        }
        if let Some(value) = var(ENV_NO_CONNECT) {
            self.no_connect_ports = parse_bool_hint(&value);
        }
        if let Some(value) = var(ENV_ALLOW_PAUSE) {
            self.allow_pause = parse_bool_hint(&value);
        }
        if let Some(name) = var(ENV_APP_NAME).filter(|n| !n.is_empty()) {
            self.app_name = Some(name);
        }
    }

    /// Resolves the identity used to name the sequencer client and port.
    ///
    /// Uses the configured name, else the running executable's file name,
    /// else `DEFAULT_APP_NAME`.
    pub fn app_name(&self) -> String {
        if let Some(name) = self.app_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_APP_NAME.to_string())
    }
}

/// Interprets a boolean hint: "0", "false", "no", "off" and empty are false.
pub fn parse_bool_hint(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_bool_hint() {
        assert!(parse_bool_hint("1"));
        assert!(parse_bool_hint("yes"));
        assert!(parse_bool_hint("TRUE"));
        assert!(!parse_bool_hint("0"));
        assert!(!parse_bool_hint("False"));
        assert!(!parse_bool_hint(" off "));
        assert!(!parse_bool_hint(""));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_ALSA_OUTPUT_PORTS, "24:0"),
            (ENV_ALLOW_PAUSE, "1"),
            (ENV_APP_NAME, "Jukebox"),
        ]
        .into_iter()
        .collect();

        let mut config = PlayerConfig {
            no_connect_ports: true,
            ..Default::default()
        };
        config.merge_env_with(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.output_ports.as_deref(), Some("24:0"));
        assert!(config.allow_pause);
        // Unset variables leave file values alone
        assert!(config.no_connect_ports);
        assert_eq!(config.app_name(), "Jukebox");
    }

    #[test]
    fn test_own_variable_beats_alsa_variable() {
        let env: HashMap<&str, &str> = [(ENV_OUTPUT_PORTS, "Synth"), (ENV_ALSA_OUTPUT_PORTS, "20")]
            .into_iter()
            .collect();
        let mut config = PlayerConfig::default();
        config.merge_env_with(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.output_ports.as_deref(), Some("Synth"));
    }

    #[test]
    fn test_json_defaults() {
        let config: PlayerConfig = serde_json::from_str(r#"{ "allow_pause": true }"#).unwrap();
        assert!(config.allow_pause);
        assert!(!config.no_connect_ports);
        assert_eq!(config.output_ports, None);
    }

    #[test]
    fn test_missing_file() {
        let err = PlayerConfig::from_json_file("/nonexistent/midiplay.json").unwrap_err();
        assert!(matches!(err, MidiError::Config { .. }));
    }

    #[test]
    fn test_app_name_fallback() {
        let config = PlayerConfig::default();
        assert!(!config.app_name().is_empty());
    }
}
