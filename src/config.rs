//! Synth configuration — the settings surface owned by the embedding app.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Engine configuration. Every field has a default, so a partial JSON
/// document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SynthConfig {
    /// Master gain, dB.
    pub gain: i32,
    pub chorus_level: i32,
    pub chorus_depth: i32,
    pub chorus_frequency: i32,
    /// Reverb settings, percent.
    pub reverb_level: i32,
    pub reverb_size: i32,
    pub reverb_width: i32,
    pub reverb_damping: i32,
    /// A4 reference frequency, Hz.
    pub tuning_fork: i32,
    /// Comma-separated per-pitch-class offsets in cents, optionally preceded
    /// by a name. Empty means equal temperament.
    pub temperament: String,
    /// Frames rendered per engine pass.
    pub buffer_size: usize,
    /// Enable the default velocity to filter cutoff modulator.
    pub vel_to_filter: bool,
    /// Number of render engines; `None` picks one per spare core.
    pub engine_count: Option<usize>,
}

impl Default for SynthConfig {
    fn default() -> Self {
        SynthConfig {
            gain: 0,
            chorus_level: 0,
            chorus_depth: 0,
            chorus_frequency: 0,
            reverb_level: 0,
            reverb_size: 0,
            reverb_width: 0,
            reverb_damping: 0,
            tuning_fork: 440,
            temperament: String::new(),
            buffer_size: 512,
            vel_to_filter: true,
            engine_count: None,
        }
    }
}

impl SynthConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SynthConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.tuning_fork <= 0 {
            return Err(ConfigError::InvalidTuningFork(self.tuning_fork));
        }
        Ok(())
    }

    /// Engines to run: the override, or all cores but two (at least one).
    pub fn resolved_engine_count(&self) -> usize {
        self.engine_count
            .unwrap_or_else(|| num_cpus::get().saturating_sub(2))
            .max(1)
    }

    /// Temperament offsets, falling back to equal temperament when the
    /// string does not describe one.
    pub fn temperament_cents(&self) -> [f64; 12] {
        parse_temperament(&self.temperament).unwrap_or([0.0; 12])
    }
}

/// Parse a temperament string: 12 comma-separated cent offsets, or 13
/// fields where the first is a name. Any other field count is equal
/// temperament.
pub fn parse_temperament(text: &str) -> Result<[f64; 12], ConfigError> {
    let fields: Vec<&str> = text.split(',').map(str::trim).collect();
    let values = match fields.len() {
        12 => &fields[..],
        13 => &fields[1..],
        _ => return Ok([0.0; 12]),
    };
    let offset = fields.len() - 12;

    let mut cents = [0.0; 12];
    for (i, field) in values.iter().enumerate() {
        cents[i] = field.parse().map_err(|_| ConfigError::InvalidTemperament {
            text: field.to_string(),
            index: i + offset,
        })?;
    }
    Ok(cents)
}

/// Output format negotiated with the audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat {
            sample_rate: 44100,
            channels: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config = SynthConfig::from_json(r#"{ "gain": -6, "reverb_level": 40 }"#).unwrap();
        assert_eq!(config.gain, -6);
        assert_eq!(config.reverb_level, 40);
        assert_eq!(config.tuning_fork, 440);
        assert_eq!(config.buffer_size, 512);
        assert!(config.vel_to_filter);
        assert_eq!(config.engine_count, None);
    }

    #[test]
    fn zero_buffer_size_is_rejected() {
        let err = SynthConfig::from_json(r#"{ "buffer_size": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroBufferSize));
    }

    #[test]
    fn non_positive_tuning_fork_is_rejected() {
        for hz in [0, -440] {
            let err = SynthConfig::from_json(&format!(r#"{{ "tuning_fork": {hz} }}"#)).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidTuningFork(v) if v == hz));
        }
        assert!(SynthConfig::from_json(r#"{ "tuning_fork": 432 }"#).is_ok());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = SynthConfig::from_json("{ gain: ").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn json_round_trip_keeps_values() {
        let config = SynthConfig {
            temperament: "Pythagorean,0,-9.8,3.9,-5.9,7.8,-2,-11.7,2,-7.8,5.9,-3.9,9.8".into(),
            engine_count: Some(3),
            ..SynthConfig::default()
        };
        let parsed = SynthConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn engine_count_is_at_least_one() {
        let config = SynthConfig {
            engine_count: Some(0),
            ..SynthConfig::default()
        };
        assert_eq!(config.resolved_engine_count(), 1);
        assert!(SynthConfig::default().resolved_engine_count() >= 1);
    }

    #[test]
    fn temperament_with_twelve_values() {
        let cents = parse_temperament("0, 10, 0, 0, 0, 0, 0, 0, 0, 0, 0, -5.5").unwrap();
        assert_eq!(cents[1], 10.0);
        assert_eq!(cents[11], -5.5);
    }

    #[test]
    fn temperament_with_name_prefix() {
        let cents = parse_temperament("Werckmeister,0,-9.8,-7.8,-5.9,-9.8,-2,-11.7,-3.9,-7.8,-11.7,-3.9,-7.8").unwrap();
        assert_eq!(cents[0], 0.0);
        assert_eq!(cents[1], -9.8);
        assert_eq!(cents[6], -11.7);
    }

    #[test]
    fn other_shapes_mean_equal_temperament() {
        assert_eq!(parse_temperament("").unwrap(), [0.0; 12]);
        assert_eq!(parse_temperament("1,2,3").unwrap(), [0.0; 12]);
    }

    #[test]
    fn bad_value_reports_its_field() {
        let err = parse_temperament("Name,0,0,x,0,0,0,0,0,0,0,0,0").unwrap_err();
        match err {
            ConfigError::InvalidTemperament { text, index } => {
                assert_eq!(text, "x");
                assert_eq!(index, 3);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
