use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Backend invocation preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    High,
    #[default]
    Default,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfileParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Profile {
    pub const CHOICES: &'static str = "high, default, low";

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Default => "default",
            Self::Low => "low",
        }
    }

    pub fn params(self) -> ProfileParams {
        match self {
            Self::High => ProfileParams {
                temperature: 0.1,
                max_tokens: 4000,
                top_p: 0.95,
            },
            Self::Default => ProfileParams {
                temperature: 0.2,
                max_tokens: 2000,
                top_p: 0.92,
            },
            Self::Low => ProfileParams {
                temperature: 0.3,
                max_tokens: 1000,
                top_p: 0.9,
            },
        }
    }

    /// One-line instruction placed at the top of every backend prompt.
    pub fn instruction(self) -> &'static str {
        match self {
            Self::High => "Think thoroughly and give a complete, detailed answer.",
            Self::Default => "Give a clear answer with the detail the question needs.",
            Self::Low => "Answer briefly; prefer a short direct reply.",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strict: exactly the three canonical names, case-insensitive.  Aliases such
/// as `medium` or `balanced` are rejected.
impl FromStr for Profile {
    type Err = InvalidValue;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "default" => Ok(Self::Default),
            "low" => Ok(Self::Low),
            _ => Err(InvalidValue::new("profile", raw, Self::CHOICES)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    FinalOnly,
    FinalWithDetails,
}

impl OutputFormat {
    pub const CHOICES: &'static str = "final_only, final_with_details";

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FinalOnly => "final_only",
            Self::FinalWithDetails => "final_with_details",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = InvalidValue;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "final_only" => Ok(Self::FinalOnly),
            "final_with_details" => Ok(Self::FinalWithDetails),
            _ => Err(InvalidValue::new("output_format", raw, Self::CHOICES)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field} '{value}'; valid choices: {choices}")]
pub struct InvalidValue {
    pub field: &'static str,
    pub value: String,
    pub choices: &'static str,
}

impl InvalidValue {
    fn new(field: &'static str, value: &str, choices: &'static str) -> Self {
        Self {
            field,
            value: value.to_string(),
            choices,
        }
    }
}

/// Per-conversation settings owned by a worker.
///
/// Live mutations go through the validated setters, which reject bad input.
/// [`RuntimeConfig::merge_lenient`] is the loading path: anything invalid
/// keeps the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, deserialize_with = "lenient_profile")]
    pub profile: Profile,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub show_reasoning: bool,
    #[serde(default, deserialize_with = "lenient_output_format")]
    pub output_format: OutputFormat,
}

impl RuntimeConfig {
    /// Returns the previous profile.
    pub fn set_profile(&mut self, raw: &str) -> Result<Profile, InvalidValue> {
        let next: Profile = raw.parse()?;
        Ok(std::mem::replace(&mut self.profile, next))
    }

    /// Returns the previous format.
    pub fn set_output_format(&mut self, raw: &str) -> Result<OutputFormat, InvalidValue> {
        let next: OutputFormat = raw.parse()?;
        Ok(std::mem::replace(&mut self.output_format, next))
    }

    /// Returns the previous flag.
    pub fn set_show_reasoning(&mut self, show: bool) -> bool {
        std::mem::replace(&mut self.show_reasoning, show)
    }

    pub fn merge_lenient(
        &mut self,
        profile: Option<&str>,
        show_reasoning: Option<bool>,
        output_format: Option<&str>,
    ) {
        if let Some(p) = profile.and_then(|raw| raw.parse().ok()) {
            self.profile = p;
        }
        if let Some(show) = show_reasoning {
            self.show_reasoning = show;
        }
        if let Some(f) = output_format.and_then(|raw| raw.parse().ok()) {
            self.output_format = f;
        }
    }
}

/// Deserialize a profile from any JSON value, falling back to the default for
/// unknown or mistyped input.
pub fn lenient_profile<'de, D>(deserializer: D) -> Result<Profile, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default())
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value.as_bool().unwrap_or_default())
}

fn lenient_output_format<'de, D>(deserializer: D) -> Result<OutputFormat, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_parse_is_strict_and_case_insensitive() {
        assert_eq!("HIGH".parse::<Profile>().unwrap(), Profile::High);
        assert_eq!(" low ".parse::<Profile>().unwrap(), Profile::Low);
        for alias in ["medium", "mid", "normal", "balanced", ""] {
            assert!(alias.parse::<Profile>().is_err(), "{alias} should be rejected");
        }
    }

    #[test]
    fn invalid_value_names_the_choices() {
        let err = "turbo".parse::<Profile>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("turbo"));
        assert!(msg.contains("high, default, low"));
    }

    #[test]
    fn profile_params_are_ordered_by_depth() {
        assert!(Profile::High.params().max_tokens > Profile::Default.params().max_tokens);
        assert!(Profile::Default.params().max_tokens > Profile::Low.params().max_tokens);
        assert!(Profile::High.params().temperature < Profile::Low.params().temperature);
    }

    #[test]
    fn setter_rejects_and_keeps_prior_value() {
        let mut cfg = RuntimeConfig::default();
        assert_eq!(cfg.set_profile("high").unwrap(), Profile::Default);
        assert_eq!(cfg.set_profile("low").unwrap(), Profile::High);
        assert!(cfg.set_profile("ultra").is_err());
        assert_eq!(cfg.profile, Profile::Low);

        assert!(cfg.set_output_format("verbose").is_err());
        assert_eq!(cfg.output_format, OutputFormat::FinalOnly);
    }

    #[test]
    fn merge_lenient_keeps_current_on_garbage() {
        let mut cfg = RuntimeConfig {
            profile: Profile::High,
            show_reasoning: false,
            output_format: OutputFormat::FinalWithDetails,
        };
        cfg.merge_lenient(Some("bogus"), Some(true), Some("nope"));
        assert_eq!(cfg.profile, Profile::High);
        assert!(cfg.show_reasoning);
        assert_eq!(cfg.output_format, OutputFormat::FinalWithDetails);

        cfg.merge_lenient(Some("low"), None, Some("final_only"));
        assert_eq!(cfg.profile, Profile::Low);
        assert_eq!(cfg.output_format, OutputFormat::FinalOnly);
    }

    #[test]
    fn stored_garbage_deserializes_to_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str(
            r#"{"profile":"warp9","show_reasoning":"yes","output_format":42}"#,
        )
        .unwrap();
        assert_eq!(cfg.profile, Profile::Default);
        assert!(!cfg.show_reasoning);
        assert_eq!(cfg.output_format, OutputFormat::FinalOnly);
    }

    #[test]
    fn wire_names() {
        let json = serde_json::to_value(RuntimeConfig::default()).unwrap();
        assert_eq!(json["profile"], "default");
        assert_eq!(json["output_format"], "final_only");
        assert_eq!(json["show_reasoning"], false);
    }
}
