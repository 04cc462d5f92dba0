//! Run configuration for the conclave pipeline.
//!
//! A nested YAML document of numeric thresholds, retry ceilings, persona
//! breakpoints and feature toggles. Read once at startup, validated, then
//! passed by value into the `PhaseController` — there is no ambient global.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Immutable configuration for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub thresholds: Thresholds,
    pub personas: PersonaBands,
    pub retries: RetryCeilings,
    pub credibility: CredibilityBaselines,
    pub optimization: Toggles,
    pub search: SearchSettings,
}

/// Numeric acceptance thresholds used by the controller's retry loops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    /// Maximum allowed pairwise persona similarity.
    pub persona_similarity_max: f64,
    /// Credibility at or above which a fact counts as empirically settled.
    pub credibility_bedrock: f64,
    /// Minimum fraction of high-value facts a case file must preserve.
    pub fact_preservation_min: f64,
    /// Minimum fraction of divergences a case file must cover.
    pub divergence_coverage_min: f64,
    /// Null-hypothesis coverage requirement; must be exactly 1.0.
    pub null_coverage_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            persona_similarity_max: 0.70,
            credibility_bedrock: 0.80,
            fact_preservation_min: 0.70,
            divergence_coverage_min: 0.90,
            null_coverage_min: 1.00,
        }
    }
}

/// Complexity-score breakpoints and the persona counts they map to.
///
/// The band ordering is fixed: `score <= simple_max` gets `simple_count`,
/// `score <= moderate_max` gets `moderate_count`, anything above gets
/// `complex_count`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersonaBands {
    pub simple_max_complexity: f64,
    pub simple_count: usize,
    pub moderate_max_complexity: f64,
    pub moderate_count: usize,
    pub complex_count: usize,
}

impl Default for PersonaBands {
    fn default() -> Self {
        Self {
            simple_max_complexity: 2.5,
            simple_count: 3,
            moderate_max_complexity: 4.0,
            moderate_count: 5,
            complex_count: 7,
        }
    }
}

/// Bounded-loop attempt ceilings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryCeilings {
    pub max_allocation_attempts: u32,
    pub max_coverage_attempts: u32,
    /// Schema-validation retries per task execution.
    pub max_schema_retries: u32,
}

impl Default for RetryCeilings {
    fn default() -> Self {
        Self {
            max_allocation_attempts: 3,
            max_coverage_attempts: 3,
            max_schema_retries: 2,
        }
    }
}

/// Per-tier baseline credibility scores for registered evidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredibilityBaselines {
    pub primary: f64,
    pub secondary: f64,
    pub tertiary: f64,
}

impl Default for CredibilityBaselines {
    fn default() -> Self {
        Self {
            primary: 0.95,
            secondary: 0.75,
            tertiary: 0.55,
        }
    }
}

/// Feature toggles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Toggles {
    /// Run the persona fan-out group concurrently.
    pub parallel_personas: bool,
    /// Reserved: stop early once convergence is reached.
    pub early_termination: bool,
}

impl Default for Toggles {
    fn default() -> Self {
        Self {
            parallel_personas: true,
            early_termination: false,
        }
    }
}

/// Search tool pacing and result sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchSettings {
    /// Minimum spacing between outbound search calls.
    pub min_interval_ms: u64,
    pub max_results: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: 1100,
            max_results: 10,
        }
    }
}

/// On-disk layout: everything nests under a `workflow` key.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigDocument {
    workflow: Config,
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults when the
    /// file does not exist. A file that exists but fails to parse or validate
    /// is an error — a half-read configuration is worse than none.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse configuration from a YAML string. Missing keys take defaults.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let doc: ConfigDocument =
            serde_yaml::from_str(raw).context("Invalid YAML configuration")?;
        let config = doc.workflow;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot honor.
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        for (name, value) in [
            ("persona_similarity_max", t.persona_similarity_max),
            ("credibility_bedrock", t.credibility_bedrock),
            ("fact_preservation_min", t.fact_preservation_min),
            ("divergence_coverage_min", t.divergence_coverage_min),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("threshold {name} must be between 0.0 and 1.0, got {value}");
            }
        }
        if t.null_coverage_min != 1.0 {
            bail!(
                "null_coverage_min must be exactly 1.0, got {}",
                t.null_coverage_min
            );
        }

        let p = &self.personas;
        if p.simple_max_complexity >= p.moderate_max_complexity {
            bail!(
                "persona breakpoints must ascend: simple_max {} >= moderate_max {}",
                p.simple_max_complexity,
                p.moderate_max_complexity
            );
        }
        if p.simple_count < 3 || p.moderate_count < p.simple_count || p.complex_count < p.moderate_count {
            bail!(
                "persona counts must be at least 3 and non-decreasing, got {}/{}/{}",
                p.simple_count,
                p.moderate_count,
                p.complex_count
            );
        }

        let r = &self.retries;
        if r.max_allocation_attempts == 0 || r.max_coverage_attempts == 0 {
            bail!("retry ceilings must be greater than zero");
        }

        for (name, value) in [
            ("primary", self.credibility.primary),
            ("secondary", self.credibility.secondary),
            ("tertiary", self.credibility.tertiary),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("credibility baseline {name} must be between 0.0 and 1.0, got {value}");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.retries.max_allocation_attempts, 3);
        assert_eq!(config.personas.complex_count, 7);
        assert_eq!(config.credibility.primary, 0.95);
        assert_eq!(config.search.min_interval_ms, 1100);
        assert!(config.optimization.parallel_personas);
        assert!(!config.optimization.early_termination);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_yaml_merges_partial_document() {
        let yaml = r#"
workflow:
  thresholds:
    fact_preservation_min: 0.80
  retries:
    max_allocation_attempts: 5
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.thresholds.fact_preservation_min, 0.80);
        assert_eq!(config.retries.max_allocation_attempts, 5);
        // Untouched keys keep their defaults.
        assert_eq!(config.thresholds.divergence_coverage_min, 0.90);
        assert_eq!(config.retries.max_coverage_attempts, 3);
    }

    #[test]
    fn test_load_round_trips_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "workflow:\n  personas:\n    simple_max_complexity: 2.0\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.personas.simple_max_complexity, 2.0);
    }

    #[test]
    fn test_null_coverage_must_be_exactly_one() {
        let yaml = "workflow:\n  thresholds:\n    null_coverage_min: 0.9\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("null_coverage_min"));
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let yaml = "workflow:\n  thresholds:\n    persona_similarity_max: 1.5\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_non_ascending_breakpoints_rejected() {
        let yaml = concat!(
            "workflow:\n",
            "  personas:\n",
            "    simple_max_complexity: 4.0\n",
            "    moderate_max_complexity: 2.5\n",
        );
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("ascend"));
    }

    #[test]
    fn test_zero_retry_ceiling_rejected() {
        let yaml = "workflow:\n  retries:\n    max_coverage_attempts: 0\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml_is_error_not_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "workflow: [not, a, mapping\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
