//! Config validation: unknown-key detection with Levenshtein suggestions
//! and range checks.
//!
//! Two-pass parse approach: first deserialize raw TOML into `toml::Value`,
//! walk the key tree, compare against known field names, and emit warnings
//! with "did you mean?" suggestions. Then proceed with normal serde
//! deserialization. Warnings never break existing configs.

use std::collections::HashSet;

use super::ScanConfig;
use crate::energy::MAX_STACK_CHANNELS;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, ": did you mean '{s}'?")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Returns the complete set of valid dotted key paths for `ScanConfig`.
///
/// Maintained by hand to match the struct hierarchy in `scan_config.rs`.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [grid]
        "grid",
        "grid.phase",
        "grid.output_phase",
        "grid.ps_ratio",
        "grid.lag_mode",
        "grid.dedup_threshold_s",
        // [grid.volume]
        "grid.volume",
        "grid.volume.min_depth_km",
        "grid.volume.max_depth_km",
        "grid.volume.polygon",
        // [stack]
        "stack",
        "stack.clip_level",
        "stack.cores",
        // [detection]
        "detection",
        "detection.threshold",
        "detection.threshold_kind",
        "detection.min_separation_s",
        // [template]
        "template",
        "template.length_s",
        "template.pre_pick_s",
        "template.coherence_a",
        "template.coherence_b",
        "template.coherence_stations",
        "template.coherence_clip",
        // [memory]
        "memory",
        "memory.conserve",
        "memory.scratch_dir",
        "memory.instance",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// For example, a table `{ a = { b = 1, c = 2 } }` yields:
/// `["a", "a.b", "a.c"]`
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
///
/// Ties go to the alphabetically first key so suggestions are stable.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|&k| (levenshtein(unknown, k), k))
        .filter(|(dist, _)| *dist <= 3)
        .min()
        .map(|(_, k)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// Never fails: a document that does not parse is left for serde to report.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

// ============================================================================
// Range Validation
// ============================================================================

/// Range checks that need domain knowledge rather than simple positivity.
///
/// Returns (errors, warnings): errors prevent the scan from starting,
/// warnings are suspicious but allowed.
pub fn validate_ranges(config: &ScanConfig) -> (Vec<String>, Vec<ValidationWarning>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Vp/Vs for crustal rock sits well inside 1.4-2.5
    let ratio = config.grid.ps_ratio;
    if ratio.is_finite() && ratio > 0.0 && !(1.4..=2.5).contains(&ratio) {
        warnings.push(ValidationWarning {
            field: "grid.ps_ratio".to_string(),
            message: format!("grid.ps_ratio = {ratio:.2} is outside the typical range (1.4-2.5)"),
            suggestion: None,
        });
    }

    if let Some(volume) = &config.grid.volume {
        if volume.min_depth_km < -10.0 {
            errors.push(format!(
                "grid.volume.min_depth_km = {:.1} is above any topography",
                volume.min_depth_km
            ));
        }
    }

    // Clip levels below one would clip energy under its own mean
    if config.stack.clip_level > 0.0 && config.stack.clip_level < 1.0 {
        warnings.push(ValidationWarning {
            field: "stack.clip_level".to_string(),
            message: format!(
                "stack.clip_level = {} clips energy below its mean",
                config.stack.clip_level
            ),
            suggestion: None,
        });
    }

    if config.template.coherence_stations.len() == 1 {
        errors.push(
            "template.coherence_stations lists one station; coherence needs at least two".to_string(),
        );
    }
    if config.template.coherence_stations.len() > MAX_STACK_CHANNELS {
        warnings.push(ValidationWarning {
            field: "template.coherence_stations".to_string(),
            message: format!(
                "template.coherence_stations lists {} stations, more than can be stacked ({MAX_STACK_CHANNELS})",
                config.template.coherence_stations.len()
            ),
            suggestion: None,
        });
    }

    if let Some([_, end]) = config.template.coherence_clip {
        if end > config.template.length_s {
            warnings.push(ValidationWarning {
                field: "template.coherence_clip".to_string(),
                message: format!(
                    "template.coherence_clip ends at {end} s, after the {} s template",
                    config.template.length_s
                ),
                suggestion: None,
            });
        }
    }

    (errors, warnings)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_identical() {
        assert_eq!(levenshtein("hello", "hello"), 0);
    }

    #[test]
    fn test_levenshtein_one_edit() {
        assert_eq!(levenshtein("threshhold", "threshold"), 1);
    }

    #[test]
    fn test_levenshtein_empty() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn test_walk_toml_keys_nested() {
        let toml: toml::Value = r#"
            [grid.volume]
            min_depth_km = 0.0
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert!(keys.contains(&"grid".to_string()));
        assert!(keys.contains(&"grid.volume".to_string()));
        assert!(keys.contains(&"grid.volume.min_depth_km".to_string()));
    }

    #[test]
    fn test_typo_key_produces_warning_with_suggestion() {
        let warnings = validate_unknown_keys("[stack]\nclip_levle = 50.0\n");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "stack.clip_levle");
        assert_eq!(warnings[0].suggestion.as_deref(), Some("stack.clip_level"));
        assert!(warnings[0].to_string().contains("did you mean 'stack.clip_level'"));
    }

    #[test]
    fn test_unknown_section_produces_warning() {
        let warnings = validate_unknown_keys("[plotting]\nsave = true\n");
        assert!(warnings.iter().any(|w| w.field == "plotting"));
    }

    #[test]
    fn test_ranges_defaults_clean() {
        let (errors, warnings) = validate_ranges(&ScanConfig::default());
        assert!(errors.is_empty(), "{errors:?}");
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn test_single_coherence_station_is_error() {
        let mut config = ScanConfig::default();
        config.template.coherence_stations = vec!["FOZ".into()];
        let (errors, _) = validate_ranges(&config);
        assert!(errors.iter().any(|e| e.contains("coherence_stations")));
    }

    #[test]
    fn test_unusual_ps_ratio_warns() {
        let mut config = ScanConfig::default();
        config.grid.ps_ratio = 3.2;
        let (errors, warnings) = validate_ranges(&config);
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.field == "grid.ps_ratio"));
    }
}
