//! Analysis configuration flags.

use crate::error::CuldesacError;
use serde::{Deserialize, Serialize};

/// The recognized flag set. Booleans default to off except where noted;
/// `version` selects the interpreter variant (1–3; this crate ships the
/// compositional variant for all of them and records the request).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Cap the per-edge state count by merging beyond `merge_threshold`.
    pub merge: bool,
    /// Fall back to the full path when a minimization fails validation.
    pub unminimized_paths: bool,
    /// Skip SMT calls entirely.
    pub dry_run: bool,
    /// Assert predicates one at a time and re-check, for diagnostics.
    pub smt_check_linear: bool,
    pub show_progress: bool,
    /// The input program is expected pre-virtualized (calls inlined).
    pub virtualize_cfg: bool,
    /// The input program is expected pre-sliced on conditionals.
    pub slice_cfg: bool,
    /// The input program is expected with irregular loops reduced.
    pub reduce_loops: bool,
    /// Dominance pruning and duplicate removal on the result set.
    pub post_processing: bool,
    /// Assume every callee restores SP; reset it in summaries.
    pub assume_identical_sp: bool,
    /// Let each CFG's var maker forget unreferenced tops.
    pub clean_tops: bool,
    /// Seed entry states from the initial data-flow state.
    pub use_initial_data: bool,
    pub version: u8,
    pub merge_threshold: usize,
    pub nb_cores: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            merge: false,
            unminimized_paths: false,
            dry_run: false,
            smt_check_linear: false,
            show_progress: false,
            virtualize_cfg: false,
            slice_cfg: false,
            reduce_loops: false,
            post_processing: true,
            assume_identical_sp: true,
            clean_tops: true,
            use_initial_data: true,
            version: 2,
            merge_threshold: 250,
            nb_cores: 1,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), CuldesacError> {
        if !(1..=3).contains(&self.version) {
            return Err(CuldesacError::BadVersion(self.version));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AnalysisConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_version_is_rejected() {
        let cfg = AnalysisConfig {
            version: 4,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(CuldesacError::BadVersion(4))
        ));
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: AnalysisConfig =
            serde_json::from_str(r#"{"merge": true, "merge_threshold": 8}"#).unwrap();
        assert!(cfg.merge);
        assert_eq!(cfg.merge_threshold, 8);
        assert!(cfg.post_processing);
    }
}
