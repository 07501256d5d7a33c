use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{DatagenError, Result};
use crate::invocation::{CompletionPolicy, ScaleFactor, DEFAULT_SCALE_FACTORS};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_scale_factors")]
    pub scale_factors: Vec<ScaleFactor>,
    #[serde(default)]
    pub completion: CompletionPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scale_factors: default_scale_factors(),
            completion: CompletionPolicy::default(),
        }
    }
}

fn default_scale_factors() -> Vec<ScaleFactor> {
    DEFAULT_SCALE_FACTORS.to_vec()
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| DatagenError::SettingsIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|reason| DatagenError::Settings {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let settings: Settings = serde_yaml::from_str(raw).map_err(|e| e.to_string())?;
        if settings.scale_factors.is_empty() {
            return Err("scale_factors must list at least one value".to_string());
        }
        Ok(settings)
    }

    pub fn with_overrides(
        mut self,
        scale_factors: &[ScaleFactor],
        completion: Option<CompletionPolicy>,
    ) -> Self {
        if !scale_factors.is_empty() {
            self.scale_factors = scale_factors.to_vec();
        }
        if let Some(policy) = completion {
            self.completion = policy;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factors(s: &Settings) -> Vec<u32> {
        s.scale_factors.iter().map(|f| f.get()).collect()
    }

    #[test]
    fn empty_document_uses_defaults() {
        let s = Settings::parse("{}").expect("parse");
        assert_eq!(s, Settings::default());
        assert_eq!(factors(&s), vec![1, 2, 3]);
        assert_eq!(s.completion, CompletionPolicy::Completed);
    }

    #[test]
    fn reads_factors_and_policy() {
        let s = Settings::parse("scale_factors: [10, 100]\ncompletion: submitted\n").expect("parse");
        assert_eq!(factors(&s), vec![10, 100]);
        assert_eq!(s.completion, CompletionPolicy::Submitted);
    }

    #[test]
    fn rejects_bad_documents() {
        assert!(Settings::parse("scale_factors: []\n").is_err());
        assert!(Settings::parse("scale_factors: [1, 0]\n").is_err());
        assert!(Settings::parse("completion: eventually\n").is_err());
        assert!(Settings::parse("retries: 3\n").is_err());
    }

    #[test]
    fn cli_overrides_win() {
        let s = Settings::parse("scale_factors: [5]\ncompletion: submitted\n")
            .expect("parse")
            .with_overrides(&[ScaleFactor::new(9).expect("sf")], Some(CompletionPolicy::Completed));
        assert_eq!(factors(&s), vec![9]);
        assert_eq!(s.completion, CompletionPolicy::Completed);

        let untouched = Settings::default().with_overrides(&[], None);
        assert_eq!(untouched, Settings::default());
    }

    #[test]
    fn load_reports_path_on_missing_file() {
        let path = std::env::temp_dir().join(format!(
            "datagen_missing_settings_{}.yaml",
            std::process::id()
        ));
        let err = Settings::load(&path).expect_err("missing file");
        assert!(err.to_string().contains(&path.display().to_string()));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let path = std::env::temp_dir().join(format!(
            "datagen_settings_{}_{}.yaml",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::write(&path, "scale_factors: [4]\n").expect("write");
        let s = Settings::load(&path).expect("load");
        assert_eq!(factors(&s), vec![4]);
        let _ = fs::remove_file(path);
    }
}
