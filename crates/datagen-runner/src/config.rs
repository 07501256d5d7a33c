use serde::Serialize;

use crate::error::ConfigError;

pub const CONTAINER_PREFIX_VAR: &str = "CONTAINER_PREFIX";
pub const SPARK_TAGS_VAR: &str = "SPARK_TAGS_FLAT";
pub const SPARK_HOME_VAR: &str = "SPARK_HOME";
pub const SPARK_CONFIG_VAR: &str = "SPARK_CONFIG";
pub const OUTPUT_ROOT_VAR: &str = "S3_ROOT";

pub fn env_lookup(name: &str) -> Option<String> {
    std::env::var_os(name).map(|v| v.to_string_lossy().into_owned())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunConfig {
    pub container_prefix: String,
    pub image_tag: String,
    pub all_tags: Vec<String>,
    pub spark_home: String,
    pub spark_config: Vec<String>,
    pub spark_config_raw: String,
    pub output_root: String,
}

impl RunConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut problems = ConfigError::default();
        let mut required = |name: &'static str| -> Option<String> {
            let value = lookup(name);
            if value.is_none() {
                problems.missing.push(name);
            }
            value
        };

        let container_prefix = required(CONTAINER_PREFIX_VAR);
        let tags_raw = required(SPARK_TAGS_VAR);
        let spark_home = required(SPARK_HOME_VAR);
        let spark_config_raw = required(SPARK_CONFIG_VAR);
        let output_root = required(OUTPUT_ROOT_VAR);

        let all_tags: Vec<String> = tags_raw
            .as_deref()
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        if tags_raw.is_some() && all_tags.is_empty() {
            problems
                .malformed
                .push((SPARK_TAGS_VAR, "no image tag listed".to_string()));
        }

        let spark_config = match spark_config_raw.as_deref().map(split_config_words) {
            Some(Ok(words)) => words,
            Some(Err(reason)) => {
                problems.malformed.push((SPARK_CONFIG_VAR, reason));
                Vec::new()
            }
            None => Vec::new(),
        };

        for (name, value) in [
            (CONTAINER_PREFIX_VAR, &container_prefix),
            (SPARK_HOME_VAR, &spark_home),
            (OUTPUT_ROOT_VAR, &output_root),
        ] {
            if matches!(value.as_deref(), Some(v) if v.trim().is_empty()) {
                problems.malformed.push((name, "empty value".to_string()));
            }
        }

        if !problems.is_empty() {
            return Err(problems);
        }

        let config = RunConfig {
            container_prefix: container_prefix.unwrap_or_default(),
            image_tag: all_tags[0].clone(),
            all_tags,
            spark_home: spark_home.unwrap_or_default(),
            spark_config,
            spark_config_raw: spark_config_raw.unwrap_or_default(),
            output_root: output_root.unwrap_or_default(),
        };
        tracing::debug!(?config, "loaded run configuration");
        Ok(config)
    }

    pub fn image_reference(&self) -> String {
        format!("{}/iceberg-spark:{}", self.container_prefix, self.image_tag)
    }
}

// POSIX-like word splitting, no expansion.
pub fn split_config_words(raw: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            ch if ch.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            ch => {
                in_word = true;
                current.push(ch);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
