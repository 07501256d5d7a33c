use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::RunConfig;

pub const JOB_CLASS: &str = "org.apache.spark.sql.execution.benchmark.TPCDSDatagen";
pub const JOB_ARTIFACT: &str =
    "local:///spark-tpcds-datagen_2.12-0.1.0-SNAPSHOT-with-dependencies.jar";
pub const DRIVER_LABEL_CONF: &str = "spark.kubernetes.driver.label.sdr.appname=spark";
pub const EXECUTOR_LABEL_CONF: &str = "spark.kubernetes.executor.label.sdr.appname=spark";
pub const CATALOG_CONF: &str = "spark.sql.catalog.hive_prod=org.apache.iceberg.spark.SparkCatalog";
const WAIT_COMPLETION_KEY: &str = "spark.kubernetes.submission.waitAppCompletion";

pub const DEFAULT_SCALE_FACTORS: [ScaleFactor; 3] = [ScaleFactor(1), ScaleFactor(2), ScaleFactor(3)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ScaleFactor(u32);

impl ScaleFactor {
    pub fn new(value: u32) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for ScaleFactor {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| "scale factor must be positive".to_string())
    }
}

impl From<ScaleFactor> for u32 {
    fn from(value: ScaleFactor) -> Self {
        value.0
    }
}

impl fmt::Display for ScaleFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    #[default]
    Completed,
    Submitted,
}

impl CompletionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionPolicy::Completed => "completed",
            CompletionPolicy::Submitted => "submitted",
        }
    }

    fn wait_conf(self) -> String {
        let wait = matches!(self, CompletionPolicy::Completed);
        format!("{}={}", WAIT_COMPLETION_KEY, wait)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInvocation {
    pub scale_factor: ScaleFactor,
    pub program: String,
    pub args: Vec<String>,
    pub destination: String,
    pub app_name: String,
    pub job_id: String,
    pub image: String,
}

impl JobInvocation {
    pub fn build(config: &RunConfig, factor: ScaleFactor, policy: CompletionPolicy) -> Self {
        let destination = destination_path(&config.output_root, factor);
        let app_name = format!("spark-tpcds-test-gen-{}", factor);
        let image = config.image_reference();
        let program = format!("{}/bin/spark-submit", config.spark_home.trim_end_matches('/'));

        let mut args: Vec<String> = vec![
            "--conf".into(),
            format!("spark.kubernetes.container.image={}", image),
            "--class".into(),
            JOB_CLASS.into(),
            "--name".into(),
            app_name.clone(),
            "--conf".into(),
            DRIVER_LABEL_CONF.into(),
            "--conf".into(),
            CATALOG_CONF.into(),
            "--conf".into(),
            EXECUTOR_LABEL_CONF.into(),
            "--conf".into(),
            policy.wait_conf(),
        ];
        args.extend(config.spark_config.iter().cloned());
        args.extend([
            JOB_ARTIFACT.to_string(),
            "--output-location".to_string(),
            destination.clone(),
            "--scale-factor".to_string(),
            factor.to_string(),
        ]);

        JobInvocation {
            scale_factor: factor,
            program,
            args,
            destination,
            app_name,
            job_id: format!("dsgen{}", factor),
            image,
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in std::iter::once(&self.program).chain(self.args.iter()) {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

pub fn destination_path(output_root: &str, factor: ScaleFactor) -> String {
    format!("{}/{}", output_root.trim_end_matches('/'), factor)
}

pub fn build_plan(
    config: &RunConfig,
    factors: &[ScaleFactor],
    policy: CompletionPolicy,
) -> Vec<JobInvocation> {
    factors
        .iter()
        .map(|f| JobInvocation::build(config, *f, policy))
        .collect()
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
