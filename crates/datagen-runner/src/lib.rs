pub mod config;
pub mod error;
pub mod invocation;
pub mod launcher;
pub mod preflight;
pub mod settings;

pub use config::RunConfig;
pub use error::{ConfigError, DatagenError, PreflightError, Result};
pub use invocation::{CompletionPolicy, JobInvocation, ScaleFactor, DEFAULT_SCALE_FACTORS};
pub use launcher::{
    BatchReport, BatchState, JobExecutor, JobOutcome, Launcher, OutputTail, ProcessExecutor,
    ProcessOutput,
};
pub use settings::Settings;

#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub config: RunConfig,
    pub settings: Settings,
}

impl PreparedRun {
    pub fn plan(&self) -> Vec<JobInvocation> {
        invocation::build_plan(
            &self.config,
            &self.settings.scale_factors,
            self.settings.completion,
        )
    }

    pub fn launch<E: JobExecutor>(&self, executor: E) -> BatchReport {
        Launcher::new(&self.config, self.settings.completion, executor)
            .run(&self.settings.scale_factors)
    }
}

// Preflight runs before the environment is read for configuration.
pub fn prepare_run(
    lookup: &dyn Fn(&str) -> Option<String>,
    settings: Settings,
) -> Result<PreparedRun> {
    preflight::preflight(lookup)?;
    let config = RunConfig::from_lookup(lookup)?;
    Ok(PreparedRun { config, settings })
}

pub fn prepare_run_from_env(settings: Settings) -> Result<PreparedRun> {
    prepare_run(&config::env_lookup, settings)
}
