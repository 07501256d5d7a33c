use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use datagen_runner::{
    BatchReport, BatchState, CompletionPolicy, DatagenError, JobInvocation, JobOutcome,
    OutputTail, PreparedRun, ProcessExecutor, ScaleFactor, Settings,
};
use serde_json::{json, Value};
use std::path::PathBuf;

const EXCERPT_LINES: usize = 20;
const EXCEPTION_WINDOW: usize = 60;

#[derive(Parser)]
#[command(name = "datagen", version, about = "Spark TPC-DS test data generation driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CompletionArg {
    #[value(name = "completed")]
    Completed,
    #[value(name = "submitted")]
    Submitted,
}

impl From<CompletionArg> for CompletionPolicy {
    fn from(value: CompletionArg) -> Self {
        match value {
            CompletionArg::Completed => CompletionPolicy::Completed,
            CompletionArg::Submitted => CompletionPolicy::Submitted,
        }
    }
}

#[derive(Args, Debug)]
struct BatchArgs {
    #[arg(long = "scale-factor", value_parser = parse_scale_factor)]
    scale_factors: Vec<ScaleFactor>,
    #[arg(long, value_enum)]
    completion: Option<CompletionArg>,
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    Run(BatchArgs),
    Plan(BatchArgs),
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload_failed(&payload) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn parse_scale_factor(raw: &str) -> std::result::Result<ScaleFactor, String> {
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("'{}' is not a whole number", raw))?;
    ScaleFactor::try_from(value)
}

fn resolve_settings(args: &BatchArgs) -> Result<Settings> {
    let base = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let settings = base.with_overrides(&args.scale_factors, args.completion.map(Into::into));
    tracing::debug!(?settings, "resolved settings");
    Ok(settings)
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run(args) => {
            let settings = resolve_settings(&args)?;
            let prepared = datagen_runner::prepare_run_from_env(settings)?;
            let report = prepared.launch(ProcessExecutor::default());
            if args.json {
                return Ok(Some(report_to_json(&prepared, report)));
            }
            print_report(&report);
            report.into_result()?;
        }
        Commands::Plan(args) => {
            let settings = resolve_settings(&args)?;
            let prepared = datagen_runner::prepare_run_from_env(settings)?;
            let plan = prepared.plan();
            if args.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "config": config_to_json(&prepared),
                    "jobs": plan.iter().map(invocation_to_json).collect::<Vec<_>>(),
                })));
            }
            print_config(&prepared);
            for inv in &plan {
                println!("scale_factor: {}", inv.scale_factor);
                println!("  destination: {}", inv.destination);
                println!("  fingerprint: {}", inv.fingerprint());
                println!("  command: {}", inv.display());
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn payload_failed(payload: &Value) -> bool {
    payload.get("ok").and_then(Value::as_bool) == Some(false)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run(args) | Commands::Plan(args) => args.json,
    }
}

fn config_to_json(prepared: &PreparedRun) -> Value {
    json!({
        "image": prepared.config.image_reference(),
        "tags": prepared.config.all_tags,
        "spark_home": prepared.config.spark_home,
        "output_root": prepared.config.output_root,
        "spark_config": prepared.config.spark_config,
        "scale_factors": prepared.settings.scale_factors,
        "completion": prepared.settings.completion.as_str(),
    })
}

fn invocation_to_json(inv: &JobInvocation) -> Value {
    json!({
        "scale_factor": inv.scale_factor,
        "destination": inv.destination,
        "app_name": inv.app_name,
        "program": inv.program,
        "args": inv.args,
        "fingerprint": inv.fingerprint(),
    })
}

fn outcome_to_json(outcome: &JobOutcome) -> Value {
    let mut value = json!({
        "scale_factor": outcome.scale_factor,
        "destination": outcome.destination,
        "exit_code": outcome.exit_code,
        "fingerprint": outcome.fingerprint,
        "started_at": outcome.started_at.to_rfc3339(),
        "finished_at": outcome.finished_at.to_rfc3339(),
    });
    if !outcome.succeeded() {
        value["stdout"] = json!(outcome.stdout.text());
        value["stderr"] = json!(outcome.stderr.text());
        value["stdout_dropped_lines"] = json!(outcome.stdout.dropped());
        value["stderr_dropped_lines"] = json!(outcome.stderr.dropped());
    }
    value
}

fn report_to_json(prepared: &PreparedRun, report: BatchReport) -> Value {
    let state = report.state();
    let jobs: Vec<Value> = report.outcomes().iter().map(outcome_to_json).collect();
    match report.into_result() {
        Ok(_) => json!({
            "ok": true,
            "command": "run",
            "config": config_to_json(prepared),
            "jobs": jobs,
        }),
        Err(err) => {
            let code = match &err {
                DatagenError::Spawn { .. } => "job_spawn_failed",
                _ => "job_failed",
            };
            let failed_scale_factor = match state {
                BatchState::Failed { scale_factor } => Some(scale_factor),
                BatchState::Done => None,
            };
            json_error(
                code,
                err.to_string(),
                json!({
                    "failed_scale_factor": failed_scale_factor,
                    "config": config_to_json(prepared),
                    "jobs": jobs,
                }),
            )
        }
    }
}

// The tail of stderr, widened back to the last exception when it is close by,
// since spark-submit ends with shutdown-hook noise.
fn failure_excerpt(stderr: &OutputTail) -> Vec<&str> {
    let lines: Vec<&str> = stderr.lines().collect();
    let tail_start = lines.len().saturating_sub(EXCERPT_LINES);
    let start = lines
        .iter()
        .rposition(|l| l.contains("Exception"))
        .filter(|i| lines.len() - i <= EXCEPTION_WINDOW)
        .map_or(tail_start, |i| i.min(tail_start));
    lines[start..].to_vec()
}

fn print_config(prepared: &PreparedRun) {
    println!("image: {}", prepared.config.image_reference());
    println!("spark_home: {}", prepared.config.spark_home);
    println!("output_root: {}", prepared.config.output_root);
    println!("completion: {}", prepared.settings.completion.as_str());
}

fn print_report(report: &BatchReport) {
    for outcome in report.outcomes() {
        println!(
            "scale_factor {}: exit {} -> {}",
            outcome.scale_factor,
            outcome.status_label(),
            outcome.destination
        );
        if !outcome.succeeded() {
            eprintln!("stderr of scale factor {}:", outcome.scale_factor);
            for line in failure_excerpt(&outcome.stderr) {
                eprintln!("  {}", line);
            }
        }
    }
    if report.is_done() {
        println!("done: {} job(s)", report.outcomes().len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPARK_FAILURE: &str = "\
24/05/01 INFO SparkContext: Running Spark version 3.5.1
24/05/01 INFO KubernetesClientApplication: Waiting for application spark-tpcds-test-gen-2 to finish
Exception in thread \"main\" org.apache.spark.SparkException: Job aborted due to stage failure
\tat org.apache.spark.scheduler.DAGScheduler.failJobAndIndependentStages(DAGScheduler.scala:2790)
\tat org.apache.spark.sql.execution.benchmark.TPCDSDatagen.main(TPCDSDatagen.scala:51)
24/05/01 INFO ShutdownHookManager: Shutdown hook called
24/05/01 INFO ShutdownHookManager: Deleting directory /tmp/spark-abc";

    #[test]
    fn scale_factor_parser_rejects_zero_and_junk() {
        assert_eq!(parse_scale_factor("4").map(ScaleFactor::get), Ok(4));
        assert!(parse_scale_factor("0").is_err());
        assert!(parse_scale_factor("-1").is_err());
        assert!(parse_scale_factor("ten").is_err());
    }

    #[test]
    fn cli_accepts_repeated_scale_factors() {
        let cli = Cli::try_parse_from([
            "datagen",
            "run",
            "--scale-factor",
            "10",
            "--scale-factor",
            "100",
            "--completion",
            "submitted",
            "--json",
        ])
        .expect("parse");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.json);
        let settings = resolve_settings(&args).expect("settings");
        let factors: Vec<u32> = settings.scale_factors.iter().map(|f| f.get()).collect();
        assert_eq!(factors, vec![10, 100]);
        assert_eq!(settings.completion, CompletionPolicy::Submitted);
    }

    #[test]
    fn plan_defaults_to_builtin_settings() {
        let cli = Cli::try_parse_from(["datagen", "plan"]).expect("parse");
        assert!(!command_json_mode(&cli.command));
        let Commands::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(resolve_settings(&args).expect("settings"), Settings::default());
    }

    #[test]
    fn json_error_has_stable_shape() {
        let v = json_error("job_failed", "boom".to_string(), json!({"x": 1}));
        assert_eq!(v["ok"], json!(false));
        assert!(payload_failed(&v));
        assert_eq!(v["error"]["code"], json!("job_failed"));
        assert_eq!(v["error"]["details"]["x"], json!(1));
    }

    #[test]
    fn failure_excerpt_keeps_the_spark_exception() {
        let tail = OutputTail::from_text(SPARK_FAILURE);
        let excerpt = failure_excerpt(&tail);
        assert!(
            excerpt.iter().any(|l| l.contains("SparkException")),
            "{:?}",
            excerpt
        );
        assert_eq!(excerpt.len(), 7);
    }

    #[test]
    fn failure_excerpt_reaches_back_past_shutdown_noise() {
        let mut stderr = OutputTail::from_text(SPARK_FAILURE);
        for i in 0..30 {
            stderr.push(format!("24/05/01 INFO ShutdownHookManager: Deleting directory /tmp/spark-{}", i));
        }
        let excerpt = failure_excerpt(&stderr);
        assert!(excerpt[0].starts_with("Exception in thread \"main\""), "{:?}", excerpt);
        assert_eq!(excerpt.len(), 35);
    }

    #[test]
    fn failure_excerpt_falls_back_to_the_tail() {
        let mut stderr = OutputTail::from_text("");
        for i in 0..100 {
            stderr.push(format!("line {}", i));
        }
        let excerpt = failure_excerpt(&stderr);
        assert_eq!(excerpt.len(), EXCERPT_LINES);
        assert_eq!(excerpt[0], "line 80");
    }

    // Both modes live in one test since they share the process environment.
    #[cfg(unix)]
    #[test]
    fn run_fails_the_batch_on_second_scale_factor_in_both_modes() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let home = std::env::temp_dir().join(format!(
            "datagen_cli_run_test_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&home);
        let bin = home.join("bin");
        fs::create_dir_all(&bin).expect("bin dir");
        fs::write(bin.join("failure.txt"), SPARK_FAILURE).expect("stderr fixture");
        let script = bin.join("spark-submit");
        fs::write(
            &script,
            "#!/bin/sh\n\
             dir=$(dirname \"$0\")\n\
             for last; do :; done\n\
             echo \"$last\" >> \"$dir/calls.log\"\n\
             if [ \"$last\" = 2 ]; then cat \"$dir/failure.txt\" >&2; exit 1; fi\n\
             exit 0\n",
        )
        .expect("write script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

        std::env::set_var("CALLED_FROM_RUN", "1");
        std::env::set_var("CONTAINER_PREFIX", "myrepo");
        std::env::set_var("SPARK_TAGS_FLAT", "v1 v2");
        std::env::set_var("SPARK_HOME", &home);
        std::env::set_var("SPARK_CONFIG", "--deploy-mode cluster");
        std::env::set_var("S3_ROOT", "s3://bucket/x");

        let batch = |json: bool| BatchArgs {
            scale_factors: Vec::new(),
            completion: None,
            settings: None,
            json,
        };

        let err = run_command(Commands::Run(batch(false))).expect_err("human run must fail");
        let human_message = err.to_string();
        assert!(human_message.contains("Non zero exit while running"), "{}", human_message);
        assert!(human_message.contains("scale factor 2"), "{}", human_message);
        let calls = fs::read_to_string(bin.join("calls.log")).expect("calls log");
        assert_eq!(calls, "1\n2\n");

        let payload = run_command(Commands::Run(batch(true)))
            .expect("json run reports through the payload")
            .expect("payload");
        assert!(payload_failed(&payload));
        assert_eq!(payload["error"]["code"], json!("job_failed"));
        assert_eq!(payload["error"]["message"], json!(human_message));
        assert_eq!(payload["error"]["details"]["failed_scale_factor"], json!(2));
        let jobs = payload["error"]["details"]["jobs"].as_array().expect("jobs");
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].get("stderr").is_none());
        let stderr = jobs[1]["stderr"].as_str().expect("stderr");
        assert!(stderr.contains("SparkException: Job aborted"), "{}", stderr);
        assert!(stderr.ends_with("Deleting directory /tmp/spark-abc"), "{}", stderr);
        let calls = fs::read_to_string(bin.join("calls.log")).expect("calls log");
        assert_eq!(calls, "1\n2\n1\n2\n");

        let _ = fs::remove_dir_all(home);
    }
}
