use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use seqbot_core::{log_command, shell_join, split_bucket_key, CommandRunner};

pub const DEFAULT_ECR_IMAGE: &str = "sra_download";

/// Run any script as a batch job, e.g.
/// `seqbot-launch jamestwebber-logs/scripts bcl2fastq.py "--exp_id exp1"`.
#[derive(Debug, Parser)]
#[command(name = "seqbot-launch", version, about)]
pub struct LaunchArgs {
    /// S3 bucket/path holding the scripts, e.g. jamestwebber-logs/scripts
    pub s3_script_path: String,

    /// Name of the script to run, e.g. bcl2fastq.py
    pub script_name: String,

    /// Script arguments, as a single string, e.g. "--taxon mus"
    #[arg(allow_hyphen_values = true)]
    pub script_args: String,

    /// ECR image to use for the job
    #[arg(long, conflicts_with = "ami")]
    pub ecr_image: Option<String>,

    /// AMI to use for the job
    #[arg(long)]
    pub ami: Option<String>,

    /// Queue to submit the job to
    #[arg(long, default_value = "aegea_batch")]
    pub queue: String,

    /// Number of vCPUs needed, e.g. 16
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=64))]
    pub vcpus: u32,

    /// Amount of memory needed, in MB, e.g. 16000
    #[arg(long, default_value_t = 4000, value_parser = clap::value_parser!(u32).range(0..=256_000))]
    pub memory: u32,

    /// Request additional storage, in GiB (min 500)
    #[arg(long, value_parser = clap::value_parser!(u32).range(500..=16_000))]
    pub storage: Option<u32>,

    /// Change instance ulimits, e.g. nofile:1000000
    #[arg(long, num_args = 1..)]
    pub ulimits: Option<Vec<String>>,

    /// Set environment variables on the job
    #[arg(long, num_args = 1..)]
    pub environment: Option<Vec<String>>,

    /// Print the command but don't launch the job
    #[arg(long)]
    pub dryrun: bool,

    /// Upload the script to S3 before running
    #[arg(short, long)]
    pub upload: bool,

    /// Set logging to debug level
    #[arg(short, long)]
    pub debug: bool,

    /// Check the argument string against the script's argspec sidecar
    #[arg(short, long)]
    pub testargs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSelector {
    Ecr(String),
    Ami(String),
}

/// At most one of the two image flags is set (clap enforces the
/// conflict); with neither, fall back to the stock ECR image.
pub fn resolve_image(ecr_image: Option<&str>, ami: Option<&str>) -> ImageSelector {
    match (ecr_image, ami) {
        (Some(image), _) => ImageSelector::Ecr(image.to_string()),
        (None, Some(ami)) => ImageSelector::Ami(ami.to_string()),
        (None, None) => ImageSelector::Ecr(DEFAULT_ECR_IMAGE.to_string()),
    }
}

/// Shell payload run on the remote worker: fetch the script, make it
/// executable, run it with the user's argument string.
pub fn build_job_command(bucket: &str, key: &str, script_base: &str, script_args: &str) -> String {
    format!(
        "aws s3 cp s3://{}/{} .; chmod 755 {}; ./{} {}",
        bucket, key, script_base, script_base, script_args
    )
}

#[allow(clippy::too_many_arguments)]
pub fn build_submit_argv(
    queue: &str,
    vcpus: u32,
    memory: u32,
    storage: Option<u32>,
    image: &ImageSelector,
    ulimits: Option<&[String]>,
    environment: Option<&[String]>,
    job_command: &str,
) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "aegea".into(),
        "batch".into(),
        "submit".into(),
        "--queue".into(),
        queue.into(),
        "--vcpus".into(),
        vcpus.to_string(),
        "--memory".into(),
        memory.to_string(),
    ];

    match image {
        ImageSelector::Ecr(image) => {
            argv.push("--ecr-image".into());
            argv.push(image.clone());
        }
        ImageSelector::Ami(ami) => {
            argv.push("--ami".into());
            argv.push(ami.clone());
        }
    }

    if let Some(storage) = storage {
        argv.push("--storage".into());
        argv.push(format!("/mnt={}", storage));
    }

    if let Some(ulimits) = ulimits {
        argv.push("--ulimits".into());
        argv.push(ulimits.join(" "));
    }

    if let Some(environment) = environment {
        argv.push("--environment".into());
        argv.push(environment.join(" "));
    }

    argv.push("--command".into());
    argv.push(job_command.to_string());
    argv
}

/// Machine-readable argument specification shipped next to the script
/// as `<script>.argspec.json`. Pure data, never executed.
#[derive(Debug, Deserialize)]
pub struct ArgSpec {
    #[serde(default)]
    pub options: Vec<OptionSpec>,
    #[serde(default)]
    pub positionals: usize,
}

#[derive(Debug, Deserialize)]
pub struct OptionSpec {
    pub name: String,
    #[serde(default)]
    pub takes_value: bool,
    #[serde(default)]
    pub required: bool,
}

pub fn argspec_path(script: &Path) -> PathBuf {
    PathBuf::from(format!("{}.argspec.json", script.display()))
}

pub fn load_argspec(script: &Path) -> Result<ArgSpec> {
    let path = argspec_path(script);
    let data = fs::read_to_string(&path).with_context(|| {
        format!(
            "{} has no argument spec at {}, can't test args",
            script.display(),
            path.display()
        )
    })?;
    let spec: ArgSpec = serde_json::from_str(&data)
        .with_context(|| format!("invalid argument spec {}", path.display()))?;
    Ok(spec)
}

/// Validate the whitespace-split argument string against the spec:
/// unknown options, missing option values, missing required options,
/// and a positional count differing from the declared one all reject.
pub fn validate_args(spec: &ArgSpec, script_args: &str) -> Result<()> {
    let tokens: Vec<&str> = script_args.split_whitespace().collect();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut positionals = 0usize;

    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        if token.starts_with('-') && token.len() > 1 {
            let (name, inline_value) = match token.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (token, None),
            };
            let option = spec
                .options
                .iter()
                .find(|o| o.name == name)
                .ok_or_else(|| anyhow!("unknown option: {}", name))?;
            if option.takes_value && inline_value.is_none() {
                i += 1;
                if i >= tokens.len() {
                    bail!("option {} requires a value", name);
                }
            } else if !option.takes_value && inline_value.is_some() {
                bail!("option {} does not take a value", name);
            }
            seen.insert(&option.name);
        } else {
            positionals += 1;
        }
        i += 1;
    }

    for option in &spec.options {
        if option.required && !seen.contains(option.name.as_str()) {
            bail!("missing required option: {}", option.name);
        }
    }
    if positionals != spec.positionals {
        bail!(
            "expected {} positional argument(s), got {}",
            spec.positionals,
            positionals
        );
    }
    Ok(())
}

#[derive(Debug)]
pub struct LaunchOutcome {
    /// Assigned job id; `None` in dry-run mode.
    pub job_id: Option<String>,
    /// The submission command line, exactly as (or as would have been) run.
    pub submit_command: Vec<String>,
}

pub fn run_launch(args: &LaunchArgs, runner: &mut dyn CommandRunner) -> Result<LaunchOutcome> {
    let image = resolve_image(args.ecr_image.as_deref(), args.ami.as_deref());

    let script = Path::new(&args.script_name);
    let script_base = script
        .file_name()
        .ok_or_else(|| anyhow!("invalid script name: {}", args.script_name))?
        .to_string_lossy()
        .to_string();

    let (bucket, prefix) = split_bucket_key(&args.s3_script_path)?;
    let key = if prefix.is_empty() {
        script_base.clone()
    } else {
        format!("{}/{}", prefix, script_base)
    };

    // The self-test runs before any remote step so a bad argument
    // string never results in an upload or a submission.
    if args.testargs {
        if !script.exists() {
            bail!("can't find script: {}", args.script_name);
        }
        debug!("testing script args");
        let spec = load_argspec(script)?;
        validate_args(&spec, &args.script_args).with_context(|| {
            format!(
                "{} rejected the argument string `{}`",
                args.script_name, args.script_args
            )
        })?;
        debug!("script argument string validated");
    }

    if args.upload {
        if !script.exists() {
            bail!("can't find script: {}", args.script_name);
        }
        info!(
            "uploading {} to s3://{}/{}",
            args.script_name, bucket, key
        );
        if !args.dryrun {
            let cp: Vec<String> = vec![
                "aws".into(),
                "s3".into(),
                "cp".into(),
                args.script_name.clone(),
                format!("s3://{}/{}", bucket, key),
            ];
            log_command(runner, &cp)?;
        }
    } else if !args.dryrun {
        let head: Vec<String> = vec![
            "aws".into(),
            "s3api".into(),
            "head-object".into(),
            "--bucket".into(),
            bucket.clone(),
            "--key".into(),
            key.clone(),
        ];
        if log_command(runner, &head).is_err() {
            bail!("{} is not on s3, you should upload it", args.script_name);
        }
    }

    let job_command = build_job_command(&bucket, &key, &script_base, &args.script_args);
    let submit = build_submit_argv(
        &args.queue,
        args.vcpus,
        args.memory,
        args.storage,
        &image,
        args.ulimits.as_deref(),
        args.environment.as_deref(),
        &job_command,
    );

    if args.dryrun {
        info!("dryrun; would execute:\n\t{}", shell_join(&submit));
        return Ok(LaunchOutcome {
            job_id: None,
            submit_command: submit,
        });
    }

    info!("executing command:\n\t{}", shell_join(&submit));
    let output = runner.run(&submit)?;
    let parsed: Value = serde_json::from_str(output.trim())
        .context("submission CLI did not return valid JSON")?;
    let job_id = parsed
        .get("jobId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("submission output is missing jobId"))?
        .to_string();
    info!("launched job with jobId: {}", job_id);

    Ok(LaunchOutcome {
        job_id: Some(job_id),
        submit_command: submit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;

    struct RecordingRunner {
        invocations: Vec<Vec<String>>,
        stdout: String,
    }

    impl RecordingRunner {
        fn new(stdout: &str) -> Self {
            Self {
                invocations: Vec::new(),
                stdout: stdout.to_string(),
            }
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&mut self, argv: &[String]) -> Result<String> {
            self.invocations.push(argv.to_vec());
            Ok(self.stdout.clone())
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "seqbot_launcher_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn base_args(extra: &[&str]) -> LaunchArgs {
        let mut argv = vec![
            "seqbot-launch",
            "jamestwebber-logs/scripts",
            "bcl2fastq.py",
            "--exp_id exp1",
        ];
        argv.extend_from_slice(extra);
        LaunchArgs::try_parse_from(argv).expect("args should parse")
    }

    #[test]
    fn vcpus_range_is_enforced() {
        for value in ["1", "64"] {
            LaunchArgs::try_parse_from([
                "seqbot-launch", "b/p", "s.py", "args", "--vcpus", value,
            ])
            .expect("in-range vcpus should parse");
        }
        for value in ["0", "65"] {
            LaunchArgs::try_parse_from([
                "seqbot-launch", "b/p", "s.py", "args", "--vcpus", value,
            ])
            .expect_err("out-of-range vcpus should be rejected");
        }
    }

    #[test]
    fn memory_range_is_enforced() {
        LaunchArgs::try_parse_from([
            "seqbot-launch", "b/p", "s.py", "args", "--memory", "256000",
        ])
        .expect("max memory should parse");
        LaunchArgs::try_parse_from([
            "seqbot-launch", "b/p", "s.py", "args", "--memory", "256001",
        ])
        .expect_err("excess memory should be rejected");
    }

    #[test]
    fn storage_range_is_enforced() {
        LaunchArgs::try_parse_from([
            "seqbot-launch", "b/p", "s.py", "args", "--storage", "500",
        ])
        .expect("min storage should parse");
        for value in ["499", "16001"] {
            LaunchArgs::try_parse_from([
                "seqbot-launch", "b/p", "s.py", "args", "--storage", value,
            ])
            .expect_err("out-of-range storage should be rejected");
        }
    }

    #[test]
    fn image_flags_are_mutually_exclusive() {
        LaunchArgs::try_parse_from([
            "seqbot-launch",
            "b/p",
            "s.py",
            "args",
            "--ecr-image",
            "demux",
            "--ami",
            "ami-123",
        ])
        .expect_err("both image flags should be rejected");
    }

    #[test]
    fn image_defaults_when_neither_flag_given() {
        assert_eq!(
            resolve_image(None, None),
            ImageSelector::Ecr(DEFAULT_ECR_IMAGE.to_string())
        );
        assert_eq!(
            resolve_image(Some("demux"), None),
            ImageSelector::Ecr("demux".to_string())
        );
        assert_eq!(
            resolve_image(None, Some("ami-123")),
            ImageSelector::Ami("ami-123".to_string())
        );
    }

    #[test]
    fn job_command_matches_expected_shape() {
        let command = build_job_command(
            "jamestwebber-logs",
            "scripts/bcl2fastq.py",
            "bcl2fastq.py",
            "--exp_id exp1",
        );
        assert_eq!(
            command,
            "aws s3 cp s3://jamestwebber-logs/scripts/bcl2fastq.py .; \
             chmod 755 bcl2fastq.py; ./bcl2fastq.py --exp_id exp1"
        );
    }

    #[test]
    fn submit_argv_carries_resources_and_image() {
        let ulimits = vec!["nofile:1000000".to_string()];
        let environment = vec!["TAXON=mus".to_string(), "DEBUG=1".to_string()];
        let argv = build_submit_argv(
            "aegea_batch",
            16,
            16000,
            Some(1200),
            &ImageSelector::Ecr("demux".to_string()),
            Some(&ulimits),
            Some(&environment),
            "echo hi",
        );
        let expected: Vec<String> = [
            "aegea", "batch", "submit",
            "--queue", "aegea_batch",
            "--vcpus", "16",
            "--memory", "16000",
            "--ecr-image", "demux",
            "--storage", "/mnt=1200",
            "--ulimits", "nofile:1000000",
            "--environment", "TAXON=mus DEBUG=1",
            "--command", "echo hi",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(argv, expected);
    }

    #[test]
    fn submit_argv_with_ami_and_no_extras() {
        let argv = build_submit_argv(
            "q",
            1,
            4000,
            None,
            &ImageSelector::Ami("ami-123".to_string()),
            None,
            None,
            "run",
        );
        assert!(argv.contains(&"--ami".to_string()));
        assert!(!argv.contains(&"--storage".to_string()));
        assert!(!argv.contains(&"--ulimits".to_string()));
        assert!(!argv.contains(&"--environment".to_string()));
    }

    #[test]
    fn dryrun_issues_no_commands() {
        let dir = temp_dir("dryrun");
        let script = dir.join("script.py");
        fs::write(&script, "#!/usr/bin/env python\n").expect("write script");

        let mut args = base_args(&["--dryrun", "--upload"]);
        args.script_name = script.display().to_string();

        let mut runner = RecordingRunner::new("");
        let outcome = run_launch(&args, &mut runner).expect("dryrun should succeed");

        assert!(runner.invocations.is_empty(), "dryrun must not run anything");
        assert!(outcome.job_id.is_none());
        assert_eq!(outcome.submit_command[0], "aegea");
        assert_eq!(
            outcome.submit_command.last().map(String::as_str),
            Some("aws s3 cp s3://jamestwebber-logs/scripts/script.py .; chmod 755 script.py; ./script.py --exp_id exp1")
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn testargs_without_argspec_fails_before_any_remote_step() {
        let dir = temp_dir("noargspec");
        let script = dir.join("script.py");
        fs::write(&script, "#!/usr/bin/env python\n").expect("write script");

        let mut args = base_args(&["--testargs", "--upload"]);
        args.script_name = script.display().to_string();

        let mut runner = RecordingRunner::new("");
        let err = run_launch(&args, &mut runner).expect_err("missing argspec should fail");
        assert!(
            err.to_string().contains("can't test args"),
            "unexpected: {:#}",
            err
        );
        assert!(
            runner.invocations.is_empty(),
            "nothing may run before the self-test passes"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn testargs_with_valid_argspec_proceeds_to_submit() {
        let dir = temp_dir("argspec_ok");
        let script = dir.join("script.py");
        fs::write(&script, "#!/usr/bin/env python\n").expect("write script");
        let mut sidecar =
            fs::File::create(argspec_path(&script)).expect("create argspec sidecar");
        sidecar
            .write_all(
                br#"{"options": [{"name": "--exp_id", "takes_value": true, "required": true}]}"#,
            )
            .expect("write argspec");

        let mut args = base_args(&["--testargs", "--upload"]);
        args.script_name = script.display().to_string();

        let mut runner = RecordingRunner::new(r#"{"jobId": "9a1b2c3d"}"#);
        let outcome = run_launch(&args, &mut runner).expect("launch should succeed");

        // upload then submit
        assert_eq!(runner.invocations.len(), 2);
        assert_eq!(runner.invocations[0][0], "aws");
        assert_eq!(runner.invocations[1][0], "aegea");
        assert_eq!(outcome.job_id.as_deref(), Some("9a1b2c3d"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_remote_script_is_a_config_error() {
        let args = base_args(&[]);
        struct FailingRunner;
        impl CommandRunner for FailingRunner {
            fn run(&mut self, _argv: &[String]) -> Result<String> {
                Err(anyhow!("404"))
            }
        }
        let err = run_launch(&args, &mut FailingRunner).expect_err("head check should fail");
        assert!(
            err.to_string().contains("you should upload it"),
            "unexpected: {:#}",
            err
        );
    }

    fn spec_with_options() -> ArgSpec {
        serde_json::from_str(
            r#"{
                "options": [
                    {"name": "--exp_id", "takes_value": true, "required": true},
                    {"name": "--star_structure"}
                ],
                "positionals": 1
            }"#,
        )
        .expect("spec should deserialize")
    }

    #[test]
    fn validate_args_accepts_matching_string() {
        let spec = spec_with_options();
        validate_args(&spec, "--exp_id exp1 --star_structure input.csv")
            .expect("valid string should pass");
        validate_args(&spec, "--exp_id=exp1 input.csv").expect("inline value should pass");
    }

    #[test]
    fn validate_args_rejects_unknown_option() {
        let spec = spec_with_options();
        let err = validate_args(&spec, "--exp_id exp1 --bogus input.csv")
            .expect_err("unknown option should fail");
        assert!(err.to_string().contains("--bogus"));
    }

    #[test]
    fn validate_args_rejects_missing_required() {
        let spec = spec_with_options();
        let err =
            validate_args(&spec, "input.csv").expect_err("missing required option should fail");
        assert!(err.to_string().contains("--exp_id"));
    }

    #[test]
    fn validate_args_rejects_missing_value_and_extra_positionals() {
        let spec = spec_with_options();
        validate_args(&spec, "input.csv --exp_id").expect_err("dangling option should fail");
        validate_args(&spec, "--exp_id exp1 a.csv b.csv")
            .expect_err("extra positional should fail");
    }
}
