use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use seqbot_core::{ensure_dir, log_command, retry_command, s3_join, CommandRunner};

pub const BCL2FASTQ: &str = "bcl2fastq";
pub const BATCH_JOB_ID_ENV: &str = "AWS_BATCH_JOB_ID";
pub const S3_LOG_DIR: &str = "s3://jamestwebber-logs/bcl2fastq_logs/";
pub const UNDETERMINED_PREFIX: &str = "Undetermined";
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(90);

/// Download a sequencing run, demultiplex it with bcl2fastq, and push
/// the fastqs and reports back to S3.
#[derive(Debug, Parser)]
#[command(name = "seqbot-demux", version, about)]
pub struct DemuxArgs {
    /// Experiment id, e.g. 180817_M05295_0001_000000000
    #[arg(long = "exp_id")]
    pub exp_id: String,

    #[arg(long = "s3_input_dir", default_value = "s3://czbiohub-seqbot/bcl")]
    pub s3_input_dir: String,

    #[arg(long = "s3_output_dir", default_value = "s3://czbiohub-seqbot/fastqs")]
    pub s3_output_dir: String,

    #[arg(long = "s3_report_dir", default_value = "s3://czbiohub-seqbot/reports")]
    pub s3_report_dir: String,

    #[arg(
        long = "s3_sample_sheet_dir",
        default_value = "s3://czbiohub-seqbot/sample-sheets"
    )]
    pub s3_sample_sheet_dir: String,

    /// Move each sample's fastqs into a per-sample subdirectory
    #[arg(long = "star_structure")]
    pub star_structure: bool,

    /// Extra options passed through to bcl2fastq
    #[arg(
        long = "bcl2fastq_options",
        default_value = "--no-lane-splitting",
        allow_hyphen_values = true
    )]
    pub bcl2fastq_options: String,

    /// Delete fastqs for reads that couldn't be assigned to a sample
    #[arg(long = "skip_undetermined")]
    pub skip_undetermined: bool,

    /// Defaults to <exp_id>.csv
    #[arg(long = "sample_sheet_name")]
    pub sample_sheet_name: Option<String>,

    /// Local working directory; namespaced by the batch job id when set
    #[arg(long = "root_dir", default_value = "/mnt")]
    pub root_dir: PathBuf,
}

impl DemuxArgs {
    pub fn sample_sheet_name(&self) -> String {
        self.sample_sheet_name
            .clone()
            .unwrap_or_else(|| format!("{}.csv", self.exp_id))
    }
}

/// Local directory layout for one run.
#[derive(Debug)]
pub struct RunPaths {
    pub result: PathBuf,
    pub bcl: PathBuf,
    pub fastqs: PathBuf,
}

pub fn run_paths(root: &Path, batch_job_id: Option<&str>, exp_id: &str) -> RunPaths {
    let root = match batch_job_id {
        Some(id) => root.join(id),
        None => root.to_path_buf(),
    };
    let result = root.join("data").join("hca").join(exp_id);
    RunPaths {
        bcl: result.join("bcl"),
        fastqs: result.join("fastqs"),
        result,
    }
}

/// Periodic memory/disk usage reporter. Runs on its own thread and logs
/// a sample every interval; dropping the handle stops the thread at its
/// next wakeup and joins it, on both the success and the error path.
pub struct ResourceSampler {
    stop: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ResourceSampler {
    pub fn start(interval: Duration, mount: &str) -> Result<Self> {
        let (stop, wakeup) = mpsc::channel::<()>();
        let mount = mount.to_string();
        let handle = thread::Builder::new()
            .name("resource-sampler".to_string())
            .spawn(move || loop {
                sample_usage(&mount);
                match wakeup.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            })
            .context("failed to spawn the resource sampler thread")?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for ResourceSampler {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// cgroup v1 first, then the v2 location.
const MEMORY_USAGE_PATHS: [&str; 2] = [
    "/sys/fs/cgroup/memory/memory.usage_in_bytes",
    "/sys/fs/cgroup/memory.current",
];

fn sample_usage(mount: &str) {
    for path in MEMORY_USAGE_PATHS {
        if let Ok(raw) = fs::read_to_string(path) {
            info!("memory usage {}", raw.trim());
            break;
        }
    }
    if let Ok(output) = Command::new("df").arg("-h").output() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().filter(|l| l.contains(mount)) {
            info!("disk usage {}", line);
        }
    }
}

/// Sample name for a paired-end fastq file name, if it follows the
/// `<sample>_R[12]_001.fastq.gz` convention.
pub fn sample_for_fastq(name: &str) -> Option<&str> {
    for suffix in ["_R1_001.fastq.gz", "_R2_001.fastq.gz"] {
        if let Some(sample) = name.strip_suffix(suffix) {
            if !sample.is_empty() {
                return Some(sample);
            }
        }
    }
    None
}

fn list_fastqs(output_path: &Path) -> Result<Vec<PathBuf>> {
    let mut fastqs = Vec::new();
    let entries = fs::read_dir(output_path)
        .with_context(|| format!("failed to list {}", output_path.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && name.to_string_lossy().ends_with("fastq.gz") {
            fastqs.push(entry.path());
        }
    }
    fastqs.sort();
    Ok(fastqs)
}

/// Fix the directory structure of the produced fastqs before the sync.
/// With `skip_undetermined`, unassigned-read files are deleted; with
/// `star_structure`, each remaining sample file moves into a per-sample
/// subdirectory. Files that don't follow the naming convention stay put
/// with a warning.
pub fn reorganize_output(
    output_path: &Path,
    skip_undetermined: bool,
    star_structure: bool,
) -> Result<()> {
    let fastqs = list_fastqs(output_path)?;
    debug!(
        "all fastq.gz files\n{}",
        fastqs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n")
    );

    for fastq in fastqs {
        let name = fastq
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if skip_undetermined && name.starts_with(UNDETERMINED_PREFIX) {
            info!("removing {}", name);
            fs::remove_file(&fastq)
                .with_context(|| format!("failed to remove {}", fastq.display()))?;
        } else if star_structure && !name.starts_with(UNDETERMINED_PREFIX) {
            match sample_for_fastq(&name) {
                Some(sample) => {
                    let sample_dir = output_path.join(sample);
                    if !sample_dir.exists() {
                        debug!("creating {}", sample_dir.display());
                        fs::create_dir(&sample_dir).with_context(|| {
                            format!("failed to create {}", sample_dir.display())
                        })?;
                    }
                    debug!("moving {}", fastq.display());
                    fs::rename(&fastq, sample_dir.join(&name))
                        .with_context(|| format!("failed to move {}", fastq.display()))?;
                }
                None => warn!("name didn't match the sample pattern: {}", fastq.display()),
            }
        }
    }
    Ok(())
}

/// First `Reports/html/<flowcell>/all/all/all` directory under the
/// fastq output dir.
pub fn find_report_dir(output_path: &Path) -> Result<PathBuf> {
    let html = output_path.join("Reports").join("html");
    let mut candidates: Vec<PathBuf> = WalkDir::new(&html)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.path().join("all").join("all").join("all"))
        .filter(|p| p.is_dir())
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no report directory under {}", html.display()))
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// The whole run: download, demultiplex, reorganize, upload. Strictly
/// linear; every S3 transfer retries up to the shared bound and the
/// demultiplexer itself is never retried.
pub fn run_demux(
    args: &DemuxArgs,
    batch_job_id: Option<&str>,
    runner: &mut dyn CommandRunner,
) -> Result<()> {
    let sheet_name = args.sample_sheet_name();
    let paths = run_paths(&args.root_dir, batch_job_id, &args.exp_id);
    ensure_dir(&paths.result)?;
    ensure_dir(&paths.bcl)?;

    let result_dir = paths.result.display().to_string();
    let bcl_dir = paths.bcl.display().to_string();
    let fastq_dir = paths.fastqs.display().to_string();

    let sheet_uri = s3_join(&args.s3_sample_sheet_dir, &[sheet_name.as_str()]);
    retry_command(
        runner,
        &argv(&["aws", "s3", "cp", sheet_uri.as_str(), result_dir.as_str()]),
        "download sample sheet",
        &sheet_uri,
    )?;

    let input_uri = s3_join(&args.s3_input_dir, &[args.exp_id.as_str()]);
    retry_command(
        runner,
        &argv(&["aws", "s3", "sync", input_uri.as_str(), bcl_dir.as_str()]),
        "sync bcl",
        &input_uri,
    )?;

    let _sampler = ResourceSampler::start(SAMPLE_INTERVAL, "/mnt")?;

    let sheet_path = paths.result.join(&sheet_name).display().to_string();
    let mut bcl2fastq: Vec<String> = vec![BCL2FASTQ.to_string()];
    bcl2fastq.extend(args.bcl2fastq_options.split_whitespace().map(String::from));
    bcl2fastq.extend(argv(&[
        "--sample-sheet",
        sheet_path.as_str(),
        "-R",
        bcl_dir.as_str(),
        "-o",
        fastq_dir.as_str(),
    ]));
    log_command(runner, &bcl2fastq)?;

    reorganize_output(&paths.fastqs, args.skip_undetermined, args.star_structure)?;

    let rawdata_uri = s3_join(&args.s3_output_dir, &[args.exp_id.as_str(), "rawdata"]);
    retry_command(
        runner,
        &argv(&[
            "aws",
            "s3",
            "sync",
            fastq_dir.as_str(),
            rawdata_uri.as_str(),
            "--exclude",
            "*",
            "--include",
            "*fastq.gz",
        ]),
        "sync fastqs",
        &rawdata_uri,
    )?;

    log_command(
        runner,
        &argv(&["aws", "s3", "ls", "--recursive", rawdata_uri.as_str()]),
    )?;

    let reports_path = find_report_dir(&paths.fastqs)?.display().to_string();
    let report_uri = s3_join(&args.s3_report_dir, &[args.exp_id.as_str()]);
    retry_command(
        runner,
        &argv(&[
            "aws",
            "s3",
            "cp",
            reports_path.as_str(),
            report_uri.as_str(),
            "--recursive",
        ]),
        "cp reports",
        &report_uri,
    )?;

    Ok(())
}

/// Upload the run's own log file to the fixed log store. Called on both
/// the success and the failure path; the caller is expected not to let
/// a failure here mask the run's result.
pub fn upload_run_log(runner: &mut dyn CommandRunner, log_file: &Path) -> Result<()> {
    let log_path = log_file.display().to_string();
    let cp = argv(&["aws", "s3", "cp", log_path.as_str(), S3_LOG_DIR]);
    log_command(runner, &cp)?;
    Ok(())
}
