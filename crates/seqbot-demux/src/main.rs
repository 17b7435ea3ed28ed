use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::error;

use seqbot_core::{init_logging, SystemRunner};
use seqbot_demux::{run_demux, upload_run_log, DemuxArgs, BATCH_JOB_ID_ENV};

fn main() -> Result<()> {
    let args = DemuxArgs::parse();
    let batch_job_id = std::env::var(BATCH_JOB_ID_ENV).ok();
    let log_file = batch_job_id
        .as_deref()
        .map(|id| PathBuf::from(format!("{}.log", id)));
    init_logging(false, log_file.as_deref())?;

    let mut runner = SystemRunner;
    let result = run_demux(&args, batch_job_id.as_deref(), &mut runner);
    if let Err(err) = &result {
        error!("run failed: {:#}", err);
    }

    // The log goes up on both the success and the failure path, and a
    // failed upload must not mask the run's own result.
    if let Some(log_file) = &log_file {
        if let Err(err) = upload_run_log(&mut runner, log_file) {
            error!("couldn't upload the run log: {:#}", err);
        }
    }

    result
}
