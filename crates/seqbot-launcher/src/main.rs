use anyhow::Result;
use clap::Parser;

use seqbot_core::{init_logging, SystemRunner};
use seqbot_launcher::{run_launch, LaunchArgs};

fn main() -> Result<()> {
    let args = LaunchArgs::parse();
    init_logging(args.debug, None)?;

    let mut runner = SystemRunner;
    run_launch(&args, &mut runner)?;
    Ok(())
}
