//! Chunkdrive CLI: create, mount, and check chunk-backed NBD drives.

use anyhow::Result;
use chunkdrive::engine::arg_parser::{Cli, Commands};
use chunkdrive::utils::{Config, setup_logging};
use chunkdrive::{lifecycle, nbd};
use clap::Parser;
use std::time::Instant;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Create {
            name,
            size,
            chunk,
            fs,
            device,
        } => {
            let config = Config::load()?;
            lifecycle::create(&config, &name, size, chunk, fs, &device)?;
        }
        Commands::Mount { name, device } => {
            let config = Config::load()?;
            lifecycle::mount(&config, &name, &device)?;
        }
        Commands::Umount { name, device } => {
            let config = Config::load()?;
            lifecycle::umount(&config, &name, &device)?;
        }
        Commands::Check { name } => {
            let config = Config::load()?;
            lifecycle::check(&config, &name)?;
        }
        Commands::Status { name } => {
            let config = Config::load()?;
            println!("{}", lifecycle::status(&config, &name));
        }
        Commands::InternalServe {
            path,
            name,
            chunk_mb,
            total_chunks,
            device,
        } => {
            nbd::run_server(&path, &name, chunk_mb, total_chunks, &device)?;
        }
    }

    log::debug!("Total time: {:?}", start_time.elapsed());
    Ok(())
}
