//! Command line tool over the `linear` engine: region file conversion,
//! directory inspection and governor dry runs.
//!
//! Exit codes: 0 on success, 2 for invalid arguments, 3 for I/O failures,
//! 4 for validation failures.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use linear::codec::CompressionService;
use linear::config::{CacheConfig, Config, StorageConfig};
use linear::engine::Engine;
use linear::governor::AdjustmentMode;
use linear::region::anvil::{AnvilError, AnvilRegion};
use linear::region::convert::{ConvertError, RegionConverter};
use linear::region::linear::{LinearError, LinearReader};
use linear::region::RegionFormat;


const EXIT_INVALID_ARGS: u8 = 2;
const EXIT_IO: u8 = 3;
const EXIT_VALIDATION: u8 = 4;


#[derive(Parser)]
#[command(name = "linear", version, about = "Convert and inspect Linear and Anvil region files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a single region file, formats detected from the extensions.
    Convert {
        src: PathBuf,
        dst: PathBuf,
    },
    /// Convert every region file of a directory into the target format.
    ConvertDir {
        src_dir: PathBuf,
        dst_dir: PathBuf,
        /// Target format.
        #[arg(long, value_enum)]
        to: FormatArg,
    },
    /// Summarize the region files of a directory.
    Stats {
        dir: PathBuf,
    },
    /// Show the resource plan a governor mode yields on this machine.
    GovernorMode {
        mode: ModeArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Lrf,
    Mca,
}

impl From<FormatArg> for RegionFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Lrf => RegionFormat::Linear,
            FormatArg::Mca => RegionFormat::Anvil,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Conservative,
    Balanced,
    Aggressive,
    Adaptive,
}

impl From<ModeArg> for AdjustmentMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Conservative => AdjustmentMode::Conservative,
            ModeArg::Balanced => AdjustmentMode::Balanced,
            ModeArg::Aggressive => AdjustmentMode::Aggressive,
            ModeArg::Adaptive => AdjustmentMode::Adaptive,
        }
    }
}


fn main() -> ExitCode {

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    ExitCode::from(run(cli))

}

fn run(cli: Cli) -> u8 {
    match cli.command {
        Command::Convert { src, dst } => convert(&src, &dst),
        Command::ConvertDir { src_dir, dst_dir, to } => convert_dir(&src_dir, &dst_dir, to.into()),
        Command::Stats { dir } => stats(&dir),
        Command::GovernorMode { mode } => governor_mode(mode.into()),
    }
}

fn conversion_service() -> CompressionService {
    // Default levels always validate for the migration context.
    CompressionService::for_migration(&Config::default().compression).unwrap()
}

fn convert(src: &Path, dst: &Path) -> u8 {

    let converter = RegionConverter::new(conversion_service().into());
    match converter.convert_file(src, dst) {
        Ok(report) => {
            println!("{}: {} chunks converted, {} skipped", dst.display(), report.converted, report.skipped.len());
            for skip in &report.skipped {
                println!("  skipped {}/{}: {}", skip.cx, skip.cz, skip.reason);
            }
            0
        }
        Err(err) => {
            eprintln!("conversion failed: {err}");
            convert_exit_code(&err)
        }
    }

}

fn convert_dir(src_dir: &Path, dst_dir: &Path, to: RegionFormat) -> u8 {

    let converter = RegionConverter::new(conversion_service().into());
    match converter.convert_directory(src_dir, dst_dir, to) {
        Ok(report) => {
            for (path, outcome) in &report.files {
                match outcome {
                    Ok(file) => println!("{}: {} chunks, {} skipped", path.display(), file.converted, file.skipped.len()),
                    Err(reason) => println!("{}: FAILED: {reason}", path.display()),
                }
            }
            println!("{}", report.summary());
            if report.failed == 0 { 0 } else { EXIT_VALIDATION }
        }
        Err(err) => {
            eprintln!("directory conversion failed: {err}");
            convert_exit_code(&err)
        }
    }

}

fn convert_exit_code(err: &ConvertError) -> u8 {
    match err {
        ConvertError::SameFormat(_) | ConvertError::UnknownFormat(_) => EXIT_INVALID_ARGS,
        ConvertError::Io(_)
        | ConvertError::Anvil(AnvilError::Io(_))
        | ConvertError::Linear(LinearError::Io(_)) => EXIT_IO,
        _ => EXIT_VALIDATION,
    }
}

fn stats(dir: &Path) -> u8 {
    match gather_stats(dir) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("stats failed: {err:#}");
            EXIT_IO
        }
    }
}

fn gather_stats(dir: &Path) -> anyhow::Result<()> {

    let mut paths = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| RegionFormat::detect(path).is_some())
        .collect::<Vec<_>>();
    paths.sort();

    let mut linear_files = 0usize;
    let mut anvil_files = 0usize;
    let mut chunks = 0usize;
    let mut bytes = 0u64;
    let mut unreadable = 0usize;

    for path in &paths {
        let len = std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        match RegionFormat::detect(path) {
            Some(RegionFormat::Linear) => match LinearReader::open(path) {
                Ok(reader) => {
                    println!("{}: linear, {} chunks, {len} bytes", path.display(), reader.len());
                    linear_files += 1;
                    chunks += reader.len();
                    bytes += len;
                }
                Err(err) => {
                    println!("{}: unreadable: {err}", path.display());
                    unreadable += 1;
                }
            },
            Some(RegionFormat::Anvil) => match AnvilRegion::open(path, false) {
                Ok(region) => {
                    let count = region.occupied().count();
                    println!("{}: anvil, {count} chunks, {len} bytes", path.display());
                    anvil_files += 1;
                    chunks += count;
                    bytes += len;
                }
                Err(err) => {
                    println!("{}: unreadable: {err}", path.display());
                    unreadable += 1;
                }
            },
            None => {}
        }
    }

    println!("{linear_files} linear, {anvil_files} anvil, {chunks} chunks, {bytes} bytes, {unreadable} unreadable");
    Ok(())

}

fn governor_mode(mode: AdjustmentMode) -> u8 {

    // A throwaway engine with the cache disabled: nothing touches disk, we
    // only want the sizing decision for this machine.
    let config = Config {
        storage: StorageConfig {
            cache: CacheConfig { enabled: false, ..CacheConfig::default() },
            ..StorageConfig::default()
        },
        ..Config::default()
    };

    let engine = match Engine::new(config, ".") {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("cannot build engine: {err}");
            return EXIT_VALIDATION;
        }
    };

    engine.set_governor_mode(mode);
    let decision = engine.governor().adjust_now();
    println!("mode: {}", mode.name());
    println!("tier: {:?}", decision.tier);
    println!(
        "pools: load {}, write {}, compress {}, decompress {}",
        decision.pools.load, decision.pools.write, decision.pools.compress, decision.pools.decompress,
    );
    println!("max concurrent tasks: {}", decision.max_concurrent);
    println!("prefetch radius (requested 32): {}", engine.effective_prefetch_radius(32));
    engine.shutdown();

    0

}
