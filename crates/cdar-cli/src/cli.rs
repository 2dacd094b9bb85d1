use crate::config::CdarConfig;
use anyhow::{Context, Result};
use cdar_engine::archive::{self, StoreConfig};
use cdar_engine::{
    new_cancel_pair, parse_size, CancelHandle, ChunkerConfig, CompressionAlgorithm, PackConfig,
    Packer, UnpackConfig, Unpacker,
};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "cdar", version)]
#[command(about = "Content-defined chunking archiver", long_about = None)]
pub struct Cli {
    /// Settings file (.toml or .json); flags override it
    #[arg(short, long, global = true, env = "CDAR_CONFIG")]
    pub config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Pack a file (or stdin) into an archive
    Compress(CompressArgs),
    /// Rebuild the original file from an archive
    Unpack(UnpackArgs),
    /// Print the dictionary summary of an archive
    Info {
        input: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CodecArg {
    None,
    Lz4,
    Zstd,
    Lzma,
}

#[derive(Args)]
pub struct CompressArgs {
    /// Input file; stdin when omitted
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    pub output: PathBuf,

    #[arg(long, value_parser = size_arg)]
    pub avg_chunk_size: Option<usize>,

    #[arg(long, value_parser = size_arg)]
    pub min_chunk_size: Option<usize>,

    #[arg(long, value_parser = size_arg)]
    pub max_chunk_size: Option<usize>,

    #[arg(long, value_parser = size_arg)]
    pub hash_window: Option<usize>,

    /// Bytes of each chunk checksum to keep
    #[arg(long)]
    pub hash_length: Option<usize>,

    #[arg(long, value_enum)]
    pub compression: Option<CodecArg>,

    #[arg(long)]
    pub compression_level: Option<i32>,

    /// Store chunks in this file instead of the archive
    #[arg(long, conflicts_with = "chunk_dir")]
    pub chunk_file: Option<PathBuf>,

    /// Store one file per chunk in this directory
    #[arg(long)]
    pub chunk_dir: Option<PathBuf>,

    /// Overwrite an existing archive
    #[arg(short, long)]
    pub force_create: bool,

    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Args)]
pub struct UnpackArgs {
    pub input: PathBuf,

    pub output: PathBuf,

    /// Chunk file or directory, when moved away from where it was recorded
    #[arg(long)]
    pub chunk_location: Option<PathBuf>,

    /// Skip chunk and output checksum verification
    #[arg(long)]
    pub no_verify: bool,

    /// Local file that may already hold chunks of the output (repeatable)
    #[arg(long = "seed", value_name = "FILE")]
    pub seeds: Vec<PathBuf>,

    #[arg(long)]
    pub workers: Option<usize>,
}

fn size_arg(s: &str) -> std::result::Result<usize, String> {
    parse_size(s).map_err(|e| e.to_string())
}

impl CompressArgs {
    /// Apply the flags on top of `base`
    pub fn pack_config(&self, mut base: PackConfig) -> Result<PackConfig> {
        let chunker = &base.chunker;
        let window = self.hash_window.unwrap_or(chunker.window_size);
        let hash_length = self.hash_length.unwrap_or(chunker.hash_length);
        base.chunker = if self.avg_chunk_size.is_some()
            || self.min_chunk_size.is_some()
            || self.max_chunk_size.is_some()
        {
            ChunkerConfig::with_avg_size(
                self.avg_chunk_size.unwrap_or(chunker.avg_size()),
                self.min_chunk_size.unwrap_or(chunker.min_size),
                self.max_chunk_size.unwrap_or(chunker.max_size),
                window,
                hash_length,
            )?
        } else {
            ChunkerConfig {
                window_size: window,
                hash_length,
                ..*chunker
            }
        };

        base.compression = match (self.compression, self.compression_level, base.compression) {
            (Some(CodecArg::None), None, _) => CompressionAlgorithm::None,
            (Some(CodecArg::Lz4), None, _) => CompressionAlgorithm::Lz4,
            (Some(CodecArg::Zstd), level, CompressionAlgorithm::Zstd { level: current }) => {
                CompressionAlgorithm::Zstd {
                    level: level.unwrap_or(current),
                }
            }
            (Some(CodecArg::Zstd), level, _) => CompressionAlgorithm::Zstd {
                level: level.unwrap_or(6),
            },
            (Some(CodecArg::Lzma), level, CompressionAlgorithm::Lzma { level: current }) => {
                CompressionAlgorithm::Lzma {
                    level: lzma_level(level)?.unwrap_or(current),
                }
            }
            (Some(CodecArg::Lzma), level, _) => CompressionAlgorithm::Lzma {
                level: lzma_level(level)?.unwrap_or(6),
            },
            (None, Some(level), CompressionAlgorithm::Zstd { .. }) => {
                CompressionAlgorithm::Zstd { level }
            }
            (None, Some(level), CompressionAlgorithm::Lzma { .. }) => CompressionAlgorithm::Lzma {
                level: lzma_level(Some(level))?.unwrap_or(6),
            },
            (None, None, current) => current,
            (_, Some(_), _) => anyhow::bail!("--compression-level only applies to zstd and lzma"),
        };
        if let Some(workers) = self.workers {
            base.workers = workers;
        }
        base.validate()?;
        Ok(base)
    }

    pub fn store(&self) -> StoreConfig {
        match (&self.chunk_file, &self.chunk_dir) {
            (Some(file), _) => StoreConfig::External(file.clone()),
            (None, Some(dir)) => StoreConfig::PerChunk(dir.clone()),
            (None, None) => StoreConfig::Embedded,
        }
    }
}

/// Input file, or stdin unless it is an interactive terminal
fn open_input(input: Option<&Path>, stdin_is_terminal: bool) -> Result<Box<dyn Read + Send>> {
    match input {
        Some(path) => Ok(Box::new(
            std::fs::File::open(path)
                .with_context(|| format!("opening input {}", path.display()))?,
        )),
        None if stdin_is_terminal => anyhow::bail!("Missing input file (stdin is a terminal)"),
        None => Ok(Box::new(std::io::stdin())),
    }
}

fn lzma_level(level: Option<i32>) -> Result<Option<u32>> {
    level
        .map(|l| u32::try_from(l).context("lzma level must not be negative"))
        .transpose()
}

impl UnpackArgs {
    pub fn unpack_config(&self, mut base: UnpackConfig) -> UnpackConfig {
        base.seeds.extend(self.seeds.iter().cloned());
        if self.no_verify {
            base.verify_chunks = false;
            base.verify_output = false;
        }
        if let Some(workers) = self.workers {
            base.workers = workers;
        }
        base
    }
}

impl Cli {
    pub fn load_config(&self) -> Result<CdarConfig> {
        match &self.config {
            Some(path) => CdarConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display())),
            None => Ok(CdarConfig::default()),
        }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Compress(ref args) => Self::compress(args, config).await,
            Command::Unpack(ref args) => Self::unpack(args, config).await,
            Command::Info { ref input } => Self::info(input).await,
        }
    }

    async fn compress(args: &CompressArgs, config: CdarConfig) -> Result<()> {
        let pack = args.pack_config(config.pack)?;
        let (token, handle) = new_cancel_pair();
        cancel_on_ctrl_c(handle);
        let packer = Packer::new(pack)?.with_cancel(token);

        let source = open_input(args.input.as_deref(), std::io::stdin().is_terminal())?;

        let outcome = archive::create(source, &args.output, &args.store(), &packer, args.force_create)
            .await
            .with_context(|| format!("creating archive {}", args.output.display()))?;

        let stats = &outcome.stats;
        println!("Source:        {}", Self::format_bytes(stats.input_bytes));
        println!("Chunks:        {} ({} unique)", stats.chunks, stats.unique_chunks);
        println!("Deduplicated:  {}", stats.deduplicated_chunks);
        println!("Stored:        {}", Self::format_bytes(stats.stored_bytes));
        println!(
            "Ratios:        dedup {:.2}x, compression {:.2}x",
            stats.dedup_ratio(),
            stats.compression_ratio()
        );
        Ok(())
    }

    async fn unpack(args: &UnpackArgs, config: CdarConfig) -> Result<()> {
        let (token, handle) = new_cancel_pair();
        cancel_on_ctrl_c(handle);
        let unpacker = Unpacker::new(args.unpack_config(config.unpack))?.with_cancel(token);
        let stats = archive::extract(
            &args.input,
            &args.output,
            &unpacker,
            args.chunk_location.as_deref(),
        )
        .await
        .with_context(|| format!("unpacking {}", args.input.display()))?;
        println!(
            "Wrote {} in {} chunks ({} unique)",
            Self::format_bytes(stats.bytes_written),
            stats.placements,
            stats.descriptors
        );
        if stats.seeded > 0 {
            println!("Reused {} chunks from seed files", stats.seeded);
        }
        Ok(())
    }

    async fn info(input: &Path) -> Result<()> {
        let archive = archive::open(input)
            .await
            .with_context(|| format!("reading {}", input.display()))?;
        println!("{}", archive.summary());
        println!("Header size:     {} bytes", archive.data_offset());
        Ok(())
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
        let mut value = bytes as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{bytes} B")
        } else {
            format!("{value:.2} {}", UNITS[unit])
        }
    }
}

fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            handle.cancel();
        }
    });
}
