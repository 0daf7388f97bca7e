use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, LevelFilter};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use oci2nydus::{
    locator, BackendConfig, BlobDescriptor, CancelToken, ConvertOptions, FsVersion, Layer,
    MergeOptions, NydusConverter, NydusImage,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum RafsVersion {
    #[value(name = "5")]
    V5,
    #[value(name = "6")]
    V6,
}

impl From<RafsVersion> for FsVersion {
    fn from(version: RafsVersion) -> Self {
        match version {
            RafsVersion::V5 => FsVersion::V5,
            RafsVersion::V6 => FsVersion::V6,
        }
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace)"
    )]
    verbose: u8,

    #[arg(
        long,
        global = true,
        help = "Path to the nydus-image builder binary (default: $NYDUS_BUILDER or nydus-image)"
    )]
    builder: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Convert one OCI layer tar(.gz) into a nydus tar blob
    Convert {
        #[arg(help = "OCI layer tar file, plain or gzipped")]
        source: PathBuf,

        #[arg(short, long, help = "Output path for the nydus tar blob")]
        output: PathBuf,

        #[arg(long, value_enum, default_value = "6", help = "RAFS format version")]
        fs_version: RafsVersion,

        #[arg(long, help = "Bootstrap of a chunk dict image for deduplication")]
        chunk_dict: Option<PathBuf>,

        #[arg(long = "prefetch", help = "File path pattern to prefetch (repeatable)")]
        prefetch_patterns: Vec<String>,

        #[arg(long, help = "Builder timeout in seconds")]
        timeout: Option<u64>,

        #[arg(long, help = "Root directory for scratch space")]
        work_dir: Option<PathBuf>,
    },

    /// Merge per-layer nydus blobs into one overlay bootstrap
    Merge {
        #[arg(required = true, help = "Nydus blob files, bottom-most layer first")]
        blobs: Vec<PathBuf>,

        #[arg(short, long, help = "Output path for the merged bootstrap")]
        output: PathBuf,

        #[arg(long, help = "Wrap the bootstrap in a tar stream")]
        tar: bool,

        #[arg(long, help = "Bootstrap of a chunk dict image for deduplication")]
        chunk_dict: Option<PathBuf>,

        #[arg(long = "prefetch", help = "File path pattern to prefetch (repeatable)")]
        prefetch_patterns: Vec<String>,

        #[arg(long, help = "Merge tool timeout in seconds")]
        timeout: Option<u64>,

        #[arg(long, help = "Root directory for scratch space")]
        work_dir: Option<PathBuf>,
    },

    /// Extract the bootstrap from a nydus blob
    Unpack {
        #[arg(help = "Nydus tar blob")]
        blob: PathBuf,

        #[arg(short, long, help = "Output path for the bootstrap")]
        output: PathBuf,
    },

    /// Push a blob to a storage backend
    Push {
        #[arg(help = "Blob file to push")]
        blob: PathBuf,

        #[arg(short, long, help = "Backend configuration JSON file")]
        config: PathBuf,

        #[arg(long, help = "Only query existence instead of uploading")]
        check: bool,
    },
}

fn spinner(quiet_mode: bool, message: &str) -> Option<ProgressBar> {
    if !quiet_mode {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message.to_string());
    Some(pb)
}

fn sha256_of(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)
        .with_context(|| format!("hash {}", path.display()))?;
    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), size))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_env(Env::default())
        .filter_level(log_level)
        .init();

    let quiet_mode = cli.verbose == 0;
    let tool = match &cli.builder {
        Some(path) => NydusImage::new(path),
        None => NydusImage::from_env(),
    };
    let converter = NydusConverter::new(tool);
    let token = CancelToken::new();

    match cli.command {
        Command::Convert {
            source,
            output,
            fs_version,
            chunk_dict,
            prefetch_patterns,
            timeout,
            work_dir,
        } => {
            info!("converting layer {}", source.display());
            let pb = spinner(quiet_mode, "Converting layer...");

            let options = ConvertOptions {
                work_dir,
                fs_version: fs_version.into(),
                chunk_dict,
                prefetch_patterns,
                timeout: timeout.map(Duration::from_secs),
            };

            let mut input =
                File::open(&source).with_context(|| format!("open {}", source.display()))?;
            let output_file =
                File::create(&output).with_context(|| format!("create {}", output.display()))?;

            let mut stream = converter.convert(&token, io::BufWriter::new(output_file), options)?;
            io::copy(&mut input, &mut stream).context("stream layer into converter")?;
            let mut dest = stream.finish()?;
            dest.flush().context("flush output blob")?;

            if let Some(pb) = pb {
                pb.finish_with_message(format!("Converted to {}", output.display()));
            }
            info!("wrote nydus blob {}", output.display());
        }

        Command::Merge {
            blobs,
            output,
            tar,
            chunk_dict,
            prefetch_patterns,
            timeout,
            work_dir,
        } => {
            info!("merging {} layers", blobs.len());
            let pb = spinner(quiet_mode, "Merging bootstraps...");

            let mut files = Vec::with_capacity(blobs.len());
            let mut digests = Vec::with_capacity(blobs.len());
            for path in &blobs {
                let (digest, _) = sha256_of(path)?;
                debug!("layer {} is {}", path.display(), digest);
                files.push(File::open(path).with_context(|| format!("open {}", path.display()))?);
                digests.push(digest);
            }
            let layers: Vec<Layer<'_>> = files
                .iter()
                .zip(&digests)
                .map(|(file, digest)| Layer {
                    digest: digest.clone(),
                    original_digest: None,
                    content: file,
                })
                .collect();

            let options = MergeOptions {
                work_dir,
                chunk_dict,
                prefetch_patterns,
                with_tar: tar,
                timeout: timeout.map(Duration::from_secs),
            };

            let output_file =
                File::create(&output).with_context(|| format!("create {}", output.display()))?;
            let mut dest = io::BufWriter::new(output_file);
            converter.merge(&token, &layers, &mut dest, options)?;
            dest.flush().context("flush merged bootstrap")?;

            if let Some(pb) = pb {
                pb.finish_with_message(format!("Merged into {}", output.display()));
            }
            info!("wrote overlay bootstrap {}", output.display());
        }

        Command::Unpack { blob, output } => {
            let blob_file =
                File::open(&blob).with_context(|| format!("open {}", blob.display()))?;
            let output_file =
                File::create(&output).with_context(|| format!("create {}", output.display()))?;
            let mut dest = io::BufWriter::new(output_file);
            let copied = locator::unpack_bootstrap(&blob_file, &mut dest)?;
            dest.flush().context("flush bootstrap")?;
            info!("wrote {} bootstrap bytes to {}", copied, output.display());
        }

        Command::Push {
            blob,
            config,
            check,
        } => {
            let config_bytes =
                fs::read(&config).with_context(|| format!("read {}", config.display()))?;
            let backend = BackendConfig::from_json(&config_bytes)?.connect()?;

            let (digest, size) = sha256_of(&blob)?;
            let desc = BlobDescriptor::new(digest, size);

            if check {
                let key = backend.check(&desc.digest)?;
                println!("{}", key);
                return Ok(());
            }

            let pb = spinner(quiet_mode, "Pushing blob...");
            let blob_file =
                File::open(&blob).with_context(|| format!("open {}", blob.display()))?;
            backend.push(&token, &blob_file, &desc)?;
            if let Some(pb) = pb {
                pb.finish_with_message(format!("Pushed {}", desc.digest));
            }
            info!(
                "pushed {} ({} bytes) to {} backend",
                desc.digest,
                size,
                backend.kind()
            );
        }
    }

    Ok(())
}
