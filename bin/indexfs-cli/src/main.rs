//! IndexFS CLI - index root inspection
//!
//! Offline commands for looking at what a logical file system left on
//! disk: committed versions, package files, compressed file sidecars and
//! load config documents.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indexfs_common::FileSystemConfig;
use indexfs_framework::{Version, list_version_in};
use indexfs_storage::layout::compress_info_path;
use indexfs_storage::{
    CompressFileInfo, ConfigDownloader, Directory, DownloadErrorCode, FileSystemOptions,
    LoadConfigList, LogicalFileSystem, MountOption, PackageMeta, PersistedEntryTable,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "indexfs-cli")]
#[command(about = "IndexFS inspection CLI")]
#[command(version)]
struct Args {
    /// Config file path (TOML)
    #[arg(short, long, env = "INDEXFS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Open mounted files as an offline build (never lock memory)
    #[arg(long)]
    offline: bool,

    /// Memory quota of the mounting file system in bytes (0 = unlimited)
    #[arg(long)]
    memory_quota_bytes: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a load config document and print its rules
    CheckLoadConfig {
        /// Load config JSON file
        path: PathBuf,
    },
    /// Show the sidecar of a compressed file
    CompressInfo {
        /// Physical path of the compressed file
        path: PathBuf,
    },
    /// List the entries of a package directory
    ListPackage {
        /// Physical package directory
        dir: PathBuf,
    },
    /// List the committed versions of an index root
    ListVersions {
        /// Physical index root
        root: PathBuf,
    },
    /// Mount a version and list the files it exposes
    Ls {
        /// Physical index root
        root: PathBuf,
        /// Version to mount, latest when omitted
        #[arg(short, long)]
        version: Option<u64>,
    },
    /// Download a config directory next to a local index
    Download {
        /// Remote config path
        remote: PathBuf,
        /// Local directory to download into
        local_dir: PathBuf,
        /// Retries on source errors
        #[arg(long, default_value_t = 3)]
        retry_times: u32,
    },
}

/// Contents of the `--config` file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    file_system: FileSystemConfig,
    /// Load config JSON used by `ls`
    load_config: Option<PathBuf>,
    /// Working directory of the file system `ls` mounts into
    work_dir: Option<PathBuf>,
}

impl CliConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    fn file_system_options(&self) -> Result<FileSystemOptions> {
        let load_configs = match &self.load_config {
            Some(path) => read_load_config(path)?,
            None => LoadConfigList::new(),
        };
        Ok(FileSystemOptions::new(self.file_system.clone(), load_configs))
    }
}

fn read_load_config(path: &Path) -> Result<LoadConfigList> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read load config {}", path.display()))?;
    Ok(LoadConfigList::from_json(&json)?)
}

fn check_load_config(path: &Path) -> Result<()> {
    let list = read_load_config(path)?;
    println!("Load Configs");
    println!("============");
    println!(
        "{:<24} {:<10} {:<12} {:<8} PATTERNS",
        "NAME", "STRATEGY", "LIFECYCLE", "DEPLOY"
    );
    println!("{}", "-".repeat(80));
    for config in list
        .load_configs()
        .iter()
        .chain(std::iter::once(list.default_config()))
    {
        println!(
            "{:<24} {:<10} {:<12} {:<8} {}",
            config.name(),
            config.strategy().name(),
            config
                .lifecycle()
                .map_or_else(|| "-".to_string(), ToString::to_string),
            config.is_deploy(),
            config.file_patterns().join(", ")
        );
    }
    println!();
    println!("Cache memory: {} bytes", list.total_cache_memory_size());
    println!("Load speed limit: {}", list.load_speed_limit_enabled());
    Ok(())
}

fn compress_info(path: &Path) -> Result<()> {
    let info_path = PathBuf::from(compress_info_path(&path.to_string_lossy()));
    let data = std::fs::read(&info_path)
        .with_context(|| format!("{} is not a compressed file", path.display()))?;
    let info = CompressFileInfo::from_json(&data)?;
    println!("Compressed File: {}", path.display());
    println!("Compressor:       {}", info.compressor_name);
    println!("Block size:       {}", info.block_size);
    println!("Blocks:           {}", info.block_count);
    println!("Compressed len:   {}", info.compress_file_len);
    println!("Decompressed len: {}", info.decompress_file_len);
    println!("Encoded mapper:   {}", info.enable_compress_address_mapper);
    for (key, value) in &info.additional_info {
        println!("  {key} = {value}");
    }
    Ok(())
}

fn list_package(dir: &Path) -> Result<()> {
    let meta = PackageMeta::load(dir)?;
    println!("Package: {} (checkpoint {})", dir.display(), meta.checkpoint);
    println!("{:<50} {:>6} {:>12} {:>12}", "FILE", "SHARD", "OFFSET", "LENGTH");
    println!("{}", "-".repeat(84));
    for (name, entry) in &meta.files {
        println!(
            "{:<50} {:>6} {:>12} {:>12}",
            name, entry.shard, entry.offset, entry.length
        );
    }
    for name in &meta.dirs {
        println!("{name}/");
    }
    Ok(())
}

fn list_versions(root: &Path) -> Result<()> {
    let versions = list_version_in(root)?;
    if versions.is_empty() {
        println!("No versions found");
        return Ok(());
    }
    println!("{:<10} {:<16} {:<10} SEGMENTS", "VERSION", "TIMESTAMP", "FILES");
    println!("{}", "-".repeat(70));
    for id in versions {
        let version = Version::load(root, id)?;
        let files = PersistedEntryTable::load(root, id.as_u64())
            .map_or_else(|_| "-".to_string(), |table| table.files.len().to_string());
        let segments: Vec<String> = version.segments().iter().map(ToString::to_string).collect();
        println!(
            "{:<10} {:<16} {:<10} {}",
            id,
            version.timestamp(),
            files,
            segments.join(",")
        );
    }
    Ok(())
}

fn ls(config: &CliConfig, root: &Path, version: Option<u64>) -> Result<()> {
    let version = match version {
        Some(version) => version,
        None => list_version_in(root)?
            .last()
            .map(|id| id.as_u64())
            .context("No versions found")?,
    };
    let work_dir = config
        .work_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("indexfs-cli"));
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create {}", work_dir.display()))?;

    let fs = LogicalFileSystem::create("indexfs-cli", &work_dir, config.file_system_options()?)?;
    fs.mount_version(root, version, "", MountOption::default(), &BTreeMap::new())?;
    info!("Mounted version {} of {}", version, root.display());
    let dir = Directory::new(Arc::new(fs), "")?;
    for path in dir.list_dir("", true)? {
        if dir.is_dir(&path)? {
            println!("{path}/");
        } else {
            println!("{:<60} {:>12}", path, dir.get_file_length(&path)?);
        }
    }
    Ok(())
}

fn download(remote: &Path, local_dir: &Path, retry_times: u32) -> Result<()> {
    let downloader = ConfigDownloader::new(retry_times, Duration::from_secs(1));
    match downloader.download_config(remote, local_dir) {
        DownloadErrorCode::None => {
            println!(
                "Downloaded to {}",
                ConfigDownloader::local_target(remote, local_dir)?.display()
            );
            Ok(())
        }
        DownloadErrorCode::DestError => {
            anyhow::bail!("Local disk refused the download into {}", local_dir.display())
        }
        DownloadErrorCode::NormalError => {
            anyhow::bail!("Failed to download {}", remote.display())
        }
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Merge CLI args with config file (CLI takes precedence)
    let mut config = CliConfig::load(args.config.as_deref())?;
    if args.offline {
        config.file_system.is_offline = true;
    }
    if let Some(quota) = args.memory_quota_bytes {
        config.file_system.memory_quota_bytes = quota;
    }

    match args.command {
        Commands::CheckLoadConfig { path } => check_load_config(&path),
        Commands::CompressInfo { path } => compress_info(&path),
        Commands::ListPackage { dir } => list_package(&dir),
        Commands::ListVersions { root } => list_versions(&root),
        Commands::Ls { root, version } => ls(&config, &root, version),
        Commands::Download {
            remote,
            local_dir,
            retry_times,
        } => download(&remote, &local_dir, retry_times),
    }
}
