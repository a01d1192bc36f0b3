//! Command-line configuration (§6).

use std::path::PathBuf;

use clap::Parser;

use crate::archive::OnlyFirst;

/// Project a source directory onto a mount point, rewriting multi-volume
/// RAR archives as their contained files.
#[derive(Debug, Parser)]
#[command(name = "rardirfs", version, about)]
pub struct Config {
    /// Directory to project.
    pub source_dir: PathBuf,

    /// Where to mount the projected filesystem.
    pub mountpoint: PathBuf,

    /// File of regular expressions (one per line); matching names are
    /// hidden from the projection.
    #[arg(long)]
    pub filter: Option<PathBuf>,

    /// File of regular expressions (one per line); matching directories
    /// are flattened into their parent.
    #[arg(long)]
    pub flatten: Option<PathBuf>,

    /// How many volumes of a multi-volume archive to read when listing it.
    #[arg(long, value_enum, default_value = "auto")]
    pub only_first: OnlyFirst,

    /// Serve compressed entries via an external extractor. Uncompressed
    /// (store-method) entries are always served directly.
    #[arg(long, default_value_t = false)]
    pub enable_unrar: bool,

    /// Where the extraction cache for compressed entries is kept.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Run the filesystem in the foreground instead of daemonizing.
    #[arg(long, default_value_t = false)]
    pub foreground: bool,
}

impl Config {
    /// The effective extraction cache directory: `--cache-dir`, or a
    /// `.rardirfs-cache` directory alongside the mount point.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.mountpoint.join(".rardirfs-cache"))
    }
}
