use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    /// Host directory to pack
    #[arg(long, short)]
    pub source: PathBuf,

    /// Output image file
    #[arg(long, short)]
    pub image: PathBuf,

    /// Image size in MiB
    #[arg(long, default_value_t = 64)]
    pub size_mib: u64,

    /// Sectors per cluster, chosen from the image size when omitted
    #[arg(long)]
    pub cluster_sectors: Option<usize>,

    /// Entries in the sector cache
    #[arg(long, default_value_t = 256)]
    pub cache_entries: usize,

    /// Remount the image read-only and compare every file with the host copy
    #[arg(long)]
    pub read_back: bool,
}
