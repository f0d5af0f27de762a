use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    /// Directory of files to pack
    #[arg(long, short)]
    pub source: PathBuf,

    /// Output directory for fs.img
    #[arg(long, short = 'O')]
    pub out_dir: PathBuf,
}
