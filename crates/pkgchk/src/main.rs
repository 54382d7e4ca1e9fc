use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use tokio::task::spawn_blocking;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use bytetide::{
    error::Error, hash::HexHash, manifest::Manifest, merkle::MerkleTree,
};

/// Inspect a package manifest and the file it describes.
#[derive(Parser, Debug)]
#[clap(name = "pkgchk")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the manifest, the package file is resolved next to it.
    manifest: PathBuf,

    #[command(subcommand)]
    query: Query,

    /// Log debug messages to stderr.
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Query {
    /// Every expected hash of the tree, level order.
    AllHashes,
    /// Hashes of the chunks whose bytes match the manifest.
    ChunkCheck,
    /// Smallest set of hashes covering what is complete and what is not.
    MinHashes,
    /// Chunk hashes under the node with the given hash.
    HashesOf { hash: String },
    /// Create the package file if it does not exist.
    FileCheck,
}

async fn build(manifest: Manifest, path: PathBuf) -> Result<MerkleTree, Error> {
    spawn_blocking(move || MerkleTree::build(&manifest, &path)).await?
}

async fn run(args: Args) -> Result<Vec<String>, Error> {
    let manifest = Manifest::load(&args.manifest).await?;
    let dir = args.manifest.parent().unwrap_or(Path::new(""));
    let path = manifest.resolve(dir);

    if let Query::FileCheck = args.query {
        let check = manifest.file_check(&path).await?;
        return Ok(vec![check.to_string()]);
    }

    let tree = build(manifest, path).await?;

    let hashes = match args.query {
        Query::AllHashes => tree.all_hashes()?,
        Query::ChunkCheck => tree.completed_chunks()?,
        Query::MinHashes => tree.min_hashes()?,
        Query::HashesOf { hash } => tree.hashes_of(&hash.parse::<HexHash>()?)?,
        Query::FileCheck => vec![],
    };

    Ok(hashes.iter().map(HexHash::to_string).collect())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not set the logger: {e}");
    }

    match run(args).await {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
