use std::path::{Path, PathBuf};

use anyhow::Context;
use bucketfs::Config;
use bucketfs::Vfs;
use bucketfs::cadapter::client::ObjectClient;
use bucketfs::cadapter::localfs::LocalFsBackend;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bucketfs")]
#[command(
    about = "Buffered writes and cached reads against a versioned object store",
    long_about = None
)]
struct Cli {
    /// Directory holding the local object store
    #[arg(long, value_name = "DIR", default_value = "./bucketfs-data")]
    data_dir: PathBuf,

    /// YAML config file; falls back to ./bucketfs.yml or the defaults
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "BYTES")]
    block_size: Option<u64>,

    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<u64>,

    #[arg(long, value_name = "BYTES")]
    cache_capacity: Option<u64>,

    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[arg(long)]
    no_chunk_cache: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Upload a local file through the buffered write path")]
    Put {
        #[arg(value_name = "SRC")]
        src: PathBuf,
        #[arg(value_name = "NAME")]
        name: String,
        /// Append to the existing object instead of replacing it
        #[arg(long)]
        append: bool,
    },
    #[command(about = "Print an object (or a range of it) to stdout")]
    Cat {
        #[arg(value_name = "NAME")]
        name: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: Option<u64>,
    },
    #[command(about = "Show size and generation of an object")]
    Stat {
        #[arg(value_name = "NAME")]
        name: String,
    },
    #[command(about = "Delete an object")]
    Rm {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => Config::from_default_path()?,
        };
        if let Some(v) = self.block_size {
            config = config.block_size(v);
        }
        if let Some(v) = self.chunk_size {
            config = config.chunk_size(v);
        }
        if let Some(v) = self.cache_capacity {
            config = config.cache_capacity(v);
        }
        if let Some(dir) = &self.cache_dir {
            config = config.cache_dir(dir.clone());
        }
        if self.no_chunk_cache {
            config = config.chunk_cache_enabled(false);
        }
        config.validate()?;
        Ok(config)
    }
}

// read buffer for `put`; writes are re-blocked by the handler anyway
const COPY_BUF: usize = 1 << 20;

async fn put(vfs: &Vfs, src: &Path, name: &str, append: bool) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {}", src.display()))?;
    let fh = if append {
        vfs.open_append(name).await?
    } else {
        vfs.create(name).await?
    };
    let cancel = CancellationToken::new();
    let mut offset = vfs.write_file_info(fh)?.total_size;
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        vfs.write(fh, &buf[..n], offset, &cancel).await?;
        offset += n as u64;
    }
    let generation = vfs.flush(fh).await?;
    vfs.release(fh).await?;
    info!(name, size = offset, generation, "upload complete");
    Ok(())
}

async fn cat(vfs: &Vfs, name: &str, offset: u64, length: Option<u64>) -> anyhow::Result<()> {
    let fh = vfs.open_read(name).await?;
    let size = vfs.stat(name).await?.size;
    let end = length.map_or(size, |l| offset.saturating_add(l).min(size));
    let cancel = CancellationToken::new();
    let mut stdout = tokio::io::stdout();
    let mut pos = offset;
    let step = vfs.config().read.chunk_size.max(1);
    while pos < end {
        let len = step.min(end - pos) as usize;
        let data = vfs.read(fh, pos, len, &cancel).await?;
        if data.is_empty() {
            break;
        }
        stdout.write_all(&data).await?;
        pos += data.len() as u64;
    }
    stdout.flush().await?;
    vfs.release(fh).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bucketfs=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let client = ObjectClient::new(LocalFsBackend::new(&cli.data_dir));
    let vfs = Vfs::new(config, client).await?;

    match &cli.command {
        Commands::Put { src, name, append } => put(&vfs, src, name, *append).await,
        Commands::Cat {
            name,
            offset,
            length,
        } => cat(&vfs, name, *offset, *length).await,
        Commands::Stat { name } => {
            let attr = vfs.stat(name).await?;
            println!("{}\tsize={}\tgeneration={}", attr.name, attr.size, attr.generation);
            Ok(())
        }
        Commands::Rm { name } => {
            vfs.unlink(name).await?;
            Ok(())
        }
    }
}
