use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use block_fs::{BlockCache, FileDevice, FileKind, FileSystem, BLOCK_SIZE};
use clap::{Parser, Subcommand};

type ImageFs = FileSystem<BlockCache<FileDevice>>;

#[derive(Debug, Parser)]
#[command(about = "Inspect and edit block-fs images")]
struct CliArgs {
    /// Backing image file.
    image: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a fresh image, truncating any existing file.
    Format,
    Mkdir { path: String },
    Touch { path: String },
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Copy a host file into the image.
    Put { host: PathBuf, path: String },
    /// Print a file to stdout.
    Cat { path: String },
    Rm { path: String },
    Mv { src: String, dst: String },
    Stat { path: String },
    /// Show free space.
    Df,
    /// Copy a host directory tree into the image root.
    Import { dir: PathBuf },
}

fn mount(image: &Path) -> Result<ImageFs> {
    let dev = FileDevice::open(image).with_context(|| format!("opening {}", image.display()))?;
    Ok(FileSystem::mount_on(BlockCache::new(dev))?)
}

fn copy_in(fs: &mut ImageFs, host: &Path, path: &str) -> Result<()> {
    let mut buf = vec![];
    File::open(host)?.read_to_end(&mut buf)?;

    fs.create(path, FileKind::Regular)?;
    if buf.is_empty() {
        return Ok(());
    }
    let fd = fs.open(path)?;
    let written = fs.write(fd, &buf)?;
    fs.close(fd)?;
    if written < buf.len() {
        bail!("image full: wrote {written} of {} bytes of {}", buf.len(), host.display());
    }
    Ok(())
}

fn import_dir(fs: &mut ImageFs, host_dir: &Path, prefix: &str) -> Result<()> {
    for ent in fs::read_dir(host_dir)? {
        let ent = ent?;
        let name = ent
            .file_name()
            .into_string()
            .map_err(|name| anyhow!("non UTF-8 file name {name:?}"))?;
        let path = format!("{prefix}/{name}");
        if ent.file_type()?.is_dir() {
            fs.create(&path, FileKind::Directory)?;
            import_dir(fs, &ent.path(), &path)?;
        } else {
            copy_in(fs, &ent.path(), &path).with_context(|| format!("importing {path}"))?;
        }
    }
    Ok(())
}

fn cat(fs: &mut ImageFs, path: &str) -> Result<()> {
    let fd = fs.open(path)?;
    let mut buf = [0; 4 * BLOCK_SIZE];
    let mut out = io::stdout().lock();
    loop {
        let n = fs.read(fd, &mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    fs.close(fd)?;
    Ok(())
}

fn run(args: CliArgs) -> Result<()> {
    let image = &args.image;
    let mut fs = match args.command {
        Command::Format => {
            let dev = FileDevice::create(image).with_context(|| format!("creating {}", image.display()))?;
            FileSystem::format_on(BlockCache::new(dev))?
        }
        _ => mount(image)?,
    };

    match args.command {
        Command::Format => {}
        Command::Mkdir { path } => fs.create(&path, FileKind::Directory)?,
        Command::Touch { path } => fs.create(&path, FileKind::Regular)?,
        Command::Ls { path } => {
            for record in fs.list_directory(&path)? {
                let kind = match record.kind {
                    FileKind::Directory => 'd',
                    FileKind::Regular => '-',
                };
                let size = fs.stat(&format!("{}/{}", path.trim_end_matches('/'), record.name))?.size;
                println!("{kind} {:>3} {size:>10} {}", record.inode, record.name);
            }
        }
        Command::Put { host, path } => copy_in(&mut fs, &host, &path)?,
        Command::Cat { path } => cat(&mut fs, &path)?,
        Command::Rm { path } => fs.remove(&path)?,
        Command::Mv { src, dst } => fs.move_entry(&src, &dst)?,
        Command::Stat { path } => println!("{:#?}", fs.stat(&path)?),
        Command::Df => {
            let free = fs.free_blocks();
            println!("{free} blocks free ({} KiB)", free * BLOCK_SIZE / 1024);
        }
        Command::Import { dir } => import_dir(&mut fs, &dir, "")?,
    }

    fs.unmount()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    run(CliArgs::parse())
}
