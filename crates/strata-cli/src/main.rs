use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use sha2::{Digest, Sha256};
use strata::{CancelToken, DirEntry, Error, FileKind, VfsOptions, default_vfs};

#[derive(Debug, Parser)]
#[command(name = "strata", about = "Browse disk images, partitions and archives.")]
struct Args {
    /// Register a disk image, NAME=PATH. May be repeated.
    #[arg(short, long = "image", value_name = "NAME=PATH")]
    images: Vec<String>,

    /// Mount a file as a loopback device before running the command,
    /// NAME=(dev)/path. May be repeated.
    #[arg(short = 'l', long = "loop", value_name = "NAME=PATH")]
    loops: Vec<String>,

    /// Assemble RAID arrays from the registered images.
    #[arg(long)]
    scan_raid: bool,

    /// Treat paths case-insensitively even on case-sensitive
    /// filesystems.
    #[arg(long)]
    ignore_case: bool,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, clap::Subcommand)]
enum Command {
    /// List a directory.
    Ls {
        path: String,
        /// Long listing: kind, size and mtime per entry.
        #[arg(short, long)]
        long: bool,
    },
    /// Write a file to stdout.
    Cat {
        path: String,
        /// Skip the transparent decompression filters.
        #[arg(long)]
        raw: bool,
    },
    /// Copy a file out of the stack.
    Extract { path: String, output: PathBuf },
    /// SHA-256 of a file.
    Hash { path: String },
    /// Identify the filesystem on a device spec like `hd0,gpt2`.
    Probe { device: String },
    /// List the partitions every map finds on a device.
    Parts { device: String },
    /// Dump USN change-journal records from a journal file.
    Usn {
        path: String,
        #[arg(long, default_value_t = 32)]
        limit: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(if args.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Warn
        })
        .init()?;

    let mut vfs = default_vfs(VfsOptions {
        case_sensitive: !args.ignore_case,
        ..Default::default()
    });

    for spec in &args.images {
        let (name, path) = spec
            .split_once('=')
            .with_context(|| format!("--image wants NAME=PATH, got `{spec}`"))?;
        vfs.add_image(name, path)
            .with_context(|| format!("registering {path}"))?;
    }
    if args.scan_raid {
        let found = vfs.scan_disk_filters()?;
        log::info!("assembled {found} array(s)");
    }
    for spec in &args.loops {
        let (name, path) = spec
            .split_once('=')
            .with_context(|| format!("--loop wants NAME=PATH, got `{spec}`"))?;
        let handle = vfs.open(path).with_context(|| format!("opening {path}"))?;
        vfs.loopback_add(name, handle)?;
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        let _ = ctrlc::set_handler(move || cancel.cancel());
    }

    match args.cmd {
        Command::Ls { path, long } => ls(&vfs, &path, long),
        Command::Cat { path, raw } => cat(&vfs, &path, raw, &cancel),
        Command::Extract { path, output } => extract(&vfs, &path, &output, &cancel),
        Command::Hash { path } => hash(&vfs, &path, &cancel),
        Command::Probe { device } => probe(&vfs, &device),
        Command::Parts { device } => parts(&vfs, &device),
        Command::Usn { path, limit } => usn(&vfs, &path, limit),
    }
}

fn format_entry(entry: &DirEntry) -> String {
    let kind = match entry.info.kind {
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        _ => '-',
    };
    let size = entry
        .info
        .size
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    let time = entry
        .info
        .mtime
        .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{kind} {size:>12} {time:>19}  {}", entry.name)
}

fn ls(vfs: &strata::Vfs, path: &str, long: bool) -> anyhow::Result<()> {
    let entries = vfs.read_dir(path)?;
    for entry in entries {
        if long {
            println!("{}", format_entry(&entry));
        } else {
            println!("{}", entry.name);
        }
    }
    Ok(())
}

/// Streams a handle to `out` in sector-sized chunks, honouring Ctrl-C
/// between reads.
fn stream(
    handle: &mut strata::FileHandle,
    mut out: impl Write,
    cancel: &CancelToken,
) -> Result<u64, Error> {
    let mut buf = vec![0u8; 1 << 16];
    let mut total = 0u64;
    loop {
        cancel.check()?;
        let got = handle.read(&mut buf)?;
        if got == 0 {
            return Ok(total);
        }
        out.write_all(&buf[..got])?;
        total += got as u64;
    }
}

fn cat(vfs: &strata::Vfs, path: &str, raw: bool, cancel: &CancelToken) -> anyhow::Result<()> {
    let mut handle = if raw {
        vfs.open_raw(path)?
    } else {
        vfs.open(path)?
    };
    stream(&mut handle, std::io::stdout().lock(), cancel)?;
    Ok(())
}

fn extract(
    vfs: &strata::Vfs,
    path: &str,
    output: &PathBuf,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let mut handle = vfs.open(path)?;
    let file = fs::File::create(output)
        .with_context(|| format!("creating {}", output.display()))?;
    let total = stream(&mut handle, file, cancel)?;
    eprintln!("{total} bytes -> {}", output.display());
    Ok(())
}

fn hash(vfs: &strata::Vfs, path: &str, cancel: &CancelToken) -> anyhow::Result<()> {
    let mut handle = vfs.open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        cancel.check()?;
        let got = handle.read(&mut buf)?;
        if got == 0 {
            break;
        }
        hasher.update(&buf[..got]);
    }
    println!("{:x}  {path}", hasher.finalize());
    Ok(())
}

fn probe(vfs: &strata::Vfs, device: &str) -> anyhow::Result<()> {
    let disk = vfs.disk_open(device)?;
    let fs = vfs.probe(&disk)?;
    println!("{}: {}", device, fs.name());
    if let Ok(label) = fs.label(&disk) {
        println!("label: {label}");
    }
    if let Ok(uuid) = fs.uuid(&disk) {
        println!("uuid:  {uuid}");
    }
    if let Ok(mtime) = fs.mtime(&disk) {
        println!("mtime: {mtime}");
    }
    Ok(())
}

fn parts(vfs: &strata::Vfs, device: &str) -> anyhow::Result<()> {
    let disk = vfs.disk_open(device)?;
    let maps = vfs.partitions(&disk);
    if maps.is_empty() {
        bail!("no partition map recognised on {device}");
    }
    for (map, entries) in maps {
        for entry in entries {
            println!(
                "{map}{}: start {:>10} sectors {:>10} type {}",
                entry.number, entry.start_sector, entry.num_sectors, entry.type_tag
            );
        }
    }
    Ok(())
}

fn usn(vfs: &strata::Vfs, path: &str, limit: usize) -> anyhow::Result<()> {
    // Composite paths read through the vfs; plain paths from the host.
    let data = if path.starts_with('(') {
        vfs.open(path)?.read_to_end()?
    } else {
        fs::read(path)?
    };
    for record in strata::usn::RecordIter::new(&data).take(limit) {
        let record = record?;
        let dt = strata::usn::filetime_to_datetime(record.update_time)?;
        println!(
            "usn {:>12}  {:04}-{:02}-{:02} {:02}:{:02}:{:02}  mft {:>8}  {:?}  {}",
            record.update_sequence_number,
            dt.year,
            dt.month,
            dt.day,
            dt.hours,
            dt.minutes,
            dt.seconds,
            record.file_reference.mft_entry(),
            record.reason_flags,
            record.name_string()
        );
    }
    Ok(())
}
