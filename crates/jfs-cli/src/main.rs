#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use jfs::{
    ErrorBehavior, FileByteDevice, Filesystem, FormatOptions, FsReport, InodeNumber, InodeReport,
    MountOptions, OrphanReport, S_IFREG, format, inspect,
};
use serde::Serialize;
use std::env;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

/// Logs go to stderr, filtered by `RUST_LOG` (default `warn`).
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };
    let rest = &args[1..];
    let json = rest.iter().any(|arg| arg == "--json");

    match command.as_str() {
        "mkfs" => {
            let [path, size, ..] = rest else {
                bail!("mkfs requires <image-path> <size>");
            };
            let opts = format_options(rest)?;
            mkfs(Path::new(path), parse_size(size)?, &opts)
        }
        "inspect" => {
            let Some(path) = rest.first() else {
                bail!("inspect requires an image path");
            };
            inspect_cmd(Path::new(path), json)
        }
        "recover" => {
            let Some(path) = rest.first() else {
                bail!("recover requires an image path");
            };
            recover(Path::new(path), json)
        }
        "put" => {
            let [image, source, ..] = rest else {
                bail!("put requires <image-path> <source-file>");
            };
            let ino = put(Path::new(image), Path::new(source))?;
            println!("{}", ino.0);
            Ok(())
        }
        "cat" => {
            let [image, ino, ..] = rest else {
                bail!("cat requires <image-path> <inode>");
            };
            cat(Path::new(image), parse_ino(ino)?)
        }
        "stat" => {
            let [image, ino, ..] = rest else {
                bail!("stat requires <image-path> <inode>");
            };
            stat(Path::new(image), parse_ino(ino)?, json)
        }
        "truncate" => {
            let [image, ino, size, ..] = rest else {
                bail!("truncate requires <image-path> <inode> <size>");
            };
            truncate(Path::new(image), parse_ino(ino)?, parse_size(size)?)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("jfs\n");
    println!("USAGE:");
    println!("  jfs mkfs <image-path> <size> [--block-size N] [--inodes-per-group N]");
    println!("           [--label NAME] [--errors continue|remount-ro|panic]");
    println!("  jfs inspect <image-path> [--json]");
    println!("  jfs recover <image-path> [--json]");
    println!("  jfs put <image-path> <source-file>");
    println!("  jfs cat <image-path> <inode>");
    println!("  jfs stat <image-path> <inode> [--json]");
    println!("  jfs truncate <image-path> <inode> <size>");
    println!();
    println!("Sizes accept K, M and G suffixes.");
}

// ── Argument parsing ────────────────────────────────────────────────────────

fn flag<'a>(args: &'a [String], name: &str) -> Result<Option<&'a str>> {
    match args.iter().position(|arg| arg == name) {
        None => Ok(None),
        Some(pos) => match args.get(pos + 1) {
            Some(value) => Ok(Some(value.as_str())),
            None => bail!("{name} requires a value"),
        },
    }
}

fn parse_size(text: &str) -> Result<u64> {
    let (digits, shift) = match text.as_bytes().last() {
        Some(b'K' | b'k') => (&text[..text.len() - 1], 10),
        Some(b'M' | b'm') => (&text[..text.len() - 1], 20),
        Some(b'G' | b'g') => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size: {text}"))?;
    value
        .checked_mul(1_u64 << shift)
        .with_context(|| format!("size overflows: {text}"))
}

fn parse_ino(text: &str) -> Result<InodeNumber> {
    let ino: u64 = text
        .parse()
        .with_context(|| format!("invalid inode number: {text}"))?;
    Ok(InodeNumber(ino))
}

fn parse_errors(text: &str) -> Result<ErrorBehavior> {
    Ok(match text {
        "continue" => ErrorBehavior::Continue,
        "remount-ro" => ErrorBehavior::RemountReadOnly,
        "panic" => ErrorBehavior::Panic,
        other => bail!("unknown error behavior: {other}"),
    })
}

fn format_options(args: &[String]) -> Result<FormatOptions> {
    let mut opts = FormatOptions::default();
    if let Some(value) = flag(args, "--block-size")? {
        opts.block_size = value
            .parse()
            .with_context(|| format!("invalid block size: {value}"))?;
    }
    if let Some(value) = flag(args, "--inodes-per-group")? {
        opts.inodes_per_group = value
            .parse()
            .with_context(|| format!("invalid inode count: {value}"))?;
    }
    if let Some(value) = flag(args, "--label")? {
        value.clone_into(&mut opts.volume_name);
    }
    if let Some(value) = flag(args, "--errors")? {
        opts.errors = parse_errors(value)?;
    }
    Ok(opts)
}

// ── Commands ────────────────────────────────────────────────────────────────

fn open(path: &Path) -> Result<Filesystem> {
    Filesystem::open(path, MountOptions::default())
        .with_context(|| format!("failed to mount {}", path.display()))
}

fn mkfs(path: &Path, size: u64, opts: &FormatOptions) -> Result<()> {
    let dev = FileByteDevice::create(path, size)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let sb = format(dev, opts).with_context(|| format!("failed to format {}", path.display()))?;
    info!(target: "jfs::cli", path = %path.display(), blocks = sb.blocks_count, "formatted");
    println!(
        "{}: {} blocks of {} bytes, {} inodes, {} groups",
        path.display(),
        sb.blocks_count,
        opts.block_size,
        sb.inodes_count,
        sb.groups_count()
    );
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn print_report(report: &FsReport) {
    println!("jfs Inspector");
    println!("volume_name: {}", report.volume_name);
    println!("uuid: {}", report.uuid);
    println!("block_size: {}", report.block_size);
    println!("blocks: {} ({} free)", report.blocks_count, report.free_blocks);
    println!("inodes: {} ({} free)", report.inodes_count, report.free_inodes);
    println!("groups: {}", report.groups);
    println!("state: {:?}", report.state);
    println!("mount_count: {}", report.mount_count);
    println!("error_count: {}", report.error_count);
    println!("last_orphan: {}", report.last_orphan);
}

fn inspect_cmd(path: &Path, json: bool) -> Result<()> {
    let dev = FileByteDevice::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let report = inspect(&dev).with_context(|| format!("no jfs filesystem in {}", path.display()))?;
    if json {
        print_json(&report)
    } else {
        print_report(&report);
        Ok(())
    }
}

fn recover(path: &Path, json: bool) -> Result<()> {
    let fs = open(path)?;
    let recovery: OrphanReport = fs.recovery();
    fs.unmount().context("unmount")?;
    if json {
        return print_json(&recovery);
    }
    if recovery.skipped {
        println!("orphan recovery incomplete: filesystem has errors, run a check");
    } else {
        println!(
            "orphans: {} deleted, {} truncated",
            recovery.deleted, recovery.truncated
        );
    }
    Ok(())
}

/// Copy `source` into a new regular file and return its inode number.
fn put(image: &Path, source: &Path) -> Result<InodeNumber> {
    let data = std::fs::read(source).with_context(|| format!("failed to read {}", source.display()))?;
    let fs = open(image)?;
    let root = fs.root()?;
    let inode = fs.create(Some(&root), S_IFREG | 0o644, 0, 0)?;
    let written = fs.write_at(&inode, 0, &data, false)?;
    if written < data.len() {
        bail!("short write: {written} of {} bytes", data.len());
    }
    let ino = inode.ino();
    drop((root, inode));
    fs.unmount().context("unmount")?;
    Ok(ino)
}

fn cat(image: &Path, ino: InodeNumber) -> Result<()> {
    use std::io::Write as _;
    let fs = open(image)?;
    let inode = fs.inode(ino).with_context(|| format!("inode {}", ino.0))?;
    let len = usize::try_from(inode.snapshot().size).context("file too large to print")?;
    let data = fs.read_at(&inode, 0, len)?;
    std::io::stdout().write_all(&data).context("write stdout")?;
    drop(inode);
    fs.unmount().context("unmount")
}

fn stat(image: &Path, ino: InodeNumber, json: bool) -> Result<()> {
    let fs = open(image)?;
    let inode = fs.inode(ino).with_context(|| format!("inode {}", ino.0))?;
    let report = InodeReport::from_inode(&inode);
    drop(inode);
    fs.unmount().context("unmount")?;
    if json {
        return print_json(&report);
    }
    println!("inode: {}", report.ino);
    println!("type: {:?}", report.file_type);
    println!("mode: {:o}", report.mode);
    println!("owner: {}:{}", report.uid, report.gid);
    println!("size: {}", report.size);
    println!("sectors: {}", report.sectors);
    println!("links: {}", report.links);
    println!("flags: {:#x}", report.flags);
    println!("orphan: {}", report.on_orphan_list);
    println!("blocks: {:?}", report.block_map);
    Ok(())
}

fn truncate(image: &Path, ino: InodeNumber, size: u64) -> Result<()> {
    let fs = open(image)?;
    let inode = fs.inode(ino).with_context(|| format!("inode {}", ino.0))?;
    fs.truncate(&inode, size)
        .with_context(|| format!("failed to truncate inode {} to {size}", ino.0))?;
    let sectors = inode.snapshot().blocks;
    drop(inode);
    fs.unmount().context("unmount")?;
    println!("inode {}: size {size}, {sectors} sectors", ino.0);
    Ok(())
}
