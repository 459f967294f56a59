#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use veil::{
    create_container, open_container, ByteDevice, FileByteDevice, Keyfile, MountedVolume,
};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "veil", about = "VeilFS — encrypted FAT32 container tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct Credentials {
    /// Container password.
    #[arg(long, default_value = "")]
    password: String,
    /// Personal Iterations Multiplier (0 selects the default schedule).
    #[arg(long, default_value_t = 0)]
    pim: i32,
    /// Keyfile path; may be given multiple times, order matters.
    #[arg(long = "keyfile")]
    keyfiles: Vec<PathBuf>,
}

impl Credentials {
    fn keyfiles(&self) -> Result<Vec<Keyfile>> {
        self.keyfiles
            .iter()
            .map(|path| {
                Keyfile::from_path(path)
                    .with_context(|| format!("reading keyfile {}", path.display()))
            })
            .collect()
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create a new container of the given size and format it.
    Create {
        container: PathBuf,
        /// Container size in bytes (e.g. 10485760 for 10 MiB).
        #[arg(long)]
        size: u64,
        /// FAT32 volume label.
        #[arg(long, default_value = "VEILFS")]
        label: String,
        #[command(flatten)]
        creds: Credentials,
    },
    /// Print header and filesystem geometry.
    Inspect {
        container: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        creds: Credentials,
    },
    /// List a directory.
    Ls {
        container: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        creds: Credentials,
    },
    /// Write a file's content to stdout.
    Cat {
        container: PathBuf,
        path: String,
        #[command(flatten)]
        creds: Credentials,
    },
    /// Copy a local file into the container.
    Put {
        container: PathBuf,
        source: PathBuf,
        dest: String,
        #[command(flatten)]
        creds: Credentials,
    },
    /// Copy a file out of the container.
    Get {
        container: PathBuf,
        source: String,
        dest: PathBuf,
        #[command(flatten)]
        creds: Credentials,
    },
    /// Create a directory.
    Mkdir {
        container: PathBuf,
        path: String,
        #[command(flatten)]
        creds: Credentials,
    },
    /// Delete a file or directory tree.
    Rm {
        container: PathBuf,
        path: String,
        #[command(flatten)]
        creds: Credentials,
    },
    /// Print free and total space.
    Df {
        container: PathBuf,
        #[command(flatten)]
        creds: Credentials,
    },
}

fn mount(container: &PathBuf, creds: &Credentials) -> Result<MountedVolume> {
    let device = FileByteDevice::open(container)
        .with_context(|| format!("opening {}", container.display()))?;
    let keyfiles = creds.keyfiles()?;
    let volume = open_container(
        Arc::new(device) as Arc<dyn ByteDevice>,
        creds.password.as_bytes(),
        creds.pim,
        &keyfiles,
    )?;
    Ok(volume)
}

/// Split a container path like `/docs/a.txt` into parent and name.
fn parent_and_name(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        bail!("path has no file name: {path}");
    }
    match trimmed.rfind('/') {
        Some(pos) => Ok((
            if pos == 0 { "/".to_owned() } else { trimmed[..pos].to_owned() },
            trimmed[pos + 1..].to_owned(),
        )),
        None => Ok(("/".to_owned(), trimmed.to_owned())),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Create {
            container,
            size,
            label,
            creds,
        } => {
            let device = FileByteDevice::create(&container, size)
                .with_context(|| format!("creating {}", container.display()))?;
            let keyfiles = creds.keyfiles()?;
            create_container(
                Arc::new(device) as Arc<dyn ByteDevice>,
                creds.password.as_bytes(),
                creds.pim,
                &keyfiles,
                &label,
            )?;
            eprintln!("created {} ({size} bytes)", container.display());
        }
        Command::Inspect {
            container,
            json,
            creds,
        } => {
            let volume = mount(&container, &creds)?;
            let header = volume.header()?;
            let boot = volume.boot_sector()?;
            if json {
                let report = serde_json::json!({
                    "header": header,
                    "boot_sector": boot,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("header version:   {}", header.version);
                println!("data area start:  {}", header.encrypted_area_start);
                println!("data area bytes:  {}", header.encrypted_area_length);
                println!("sector size:      {}", header.sector_size);
                println!("volume label:     {}", boot.volume_label);
                println!("cluster size:     {}", boot.cluster_size());
                println!("sectors per FAT:  {}", boot.sectors_per_fat);
            }
            volume.close();
        }
        Command::Ls {
            container,
            path,
            json,
            creds,
        } => {
            let volume = mount(&container, &creds)?;
            let entries = volume.list(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    let kind = if entry.is_directory { "d" } else { "-" };
                    println!("{kind} {:>12} {}", entry.size, entry.name);
                }
            }
            volume.close();
        }
        Command::Cat {
            container,
            path,
            creds,
        } => {
            let volume = mount(&container, &creds)?;
            let mut stdout = std::io::stdout().lock();
            volume.stream(&path, &mut stdout)?;
            stdout.flush()?;
            volume.close();
        }
        Command::Put {
            container,
            source,
            dest,
            creds,
        } => {
            let volume = mount(&container, &creds)?;
            let mut file = std::fs::File::open(&source)
                .with_context(|| format!("opening {}", source.display()))?;
            let size = file.metadata()?.len();

            if !volume.exists(&dest)? {
                let (parent, name) = parent_and_name(&dest)?;
                volume.create_file(&parent, &name)?;
            }
            volume.write_streaming(&dest, &mut file, size, |_| {})?;
            eprintln!("wrote {size} bytes to {dest}");
            volume.close();
        }
        Command::Get {
            container,
            source,
            dest,
            creds,
        } => {
            let volume = mount(&container, &creds)?;
            let mut file = std::fs::File::create(&dest)
                .with_context(|| format!("creating {}", dest.display()))?;
            let copied = volume.stream(&source, &mut file)?;
            file.flush()?;
            eprintln!("copied {copied} bytes to {}", dest.display());
            volume.close();
        }
        Command::Mkdir {
            container,
            path,
            creds,
        } => {
            let volume = mount(&container, &creds)?;
            let (parent, name) = parent_and_name(&path)?;
            volume.create_directory(&parent, &name)?;
            volume.close();
        }
        Command::Rm {
            container,
            path,
            creds,
        } => {
            let volume = mount(&container, &creds)?;
            volume.delete(&path)?;
            volume.close();
        }
        Command::Df { container, creds } => {
            let volume = mount(&container, &creds)?;
            let free = volume.free_space()?;
            let total = volume.total_space()?;
            println!("total: {total}");
            println!("free:  {free}");
            println!("used:  {}", total - free);
            volume.close();
        }
    }
    Ok(())
}
