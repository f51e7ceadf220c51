// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    io::Write,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use npktools::{
    kernel,
    keys::{fingerprint, KeyScan},
    squashfs, KeyPair, KeySet, SigningKeys,
};

#[derive(Parser, Debug)]
#[clap(name = "npkedit", max_term_width = 80)]
pub struct Args {
    #[clap(flatten)]
    key_args: KeyArgs,

    #[clap(subcommand)]
    cmd: Command,
}

/// Public keys to swap, as hex strings
#[derive(clap::Args, Debug)]
struct KeyArgs {
    /// TOML file of `[[pair]]` tables (`name`, `old`, `new`), used instead
    /// of the individual keys below
    #[clap(long)]
    keys: Option<PathBuf>,

    #[clap(long, env = "MIKRO_LICENSE_PUBLIC_KEY", hide_env_values = true)]
    old_license_key: Option<String>,

    #[clap(long, env = "CUSTOM_LICENSE_PUBLIC_KEY", hide_env_values = true)]
    new_license_key: Option<String>,

    #[clap(long, env = "MIKRO_NPK_SIGN_PUBLIC_LKEY", hide_env_values = true)]
    old_npk_sign_key: Option<String>,

    #[clap(long, env = "CUSTOM_NPK_SIGN_PUBLIC_KEY", hide_env_values = true)]
    new_npk_sign_key: Option<String>,

    /// Private key for the license signature
    #[clap(long, env = "CUSTOM_LICENSE_PRIVATE_KEY", hide_env_values = true)]
    license_private_key: Option<String>,

    /// Private key for the package signature
    #[clap(long, env = "CUSTOM_NPK_SIGN_PRIVATE_KEY", hide_env_values = true)]
    npk_sign_private_key: Option<String>,
}

impl KeyArgs {
    fn load(&self) -> Result<KeySet> {
        if let Some(path) = &self.keys {
            let text = std::fs::read_to_string(path).with_context(|| {
                format!("reading key file {}", path.display())
            })?;
            return KeySet::from_toml(&text)
                .with_context(|| format!("loading {}", path.display()));
        }

        let mut pairs = vec![];
        for (name, old, new) in [
            ("license", &self.old_license_key, &self.new_license_key),
            ("npk-sign", &self.old_npk_sign_key, &self.new_npk_sign_key),
        ] {
            match (old, new) {
                (Some(old), Some(new)) => {
                    pairs.push(KeyPair::from_hex(name, old, new)?)
                }
                (None, None) => (),
                _ => bail!("{name} key needs both an old and a new value"),
            }
        }
        if pairs.is_empty() {
            bail!("no keys configured");
        }
        Ok(KeySet::new(pairs)?)
    }

    fn signing(&self) -> Result<SigningKeys> {
        match (&self.license_private_key, &self.npk_sign_private_key) {
            (Some(license), Some(package)) => {
                Ok(SigningKeys::from_hex(license, package)?)
            }
            _ => bail!("both private signing keys are required"),
        }
    }
}

#[derive(Parser, Debug)]
pub enum Command {
    /// Swaps keys in the initramfs built into a kernel container
    /// (`BOOTX64.EFI`)
    PatchKernel {
        input: PathBuf,

        /// Where to write the result; defaults to overwriting the input
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Writes the decompressed kernel out of a kernel container
    ExtractKernel { input: PathBuf, output: PathBuf },
    /// Prints where the payload and the initramfs are in a kernel container
    InspectKernel { input: PathBuf },
    /// Swaps keys in every file of an unpacked filesystem tree
    PatchTree { root: PathBuf },
    /// Swaps keys in a squashfs image, using `unsquashfs` and `mksquashfs`
    PatchSquashfs {
        input: PathBuf,

        /// Where to write the result; defaults to overwriting the input
        #[clap(short, long)]
        output: Option<PathBuf>,

        #[clap(long, env = "NPKEDIT_UNSQUASHFS", default_value = "unsquashfs")]
        unsquashfs: PathBuf,

        #[clap(long, env = "NPKEDIT_MKSQUASHFS", default_value = "mksquashfs")]
        mksquashfs: PathBuf,
    },
    /// Reports which old and new keys occur in a file
    Scan { file: PathBuf },
    /// Loads and validates the configured public and private keys
    CheckKeys,
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Writes through a temporary file next to `path`, so that a failure never
/// leaves a half-written output behind
fn write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).with_context(|| {
        format!("creating temporary file in {}", dir.display())
    })?;
    tmp.write_all(data)
        .with_context(|| format!("writing {}", tmp.path().display()))?;
    tmp.persist(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn print_scan(scan: &[KeyScan]) {
    for s in scan {
        println!(
            "{:<12} old: {:>3}  new: {:>3}",
            s.pair.name(),
            s.old,
            s.new
        );
    }
}

fn run(args: Args) -> Result<()> {
    match args.cmd {
        Command::PatchKernel { input, output } => {
            let keys = args.key_args.load()?;
            let image = read(&input)?;
            info!("patching {}", input.display());
            let patched = kernel::patch(&image, &keys)?;
            let output = output.unwrap_or(input);
            write(&output, &patched.image)?;
            info!("wrote {}", output.display());
        }
        Command::ExtractKernel { input, output } => {
            let vmlinux = kernel::extract_payload(&read(&input)?)?;
            write(&output, &vmlinux)?;
        }
        Command::InspectKernel { input } => {
            let report = kernel::inspect(&read(&input)?)?;
            let p = &report.payload;
            println!("payload offset:    {:#x}", p.offset);
            println!("payload length:    {}", p.len);
            println!("decompressed size: {}", p.decompressed_len);
            println!(
                "initramfs:         {:#x}..{:#x}",
                report.archive.start, report.archive.end
            );
        }
        Command::PatchTree { root } => {
            let keys = args.key_args.load()?;
            let report = squashfs::patch_tree(&root, &keys)?;
            for f in &report.patched {
                println!("{}: {}", f.path.display(), f.keys.join(", "));
            }
        }
        Command::PatchSquashfs {
            input,
            output,
            unsquashfs,
            mksquashfs,
        } => {
            let keys = args.key_args.load()?;
            let opts = squashfs::SquashfsOptions {
                unsquashfs,
                mksquashfs,
                ..Default::default()
            };
            let (image, _report) =
                squashfs::patch_image(&read(&input)?, &keys, &opts)?;
            let output = output.unwrap_or(input);
            write(&output, &image)?;
            info!("wrote {}", output.display());
        }
        Command::Scan { file } => {
            let keys = args.key_args.load()?;
            print_scan(&keys.scan(&read(&file)?));
        }
        Command::CheckKeys => {
            let keys = args.key_args.load()?;
            for pair in keys.pairs() {
                println!(
                    "{:<12} {} -> {}",
                    pair.name(),
                    fingerprint(pair.old_key()),
                    fingerprint(pair.new_key())
                );
            }
            let signing = args.key_args.signing()?;
            println!(
                "signing keys: license {} bytes, npk-sign {} bytes",
                signing.license.len(),
                signing.package.len()
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = e
                .chain()
                .find_map(|c| c.downcast_ref::<npktools::Error>())
                .map(|e| e.kind());
            match kind {
                Some(kind) => eprintln!("{kind}: {e:?}"),
                None => eprintln!("Error: {e:?}"),
            }
            ExitCode::FAILURE
        }
    }
}
