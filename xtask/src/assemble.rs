//! Lays a kernel, its modules, and a configuration file out into the
//! directory tree KBoot's discovery order expects (§6): `kboot.cfg` at the
//! boot directory's root, the kernel and modules under `boot/`.
//!
//! This only arranges files on disk; turning the result into bootable media
//! (an El Torito ISO, a raw disk image with an MBR/GPT) is left to an
//! external mastering tool, the same way the core crate never writes a
//! filesystem itself (a stated non-goal).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argh::FromArgs;

/// Assembles a KBoot boot directory from a kernel, config, and modules.
#[derive(FromArgs)]
#[argh(subcommand, name = "assemble")]
pub struct AssembleArgs {
    /// path to the kernel image (an ELF binary carrying KBoot notes)
    #[argh(option)]
    kernel: PathBuf,

    /// path to the `kboot.cfg` configuration script
    #[argh(option)]
    config: PathBuf,

    /// module files to stage alongside the kernel, in `name=path` form
    #[argh(option)]
    module: Vec<String>,

    /// output boot directory (created if missing)
    #[argh(option)]
    out: PathBuf,
}

pub fn run(args: &AssembleArgs) -> Result<()> {
    let boot_dir = args.out.join("boot");
    fs::create_dir_all(&boot_dir).with_context(|| format!("creating {}", boot_dir.display()))?;

    let kernel_dest = boot_dir.join("vmlinuz");
    copy_file(&args.kernel, &kernel_dest)?;

    let config_dest = args.out.join("kboot.cfg");
    copy_file(&args.config, &config_dest)?;

    for entry in &args.module {
        let (name, path) = entry
            .split_once('=')
            .with_context(|| format!("module entry `{entry}` is not in `name=path` form"))?;
        let dest = boot_dir.join(name);
        copy_file(Path::new(path), &dest)?;
    }

    println!("assembled boot directory at {}", args.out.display());
    Ok(())
}

fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    fs::copy(src, dest)
        .with_context(|| format!("copying {} to {}", src.display(), dest.display()))?;
    Ok(())
}
