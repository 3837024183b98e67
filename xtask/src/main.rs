//! Host-side build helper for KBoot images.
//!
//! Two subcommands: `assemble` lays a kernel, its modules, and a
//! configuration file out into the directory KBoot itself expects to find
//! at boot (§6 "Configuration file" discovery order), ready to be staged
//! onto a disk or ISO9660 image by an external mastering tool (`xorriso`,
//! `mkisofs`); `preview` drives the real [`kboot::menu`] selector against a
//! `kboot.cfg` on the host terminal, without a firmware console or an
//! actual kernel to hand off to.

mod assemble;
mod preview;

use argh::FromArgs;

/// KBoot image assembly and menu preview helper.
#[derive(FromArgs)]
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Assemble(assemble::AssembleArgs),
    Preview(preview::PreviewArgs),
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    match args.command {
        Command::Assemble(a) => assemble::run(&a),
        Command::Preview(p) => preview::run(&p),
    }
}
