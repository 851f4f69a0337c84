use std::fs;
use std::process;

use anyhow::{bail, Context, Result};
use clap::Parser;

use genprotimg::command_line::Args;
use genprotimg::image::PvImage;
use genprotimg::stage3;

fn build(args: &Args) -> Result<()> {
    if !args.no_cert_check {
        bail!(
            "please use the option '--no-cert-check' as the verification \
             support is not available yet"
        );
    }
    eprintln!("WARNING: Certificate check is disabled. Please be aware that this is insecure.");

    // scratch directory for the prepared components, removed again on every
    // exit path
    let tmp_dir = tempfile::Builder::new()
        .prefix("genprotimg-")
        .tempdir()
        .context("failed to create the temporary directory")?;

    let tmp_path = tmp_dir.path().to_path_buf();
    ctrlc::set_handler(move || {
        let _ = fs::remove_dir_all(&tmp_path);
        process::exit(1);
    })
    .context("failed to set the signal handler")?;

    let mut img = PvImage::new(args, &stage3::stage3a_path(), tmp_dir.path())?;

    // the user components, sorted by component type and thereby by their
    // guest address
    for (ty, path) in args.components() {
        img.add_component_file(ty, path)?;
    }

    img.finalize(&stage3::stage3b_path())?;
    img.write(&args.output)?;
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = build(&args) {
        eprintln!("ERROR: {e:#}");
        process::exit(1);
    }
}
