/// Parse the main command-line.
///
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::component::ComponentType;

// This is the help blurb:
/// Takes a kernel, key files, and optionally an initial ram filesystem and a
/// file containing the kernel command line, and generates a single loadable
/// image file. The image consists of a concatenation of a plain text boot
/// loader, the encrypted components for kernel, initrd, and cmdline, and the
/// integrity-protected PV header, containing metadata necessary for running
/// the guest in PV mode. It's possible to use this image file as a kernel for
/// zipl or for a direct kernel boot using QEMU.
#[derive(Debug, Parser)]
#[command(
    name = "genprotimg",
    version,
    disable_version_flag = true,
    about = "Create a Protected Virtualization Image",
    long_about,
    verbatim_doc_comment
)]
pub struct Args {
    /// Use FILE as a host certificate. At least one host certificate must be
    /// specified
    #[arg(short = 'c', long = "host-certificate", value_name = "FILE", required = true)]
    pub host_certificates: Vec<PathBuf>,

    /// Use FILE as the Linux kernel image
    #[arg(short = 'i', long = "image", value_name = "FILE")]
    pub image: PathBuf,

    /// Use FILE as the initial ramdisk (optional)
    #[arg(short = 'r', long = "ramdisk", value_name = "FILE")]
    pub ramdisk: Option<PathBuf>,

    /// Use content of FILE as the kernel cmdline (optional)
    #[arg(short = 'p', long = "parmfile", value_name = "FILE")]
    pub parmfile: Option<PathBuf>,

    /// Set FILE as the output file
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: PathBuf,

    /// Use FILE as the AES 256-bit GCM customer root key (optional, default:
    /// auto generation). This key protects the PV header (confidentiality
    /// and integrity)
    #[arg(long = "header-key", value_name = "FILE")]
    pub header_key: Option<PathBuf>,

    /// Use FILE as the AES 256-bit XTS key (optional, default: auto
    /// generation). This key is used for the component encryption
    #[arg(long = "comp-key", value_name = "FILE")]
    pub comp_key: Option<PathBuf>,

    /// Disable the certification check (optional)
    #[arg(long = "no-cert-check")]
    pub no_cert_check: bool,

    /// Print memory layout (optional)
    #[arg(short = 'V', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Print version and exit (optional)
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    pub version: Option<bool>,

    /// Use FILE as the customer communication key (optional, default: auto
    /// generation)
    #[arg(long = "x-comm-key", value_name = "FILE", help_heading = "Experimental options")]
    pub x_comm_key: Option<PathBuf>,

    /// Use FILE as the 12-byte GCM IV protecting the PV header (optional,
    /// default: auto generation)
    #[arg(long = "x-gcm-iv", value_name = "FILE", help_heading = "Experimental options")]
    pub x_gcm_iv: Option<PathBuf>,

    /// Use VALUE as the plaintext control flags (optional, default: '0x0').
    /// Must be a hexadecimal value
    #[arg(long = "x-pcf", value_name = "VALUE", help_heading = "Experimental options")]
    pub x_pcf: Option<String>,

    /// Use the address ADDRESS to load from (optional, default: '0x10000').
    /// Must be a hexadecimal value
    #[arg(long = "x-psw", value_name = "ADDRESS", help_heading = "Experimental options")]
    pub x_psw: Option<String>,

    /// Use VALUE as the secret control flags (optional, default: '0x0').
    /// Must be a hexadecimal value
    #[arg(long = "x-scf", value_name = "VALUE", help_heading = "Experimental options")]
    pub x_scf: Option<String>,
}

impl Args {
    /// The user components in load order, which is component-type order.
    pub fn components(&self) -> Vec<(ComponentType, &PathBuf)> {
        let mut comps = vec![(ComponentType::Kernel, &self.image)];
        if let Some(path) = &self.parmfile {
            comps.push((ComponentType::Cmdline, path));
        }
        if let Some(path) = &self.ramdisk {
            comps.push((ComponentType::Initrd, path));
        }
        comps
    }
}
