//! Build a single bootable image file for IBM Z Protected Virtualization
//! (Secure Execution) guests.
//!
//! The tool takes a Linux kernel, optionally an initial ramdisk and a kernel
//! command line, and one or more host-key certificates. It produces an image
//! consisting of a cleartext stage-3a boot loader, the XTS-encrypted guest
//! components, and an AES-GCM protected PV header that lets each authorised
//! host machine recover the image keys via an ECDH key exchange.
//!
//! Example
//! ```bash
//! genprotimg
//!     -c host.crt                     # host-key certificate
//!     -i vmlinuz                      # raw kernel image
//!     -r initrd.img                   # initial ramdisk
//!     -p parmfile                     # kernel command line
//!     -o secure.img                   # output image
//!     --no-cert-check
//! ```
//!
//! The resulting file can be used as a kernel for zipl or for a direct
//! kernel boot using QEMU. At boot, the stage-3a loader hands the IPL
//! information block and the PV header to the Ultravisor, which verifies
//! and decrypts the components and enters the guest through the stage-3b.

/// Command-line surface of the tool
pub mod command_line;
/// A single payload piece: kernel, cmdline, ramdisk or stage-3b
pub mod component;
/// The ordered component list and the payload digests
pub mod components;
/// OpenSSL-backed primitives: digests, AES-GCM, AES-XTS, EC key exchange
pub mod crypto;
/// The PV header record
pub mod hdr;
/// The image builder
pub mod image;
/// Stage-3a/3b template handling
pub mod stage3;

mod utils;
