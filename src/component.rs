use std::cmp::max;
use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use openssl::sha::Sha512;

use crate::crypto::{self, Tweak, AES_256_XTS_KEY_SIZE};
use crate::utils::{is_page_aligned, page_align};
use s390_boot::PAGE_SIZE;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// The numeric value is the load-order rank of the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComponentType {
    Kernel = 0,
    Cmdline = 1,
    Initrd = 2,
    Stage3b = 3,
}

impl ComponentType {
    pub fn name(self) -> &'static str {
        match self {
            ComponentType::Kernel => "kernel",
            ComponentType::Cmdline => "parmline",
            ComponentType::Initrd => "ramdisk",
            ComponentType::Stage3b => "stage3b",
        }
    }
}

#[derive(Debug)]
pub enum ComponentData {
    File { path: PathBuf, size: u64 },
    Bytes(Vec<u8>),
}

/// One payload piece of the image: the kernel, the kernel command line, the
/// initial ramdisk or the stage-3b loader.
#[derive(Debug)]
pub struct Component {
    pub ty: ComponentType,
    pub data: ComponentData,
    /// Logical size before padding and encryption.
    pub orig_size: u64,
    /// Page-aligned guest-absolute load address, assigned by the list.
    pub src_addr: u64,
    pub tweak: Tweak,
}

fn read_chunk<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = input.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

impl Component {
    fn new(ty: ComponentType, data: ComponentData, orig_size: u64) -> Result<Component> {
        Ok(Component {
            ty,
            data,
            orig_size,
            src_addr: 0,
            tweak: crypto::generate_tweak(ty as u16)?,
        })
    }

    /// Create a file-backed component. The size is cached here; a change
    /// before preparation is detected later.
    pub fn new_file(ty: ComponentType, path: &Path) -> Result<Component> {
        let meta = fs::metadata(path)
            .with_context(|| format!("failed to stat file '{}'", path.display()))?;
        if !meta.is_file() {
            bail!("'{}' is not a regular file", path.display());
        }

        if ty == ComponentType::Kernel {
            let mut magic = [0u8; 4];
            let mut f = File::open(path)
                .with_context(|| format!("failed to open file '{}'", path.display()))?;
            let n = read_chunk(&mut f, &mut magic)?;
            if n == magic.len() && magic == ELF_MAGIC {
                bail!(
                    "'{}' is an ELF file and cannot be used as a Linux kernel image",
                    path.display()
                );
            }
        }

        Component::new(
            ty,
            ComponentData::File {
                path: path.to_path_buf(),
                size: meta.len(),
            },
            meta.len(),
        )
    }

    pub fn new_bytes(ty: ComponentType, bytes: Vec<u8>) -> Result<Component> {
        let size = bytes.len() as u64;
        Component::new(ty, ComponentData::Bytes(bytes), size)
    }

    pub fn size(&self) -> u64 {
        match &self.data {
            ComponentData::File { size, .. } => *size,
            ComponentData::Bytes(b) => b.len() as u64,
        }
    }

    pub fn is_stage3b(&self) -> bool {
        self.ty == ComponentType::Stage3b
    }

    /// Size of the component once padded: a positive number of whole pages.
    fn prepared_size(&self) -> u64 {
        max(page_align(self.size()), PAGE_SIZE)
    }

    /// Pad the content to whole pages and, when an XTS key is given, encrypt
    /// it into `tmp_dir/<name>`. An empty component becomes one zero page.
    pub fn prepare(
        &mut self,
        xts_key: Option<&[u8; AES_256_XTS_KEY_SIZE]>,
        tmp_dir: &Path,
    ) -> Result<()> {
        let padded_size = self.prepared_size();

        match &mut self.data {
            ComponentData::Bytes(buf) => {
                buf.resize(padded_size as usize, 0);
                if let Some(key) = xts_key {
                    let mut enc = Vec::with_capacity(buf.len());
                    crypto::xts_encrypt_stream(
                        key,
                        &self.tweak,
                        &mut Cursor::new(&buf[..]),
                        &mut enc,
                    )?;
                    *buf = enc;
                }
            }
            ComponentData::File { path, size } => {
                if xts_key.is_none() && *size == padded_size {
                    // already whole pages, leave the file in place
                    return Ok(());
                }

                let out_path = tmp_dir.join(self.ty.name());
                let mut f_in = File::open(&path)
                    .with_context(|| format!("failed to open file '{}'", path.display()))?;
                let mut f_out = File::create(&out_path).with_context(|| {
                    format!("failed to create file '{}'", out_path.display())
                })?;

                let size_in = match xts_key {
                    Some(key) => {
                        let (size_in, size_out) =
                            crypto::xts_encrypt_stream(key, &self.tweak, &mut f_in, &mut f_out)?;
                        if size_out == 0 {
                            // empty component, encrypt its single zero page
                            let zero = [0u8; PAGE_SIZE as usize];
                            crypto::xts_encrypt_stream(
                                key,
                                &self.tweak,
                                &mut Cursor::new(&zero[..]),
                                &mut f_out,
                            )?;
                        }
                        size_in
                    }
                    None => {
                        let mut buf = [0u8; PAGE_SIZE as usize];
                        let mut size_in = 0u64;
                        let mut size_out = 0u64;
                        loop {
                            buf.fill(0);
                            let n = read_chunk(&mut f_in, &mut buf)?;
                            if n == 0 && size_out > 0 {
                                break;
                            }
                            f_out.write_all(&buf)?;
                            size_in += n as u64;
                            size_out += PAGE_SIZE;
                            if n < buf.len() {
                                break;
                            }
                        }
                        size_in
                    }
                };

                if size_in != *size {
                    bail!(
                        "file '{}' has changed during the preparation",
                        path.display()
                    );
                }

                *path = out_path;
                *size = padded_size;
            }
        }

        debug_assert!(is_page_aligned(self.size()) && self.size() >= PAGE_SIZE);
        Ok(())
    }

    /// Feed the page contents into the page-list digest. Returns the number
    /// of pages hashed.
    pub fn update_pld(&self, ctx: &mut Sha512) -> Result<u64> {
        match &self.data {
            ComponentData::Bytes(buf) => {
                let quot = buf.len() / PAGE_SIZE as usize;
                let rem = buf.len() % PAGE_SIZE as usize;

                ctx.update(&buf[..quot * PAGE_SIZE as usize]);
                if rem != 0 || quot == 0 {
                    let mut page = [0u8; PAGE_SIZE as usize];
                    page[..rem].copy_from_slice(&buf[quot * PAGE_SIZE as usize..]);
                    ctx.update(&page);
                    return Ok(quot as u64 + 1);
                }
                Ok(quot as u64)
            }
            ComponentData::File { path, size } => {
                let mut f = File::open(path)
                    .with_context(|| format!("failed to open file '{}'", path.display()))?;
                let mut buf = [0u8; PAGE_SIZE as usize];
                let mut total = 0u64;
                let mut nep = 0u64;

                loop {
                    buf.fill(0);
                    let n = read_chunk(&mut f, &mut buf)?;
                    if n == 0 && nep > 0 {
                        break;
                    }
                    ctx.update(&buf);
                    total += n as u64;
                    nep += 1;
                    if n < buf.len() {
                        break;
                    }
                }

                if total != *size {
                    bail!(
                        "file '{}' has changed during the preparation",
                        path.display()
                    );
                }
                Ok(nep)
            }
        }
    }

    /// Feed the guest-absolute address of every page into the address-list
    /// digest. An empty component still occupies one page.
    pub fn update_ald(&self, ctx: &mut Sha512) -> u64 {
        let pages = max(self.size().div_ceil(PAGE_SIZE), 1);
        for i in 0..pages {
            let addr = self.src_addr + i * PAGE_SIZE;
            ctx.update(&addr.to_be_bytes());
        }
        pages
    }

    /// Feed the XTS tweak of every page into the tweak-list digest. The
    /// tweak advances by the page size per page, as a 128-bit big-endian
    /// integer.
    pub fn update_tld(&self, ctx: &mut Sha512) -> u64 {
        let pages = max(self.size().div_ceil(PAGE_SIZE), 1);
        let mut num = u128::from_be_bytes(self.tweak.0);
        for _ in 0..pages {
            ctx.update(&num.to_be_bytes());
            num = num.wrapping_add(PAGE_SIZE as u128);
        }
        pages
    }

    /// Write the prepared content to its source address in the output file.
    pub fn write_into<W: Write + Seek>(&self, out: &mut W) -> Result<()> {
        out.seek(SeekFrom::Start(self.src_addr))?;

        match &self.data {
            ComponentData::Bytes(buf) => {
                out.write_all(buf)?;
            }
            ComponentData::File { path, size } => {
                let mut f = File::open(path)
                    .with_context(|| format!("failed to open file '{}'", path.display()))?;
                let copied = std::io::copy(&mut f, out)?;
                if copied != *size {
                    bail!(
                        "file '{}' has changed during the preparation",
                        path.display()
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use openssl::sha::sha512;

    use super::*;

    fn xts_key() -> [u8; 64] {
        let mut key = [0xaau8; 64];
        key[32..].fill(0x55);
        key
    }

    #[test]
    fn test_prepare_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut comp = Component::new_bytes(ComponentType::Cmdline, b"console=ttyS0".to_vec())
            .unwrap();
        assert_eq!(comp.orig_size, 13);

        let key = xts_key();
        comp.prepare(Some(&key), dir.path()).unwrap();
        assert_eq!(comp.size(), PAGE_SIZE);

        let ComponentData::Bytes(enc) = &comp.data else {
            panic!("buffer-backed component changed kind");
        };
        assert_ne!(&enc[..13], b"console=ttyS0".as_slice());
    }

    #[test]
    fn test_prepare_bytes_no_decryption() {
        let dir = tempfile::tempdir().unwrap();
        let mut comp =
            Component::new_bytes(ComponentType::Cmdline, b"root=/dev/vda".to_vec()).unwrap();
        comp.prepare(None, dir.path()).unwrap();

        let ComponentData::Bytes(buf) = &comp.data else {
            panic!("buffer-backed component changed kind");
        };
        assert_eq!(buf.len() as u64, PAGE_SIZE);
        assert_eq!(&buf[..13], b"root=/dev/vda".as_slice());
        assert!(buf[13..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_prepare_empty_is_one_page() {
        let dir = tempfile::tempdir().unwrap();
        for key in [None, Some(&xts_key())] {
            let mut comp = Component::new_bytes(ComponentType::Initrd, vec![]).unwrap();
            comp.prepare(key, dir.path()).unwrap();
            assert_eq!(comp.size(), PAGE_SIZE);
            assert_eq!(comp.orig_size, 0);
        }
    }

    #[test]
    fn test_prepare_file() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let path = dir.path().join("initrd");
        fs::write(&path, vec![0x77u8; 5000]).unwrap();

        let mut comp = Component::new_file(ComponentType::Initrd, &path).unwrap();
        let key = xts_key();
        comp.prepare(Some(&key), tmp.path()).unwrap();

        assert_eq!(comp.size(), 2 * PAGE_SIZE);
        let ComponentData::File { path, size } = &comp.data else {
            panic!("file-backed component changed kind");
        };
        assert_eq!(path, &tmp.path().join("ramdisk"));
        assert_eq!(fs::metadata(path).unwrap().len(), *size);
    }

    #[test]
    fn test_new_file_rejects_special_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Component::new_file(ComponentType::Kernel, dir.path()).is_err());
    }

    #[test]
    fn test_new_file_rejects_elf_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmlinux");
        fs::write(&path, b"\x7fELF\x02\x01\x01").unwrap();
        assert!(Component::new_file(ComponentType::Kernel, &path).is_err());

        // as a ramdisk the same bytes are fine
        assert!(Component::new_file(ComponentType::Initrd, &path).is_ok());
    }

    #[test]
    fn test_digest_updates() {
        let dir = tempfile::tempdir().unwrap();
        let mut comp =
            Component::new_bytes(ComponentType::Kernel, vec![0x11u8; 6000]).unwrap();
        comp.prepare(None, dir.path()).unwrap();
        comp.src_addr = 0x14000;

        let mut pld = Sha512::new();
        let mut ald = Sha512::new();
        let mut tld = Sha512::new();
        let n1 = comp.update_pld(&mut pld).unwrap();
        let n2 = comp.update_ald(&mut ald);
        let n3 = comp.update_tld(&mut tld);
        assert_eq!(n1, 2);
        assert_eq!(n1, n2);
        assert_eq!(n2, n3);

        // pld equals the digest of the padded content
        let ComponentData::Bytes(buf) = &comp.data else {
            unreachable!();
        };
        assert_eq!(pld.finish(), sha512(buf));

        // ald equals the digest of the two page addresses
        let mut addrs = Vec::new();
        addrs.extend_from_slice(&0x14000u64.to_be_bytes());
        addrs.extend_from_slice(&0x15000u64.to_be_bytes());
        assert_eq!(ald.finish(), sha512(&addrs));

        // tld equals the digest of tweak and tweak + page size
        let mut tweaks = Vec::new();
        let num = u128::from_be_bytes(comp.tweak.0);
        tweaks.extend_from_slice(&num.to_be_bytes());
        tweaks.extend_from_slice(&(num + PAGE_SIZE as u128).to_be_bytes());
        assert_eq!(tld.finish(), sha512(&tweaks));
    }

    #[test]
    fn test_empty_component_digests() {
        let mut comp = Component::new_bytes(ComponentType::Initrd, vec![]).unwrap();
        comp.src_addr = 0x20000;

        let mut pld = Sha512::new();
        let mut ald = Sha512::new();
        let mut tld = Sha512::new();
        assert_eq!(comp.update_pld(&mut pld).unwrap(), 1);
        assert_eq!(comp.update_ald(&mut ald), 1);
        assert_eq!(comp.update_tld(&mut tld), 1);

        // one zero page, one address entry, one tweak entry
        assert_eq!(pld.finish(), sha512(&[0u8; PAGE_SIZE as usize]));
        assert_eq!(ald.finish(), sha512(&0x20000u64.to_be_bytes()));
        assert_eq!(tld.finish(), sha512(&comp.tweak.0));
    }

    #[test]
    fn test_write_into() {
        let mut comp = Component::new_bytes(ComponentType::Kernel, vec![0x42u8; 16]).unwrap();
        comp.src_addr = 0x100;

        let mut out = Cursor::new(Vec::new());
        comp.write_into(&mut out).unwrap();
        let bytes = out.into_inner();
        assert_eq!(bytes.len(), 0x110);
        assert!(bytes[..0x100].iter().all(|&b| b == 0));
        assert_eq!(&bytes[0x100..], &[0x42u8; 16]);
    }
}
