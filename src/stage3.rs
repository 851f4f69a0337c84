use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::components::ComponentList;
use crate::utils::page_align;
use s390_boot::{
    IpibComponent, IplParameterBlock, Stage3aArgs, Stage3bArgs, PAGE_SIZE, STAGE3A_ARGS_SIZE,
    STAGE3A_LOAD_ADDRESS, STAGE3B_ARGS_SIZE,
};

pub const DATA_DIR_ENV: &str = "GENPROTIMG_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "/usr/share/s390-tools/genprotimg";

fn data_dir() -> PathBuf {
    env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

pub fn stage3a_path() -> PathBuf {
    data_dir().join("stage3a.bin")
}

pub fn stage3b_path() -> PathBuf {
    data_dir().join("stage3b_reloc.bin")
}

/// The stage-3a loader region: the template binary followed by one
/// page-aligned area for the IPIB and one for the PV header. The template's
/// last bytes are its argument block, patched at finalization.
#[derive(Debug)]
pub struct Stage3a {
    blob: Vec<u8>,
    bin_size: usize,
}

impl Stage3a {
    /// Load the template and reserve the data areas. @hdr_size must be the
    /// final size of the PV header, known once the host keys are loaded.
    pub fn load(path: &Path, hdr_size: usize) -> Result<Stage3a> {
        let template = fs::read(path)
            .with_context(|| format!("failed to read stage3a loader '{}'", path.display()))?;
        if template.len() < STAGE3A_ARGS_SIZE {
            bail!("stage3a loader '{}' is too small", path.display());
        }

        let bin_size = template.len();
        let ipib_area = PAGE_SIZE; // the IPIB never exceeds one page
        let total =
            page_align(bin_size as u64) + ipib_area + page_align(hdr_size as u64);

        let mut blob = template;
        blob.resize(total as usize, 0);
        Ok(Stage3a { blob, bin_size })
    }

    pub fn size(&self) -> u64 {
        self.blob.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.blob
    }

    /// Write the IPIB, the sealed PV header and the argument block into the
    /// reserved areas. Must run after the component layout is final.
    pub fn patch(&mut self, comps: &ComponentList, hdr: &[u8]) -> Result<()> {
        let ipib_offs = page_align(self.bin_size as u64);
        let hdr_offs = ipib_offs + PAGE_SIZE;

        let components = comps
            .components()
            .iter()
            .map(|c| IpibComponent {
                tweak_prefix: c.tweak.prefix_u64(),
                addr: c.src_addr,
                size: c.size(),
            })
            .collect();
        let ipib = IplParameterBlock::new(
            components,
            STAGE3A_LOAD_ADDRESS + hdr_offs,
            hdr.len() as u64,
        )?;
        let ipib_bytes = ipib.to_bytes();

        if hdr_offs as usize + hdr.len() > self.blob.len() {
            bail!("internal error: PV header does not fit the stage3a data area");
        }

        self.blob[ipib_offs as usize..ipib_offs as usize + ipib_bytes.len()]
            .copy_from_slice(&ipib_bytes);
        self.blob[hdr_offs as usize..hdr_offs as usize + hdr.len()].copy_from_slice(hdr);

        let args = Stage3aArgs {
            hdr_offs,
            hdr_size: hdr.len() as u64,
            ipib_offs,
        };
        let args_offs = self.bin_size - STAGE3A_ARGS_SIZE;
        self.blob[args_offs..self.bin_size].copy_from_slice(&args.to_bytes());
        Ok(())
    }
}

/// Load the relocatable stage-3b template and fill in its argument block,
/// located in the template's final bytes.
pub fn build_stage3b(path: &Path, args: &Stage3bArgs) -> Result<Vec<u8>> {
    let mut blob = fs::read(path)
        .with_context(|| format!("failed to read stage3b loader '{}'", path.display()))?;
    if blob.len() < STAGE3B_ARGS_SIZE {
        bail!("stage3b loader '{}' is too small", path.display());
    }

    let args_offs = blob.len() - STAGE3B_ARGS_SIZE;
    blob[args_offs..].copy_from_slice(&args.to_bytes());
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentType};
    use s390_boot::{MemBlob, Psw};

    #[test]
    fn test_load_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage3a.bin");
        fs::write(&path, [0u8; 8]).unwrap();
        assert!(Stage3a::load(&path, 612).is_err());
    }

    #[test]
    fn test_stage3a_patch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage3a.bin");
        fs::write(&path, vec![0xeeu8; 0x500]).unwrap();

        let mut stage3a = Stage3a::load(&path, 612).unwrap();
        // template page + IPIB page + header page
        assert_eq!(stage3a.size(), 3 * PAGE_SIZE);

        let mut comps = ComponentList::new();
        comps.set_offset(0x11000).unwrap();
        comps
            .add(Component::new_bytes(ComponentType::Kernel, vec![0u8; 0x1000]).unwrap())
            .unwrap();

        let hdr = vec![0xabu8; 612];
        stage3a.patch(&comps, &hdr).unwrap();

        let blob = stage3a.bytes();
        // template content is untouched up to the argument block
        assert!(blob[..0x500 - STAGE3A_ARGS_SIZE].iter().all(|&b| b == 0xee));

        // the argument block points at the data areas
        let args = &blob[0x500 - STAGE3A_ARGS_SIZE..0x500];
        let hdr_offs = u64::from_be_bytes(args[0..8].try_into().unwrap());
        let hdr_size = u64::from_be_bytes(args[8..16].try_into().unwrap());
        let ipib_offs = u64::from_be_bytes(args[16..24].try_into().unwrap());
        assert_eq!(ipib_offs, PAGE_SIZE);
        assert_eq!(hdr_offs, 2 * PAGE_SIZE);
        assert_eq!(hdr_size, 612);

        // IPIB length and header copy
        let ipib_len =
            u32::from_be_bytes(blob[PAGE_SIZE as usize..PAGE_SIZE as usize + 4].try_into().unwrap());
        assert_eq!(ipib_len as u64, s390_boot::ipib_size(1));
        assert_eq!(&blob[2 * PAGE_SIZE as usize..2 * PAGE_SIZE as usize + 612], &hdr[..]);
    }

    #[test]
    fn test_build_stage3b() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage3b_reloc.bin");
        fs::write(&path, vec![0x11u8; 0x200]).unwrap();

        let args = Stage3bArgs {
            kernel: MemBlob::new(0x14000, 0x2100),
            cmdline: MemBlob::default(),
            initrd: MemBlob::default(),
            psw: Psw::new(0x0000_0001_8000_0000, 0x10000),
        };
        let blob = build_stage3b(&path, &args).unwrap();
        assert_eq!(blob.len(), 0x200);
        assert!(blob[..0x200 - STAGE3B_ARGS_SIZE].iter().all(|&b| b == 0x11));
        assert_eq!(&blob[0x200 - STAGE3B_ARGS_SIZE..], &args.to_bytes()[..]);

        fs::write(&path, [0u8; 16]).unwrap();
        assert!(build_stage3b(&path, &args).is_err());
    }
}
