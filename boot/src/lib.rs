// Structures and values defined by the s390 boot architecture. This library
// only provides the definitions needed for building a Secure Execution image:
// PSWs, the IPL Parameter Information Block and the loader argument blocks.
use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use thiserror::Error;

pub const PAGE_SIZE: u64 = 0x1000;

/// Entry address of a raw s390 Linux kernel image.
pub const IMAGE_ENTRY: u64 = 0x10000;

/// The stage-3a loader is linked to run at a fixed address below the kernel.
pub const STAGE3A_INIT_ENTRY: u64 = 0xe000;
pub const STAGE3A_ENTRY: u64 = STAGE3A_INIT_ENTRY;
pub const STAGE3A_LOAD_ADDRESS: u64 = STAGE3A_INIT_ENTRY;

pub const PSW_SHORT_ADDR_MASK: u64 = 0x0000_0000_7fff_ffff;
pub const PSW_MASK_BA: u64 = 0x0000_0000_8000_0000;
pub const PSW_MASK_EA: u64 = 0x0000_0001_0000_0000;
pub const PSW_MASK_BIT_12: u64 = 0x0008_0000_0000_0000;

pub const DEFAULT_INITIAL_PSW_ADDR: u64 = IMAGE_ENTRY;
pub const DEFAULT_INITIAL_PSW_MASK: u64 = PSW_MASK_EA | PSW_MASK_BA;

pub const IPL_PARM_BLOCK_VERSION: u8 = 0x1;
pub const IPL_PB0_PV_VERSION: u8 = 0x1;
/// Program block type of a Protected Virtualization IPL block.
pub const IPL_PBT_PV: u8 = 0x5;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("cannot convert PSW (mask {mask:#x}, addr {addr:#x}) to a short PSW")]
    ShortPsw { mask: u64, addr: u64 },

    #[error("IPL information block too large ({0} bytes)")]
    IpibSize(u64),
}

/// 128-bit Program Status Word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Psw {
    pub mask: u64,
    pub addr: u64,
}

impl Psw {
    pub fn new(mask: u64, addr: u64) -> Psw {
        Psw { mask, addr }
    }

    /// Fold mask and address into the 64-bit short PSW format. Bit 12 is
    /// asserted; the address must fit into 31 bits and the mask must not
    /// carry address bits or bit 12.
    pub fn to_short(self) -> Result<u64, BootError> {
        if self.mask & PSW_SHORT_ADDR_MASK != 0
            || self.mask & PSW_MASK_BIT_12 != 0
            || self.addr & !PSW_SHORT_ADDR_MASK != 0
        {
            return Err(BootError::ShortPsw {
                mask: self.mask,
                addr: self.addr,
            });
        }

        Ok(self.mask | PSW_MASK_BIT_12 | self.addr)
    }
}

/// Argument block patched into the end of the stage-3a template. All offsets
/// are relative to the start of the loaded stage-3a region.
#[derive(Debug, Default)]
pub struct Stage3aArgs {
    pub hdr_offs: u64,
    pub hdr_size: u64,
    pub ipib_offs: u64,
}

pub const STAGE3A_ARGS_SIZE: usize = 24;

impl Stage3aArgs {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(STAGE3A_ARGS_SIZE);
        bytes.write_u64::<BigEndian>(self.hdr_offs).unwrap();
        bytes.write_u64::<BigEndian>(self.hdr_size).unwrap();
        bytes.write_u64::<BigEndian>(self.ipib_offs).unwrap();
        assert!(bytes.len() == STAGE3A_ARGS_SIZE);
        bytes
    }
}

/// Source address and size of one guest memory region.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemBlob {
    pub src: u64,
    pub size: u64,
}

impl MemBlob {
    pub fn new(src: u64, size: u64) -> MemBlob {
        MemBlob { src, size }
    }
}

/// Argument block patched into the end of the stage-3b loader. The stage-3b
/// moves the listed regions to their run-time locations and loads @psw.
#[derive(Debug, Default)]
pub struct Stage3bArgs {
    pub kernel: MemBlob,
    pub cmdline: MemBlob,
    pub initrd: MemBlob,
    pub psw: Psw,
}

pub const STAGE3B_ARGS_SIZE: usize = 64;

impl Stage3bArgs {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(STAGE3B_ARGS_SIZE);
        for blob in [&self.kernel, &self.cmdline, &self.initrd] {
            bytes.write_u64::<BigEndian>(blob.src).unwrap();
            bytes.write_u64::<BigEndian>(blob.size).unwrap();
        }
        bytes.write_u64::<BigEndian>(self.psw.mask).unwrap();
        bytes.write_u64::<BigEndian>(self.psw.addr).unwrap();
        assert!(bytes.len() == STAGE3B_ARGS_SIZE);
        bytes
    }
}

/// One component entry of the PV IPL block. The tweak prefix carries the
/// component type in its first two bytes.
#[derive(Debug, Clone, Copy)]
pub struct IpibComponent {
    pub tweak_prefix: u64,
    pub addr: u64,
    pub size: u64,
}

const IPL_PL_HDR_SIZE: u64 = 8;
const IPL_PB0_PV_FIXED_SIZE: u64 = 124;
const IPL_PB0_PV_COMP_SIZE: u64 = 24;

/// Size of the serialized IPIB for @num_comp components.
pub fn ipib_size(num_comp: usize) -> u64 {
    IPL_PL_HDR_SIZE + IPL_PB0_PV_FIXED_SIZE + num_comp as u64 * IPL_PB0_PV_COMP_SIZE
}

/// IPL Parameter Information Block describing a Protected Virtualization
/// boot: the component table and the location of the PV header.
#[derive(Debug)]
pub struct IplParameterBlock {
    components: Vec<IpibComponent>,
    pv_hdr_addr: u64,
    pv_hdr_size: u64,
}

impl IplParameterBlock {
    /// The firmware copies the IPIB into a single page, larger blocks
    /// cannot be passed.
    pub fn new(
        components: Vec<IpibComponent>,
        pv_hdr_addr: u64,
        pv_hdr_size: u64,
    ) -> Result<IplParameterBlock, BootError> {
        let size = ipib_size(components.len());
        if size > PAGE_SIZE {
            return Err(BootError::IpibSize(size));
        }

        Ok(IplParameterBlock {
            components,
            pv_hdr_addr,
            pv_hdr_size,
        })
    }

    pub fn size(&self) -> u64 {
        ipib_size(self.components.len())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let size = self.size();
        let mut bytes = Vec::with_capacity(size as usize);

        // ipl_pl_hdr
        bytes.write_u32::<BigEndian>(size as u32).unwrap();
        bytes.write_u8(0).unwrap(); // flags
        bytes.write_all(&[0; 2]).unwrap();
        bytes.write_u8(IPL_PARM_BLOCK_VERSION).unwrap();

        // ipl_pb0_pv
        bytes
            .write_u32::<BigEndian>((size - IPL_PL_HDR_SIZE) as u32)
            .unwrap();
        bytes.write_u8(IPL_PBT_PV).unwrap();
        bytes.write_all(&[0; 3]).unwrap();
        bytes.write_all(&[0; 8]).unwrap(); // loadparm
        bytes.write_all(&[0; 84]).unwrap();
        bytes.write_u8(IPL_PB0_PV_VERSION).unwrap();
        bytes.write_all(&[0; 3]).unwrap();
        bytes
            .write_u32::<BigEndian>(self.components.len() as u32)
            .unwrap();
        bytes.write_u64::<BigEndian>(self.pv_hdr_addr).unwrap();
        bytes.write_u64::<BigEndian>(self.pv_hdr_size).unwrap();

        for comp in &self.components {
            bytes.write_u64::<BigEndian>(comp.tweak_prefix).unwrap();
            bytes.write_u64::<BigEndian>(comp.addr).unwrap();
            bytes.write_u64::<BigEndian>(comp.size).unwrap();
        }

        assert!(bytes.len() as u64 == size);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_psw() {
        let psw = Psw::new(DEFAULT_INITIAL_PSW_MASK, STAGE3A_ENTRY);
        assert_eq!(psw.to_short().unwrap(), 0x0008_0001_8000_e000);

        // address bits in the mask
        assert!(Psw::new(DEFAULT_INITIAL_PSW_MASK | 0x1, 0).to_short().is_err());
        // bit 12 already set
        assert!(Psw::new(DEFAULT_INITIAL_PSW_MASK | PSW_MASK_BIT_12, 0)
            .to_short()
            .is_err());
        // address does not fit into 31 bits
        assert!(Psw::new(DEFAULT_INITIAL_PSW_MASK, 1 << 31).to_short().is_err());
    }

    #[test]
    fn test_stage3b_args() {
        let args = Stage3bArgs {
            kernel: MemBlob::new(0x12000, 0x5000),
            cmdline: MemBlob::new(0x0, 0x0),
            initrd: MemBlob::new(0x20000, 0x800),
            psw: Psw::new(DEFAULT_INITIAL_PSW_MASK, IMAGE_ENTRY),
        };
        let bytes = args.to_bytes();
        assert_eq!(bytes.len(), STAGE3B_ARGS_SIZE);
        // big-endian field order
        assert_eq!(&bytes[0..8], &[0, 0, 0, 0, 0, 1, 0x20, 0]);
        assert_eq!(&bytes[56..64], &[0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_ipib() {
        let comps = vec![
            IpibComponent {
                tweak_prefix: 0x0000_1122_3344_5566,
                addr: 0x10000,
                size: 0x1000,
            },
            IpibComponent {
                tweak_prefix: 0x0003_aabb_ccdd_eeff,
                addr: 0x11000,
                size: 0x2000,
            },
        ];
        let ipib = IplParameterBlock::new(comps, 0xf000, 0x264).unwrap();
        let bytes = ipib.to_bytes();
        assert_eq!(bytes.len() as u64, ipib_size(2));
        assert_eq!(bytes.len(), 8 + 124 + 2 * 24);
        // pl_hdr: len, flags, version
        assert_eq!(&bytes[0..4], &(bytes.len() as u32).to_be_bytes());
        assert_eq!(bytes[7], IPL_PARM_BLOCK_VERSION);
        // pb0: len covers everything but the pl_hdr
        assert_eq!(&bytes[8..12], &((bytes.len() - 8) as u32).to_be_bytes());
        assert_eq!(bytes[12], IPL_PBT_PV);

        // more components than fit into one page
        let many = vec![
            IpibComponent {
                tweak_prefix: 0,
                addr: 0,
                size: 0,
            };
            200
        ];
        assert!(IplParameterBlock::new(many, 0, 0).is_err());
    }
}
