use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use byteorder::{BigEndian, WriteBytesExt};
use openssl::pkey::{PKey, Private};

use crate::command_line::Args;
use crate::component::{Component, ComponentType};
use crate::components::{ComponentList, Digests};
use crate::crypto::{self, AES_256_GCM_IV_SIZE, AES_256_GCM_KEY_SIZE, AES_256_XTS_KEY_SIZE, CURVE_NID};
use crate::hdr::{pv_hdr_size, KeySlot, PvHdr, PV_CONTROL_FLAG_NO_DECRYPTION};
use crate::stage3::{self, Stage3a};
use crate::utils::{page_align, parse_hex_u64};
use s390_boot::{
    Psw, DEFAULT_INITIAL_PSW_ADDR, DEFAULT_INITIAL_PSW_MASK, STAGE3A_ENTRY, STAGE3A_LOAD_ADDRESS,
};

/// The image under construction: all key material, the stage-3a region and
/// the component list. Create, add the user components, finalize, write.
#[derive(Debug)]
pub struct PvImage {
    tmp_dir: PathBuf,
    verbose: bool,
    cust_key: PKey<Private>,
    gcm_iv: [u8; AES_256_GCM_IV_SIZE],
    cust_root_key: [u8; AES_256_GCM_KEY_SIZE],
    xts_key: [u8; AES_256_XTS_KEY_SIZE],
    cust_comm_key: [u8; 32],
    pcf: u64,
    scf: u64,
    /// Loaded by the stage-3b once the components are unpacked.
    initial_psw: Psw,
    /// Written to location 0 of the image as a short PSW.
    stage3a_psw: Psw,
    stage3a: Stage3a,
    key_slots: Vec<KeySlot>,
    comps: ComponentList,
}

fn get_key<const N: usize>(path: Option<&Path>) -> Result<[u8; N]> {
    match path {
        Some(path) => {
            let key = crypto::read_key_file(path, N)?;
            Ok(key.try_into().expect("checked size"))
        }
        None => Ok(crypto::random_array()?),
    }
}

impl PvImage {
    pub fn new(args: &Args, stage3a_path: &Path, tmp_dir: &Path) -> Result<PvImage> {
        let mut initial_psw = Psw::new(DEFAULT_INITIAL_PSW_MASK, DEFAULT_INITIAL_PSW_ADDR);
        if let Some(s) = &args.x_psw {
            initial_psw.addr = parse_hex_u64(s)?;
        }
        let pcf = args.x_pcf.as_deref().map(parse_hex_u64).transpose()?.unwrap_or(0);
        let scf = args.x_scf.as_deref().map(parse_hex_u64).transpose()?.unwrap_or(0);

        // read in the keys or auto-generate them
        let xts_key = get_key(args.comp_key.as_deref())?;
        let cust_comm_key = get_key(args.x_comm_key.as_deref())?;
        let cust_root_key = get_key(args.header_key.as_deref())?;
        let gcm_iv = get_key(args.x_gcm_iv.as_deref())?;
        let cust_key = crypto::generate_ec_key(CURVE_NID)?;

        // one slot per host certificate, in declaration order
        let mut key_slots = Vec::with_capacity(args.host_certificates.len());
        for path in &args.host_certificates {
            let host_key = crypto::read_ec_pubkey_cert(CURVE_NID, path)?;
            key_slots.push(KeySlot::new(&cust_key, &host_key, &cust_root_key, &gcm_iv)?);
        }

        // load the stage3a template, with room for the IPIB and PV header
        let stage3a = Stage3a::load(stage3a_path, pv_hdr_size(key_slots.len()))?;
        let stage3a_psw = Psw::new(DEFAULT_INITIAL_PSW_MASK, STAGE3A_ENTRY);

        // shift all components right of the stage3a region
        let mut comps = ComponentList::new();
        comps.set_offset(page_align(STAGE3A_LOAD_ADDRESS + stage3a.size()))?;

        Ok(PvImage {
            tmp_dir: tmp_dir.to_path_buf(),
            verbose: args.verbose > 0,
            cust_key,
            gcm_iv,
            cust_root_key,
            xts_key,
            cust_comm_key,
            pcf,
            scf,
            initial_psw,
            stage3a_psw,
            stage3a,
            key_slots,
            comps,
        })
    }

    fn prepare_key(&self) -> Option<&[u8; AES_256_XTS_KEY_SIZE]> {
        if self.pcf & PV_CONTROL_FLAG_NO_DECRYPTION != 0 {
            // the components only need to be page aligned
            None
        } else {
            Some(&self.xts_key)
        }
    }

    fn prepare_and_add(&mut self, mut comp: Component) -> Result<()> {
        comp.prepare(self.prepare_key(), &self.tmp_dir)?;
        self.comps.add(comp)?;

        if self.verbose {
            let comp = self.comps.components().last().expect("just added");
            eprintln!(
                "{:>12}:\t{:#014x} ({:>12} / {:>12} bytes)",
                comp.ty.name(),
                comp.src_addr,
                comp.size(),
                comp.orig_size
            );
        }
        Ok(())
    }

    /// Prepare a user component and place it in the layout. Components must
    /// be added in type order.
    pub fn add_component_file(&mut self, ty: ComponentType, path: &Path) -> Result<()> {
        let comp = Component::new_file(ty, path)
            .with_context(|| format!("invalid '{}' component", ty.name()))?;
        self.prepare_and_add(comp)
    }

    /// Build the stage-3b from the final component addresses and append it
    /// as the last component.
    fn add_stage3b(&mut self, stage3b_path: &Path) -> Result<()> {
        let args = self.comps.stage3b_args(self.initial_psw);
        let blob = stage3::build_stage3b(stage3b_path, &args)?;
        self.prepare_and_add(Component::new_bytes(ComponentType::Stage3b, blob)?)
    }

    fn build_hdr(&self, digests: &Digests) -> Result<PvHdr> {
        // the encrypted PSW enters the guest through the stage3b
        let stage3b = self.comps.stage3b()?;
        let psw = Psw::new(DEFAULT_INITIAL_PSW_MASK, stage3b.src_addr);

        Ok(PvHdr::new(
            self.gcm_iv,
            self.pcf,
            crypto::pub_key_coords(&self.cust_key)?,
            digests,
            self.key_slots.clone(),
            self.cust_comm_key,
            self.xts_key,
            psw,
            self.scf,
        ))
    }

    /// Append the stage-3b, compute the payload digests, seal the PV header
    /// and patch the stage-3a. No component may be added afterwards.
    pub fn finalize(&mut self, stage3b_path: &Path) -> Result<()> {
        self.add_stage3b(stage3b_path)?;

        let digests = self.comps.finalize()?;
        let hdr = self.build_hdr(&digests)?;
        let sealed = hdr.seal(&self.cust_root_key)?;
        self.stage3a.patch(&self.comps, &sealed)?;

        if self.verbose {
            eprintln!(
                "{:>12}:\t{:#014x} ({:>12} / {:>12} bytes)",
                "stage3a",
                STAGE3A_LOAD_ADDRESS,
                self.stage3a.size(),
                self.stage3a.size()
            );
        }
        Ok(())
    }

    /// Write the image: the short PSW at location 0, the stage-3a region at
    /// its load address, then every component at its source address. The
    /// gaps in between stay holes.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut f = File::create(path)
            .with_context(|| format!("failed to create file '{}'", path.display()))?;

        let short_psw = self
            .stage3a_psw
            .to_short()
            .context("failed to convert the stage3a PSW")?;
        f.write_u64::<BigEndian>(short_psw)?;

        f.seek(SeekFrom::Start(STAGE3A_LOAD_ADDRESS))?;
        std::io::Write::write_all(&mut f, self.stage3a.bytes())?;

        // list is sorted by component type, so also by address
        for comp in self.comps.components() {
            comp.write_into(&mut f)?;
        }
        Ok(())
    }
}
