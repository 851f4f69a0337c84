use std::cmp::max;
use std::mem;

use anyhow::{bail, Result};
use openssl::sha::Sha512;

use crate::component::{Component, ComponentType};
use crate::utils::is_page_aligned;
use s390_boot::{MemBlob, Psw, Stage3bArgs, PAGE_SIZE};

/// The three payload digests and the total number of encrypted pages, as
/// they appear in the PV header.
pub struct Digests {
    /// Page-list digest: contents of every page.
    pub pld: [u8; 64],
    /// Address-list digest: guest-absolute address of every page.
    pub ald: [u8; 64],
    /// Tweak-list digest: XTS tweak of every page.
    pub tld: [u8; 64],
    pub nep: u64,
}

/// Components ordered by type, with their guest memory layout. Feeds the
/// three digest computations on finalization; afterwards the list is
/// immutable.
pub struct ComponentList {
    finalized: bool,
    next_src: u64,
    nep: u64,
    pld: Sha512,
    ald: Sha512,
    tld: Sha512,
    comps: Vec<Component>,
}

impl std::fmt::Debug for ComponentList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentList")
            .field("finalized", &self.finalized)
            .field("next_src", &self.next_src)
            .field("nep", &self.nep)
            .field("comps", &self.comps)
            .finish()
    }
}

impl Default for ComponentList {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentList {
    pub fn new() -> ComponentList {
        ComponentList {
            finalized: false,
            next_src: 0,
            nep: 0,
            pld: Sha512::new(),
            ald: Sha512::new(),
            tld: Sha512::new(),
            comps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.comps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }

    pub fn components(&self) -> &[Component] {
        &self.comps
    }

    /// Shift the layout right by @offset, reserving room at the start of the
    /// image (for the stage-3a loader). Only valid before any component was
    /// added.
    pub fn set_offset(&mut self, offset: u64) -> Result<()> {
        if !self.comps.is_empty() {
            bail!("offset cannot be changed after a component was added");
        }
        assert!(is_page_aligned(offset));

        self.next_src += offset;
        assert!(is_page_aligned(self.next_src));
        Ok(())
    }

    /// Assign the next source address to @comp and append it. Components
    /// must be added in type order; an empty component still occupies one
    /// page.
    pub fn add(&mut self, mut comp: Component) -> Result<()> {
        if self.finalized {
            bail!("failed to add a component as the PV header is already created");
        }
        if self.comps.iter().any(|c| c.ty == comp.ty) {
            bail!("multiple components of type '{}'", comp.ty.name());
        }
        if let Some(last) = self.comps.last() {
            assert!(last.ty < comp.ty);
        }
        assert!(is_page_aligned(self.next_src));

        comp.src_addr = self.next_src;
        self.next_src += max(comp.size(), PAGE_SIZE);
        assert!(is_page_aligned(self.next_src));

        self.comps.push(comp);
        Ok(())
    }

    /// The stage-3b loader, always the last component.
    pub fn stage3b(&self) -> Result<&Component> {
        match self.comps.last() {
            Some(comp) if comp.is_stage3b() => Ok(comp),
            _ => bail!("failed to get 'stage3b' component"),
        }
    }

    /// Build the stage-3b argument block from the final component layout.
    /// The stage-3b needs the original sizes, not the padded ones.
    pub fn stage3b_args(&self, psw: Psw) -> Stage3bArgs {
        let mut args = Stage3bArgs {
            psw,
            ..Default::default()
        };

        for comp in &self.comps {
            let blob = MemBlob::new(comp.src_addr, comp.orig_size);
            match comp.ty {
                ComponentType::Kernel => args.kernel = blob,
                ComponentType::Cmdline => args.cmdline = blob,
                ComponentType::Initrd => args.initrd = blob,
                // the stage3b does not relocate itself
                ComponentType::Stage3b => (),
            }
        }
        args
    }

    /// Compute pld, ald, tld and nep over all components, in list order.
    /// No component may be added afterwards.
    pub fn finalize(&mut self) -> Result<Digests> {
        self.finalized = true;

        let mut pld = mem::replace(&mut self.pld, Sha512::new());
        let mut ald = mem::replace(&mut self.ald, Sha512::new());
        let mut tld = mem::replace(&mut self.tld, Sha512::new());

        for comp in &self.comps {
            let nep_pld = comp.update_pld(&mut pld)?;
            let nep_ald = comp.update_ald(&mut ald);
            let nep_tld = comp.update_tld(&mut tld);
            if nep_pld != nep_ald || nep_ald != nep_tld {
                bail!(
                    "internal error: page counts of '{}' diverge ({nep_pld}/{nep_ald}/{nep_tld})",
                    comp.ty.name()
                );
            }
            self.nep += nep_pld;
        }

        Ok(Digests {
            pld: pld.finish(),
            ald: ald.finish(),
            tld: tld.finish(),
            nep: self.nep,
        })
    }
}
