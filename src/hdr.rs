use std::io::{Cursor, Read};

use anyhow::{bail, ensure, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use openssl::pkey::{PKeyRef, Private, Public};
use openssl::sha;

use crate::components::Digests;
use crate::crypto::{
    self, AES_256_GCM_IV_SIZE, AES_256_GCM_KEY_SIZE, AES_256_GCM_TAG_SIZE, AES_256_XTS_KEY_SIZE,
    EC_PUB_KEY_SIZE,
};
use s390_boot::Psw;

/// "IBMSecEx"
pub const PV_MAGIC: u64 = 0x4942_4d53_6563_4578;
pub const PV_VERSION_1: u32 = 0x0000_0100;

/// The Ultravisor does not decrypt the components during unpack.
pub const PV_CONTROL_FLAG_NO_DECRYPTION: u64 = 0x1000_0000;

pub const PV_HDR_HEAD_SIZE: usize = 388;
pub const PV_HDR_KEY_SLOT_SIZE: usize = 80;
/// Size of the encrypted area with zero optional items (version 1).
pub const PV_HDR_ENCRYPTED_SIZE: usize = 128;

/// One key slot per host: the host key fingerprint plus the customer root
/// key wrapped with the ECDH exchange key of this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlot {
    pub digest_key: [u8; 32],
    pub wrapped_key: [u8; 32],
    pub tag: [u8; AES_256_GCM_TAG_SIZE],
}

impl KeySlot {
    /// The slot wrap reuses the header IV; the exchange key differs per
    /// slot, so the (key, IV) pair never repeats.
    pub fn new(
        cust_key: &PKeyRef<Private>,
        host_key: &PKeyRef<Public>,
        cust_root_key: &[u8; AES_256_GCM_KEY_SIZE],
        gcm_iv: &[u8; AES_256_GCM_IV_SIZE],
    ) -> Result<KeySlot> {
        let raw = crypto::pub_key_coords(host_key)?;
        let digest_key = sha::sha256(&raw);

        let exchange = crypto::exchange_key(cust_key, host_key)?;
        let (wrapped, tag) = crypto::gcm_seal(&exchange, gcm_iv, &[], cust_root_key)?;
        ensure!(
            wrapped.len() == cust_root_key.len(),
            "internal error: wrapped key has the wrong size"
        );

        Ok(KeySlot {
            digest_key,
            wrapped_key: wrapped.try_into().expect("checked size"),
            tag,
        })
    }
}

/// The PV header: cleartext head and key slots (integrity protected as GCM
/// AAD), the encrypted section carrying the image keys, and the GCM tag
/// over all of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvHdr {
    pub phs: u32,
    pub iv: [u8; AES_256_GCM_IV_SIZE],
    pub nks: u64,
    pub sea: u64,
    pub nep: u64,
    pub pcf: u64,
    pub cust_pub_key: [u8; EC_PUB_KEY_SIZE],
    pub pld: [u8; 64],
    pub ald: [u8; 64],
    pub tld: [u8; 64],
    pub slots: Vec<KeySlot>,
    // encrypted section
    pub cust_comm_key: [u8; 32],
    pub img_enc_key: [u8; AES_256_XTS_KEY_SIZE],
    pub psw: Psw,
    pub scf: u64,
    pub noi: u32,
    pub tag: [u8; AES_256_GCM_TAG_SIZE],
}

/// Total header size for @nks key slots and no optional items.
pub fn pv_hdr_size(nks: usize) -> usize {
    PV_HDR_HEAD_SIZE + nks * PV_HDR_KEY_SLOT_SIZE + PV_HDR_ENCRYPTED_SIZE + AES_256_GCM_TAG_SIZE
}

#[allow(clippy::too_many_arguments)]
impl PvHdr {
    pub fn new(
        iv: [u8; AES_256_GCM_IV_SIZE],
        pcf: u64,
        cust_pub_key: [u8; EC_PUB_KEY_SIZE],
        digests: &Digests,
        slots: Vec<KeySlot>,
        cust_comm_key: [u8; 32],
        img_enc_key: [u8; AES_256_XTS_KEY_SIZE],
        psw: Psw,
        scf: u64,
    ) -> PvHdr {
        assert!(!slots.is_empty());
        let sea = PV_HDR_ENCRYPTED_SIZE as u64;
        assert!(sea % 16 == 0);

        PvHdr {
            phs: pv_hdr_size(slots.len()) as u32,
            iv,
            nks: slots.len() as u64,
            sea,
            nep: digests.nep,
            pcf,
            cust_pub_key,
            pld: digests.pld,
            ald: digests.ald,
            tld: digests.tld,
            slots,
            cust_comm_key,
            img_enc_key,
            psw,
            scf,
            noi: 0,
            tag: [0u8; AES_256_GCM_TAG_SIZE],
        }
    }

    pub fn size(&self) -> usize {
        self.phs as usize
    }

    /// Size of the integrity-protected cleartext prefix (head + key slots).
    pub fn aad_size(&self) -> usize {
        self.size() - self.sea as usize - AES_256_GCM_TAG_SIZE
    }

    /// Serialize the header without encrypting the secret section.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());

        buf.write_u64::<BigEndian>(PV_MAGIC).unwrap();
        buf.write_u32::<BigEndian>(PV_VERSION_1).unwrap();
        buf.write_u32::<BigEndian>(self.phs).unwrap();
        buf.extend_from_slice(&self.iv);
        buf.write_u32::<BigEndian>(0).unwrap(); // res1
        buf.write_u64::<BigEndian>(self.nks).unwrap();
        buf.write_u64::<BigEndian>(self.sea).unwrap();
        buf.write_u64::<BigEndian>(self.nep).unwrap();
        buf.write_u64::<BigEndian>(self.pcf).unwrap();
        buf.extend_from_slice(&self.cust_pub_key);
        buf.extend_from_slice(&self.pld);
        buf.extend_from_slice(&self.ald);
        buf.extend_from_slice(&self.tld);
        assert!(buf.len() == PV_HDR_HEAD_SIZE);

        for slot in &self.slots {
            buf.extend_from_slice(&slot.digest_key);
            buf.extend_from_slice(&slot.wrapped_key);
            buf.extend_from_slice(&slot.tag);
        }

        buf.extend_from_slice(&self.cust_comm_key);
        buf.extend_from_slice(&self.img_enc_key);
        buf.write_u64::<BigEndian>(self.psw.mask).unwrap();
        buf.write_u64::<BigEndian>(self.psw.addr).unwrap();
        buf.write_u64::<BigEndian>(self.scf).unwrap();
        buf.write_u32::<BigEndian>(self.noi).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap(); // res2

        buf.extend_from_slice(&self.tag);
        assert!(buf.len() == self.size());
        buf
    }

    /// Serialize and encrypt in one pass: AAD is head and key slots, the
    /// secret section is encrypted in place, the tag lands in the final 16
    /// bytes.
    pub fn seal(&self, cust_root_key: &[u8; AES_256_GCM_KEY_SIZE]) -> Result<Vec<u8>> {
        let mut buf = self.serialize();
        let aad_len = self.aad_size();
        let enc_len = self.sea as usize;

        let (aad, rest) = buf.split_at_mut(aad_len);
        let (ciphertext, tag) = crypto::gcm_seal(cust_root_key, &self.iv, aad, &rest[..enc_len])
            .context("failed to protect the PV header")?;
        ensure!(
            ciphertext.len() == enc_len,
            "internal error: unexpected ciphertext length"
        );

        rest[..enc_len].copy_from_slice(&ciphertext);
        rest[enc_len..].copy_from_slice(&tag);
        Ok(buf)
    }

    /// Inverse of [`PvHdr::serialize`]. The secret section is taken as
    /// stored: parsing a sealed header yields its ciphertext.
    pub fn parse(bytes: &[u8]) -> Result<PvHdr> {
        let mut cur = Cursor::new(bytes);

        fn read_array<const N: usize>(cur: &mut Cursor<&[u8]>) -> Result<[u8; N]> {
            let mut buf = [0u8; N];
            cur.read_exact(&mut buf)?;
            Ok(buf)
        }

        let magic = cur.read_u64::<BigEndian>()?;
        if magic != PV_MAGIC {
            bail!("not a PV header (bad magic)");
        }
        let version = cur.read_u32::<BigEndian>()?;
        if version != PV_VERSION_1 {
            bail!("unsupported PV header version {version:#x}");
        }

        let phs = cur.read_u32::<BigEndian>()?;
        ensure!(phs as usize == bytes.len(), "truncated PV header");
        let iv = read_array(&mut cur)?;
        let _res1 = cur.read_u32::<BigEndian>()?;
        let nks = cur.read_u64::<BigEndian>()?;
        let sea = cur.read_u64::<BigEndian>()?;
        ensure!(
            sea >= PV_HDR_ENCRYPTED_SIZE as u64 && sea % 16 == 0,
            "invalid encrypted-area size {sea}"
        );
        let nep = cur.read_u64::<BigEndian>()?;
        let pcf = cur.read_u64::<BigEndian>()?;
        let cust_pub_key = read_array(&mut cur)?;
        let pld = read_array(&mut cur)?;
        let ald = read_array(&mut cur)?;
        let tld = read_array(&mut cur)?;

        let mut slots = Vec::with_capacity(nks as usize);
        for _ in 0..nks {
            slots.push(KeySlot {
                digest_key: read_array(&mut cur)?,
                wrapped_key: read_array(&mut cur)?,
                tag: read_array(&mut cur)?,
            });
        }

        let cust_comm_key = read_array(&mut cur)?;
        let img_enc_key = read_array(&mut cur)?;
        let psw = Psw::new(cur.read_u64::<BigEndian>()?, cur.read_u64::<BigEndian>()?);
        let scf = cur.read_u64::<BigEndian>()?;
        let noi = cur.read_u32::<BigEndian>()?;
        let _res2 = cur.read_u32::<BigEndian>()?;
        // optional items are not produced in version 1
        let mut opt = vec![0u8; sea as usize - PV_HDR_ENCRYPTED_SIZE];
        cur.read_exact(&mut opt)?;
        let tag = read_array(&mut cur)?;
        ensure!(
            cur.position() as usize == bytes.len(),
            "trailing bytes after PV header"
        );

        Ok(PvHdr {
            phs,
            iv,
            nks,
            sea,
            nep,
            pcf,
            cust_pub_key,
            pld,
            ald,
            tld,
            slots,
            cust_comm_key,
            img_enc_key,
            psw,
            scf,
            noi,
            tag,
        })
    }

    /// Verify the GCM tag of a sealed header and decrypt its secret
    /// section.
    pub fn open(bytes: &[u8], cust_root_key: &[u8; AES_256_GCM_KEY_SIZE]) -> Result<PvHdr> {
        let sealed = PvHdr::parse(bytes)?;
        let aad_len = sealed.aad_size();
        let enc_len = sealed.sea as usize;

        let plaintext = crypto::gcm_open(
            cust_root_key,
            &sealed.iv,
            &bytes[..aad_len],
            &bytes[aad_len..aad_len + enc_len],
            &sealed.tag,
        )
        .context("PV header integrity check failed")?;

        let mut plain_bytes = bytes.to_vec();
        plain_bytes[aad_len..aad_len + enc_len].copy_from_slice(&plaintext);
        PvHdr::parse(&plain_bytes)
    }
}

#[cfg(test)]
mod tests {
    use openssl::ec::EcKey;
    use openssl::pkey::PKey;

    use super::*;
    use crate::crypto::{generate_ec_key, CURVE_NID};

    fn pub_half(key: &PKeyRef<Private>) -> PKey<Public> {
        let ec = key.ec_key().unwrap();
        let pub_ec = EcKey::from_public_key(ec.group(), ec.public_key()).unwrap();
        PKey::from_ec_key(pub_ec).unwrap()
    }

    fn test_digests() -> Digests {
        Digests {
            pld: [0x10; 64],
            ald: [0x20; 64],
            tld: [0x30; 64],
            nep: 7,
        }
    }

    fn test_hdr(slots: Vec<KeySlot>) -> PvHdr {
        PvHdr::new(
            [0x99; 12],
            0,
            [0x44; EC_PUB_KEY_SIZE],
            &test_digests(),
            slots,
            [0x01; 32],
            [0x02; 64],
            Psw::new(0x0000_0001_8000_0000, 0x15000),
            0,
        )
    }

    #[test]
    fn test_sizes() {
        assert_eq!(pv_hdr_size(1), 612);
        assert_eq!(pv_hdr_size(2), 692);

        let hdr = test_hdr(vec![KeySlot {
            digest_key: [0; 32],
            wrapped_key: [0; 32],
            tag: [0; 16],
        }]);
        assert_eq!(hdr.serialize().len(), 612);
        assert_eq!(hdr.aad_size(), PV_HDR_HEAD_SIZE + PV_HDR_KEY_SLOT_SIZE);
    }

    #[test]
    fn test_parse_roundtrip() {
        let slots = vec![
            KeySlot {
                digest_key: [0xaa; 32],
                wrapped_key: [0xbb; 32],
                tag: [0xcc; 16],
            },
            KeySlot {
                digest_key: [0xdd; 32],
                wrapped_key: [0xee; 32],
                tag: [0xff; 16],
            },
        ];
        let hdr = test_hdr(slots);
        let parsed = PvHdr::parse(&hdr.serialize()).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn test_seal_and_open() {
        let cust_root_key = [0x5au8; 32];
        let cust = generate_ec_key(CURVE_NID).unwrap();
        let host = generate_ec_key(CURVE_NID).unwrap();
        let iv = [0x99u8; 12];

        let slot = KeySlot::new(&cust, &pub_half(&host), &cust_root_key, &iv).unwrap();
        let mut hdr = test_hdr(vec![slot]);
        hdr.iv = iv;

        let sealed = hdr.seal(&cust_root_key).unwrap();
        assert_eq!(sealed.len(), hdr.size());
        // cleartext prefix is carried verbatim
        assert_eq!(&sealed[..hdr.aad_size()], &hdr.serialize()[..hdr.aad_size()]);
        // the secret section is not
        assert_ne!(
            &sealed[hdr.aad_size()..hdr.aad_size() + 32],
            &hdr.cust_comm_key[..]
        );

        let opened = PvHdr::open(&sealed, &cust_root_key).unwrap();
        assert_eq!(opened.cust_comm_key, hdr.cust_comm_key);
        assert_eq!(opened.img_enc_key, hdr.img_enc_key);
        assert_eq!(opened.psw, hdr.psw);
        assert_eq!(opened.scf, hdr.scf);
        assert_eq!(opened.slots, hdr.slots);

        // a wrong key must not verify
        assert!(PvHdr::open(&sealed, &[0u8; 32]).is_err());
        // nor a tampered head
        let mut bad = sealed.clone();
        bad[100] ^= 1;
        assert!(PvHdr::open(&bad, &cust_root_key).is_err());
    }

    #[test]
    fn test_key_slot_recovery() {
        let cust_root_key = [0x77u8; 32];
        let iv = [0x12u8; 12];
        let cust = generate_ec_key(CURVE_NID).unwrap();
        let host = generate_ec_key(CURVE_NID).unwrap();

        // built by the tool with (cust_priv, host_pub)
        let slot = KeySlot::new(&cust, &pub_half(&host), &cust_root_key, &iv).unwrap();

        // the slot names the host key by its coordinate digest
        let raw = crypto::pub_key_coords(&pub_half(&host)).unwrap();
        assert_eq!(slot.digest_key, sha::sha256(&raw));

        // recovered by the host with (host_priv, cust_pub)
        let exchange = crypto::exchange_key(&host, &pub_half(&cust)).unwrap();
        let recovered =
            crypto::gcm_open(&exchange, &iv, &[], &slot.wrapped_key, &slot.tag).unwrap();
        assert_eq!(&recovered[..], &cust_root_key[..]);
    }
}
