///
/// Cryptography helpers for the image builder, backed by OpenSSL.
///
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use openssl::bn::{BigNum, BigNumContext};
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private, Public};
use openssl::rand::rand_bytes;
use openssl::sha;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher, Crypter, Mode};
use openssl::x509::X509;
use thiserror::Error;

use s390_boot::PAGE_SIZE;

pub const AES_256_GCM_KEY_SIZE: usize = 32;
pub const AES_256_GCM_IV_SIZE: usize = 12;
pub const AES_256_GCM_TAG_SIZE: usize = 16;
pub const AES_256_XTS_KEY_SIZE: usize = 64;
pub const AES_256_XTS_TWEAK_SIZE: usize = 16;

/// Size of one affine coordinate of a secp521r1 point, zero-padded.
pub const EC_COORD_SIZE: usize = 66;
/// Raw public key: x and y coordinate.
pub const EC_PUB_KEY_SIZE: usize = 2 * EC_COORD_SIZE;

/// The curve used for the key exchange between customer and host keys.
pub const CURVE_NID: Nid = Nid::SECP521R1;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("OpenSSL error")]
    OpenSsl(#[from] ErrorStack),

    #[error("{0}")]
    Internal(&'static str),

    #[error("GCM tag verification failed")]
    Verification,

    #[error("failed to read certificate '{0}'")]
    ReadCertificate(String),

    #[error("EC key could not be auto-generated")]
    KeyGeneration,

    #[error("key derivation failed")]
    Derive,

    #[error("{0} could not be auto-generated as the PRNG has not been seeded with enough randomness")]
    Randomization(&'static str),

    #[error("{0}")]
    InvalidParm(String),

    #[error("invalid key size in file '{path}': read {read}, expected {expected}")]
    InvalidKeySize {
        path: String,
        read: u64,
        expected: usize,
    },

    #[error("I/O")]
    IO(#[from] std::io::Error),
}

type Result<T> = core::result::Result<T, CryptoError>;

/// XTS tweak of one component: component type (2 bytes, big-endian),
/// random bytes (6), page counter (8, starts at zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tweak(pub [u8; AES_256_XTS_TWEAK_SIZE]);

impl Tweak {
    /// The first eight bytes as a big-endian integer. Identifies the
    /// component in the IPL information block.
    pub fn prefix_u64(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().expect("tweak prefix"))
    }
}

pub fn generate_tweak(idx: u16) -> Result<Tweak> {
    let mut tweak = [0u8; AES_256_XTS_TWEAK_SIZE];
    tweak[..2].copy_from_slice(&idx.to_be_bytes());
    rand_bytes(&mut tweak[2..8]).map_err(|_| CryptoError::Randomization("Tweak/IV"))?;
    Ok(Tweak(tweak))
}

pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    rand_bytes(&mut buf).map_err(|_| CryptoError::Randomization("Key"))?;
    Ok(buf)
}

/// Read a raw key of exactly @expected bytes from @path.
pub fn read_key_file(path: &Path, expected: usize) -> Result<Vec<u8>> {
    let size = fs::metadata(path)?.len();
    if size != expected as u64 {
        return Err(CryptoError::InvalidKeySize {
            path: path.display().to_string(),
            read: size,
            expected,
        });
    }

    let data = fs::read(path)?;
    if data.len() != expected {
        return Err(CryptoError::InvalidKeySize {
            path: path.display().to_string(),
            read: data.len() as u64,
            expected,
        });
    }
    Ok(data)
}

/// AES-256-GCM authenticated encryption. Returns the ciphertext and the
/// 16-byte tag. @aad and @data may have any length.
pub fn gcm_seal(
    key: &[u8; AES_256_GCM_KEY_SIZE],
    iv: &[u8; AES_256_GCM_IV_SIZE],
    aad: &[u8],
    data: &[u8],
) -> Result<(Vec<u8>, [u8; AES_256_GCM_TAG_SIZE])> {
    let mut tag = [0u8; AES_256_GCM_TAG_SIZE];
    let ciphertext = encrypt_aead(Cipher::aes_256_gcm(), key, Some(iv), aad, data, &mut tag)
        .map_err(|_| CryptoError::Internal("AES-GCM encryption failed"))?;
    Ok((ciphertext, tag))
}

/// Inverse of [`gcm_seal`]. Fails if the tag does not authenticate
/// @aad and @data under @key and @iv.
pub fn gcm_open(
    key: &[u8; AES_256_GCM_KEY_SIZE],
    iv: &[u8; AES_256_GCM_IV_SIZE],
    aad: &[u8],
    data: &[u8],
    tag: &[u8; AES_256_GCM_TAG_SIZE],
) -> Result<Vec<u8>> {
    decrypt_aead(Cipher::aes_256_gcm(), key, Some(iv), aad, data, tag)
        .map_err(|_| CryptoError::Verification)
}

fn read_page<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
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

/// Encrypt @input with AES-256-XTS in 4096-byte chunks. A trailing partial
/// chunk is zero-padded to a whole page before encryption. After each page
/// the tweak, taken as a 128-bit big-endian integer, is advanced by the page
/// size; the caller's tweak is left untouched. Empty input produces no
/// output. Returns the number of bytes consumed and produced.
pub fn xts_encrypt_stream<R: Read, W: Write>(
    key: &[u8; AES_256_XTS_KEY_SIZE],
    tweak: &Tweak,
    input: &mut R,
    output: &mut W,
) -> Result<(u64, u64)> {
    let mut tweak_num = u128::from_be_bytes(tweak.0);
    let mut in_buf = [0u8; PAGE_SIZE as usize];
    let mut out_buf = [0u8; PAGE_SIZE as usize + 16];
    let mut size_in = 0u64;
    let mut size_out = 0u64;

    loop {
        in_buf.fill(0);
        let n = read_page(input, &mut in_buf)?;
        if n == 0 {
            break;
        }
        size_in += n as u64;

        // one cipher pass per page, re-keyed with the advanced tweak
        let mut crypter = Crypter::new(
            Cipher::aes_256_xts(),
            Mode::Encrypt,
            key,
            Some(&tweak_num.to_be_bytes()),
        )?;
        crypter.pad(false);
        let mut written = crypter.update(&in_buf, &mut out_buf)?;
        written += crypter.finalize(&mut out_buf[written..])?;
        if written != PAGE_SIZE as usize {
            return Err(CryptoError::Internal("unexpected XTS output length"));
        }

        output.write_all(&out_buf[..written])?;
        size_out += written as u64;
        tweak_num = tweak_num.wrapping_add(PAGE_SIZE as u128);

        if n < in_buf.len() {
            break;
        }
    }

    Ok((size_in, size_out))
}

/// Generate a fresh EC key pair on @nid.
pub fn generate_ec_key(nid: Nid) -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(nid)?;
    let key = EcKey::generate(&group).map_err(|_| CryptoError::KeyGeneration)?;
    Ok(PKey::from_ec_key(key)?)
}

/// Raw ECDH: the shared curve scalar, 66 bytes on secp521r1.
pub fn ecdh_derive(
    priv_key: &PKeyRef<Private>,
    pub_key: &PKeyRef<Public>,
) -> Result<Vec<u8>> {
    let mut deriver = Deriver::new(priv_key).map_err(|_| CryptoError::Derive)?;
    deriver.set_peer(pub_key).map_err(|_| CryptoError::Derive)?;
    deriver.derive_to_vec().map_err(|_| CryptoError::Derive)
}

/// Single-step SP 800-56A KDF over the ECDH shared secret: SHA-256 of the
/// 66-byte secret followed by the big-endian 32-bit counter 1.
pub fn exchange_key(
    priv_key: &PKeyRef<Private>,
    pub_key: &PKeyRef<Public>,
) -> Result<[u8; 32]> {
    let shared = ecdh_derive(priv_key, pub_key)?;
    if shared.len() != EC_COORD_SIZE {
        return Err(CryptoError::Internal("unexpected ECDH secret size"));
    }

    let mut buf = [0u8; EC_COORD_SIZE + 4];
    buf[..EC_COORD_SIZE].copy_from_slice(&shared);
    buf[EC_COORD_SIZE + 3] = 0x01;
    Ok(sha::sha256(&buf))
}

/// The affine coordinates of the public key, each zero-left-padded to
/// 66 bytes. This is the key format used in the PV header.
pub fn pub_key_coords<T: HasPublic>(key: &PKeyRef<T>) -> Result<[u8; EC_PUB_KEY_SIZE]> {
    let ec = key
        .ec_key()
        .map_err(|_| CryptoError::InvalidParm("key is not an Elliptic Curve key".into()))?;
    let mut ctx = BigNumContext::new()?;
    let mut x = BigNum::new()?;
    let mut y = BigNum::new()?;
    ec.public_key()
        .affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx)
        .map_err(|_| CryptoError::Internal("cannot convert key to raw format"))?;

    let mut raw = [0u8; EC_PUB_KEY_SIZE];
    raw[..EC_COORD_SIZE].copy_from_slice(&x.to_vec_padded(EC_COORD_SIZE as i32)?);
    raw[EC_COORD_SIZE..].copy_from_slice(&y.to_vec_padded(EC_COORD_SIZE as i32)?);
    Ok(raw)
}

fn check_curve<T: HasPublic>(key: &PKeyRef<T>, nid: Nid, path: &Path) -> Result<()> {
    let ec = key.ec_key().map_err(|_| {
        CryptoError::InvalidParm(format!(
            "certificate '{}' has no Elliptic Curve key",
            path.display()
        ))
    })?;

    ec.check_key().map_err(|_| {
        CryptoError::InvalidParm(format!(
            "certificate '{}' has no valid Elliptic Curve key",
            path.display()
        ))
    })?;

    match ec.group().curve_name() {
        Some(name) if name == nid => Ok(()),
        Some(_) => Err(CryptoError::InvalidParm(format!(
            "the Elliptic Curve key of certificate '{}' uses the wrong curve",
            path.display()
        ))),
        None => {
            // maybe the curve name is simply unset, check the point itself
            let group = EcGroup::from_curve_name(nid)?;
            let mut ctx = BigNumContext::new()?;
            if ec.public_key().is_on_curve(&group, &mut ctx)? {
                Ok(())
            } else {
                Err(CryptoError::InvalidParm(format!(
                    "the Elliptic Curve key of certificate '{}' uses the wrong curve",
                    path.display()
                )))
            }
        }
    }
}

/// Load a PEM X.509 certificate and extract its public key, which must be
/// an EC key on @nid. Chain verification against a trust store is not
/// implemented yet, see the `--no-cert-check` handling in the driver.
pub fn read_ec_pubkey_cert(nid: Nid, path: &Path) -> Result<PKey<Public>> {
    let pem =
        fs::read(path).map_err(|_| CryptoError::ReadCertificate(path.display().to_string()))?;
    let cert = X509::from_pem(&pem)
        .map_err(|_| CryptoError::ReadCertificate(path.display().to_string()))?;
    let key = cert.public_key().map_err(|_| {
        CryptoError::InvalidParm(format!(
            "failed to get public key from certificate '{}'",
            path.display()
        ))
    })?;

    check_curve(&key, nid, path)?;
    Ok(key)
}
