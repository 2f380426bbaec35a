//! Issuer signature over the front image and face image.
//!
//! DF3 carries a 256-byte check code and the issuer's X.509 certificate. The
//! check code is a raw RSA-2048 signature: applying the certificate's public
//! key yields a PKCS#1 v1.5 type 1 block whose last 32 bytes are
//! `SHA-256(front image ‖ face image)`, where the front image value is
//! zero-padded (or truncated) to 7000 bytes and the face image value to
//! 3000 bytes.

use constant_time_eq::constant_time_eq;
use core::fmt;
use openssl::{
    pkey::Public,
    rsa::{Padding, Rsa},
    x509::{X509NameRef, X509},
};
use sha2::{Digest, Sha256};
use tracing::{error, info, trace};

use crate::{
    bytes2hex,
    profile::{TAG_FACE_IMAGE, TAG_FRONT_IMAGE},
    tlv::parse_tlv,
};

pub const CHECK_CODE_LEN: usize = 256;
pub const FRONT_IMAGE_SIGNED_LEN: usize = 7000;
pub const FACE_IMAGE_SIGNED_LEN: usize = 3000;
pub const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerificationError {
    MissingCheckCode,
    MissingCertificate,
    InvalidCheckCodeLength(usize),
    PublicKeyExtraction(String),
    RsaOperation(String),
    InvalidPadding(&'static str),
    HashMismatch(Box<VerificationDetails>),
    MissingImageData(&'static str),
}
impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::MissingCheckCode => write!(f, "Check code is missing"),
            Self::MissingCertificate => write!(f, "Issuer certificate is missing"),
            Self::InvalidCheckCodeLength(len) => write!(
                f,
                "Check code must be {CHECK_CODE_LEN} bytes, found {len}"
            ),
            Self::PublicKeyExtraction(ref e) => {
                write!(f, "Public key can not be extracted from certificate: {e}")
            }
            Self::RsaOperation(ref e) => write!(f, "RSA operation failed: {e}"),
            Self::InvalidPadding(error_msg) => write!(f, "Invalid signature padding: {error_msg}"),
            Self::HashMismatch(ref details) => write!(
                f,
                "Signed hash {} does not match computed hash {}",
                bytes2hex(&details.signed_hash),
                bytes2hex(&details.computed_hash)
            ),
            Self::MissingImageData(image) => write!(f, "Signed data is missing the {image}"),
        }
    }
}
impl std::error::Error for VerificationError {}

/// What the check code was compared against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationDetails {
    /// Digest recovered from the check code.
    pub signed_hash: Vec<u8>,
    /// Digest computed over the images read from the card.
    pub computed_hash: Vec<u8>,
    pub subject: String,
    pub issuer: String,
}

/// Outcome of a signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub details: Option<VerificationDetails>,
    pub error: Option<VerificationError>,
}

impl From<Result<VerificationDetails, VerificationError>> for VerificationResult {
    fn from(result: Result<VerificationDetails, VerificationError>) -> Self {
        match result {
            Ok(details) => Self {
                is_valid: true,
                details: Some(details),
                error: None,
            },
            Err(VerificationError::HashMismatch(details)) => Self {
                is_valid: false,
                details: Some((*details).clone()),
                error: Some(VerificationError::HashMismatch(details)),
            },
            Err(err) => Self {
                is_valid: false,
                details: None,
                error: Some(err),
            },
        }
    }
}

/// Checks the issuer signature of a card.
pub trait SignatureVerifier {
    /// Verifies `check_code` against the images with the key in `certificate`.
    ///
    /// `front_image_file` and `face_image_file` are the complete EF contents,
    /// the image values are taken from their `0xD0` and `0xD1` records.
    ///
    /// # Errors
    ///
    /// * `VerificationError::HashMismatch` if the signature does not cover the images.
    /// * Any other `VerificationError` if the check code or certificate can not be processed.
    fn verify(
        &self,
        check_code: &[u8],
        certificate: &[u8],
        front_image_file: &[u8],
        face_image_file: &[u8],
    ) -> Result<VerificationDetails, VerificationError>;
}

/// [`SignatureVerifier`] backed by `openssl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensslVerifier;

impl SignatureVerifier for OpensslVerifier {
    fn verify(
        &self,
        check_code: &[u8],
        certificate: &[u8],
        front_image_file: &[u8],
        face_image_file: &[u8],
    ) -> Result<VerificationDetails, VerificationError> {
        verify_signature(check_code, certificate, front_image_file, face_image_file)
    }
}

/// Verifies the check code with `openssl`.
///
/// # Errors
///
/// See [`SignatureVerifier::verify`].
pub fn verify_signature(
    check_code: &[u8],
    certificate: &[u8],
    front_image_file: &[u8],
    face_image_file: &[u8],
) -> Result<VerificationDetails, VerificationError> {
    if check_code.len() != CHECK_CODE_LEN {
        error!(
            "Check code must be {CHECK_CODE_LEN} bytes, found {}",
            check_code.len()
        );
        return Err(VerificationError::InvalidCheckCodeLength(check_code.len()));
    }
    if certificate.is_empty() {
        error!("Issuer certificate is empty");
        return Err(VerificationError::MissingCertificate);
    }

    let certificate = X509::from_der(certificate).map_err(|e| {
        error!("Error while parsing issuer certificate: {e}");
        VerificationError::PublicKeyExtraction(e.to_string())
    })?;
    let subject = name_to_string(certificate.subject_name());
    let issuer = name_to_string(certificate.issuer_name());
    trace!("Issuer certificate subject: {subject}, issuer: {issuer}");

    let public_key = certificate
        .public_key()
        .and_then(|key| key.rsa())
        .map_err(|e| {
            error!("Error while extracting RSA public key: {e}");
            VerificationError::PublicKeyExtraction(e.to_string())
        })?;

    let block = rsa_public_transform(&public_key, check_code)?;
    let signed_hash = unpad_pkcs1_type1(&block)?.to_vec();

    let front_image = parse_tlv(front_image_file, TAG_FRONT_IMAGE).ok_or_else(|| {
        error!("Front image file has no {TAG_FRONT_IMAGE:02X} record");
        VerificationError::MissingImageData("front image")
    })?;
    let face_image = parse_tlv(face_image_file, TAG_FACE_IMAGE).ok_or_else(|| {
        error!("Face image file has no {TAG_FACE_IMAGE:02X} record");
        VerificationError::MissingImageData("face image")
    })?;
    let computed_hash = image_digest(front_image, face_image).to_vec();

    let details = VerificationDetails {
        signed_hash,
        computed_hash,
        subject,
        issuer,
    };
    if constant_time_eq(&details.signed_hash, &details.computed_hash) {
        info!("Check code verified, signed by {}", details.subject);
        Ok(details)
    } else {
        error!(
            "Signed hash {} does not match computed hash {}",
            bytes2hex(&details.signed_hash),
            bytes2hex(&details.computed_hash)
        );
        Err(VerificationError::HashMismatch(Box::new(details)))
    }
}

/// Computes `SHA-256(front ‖ face)` over the fixed-length image values.
///
/// ```
/// use zairyu::signature::image_digest;
/// use sha2::{Digest, Sha256};
///
/// let padded = [vec![0xAA; 10], vec![0x00; 6990], vec![0xBB; 3000]].concat();
/// assert_eq!(image_digest(&[0xAA; 10], &[0xBB; 3100]), Sha256::digest(&padded)[..]);
/// ```
#[must_use]
pub fn image_digest(front_image: &[u8], face_image: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(fixed_length(front_image, FRONT_IMAGE_SIGNED_LEN));
    hasher.update(fixed_length(face_image, FACE_IMAGE_SIGNED_LEN));
    hasher.finalize().into()
}

/// Strips a PKCS#1 v1.5 type 1 block (`00 01 FF .. FF 00 payload`) and returns
/// the trailing digest of the payload.
///
/// # Errors
///
/// * `VerificationError::InvalidPadding` if the block is malformed or the
///   payload is shorter than a digest.
///
/// # Examples
///
/// ```
/// use zairyu::signature::unpad_pkcs1_type1;
///
/// let block = [&[0x00, 0x01, 0xFF, 0xFF, 0x00][..], &[0x5A; 32]].concat();
/// assert_eq!(unpad_pkcs1_type1(&block).unwrap(), [0x5A; 32]);
/// ```
pub fn unpad_pkcs1_type1(block: &[u8]) -> Result<&[u8], VerificationError> {
    let [0x00, 0x01, rest @ ..] = block else {
        error!("Signature block must start with 00 01");
        return Err(VerificationError::InvalidPadding("block type is not 00 01"));
    };
    let Some(separator) = rest.iter().position(|&b| b != 0xFF) else {
        error!("Signature block has no padding terminator");
        return Err(VerificationError::InvalidPadding("padding terminator is missing"));
    };
    if rest[separator] != 0x00 {
        error!(
            "Unexpected byte {:02X} in signature padding",
            rest[separator]
        );
        return Err(VerificationError::InvalidPadding("unexpected byte in padding"));
    }

    let payload = &rest[separator + 1..];
    if payload.len() < DIGEST_LEN {
        error!(
            "Signature payload must contain a {DIGEST_LEN} byte digest, found {} bytes",
            payload.len()
        );
        return Err(VerificationError::InvalidPadding("digest is truncated"));
    }
    Ok(&payload[payload.len() - DIGEST_LEN..])
}

fn rsa_public_transform(public_key: &Rsa<Public>, data: &[u8]) -> Result<Vec<u8>, VerificationError> {
    let mut output = vec![0; public_key.size() as usize];
    let len = public_key
        .public_decrypt(data, &mut output, Padding::NONE)
        .map_err(|e| {
            error!("Raw RSA public key operation failed: {e}");
            VerificationError::RsaOperation(e.to_string())
        })?;
    output.truncate(len);
    Ok(output)
}

fn fixed_length(data: &[u8], len: usize) -> Vec<u8> {
    let mut data = data[..data.len().min(len)].to_vec();
    data.resize(len, 0x00);
    data
}

fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("UNKNOWN");
            let value = entry
                .data()
                .as_utf8()
                .map(|value| value.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
