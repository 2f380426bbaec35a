//! Mutual authentication between the terminal and the card.
//!
//! The access key is derived from the card number, the session key from the
//! key halves exchanged during MUTUAL AUTHENTICATE.

use constant_time_eq::constant_time_eq;
use core::fmt;
use sha1_checked::Sha1;
use tracing::error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    crypto::{retail_mac, tdes_transform, xor_slices, KEY_LEN, MAC_LEN},
    tlv::encode_tlv,
    CardNumber, ZairyuError,
};

pub(crate) const RND_LEN: usize = 8;
pub(crate) const MUTUAL_AUTH_LEN: usize = 2 * RND_LEN + KEY_LEN;
pub(crate) const MUTUAL_AUTH_RESPONSE_LEN: usize = MUTUAL_AUTH_LEN + MAC_LEN;

/// Tag of the secure messaging data object carrying the encrypted card number
/// and every encrypted response.
pub(crate) const TAG_SM_DATA: u8 = 0x86;
/// Padding indicator prefixed to the ciphertext in a `0x86` object.
pub(crate) const PADDING_INDICATOR: u8 = 0x01;

/// Progress of the authentication sequence.
///
/// `ChallengeReceived` and `MutuallyAuthenticated` only exist while
/// `CardComms::authenticate` runs. Afterwards the state is `SessionVerified`,
/// `Failed`, or `Idle` once the session has been ended. The cause of a failure
/// is the error returned by `authenticate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    ChallengeReceived,
    MutuallyAuthenticated,
    SessionVerified,
    /// Kept across `CardComms::end_session` until the next authentication.
    Failed,
}

/// The 16-byte session key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for SessionKey {}

impl SessionKey {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derives the access key used as both kEnc and kMac during mutual authentication.
///
/// The key is the first 16 bytes of SHA-1 over the ASCII card number.
///
/// # Errors
///
/// `ZairyuError` if SHA-1 detects a collision attack.
pub fn derive_access_key(card_number: &CardNumber) -> Result<Zeroizing<[u8; KEY_LEN]>, ZairyuError> {
    sha1_key(card_number.as_bytes(), "derive_access_key")
}

/// Derives the session key from K.IFD and K.ICC.
///
/// The key is the first 16 bytes of SHA-1 over `(K.IFD XOR K.ICC) || 00 00 00 01`.
///
/// # Errors
///
/// `ZairyuError` if SHA-1 detects a collision attack.
pub fn derive_session_key(
    k_ifd: &[u8; KEY_LEN],
    k_icc: &[u8; KEY_LEN],
) -> Result<SessionKey, ZairyuError> {
    let mut seed = Zeroizing::new(xor_slices(k_ifd, k_icc)?);
    seed.extend_from_slice(b"\x00\x00\x00\x01");
    let key = sha1_key(&seed, "derive_session_key")?;
    Ok(SessionKey(*key))
}

fn sha1_key(data: &[u8], context: &'static str) -> Result<Zeroizing<[u8; KEY_LEN]>, ZairyuError> {
    let hash_result = Sha1::try_digest(data);
    if hash_result.has_collision() {
        error!("SHA1 hash calculation during {context} had collision");
        return Err(ZairyuError::CalculateHashError(
            "SHA1 hash calculation had collision",
        ));
    }
    let mut key = Zeroizing::new([0_u8; KEY_LEN]);
    key.copy_from_slice(&hash_result.hash().as_slice()[..KEY_LEN]);
    Ok(key)
}

/// Builds the MUTUAL AUTHENTICATE command data E.IFD‖M.IFD.
///
/// # Errors
///
/// `ZairyuError` if a cipher operation fails.
pub(crate) fn build_mutual_auth_data(
    rnd_ifd: &[u8; RND_LEN],
    rnd_icc: &[u8; RND_LEN],
    k_ifd: &[u8; KEY_LEN],
    access_key: &[u8; KEY_LEN],
) -> Result<Vec<u8>, ZairyuError> {
    let s = Zeroizing::new([&rnd_ifd[..], &rnd_icc[..], &k_ifd[..]].concat());
    let e_ifd = tdes_transform(&s, access_key, true)?;
    let m_ifd = retail_mac(&e_ifd, access_key)?;
    Ok([&e_ifd[..], &m_ifd[..]].concat())
}

/// Checks the MUTUAL AUTHENTICATE response E.ICC‖M.ICC and returns K.ICC.
///
/// # Errors
///
/// * `ZairyuError::InvalidResponse` if the response is not 40 bytes.
/// * `ZairyuError::CryptographyError` if the MAC or one of the nonces does not match.
pub(crate) fn verify_mutual_auth_response(
    response: &[u8],
    rnd_icc: &[u8; RND_LEN],
    rnd_ifd: &[u8; RND_LEN],
    access_key: &[u8; KEY_LEN],
) -> Result<Zeroizing<[u8; KEY_LEN]>, ZairyuError> {
    if response.len() != MUTUAL_AUTH_RESPONSE_LEN {
        error!(
            "MUTUAL AUTHENTICATE response must be {MUTUAL_AUTH_RESPONSE_LEN} bytes, found {}",
            response.len()
        );
        return Err(ZairyuError::InvalidResponse(
            "MUTUAL AUTHENTICATE response has wrong length",
        ));
    }
    let (e_icc, m_icc) = response.split_at(MUTUAL_AUTH_LEN);

    let mac = retail_mac(e_icc, access_key)?;
    if !constant_time_eq(&mac, m_icc) {
        error!("MAC verification failed");
        return Err(ZairyuError::CryptographyError("MAC verification failed"));
    }

    let r = Zeroizing::new(tdes_transform(e_icc, access_key, false)?);
    if !constant_time_eq(&r[..RND_LEN], rnd_icc) {
        error!("RND.ICC verification failed");
        return Err(ZairyuError::CryptographyError("RND.ICC verification failed"));
    }
    if !constant_time_eq(&r[RND_LEN..2 * RND_LEN], rnd_ifd) {
        error!("RND.IFD verification failed");
        return Err(ZairyuError::CryptographyError("RND.IFD verification failed"));
    }

    let mut k_icc = Zeroizing::new([0_u8; KEY_LEN]);
    k_icc.copy_from_slice(&r[2 * RND_LEN..]);
    Ok(k_icc)
}

/// Builds the VERIFY command data, the card number encrypted with the session key
/// wrapped in a `0x86` object with padding indicator.
///
/// # Errors
///
/// `ZairyuError` if a cipher operation fails.
pub(crate) fn build_verify_data(
    card_number: &CardNumber,
    session_key: &SessionKey,
) -> Result<Vec<u8>, ZairyuError> {
    let mut plaintext = Zeroizing::new(card_number.as_bytes().to_vec());
    plaintext.extend_from_slice(b"\x80\x00\x00\x00");
    let ciphertext = tdes_transform(&plaintext, session_key.as_bytes(), true)?;
    encode_tlv(
        TAG_SM_DATA,
        &[&[PADDING_INDICATOR][..], &ciphertext].concat(),
    )
}
