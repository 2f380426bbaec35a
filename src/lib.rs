//! A library that can read a Japanese Residence Card.
//!
//! A library that can read a Japanese Residence Card (在留カード) and a Special
//! Permanent Resident Certificate over ISO/IEC 7816-4.
//!
//! The `zairyu` crate authenticates to the card with the card number printed on
//! its face, opens the secure messaging channel (2-key Triple-DES and the
//! ISO/IEC 9797-1 Algorithm 3 retail MAC), reads every data file and checks the
//! issuer signature over the front image and face image with `openssl`.
//!
//! **NOTE:**
//! Please note that this crate is provided 'as is' and is not considered production-ready. Use at your own risk.
//!
//! # Quick Start
//!
//! ```no_run
//! use zairyu::{bytes2hex, read_card, ReaderConfig, ZairyuError};
//! use tracing::{error, info};
//!
//! fn main() -> Result<(), ZairyuError> {
//!     tracing_subscriber::fmt()
//!         .with_max_level(tracing::Level::TRACE)
//!         .init();
//!
//!     let card_number = "AB12345678CD";
//!
//!     // Establish a PC/SC context.
//!     let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
//!         Ok(ctx) => ctx,
//!         Err(err) => {
//!             error!("Failed to establish context: {err}");
//!             return Ok(());
//!         }
//!     };
//!
//!     // Use the first reader.
//!     let mut readers_buf = [0; 2048];
//!     let Some(reader) = ctx.list_readers(&mut readers_buf).ok().and_then(|mut r| r.next()) else {
//!         error!("No readers are connected.");
//!         return Ok(());
//!     };
//!
//!     let card = match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
//!         Ok(card) => card,
//!         Err(err) => {
//!             error!("Failed to connect to card: {err}");
//!             return Ok(());
//!         }
//!     };
//!
//!     let card_data = read_card(card, card_number, ReaderConfig::default())?;
//!     info!("Card type: {:?}", card_data.card_type());
//!     info!("Check code: {}", bytes2hex(card_data.check_code()));
//!     if let Some(result) = card_data.verification_result() {
//!         info!("Signature valid: {}", result.is_valid);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

use core::fmt::{self, Write};

mod apdu;
mod auth;
mod card_number;
mod comms;
pub mod crypto;
pub mod profile;
mod session;
pub mod signature;
pub mod tlv;

#[cfg(test)]
mod testing;

pub use apdu::{CardTransport, APDU};
pub use auth::{derive_access_key, derive_session_key, AuthState, SessionKey};
pub use card_number::{CardNumber, CardNumberError};
pub use comms::CardComms;
pub use profile::{CardProfile, ResidenceCardProfile};
pub use session::{
    read_card, AdditionalData, AddressRecord, CardData, CardReader, CardType, ReaderConfig,
    DEFAULT_MAX_RESPONSE_LEN,
};
pub use signature::{
    OpensslVerifier, SignatureVerifier, VerificationDetails, VerificationError,
    VerificationResult,
};

#[derive(Debug)]
#[non_exhaustive]
pub enum ZairyuError {
    TransportUnavailable(pcsc::Error),
    TransportError(&'static str),
    InvalidCardNumber(CardNumberError),
    InvalidResponse(&'static str),
    CardError(u8, u8),
    IncorrectCredential { retries_remaining: u8 },
    CryptographyError(&'static str),
    VerificationError(VerificationError),
    InvalidArgument(&'static str),
    CalculateHashError(&'static str),
}
impl fmt::Display for ZairyuError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::TransportUnavailable(ref e) => {
                write!(f, "Card transport is unavailable: ")?;
                fmt::Display::fmt(&e, f)
            }
            Self::TransportError(error_msg) => write!(f, "Card transport failure: {error_msg}"),
            Self::InvalidCardNumber(ref e) => write!(f, "Invalid card number: {e}"),
            Self::InvalidResponse(error_msg) => write!(f, "Card response is invalid: {error_msg}"),
            Self::CardError(ref sw1, ref sw2) => write!(
                f,
                "APDU command failed with status code: {sw1:02X} {sw2:02X}"
            ),
            Self::IncorrectCredential {
                ref retries_remaining,
            } => write!(
                f,
                "Card number was rejected by the card, {retries_remaining} retries remaining"
            ),
            Self::CryptographyError(error_msg) => write!(f, "Cryptography failure: {error_msg}"),
            Self::VerificationError(ref e) => {
                write!(f, "Signature verification failure: {e}")
            }
            Self::InvalidArgument(error_msg) => write!(f, "Invalid argument: {error_msg}"),
            Self::CalculateHashError(error_msg) => {
                write!(f, "Failure during calculation of hashes: {error_msg}")
            }
        }
    }
}
impl std::error::Error for ZairyuError {}

impl From<CardNumberError> for ZairyuError {
    fn from(e: CardNumberError) -> Self {
        Self::InvalidCardNumber(e)
    }
}

impl From<VerificationError> for ZairyuError {
    fn from(e: VerificationError) -> Self {
        Self::VerificationError(e)
    }
}

/// Converts a byte slice to an uppercase hexadecimal string.
///
/// # Examples
///
/// ```
/// use zairyu::bytes2hex;
///
/// assert_eq!(bytes2hex(&[0x08, 0xB0, 0x85, 0x00]), "08B08500");
/// assert_eq!(bytes2hex(&[]), "");
/// ```
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, &byte| {
        write!(&mut acc, "{byte:02X}").expect("Failed to write to string");
        acc
    })
}
