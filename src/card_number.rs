use core::{fmt, str::FromStr};
use tracing::error;

use crate::ZairyuError;

/// Number of characters in a Residence Card number.
pub const CARD_NUMBER_LEN: usize = 12;

/// Reasons a card number is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardNumberError {
    /// Card number does not have 12 characters, found the given count.
    Length(usize),
    /// Card number consists of valid characters but is not two letters,
    /// eight digits and two letters.
    Format,
    /// Card number contains a character that is neither an ASCII letter nor a digit.
    Characters,
}
impl fmt::Display for CardNumberError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Length(ref found) => write!(
                f,
                "expected {CARD_NUMBER_LEN} characters, found {found}"
            ),
            Self::Format => write!(f, "expected two letters, eight digits and two letters"),
            Self::Characters => write!(f, "only ASCII letters and digits are allowed"),
        }
    }
}
impl std::error::Error for CardNumberError {}

/// A validated Residence Card number, such as `AB12345678CD`.
///
/// Input is case-insensitive and normalized to uppercase. The ASCII bytes of the
/// normalized number are the secret used for deriving the access keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardNumber(String);

impl CardNumber {
    /// Validates `input` and normalizes it to uppercase.
    ///
    /// # Errors
    ///
    /// * `ZairyuError::InvalidCardNumber` with the matching `CardNumberError`.
    ///
    /// # Examples
    ///
    /// ```
    /// use zairyu::{CardNumber, CardNumberError, ZairyuError};
    ///
    /// let number = CardNumber::new("ab12345678cd").unwrap();
    /// assert_eq!(number.as_str(), "AB12345678CD");
    ///
    /// assert!(matches!(
    ///     CardNumber::new("AB123"),
    ///     Err(ZairyuError::InvalidCardNumber(CardNumberError::Length(5)))
    /// ));
    /// ```
    pub fn new(input: &str) -> Result<Self, ZairyuError> {
        let count = input.chars().count();
        if count != CARD_NUMBER_LEN {
            error!("Card number must have {CARD_NUMBER_LEN} characters, found {count}");
            return Err(CardNumberError::Length(count).into());
        }
        if !input.chars().all(|c| c.is_ascii_alphanumeric()) {
            error!("Card number contains characters other than ASCII letters and digits");
            return Err(CardNumberError::Characters.into());
        }

        let normalized = input.to_ascii_uppercase();
        let bytes = normalized.as_bytes();
        let well_formed = bytes[..2].iter().all(u8::is_ascii_uppercase)
            && bytes[2..10].iter().all(u8::is_ascii_digit)
            && bytes[10..].iter().all(u8::is_ascii_uppercase);
        if !well_formed {
            error!("Card number does not match the two letters, eight digits, two letters format");
            return Err(CardNumberError::Format.into());
        }

        Ok(Self(normalized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl FromStr for CardNumber {
    type Err = ZairyuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for CardNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
