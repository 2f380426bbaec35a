use core::fmt;
use rand::{rngs::OsRng, CryptoRng, RngCore};
use tracing::{error, info};

use crate::{
    profile::{
        short_ef, CardProfile, ResidenceCardProfile, TAG_ADDRESS, TAG_ADDRESS_DATE,
        TAG_CARD_TYPE, TAG_CERTIFICATE, TAG_CHECK_CODE, TAG_FACE_IMAGE, TAG_FRONT_IMAGE,
        TAG_MUNICIPALITY_CODE, TAG_PERMISSION, TAG_VERSION,
    },
    signature::{
        OpensslVerifier, SignatureVerifier, VerificationError, VerificationResult, CHECK_CODE_LEN,
    },
    tlv::parse_tlv,
    CardComms, CardNumber, CardTransport, ZairyuError,
};

/// Largest response the reader asks for in one READ BINARY.
pub const DEFAULT_MAX_RESPONSE_LEN: usize = 1693;

/// Settings of a [`CardReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Expected length of every READ BINARY, between 1 and 65536.
    pub max_response_len: usize,
    /// Whether the check code is verified after reading.
    pub verify_signature: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_response_len: DEFAULT_MAX_RESPONSE_LEN,
            verify_signature: true,
        }
    }
}

impl ReaderConfig {
    #[must_use]
    pub const fn with_max_response_len(mut self, max_response_len: usize) -> Self {
        self.max_response_len = max_response_len;
        self
    }

    #[must_use]
    pub const fn with_verify_signature(mut self, verify_signature: bool) -> Self {
        self.verify_signature = verify_signature;
        self
    }
}

/// Kind of card, from the `0xC1` record of the card type file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardType {
    /// `"1"`
    ResidenceCard,
    /// `"2"`
    SpecialPermanentResident,
    Unknown(Vec<u8>),
}

impl CardType {
    /// Parses the card type file.
    ///
    /// # Errors
    ///
    /// * `ZairyuError::InvalidResponse` if the file has no `0xC1` record.
    ///
    /// # Examples
    ///
    /// ```
    /// use zairyu::CardType;
    ///
    /// assert_eq!(CardType::from_file(&[0xC1, 0x01, 0x31]).unwrap(), CardType::ResidenceCard);
    /// assert_eq!(
    ///     CardType::from_file(&[0xC1, 0x01, 0x32]).unwrap(),
    ///     CardType::SpecialPermanentResident
    /// );
    /// ```
    pub fn from_file(card_type_file: &[u8]) -> Result<Self, ZairyuError> {
        let value = parse_tlv(card_type_file, TAG_CARD_TYPE).ok_or_else(|| {
            error!("Card type file has no {TAG_CARD_TYPE:02X} record");
            ZairyuError::InvalidResponse("card type record is missing")
        })?;
        Ok(match value {
            b"1" => Self::ResidenceCard,
            b"2" => Self::SpecialPermanentResident,
            other => Self::Unknown(other.to_vec()),
        })
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::ResidenceCard => write!(f, "Residence Card"),
            Self::SpecialPermanentResident => write!(f, "Special Permanent Resident Certificate"),
            Self::Unknown(ref value) => write!(f, "Unknown card type {value:02X?}"),
        }
    }
}

/// Permission files, present on residence cards only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalData {
    pub comprehensive_permission: Vec<u8>,
    pub individual_permission: Vec<u8>,
    pub extension_application: Vec<u8>,
}

impl AdditionalData {
    #[must_use]
    pub fn comprehensive_permission_text(&self) -> Option<&str> {
        permission_text(&self.comprehensive_permission)
    }

    #[must_use]
    pub fn individual_permission_text(&self) -> Option<&str> {
        permission_text(&self.individual_permission)
    }

    #[must_use]
    pub fn extension_application_text(&self) -> Option<&str> {
        permission_text(&self.extension_application)
    }
}

fn permission_text(file: &[u8]) -> Option<&str> {
    parse_tlv(file, TAG_PERMISSION).and_then(|value| core::str::from_utf8(value).ok())
}

/// Records of the address file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    /// `YYYYMMDD`
    pub date: String,
    pub municipality_code: String,
    pub address: Vec<u8>,
}

impl AddressRecord {
    /// Parses the address file.
    ///
    /// # Errors
    ///
    /// * `ZairyuError::InvalidResponse` if a record is missing or the date or
    ///   municipality code is not ASCII.
    pub fn from_file(address_file: &[u8]) -> Result<Self, ZairyuError> {
        let ascii_record = |tag: u8, name: &'static str| -> Result<String, ZairyuError> {
            let value = parse_tlv(address_file, tag).ok_or_else(|| {
                error!("Address file has no {tag:02X} record ({name})");
                ZairyuError::InvalidResponse("address record is missing")
            })?;
            if !value.is_ascii() {
                error!("Address record {tag:02X} ({name}) is not ASCII");
                return Err(ZairyuError::InvalidResponse("address record is not ASCII"));
            }
            Ok(String::from_utf8_lossy(value).into_owned())
        };

        let date = ascii_record(TAG_ADDRESS_DATE, "date")?;
        let municipality_code = ascii_record(TAG_MUNICIPALITY_CODE, "municipality code")?;
        let address = parse_tlv(address_file, TAG_ADDRESS)
            .ok_or_else(|| {
                error!("Address file has no {TAG_ADDRESS:02X} record");
                ZairyuError::InvalidResponse("address record is missing")
            })?
            .to_vec();

        Ok(Self {
            date,
            municipality_code,
            address,
        })
    }

    /// The address as text, if it is valid UTF-8.
    #[must_use]
    pub fn address_text(&self) -> Option<&str> {
        core::str::from_utf8(&self.address).ok()
    }
}

/// Everything read from a card.
///
/// File fields hold the complete EF contents as read. Equality ignores the
/// verification result.
#[derive(Debug, Clone)]
pub struct CardData {
    common_data: Vec<u8>,
    card_type_file: Vec<u8>,
    card_type: CardType,
    front_image: Vec<u8>,
    face_image: Vec<u8>,
    address: Vec<u8>,
    additional_data: Option<AdditionalData>,
    check_code: Vec<u8>,
    certificate: Vec<u8>,
    verification_result: Option<VerificationResult>,
}

impl PartialEq for CardData {
    fn eq(&self, other: &Self) -> bool {
        self.common_data == other.common_data
            && self.card_type_file == other.card_type_file
            && self.card_type == other.card_type
            && self.front_image == other.front_image
            && self.face_image == other.face_image
            && self.address == other.address
            && self.additional_data == other.additional_data
            && self.check_code == other.check_code
            && self.certificate == other.certificate
    }
}
impl Eq for CardData {}

impl CardData {
    #[must_use]
    pub fn common_data(&self) -> &[u8] {
        &self.common_data
    }

    /// Value of the `0xC0` record of the common data file.
    #[must_use]
    pub fn version(&self) -> Option<&[u8]> {
        parse_tlv(&self.common_data, TAG_VERSION)
    }

    #[must_use]
    pub fn card_type_file(&self) -> &[u8] {
        &self.card_type_file
    }

    #[must_use]
    pub const fn card_type(&self) -> &CardType {
        &self.card_type
    }

    #[must_use]
    pub fn front_image(&self) -> &[u8] {
        &self.front_image
    }

    /// The front image without its `0xD0` record header.
    #[must_use]
    pub fn front_image_value(&self) -> Option<&[u8]> {
        parse_tlv(&self.front_image, TAG_FRONT_IMAGE)
    }

    #[must_use]
    pub fn face_image(&self) -> &[u8] {
        &self.face_image
    }

    /// The face image without its `0xD1` record header.
    #[must_use]
    pub fn face_image_value(&self) -> Option<&[u8]> {
        parse_tlv(&self.face_image, TAG_FACE_IMAGE)
    }

    #[must_use]
    pub fn address(&self) -> &[u8] {
        &self.address
    }

    /// Parses the address file.
    ///
    /// # Errors
    ///
    /// See [`AddressRecord::from_file`].
    pub fn address_record(&self) -> Result<AddressRecord, ZairyuError> {
        AddressRecord::from_file(&self.address)
    }

    #[must_use]
    pub const fn additional_data(&self) -> Option<&AdditionalData> {
        self.additional_data.as_ref()
    }

    #[must_use]
    pub fn check_code(&self) -> &[u8] {
        &self.check_code
    }

    #[must_use]
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// `None` if verification was disabled in the `ReaderConfig`.
    #[must_use]
    pub const fn verification_result(&self) -> Option<&VerificationResult> {
        self.verification_result.as_ref()
    }
}

/// Reads every file of a card in one session.
pub struct CardReader<
    C: CardTransport,
    P: CardProfile = ResidenceCardProfile,
    V: SignatureVerifier = OpensslVerifier,
    R: RngCore + CryptoRng + Default = OsRng,
> {
    comms: CardComms<C, R>,
    profile: P,
    verifier: V,
}

impl<C: CardTransport> CardReader<C> {
    /// Constructs a reader for residence cards verified with `openssl`.
    #[must_use]
    pub fn new(card: C, config: ReaderConfig) -> Self {
        Self::with_parts(card, config, ResidenceCardProfile, OpensslVerifier)
    }
}

impl<C, P, V, R> CardReader<C, P, V, R>
where
    C: CardTransport,
    P: CardProfile,
    V: SignatureVerifier,
    R: RngCore + CryptoRng + Default,
{
    #[must_use]
    pub fn with_parts(card: C, config: ReaderConfig, profile: P, verifier: V) -> Self {
        Self {
            comms: CardComms::with_config(card, config),
            profile,
            verifier,
        }
    }

    #[must_use]
    pub const fn comms(&self) -> &CardComms<C, R> {
        &self.comms
    }

    /// Reads the card.
    ///
    /// Common data and card type are read in plain, then the session is
    /// established with `card_number`, the images are read with secure
    /// messaging and the remaining files in plain. The session key is
    /// discarded before returning, whatever the outcome.
    ///
    /// A check code that does not match the images is reported through
    /// [`CardData::verification_result`], it does not fail the read.
    ///
    /// # Errors
    ///
    /// * `ZairyuError::IncorrectCredential` if the card rejects `card_number`.
    /// * `ZairyuError::VerificationError` if the signature file lacks the check
    ///   code or certificate, or the check code is not 256 bytes.
    /// * Any other `ZairyuError` raised while talking to the card.
    pub fn read(&mut self, card_number: &CardNumber) -> Result<CardData, ZairyuError> {
        info!("Reading {}...", P::NAME);
        let result = self.read_files(card_number);
        self.comms.end_session();

        match result {
            Ok(ref card_data) => info!("Finished reading {}", card_data.card_type),
            Err(ref err) => error!("Error while reading {}: {err}", P::NAME),
        }
        result
    }

    fn read_files(&mut self, card_number: &CardNumber) -> Result<CardData, ZairyuError> {
        self.comms.select_mf()?;
        let common_data = self.comms.read_binary_plain(short_ef(P::COMMON_DATA_EF), 0)?;
        let card_type_file = self.comms.read_binary_plain(short_ef(P::CARD_TYPE_EF), 0)?;
        let card_type = CardType::from_file(&card_type_file)?;
        info!("Card type: {card_type}");

        self.comms.authenticate(card_number)?;

        self.comms.select_df(P::DF1_AID, "DF1")?;
        let front_image = self.comms.read_binary_sm(short_ef(P::FRONT_IMAGE_EF), 0)?;
        let face_image = self.comms.read_binary_sm(short_ef(P::FACE_IMAGE_EF), 0)?;

        self.comms.select_df(P::DF2_AID, "DF2")?;
        let address = self.comms.read_binary_plain(short_ef(P::ADDRESS_EF), 0)?;
        let additional_data = if self.profile.has_additional_data(&card_type) {
            Some(AdditionalData {
                comprehensive_permission: self
                    .comms
                    .read_binary_plain(short_ef(P::COMPREHENSIVE_PERMISSION_EF), 0)?,
                individual_permission: self
                    .comms
                    .read_binary_plain(short_ef(P::INDIVIDUAL_PERMISSION_EF), 0)?,
                extension_application: self
                    .comms
                    .read_binary_plain(short_ef(P::EXTENSION_APPLICATION_EF), 0)?,
            })
        } else {
            None
        };

        self.comms.select_df(P::DF3_AID, "DF3")?;
        let signature = self.comms.read_binary_plain(short_ef(P::SIGNATURE_EF), 0)?;
        let check_code = parse_tlv(&signature, TAG_CHECK_CODE)
            .ok_or_else(|| {
                error!("Signature file has no {TAG_CHECK_CODE:02X} record");
                VerificationError::MissingCheckCode
            })?
            .to_vec();
        let certificate = parse_tlv(&signature, TAG_CERTIFICATE)
            .filter(|certificate| !certificate.is_empty())
            .ok_or_else(|| {
                error!("Signature file has no {TAG_CERTIFICATE:02X} record");
                VerificationError::MissingCertificate
            })?
            .to_vec();
        if check_code.len() != CHECK_CODE_LEN {
            error!(
                "Check code must be {CHECK_CODE_LEN} bytes, found {}",
                check_code.len()
            );
            return Err(VerificationError::InvalidCheckCodeLength(check_code.len()).into());
        }

        let verification_result = if self.comms.config().verify_signature {
            let result = VerificationResult::from(self.verifier.verify(
                &check_code,
                &certificate,
                &front_image,
                &face_image,
            ));
            if !result.is_valid {
                error!("Check code verification failed: {:?}", result.error);
            }
            Some(result)
        } else {
            None
        };

        Ok(CardData {
            common_data,
            card_type_file,
            card_type,
            front_image,
            face_image,
            address,
            additional_data,
            check_code,
            certificate,
            verification_result,
        })
    }
}

/// Reads a residence card with the card number printed on it.
///
/// # Errors
///
/// * `ZairyuError::InvalidCardNumber` if `card_number` is malformed, before any
///   command is sent.
/// * See [`CardReader::read`].
pub fn read_card<C: CardTransport>(
    card: C,
    card_number: &str,
    config: ReaderConfig,
) -> Result<CardData, ZairyuError> {
    let card_number = CardNumber::new(card_number)?;
    CardReader::new(card, config).read(&card_number)
}
