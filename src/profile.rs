//! File layout of the supported cards.

use crate::CardType;

/// Common data: version record.
pub const TAG_VERSION: u8 = 0xC0;
/// Card type file: card type record, `"1"` or `"2"`.
pub const TAG_CARD_TYPE: u8 = 0xC1;
pub const TAG_FRONT_IMAGE: u8 = 0xD0;
pub const TAG_FACE_IMAGE: u8 = 0xD1;
pub const TAG_ADDRESS_DATE: u8 = 0xD2;
pub const TAG_MUNICIPALITY_CODE: u8 = 0xD3;
pub const TAG_ADDRESS: u8 = 0xD4;
/// Permission files: permission text record.
pub const TAG_PERMISSION: u8 = 0x12;
pub const TAG_CHECK_CODE: u8 = 0xDA;
pub const TAG_CERTIFICATE: u8 = 0xDB;

/// Returns P1 of a READ BINARY that selects the EF with short identifier `sfi`.
///
/// ```
/// use zairyu::profile::short_ef;
///
/// assert_eq!(short_ef(0x05), 0x85);
/// ```
#[must_use]
pub const fn short_ef(sfi: u8) -> u8 {
    0x80 | (sfi & 0x1F)
}

/// Dedicated files and short EF identifiers of a card family.
///
/// A `CardReader` walks the files named here, so supporting a related card
/// only needs another implementation of this trait.
pub trait CardProfile {
    const NAME: &'static str;

    const DF1_AID: &'static [u8];
    const DF2_AID: &'static [u8];
    const DF3_AID: &'static [u8];

    /// MF
    const COMMON_DATA_EF: u8;
    const CARD_TYPE_EF: u8;
    /// DF1
    const FRONT_IMAGE_EF: u8;
    const FACE_IMAGE_EF: u8;
    /// DF2
    const ADDRESS_EF: u8;
    const COMPREHENSIVE_PERMISSION_EF: u8;
    const INDIVIDUAL_PERMISSION_EF: u8;
    const EXTENSION_APPLICATION_EF: u8;
    /// DF3
    const SIGNATURE_EF: u8;

    /// Whether the permission and extension application files are present.
    fn has_additional_data(&self, card_type: &CardType) -> bool;
}

/// Residence Card and Special Permanent Resident Certificate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResidenceCardProfile;

impl CardProfile for ResidenceCardProfile {
    const NAME: &'static str = "Residence Card";

    const DF1_AID: &'static [u8] = &[
        0xD3, 0x92, 0xF0, 0x00, 0x4F, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];
    const DF2_AID: &'static [u8] = &[
        0xD3, 0x92, 0xF0, 0x00, 0x4F, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];
    const DF3_AID: &'static [u8] = &[
        0xD3, 0x92, 0xF0, 0x00, 0x4F, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];

    const COMMON_DATA_EF: u8 = 0x0B;
    const CARD_TYPE_EF: u8 = 0x0A;
    const FRONT_IMAGE_EF: u8 = 0x05;
    const FACE_IMAGE_EF: u8 = 0x06;
    const ADDRESS_EF: u8 = 0x01;
    const COMPREHENSIVE_PERMISSION_EF: u8 = 0x02;
    const INDIVIDUAL_PERMISSION_EF: u8 = 0x03;
    const EXTENSION_APPLICATION_EF: u8 = 0x04;
    const SIGNATURE_EF: u8 = 0x02;

    /// Only residence cards carry permission data, special permanent resident
    /// certificates do not.
    fn has_additional_data(&self, card_type: &CardType) -> bool {
        matches!(card_type, CardType::ResidenceCard)
    }
}
