use tracing::error;

use crate::ZairyuError;

pub(crate) const CLA_PLAIN: u8 = 0x00;
pub(crate) const CLA_SECURE_MESSAGING: u8 = 0x08;

pub(crate) const INS_SELECT_FILE: u8 = 0xA4;
pub(crate) const INS_VERIFY: u8 = 0x20;
pub(crate) const INS_GET_CHALLENGE: u8 = 0x84;
pub(crate) const INS_MUTUAL_AUTHENTICATE: u8 = 0x82;
pub(crate) const INS_READ_BINARY: u8 = 0xB0;

/// An Application Protocol Data Unit (APDU) used in smart card communication.
#[derive(Debug, Clone)]
pub struct APDU {
    /// Class byte of the APDU
    cla: u8,
    /// Instruction byte of the APDU
    ins: u8,
    /// Parameter 1 byte of the APDU
    p1: u8,
    /// Parameter 2 byte of the APDU
    p2: u8,
    /// Length of the command data field (Lc) in the APDU
    lc: Option<Vec<u8>>,
    /// Command data field of the APDU
    cdata: Option<Vec<u8>>,
    /// Expected length of the response data field (Le) in the APDU
    le: Option<Vec<u8>>,
}

impl APDU {
    /// Constructs a new APDU instance with the specified parameters.
    ///
    /// # Panics
    ///
    /// Panics if the lengths of `lc` and `le` violate ISO/IEC 7816-4 specifications.
    /// See the wiki article for more details:
    /// <https://en.wikipedia.org/wiki/Smart_card_application_protocol_data_unit>
    ///
    /// # Example
    ///
    /// ```
    /// use zairyu::APDU;
    /// use hex_literal::hex;
    ///
    /// let apdu = APDU::new(0x00, 0x84, 0x00, 0x00, None, None, Some(vec![0x08]));
    /// assert_eq!(apdu.to_bytes(), hex!("0084000008"));
    /// ```
    #[must_use]
    pub fn new(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        lc: Option<Vec<u8>>,
        cdata: Option<Vec<u8>>,
        le: Option<Vec<u8>>,
    ) -> Self {
        match (lc.as_ref().map(Vec::len), le.as_ref().map(Vec::len)) {
            (None | Some(1 | 3), None)
            | (None | Some(1), Some(1))
            | (Some(3), Some(2))
            | (None, Some(3)) => { /* Valid */ }
            (_, _) => {
                panic!("lc and le length error");
            }
        }

        Self {
            cla,
            ins,
            p1,
            p2,
            lc,
            cdata,
            le,
        }
    }

    /// Retrieves the command header of the APDU (CLA, INS, P1, P2).
    #[must_use]
    pub fn get_command_header(&self) -> Vec<u8> {
        vec![self.cla, self.ins, self.p1, self.p2]
    }

    /// Serializes the APDU as header‖Lc‖data‖Le.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut apdu_bytes = self.get_command_header();
        apdu_bytes.extend(self.lc.as_deref().unwrap_or_default());
        apdu_bytes.extend(self.cdata.as_deref().unwrap_or_default());
        apdu_bytes.extend(self.le.as_deref().unwrap_or_default());
        apdu_bytes
    }
}

/// The card transport used by `CardComms`.
///
/// One command is sent and its response awaited before the next command is
/// issued; the `&mut self` receiver keeps a single outstanding command per card.
pub trait CardTransport {
    /// Sends a command APDU and returns the response data and status word.
    ///
    /// # Errors
    ///
    /// * `ZairyuError` if the transport can not deliver the command.
    fn send_command(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, u8, u8), ZairyuError>;
}

impl CardTransport for pcsc::Card {
    fn send_command(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, u8, u8), ZairyuError> {
        let mut response_buffer = vec![0; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let response = self
            .transmit(apdu, &mut response_buffer)
            .map_err(ZairyuError::TransportUnavailable)?;
        split_status_word(response)
    }
}

/// Splits a raw response into data and the trailing status word.
///
/// # Errors
///
/// * `ZairyuError::InvalidResponse` if the response is shorter than 2 bytes.
pub(crate) fn split_status_word(response: &[u8]) -> Result<(Vec<u8>, u8, u8), ZairyuError> {
    if response.len() < 2 {
        error!(
            "Card response length should be greater than or equal to 2, found {}",
            response.len()
        );
        return Err(ZairyuError::InvalidResponse("response has no status word"));
    }
    let (data, sw) = response.split_at(response.len() - 2);
    Ok((data.to_vec(), sw[0], sw[1]))
}

/// Maps a status word to a result.
///
/// `90 00` is success, `63 Cx` is a rejected credential with `x` retries left,
/// anything else is a generic card error.
pub(crate) fn check_status(status: [u8; 2], context: &str) -> Result<(), ZairyuError> {
    match status {
        [0x90, 0x00] => Ok(()),
        [0x63, sw2] if sw2 & 0xF0 == 0xC0 => {
            let retries_remaining = sw2 & 0x0F;
            error!("Credential rejected during {context}, {retries_remaining} retries remaining");
            Err(ZairyuError::IncorrectCredential { retries_remaining })
        }
        [sw1, sw2] => {
            error!("Received invalid SW during {context}: {sw1:02X} {sw2:02X}");
            Err(ZairyuError::CardError(sw1, sw2))
        }
    }
}
