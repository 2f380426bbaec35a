use rand::{rngs::OsRng, CryptoRng, RngCore};
use tracing::{error, info, trace};
use zeroize::Zeroizing;

use crate::{
    apdu::{
        check_status, CardTransport, APDU, CLA_PLAIN, CLA_SECURE_MESSAGING, INS_GET_CHALLENGE,
        INS_MUTUAL_AUTHENTICATE, INS_READ_BINARY, INS_SELECT_FILE, INS_VERIFY,
    },
    auth::{
        build_mutual_auth_data, build_verify_data, derive_access_key, derive_session_key,
        verify_mutual_auth_response, AuthState, SessionKey, MUTUAL_AUTH_RESPONSE_LEN,
        PADDING_INDICATOR, RND_LEN, TAG_SM_DATA,
    },
    bytes2hex,
    crypto::{remove_padding, tdes_transform, KEY_LEN},
    tlv::parse_ber_length,
    CardNumber, ReaderConfig, ZairyuError,
};

/// Tag of the expected-length data object sent with secure messaging reads.
const TAG_EXPECTED_LENGTH: u8 = 0x96;
const SW_END_OF_FILE: [u8; 2] = [0x62, 0x82];
const SW_WRONG_OFFSET: [u8; 2] = [0x6B, 0x00];
/// Largest offset addressable with `P1 = offset >> 8 & 0x7F`.
const MAX_READ_OFFSET: usize = 0x7FFF;

/// A conversation with one card.
///
/// Commands are strictly sequential: every method takes `&mut self` and waits
/// for the response before returning. The session key lives here from a
/// successful [`CardComms::authenticate`] until [`CardComms::end_session`],
/// a failed authentication or drop, and is zeroized when discarded.
pub struct CardComms<C: CardTransport, R: RngCore + CryptoRng + Default = OsRng> {
    rng: R,
    /// The card interface used for communication with the card.
    card: C,
    config: ReaderConfig,
    state: AuthState,
    /// The session key used for secure messaging reads.
    session_key: Option<SessionKey>,
}

impl<C: CardTransport, R: RngCore + CryptoRng + Default> CardComms<C, R> {
    /// Constructs a new `CardComms` with the default `ReaderConfig`.
    #[must_use]
    pub fn new(card: C) -> Self {
        Self::with_config(card, ReaderConfig::default())
    }

    #[must_use]
    pub fn with_config(card: C, config: ReaderConfig) -> Self {
        Self {
            rng: R::default(),
            card,
            config,
            state: AuthState::Idle,
            session_key: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ReaderConfig {
        &self.config
    }

    #[must_use]
    pub const fn auth_state(&self) -> AuthState {
        self.state
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::SessionVerified) && self.session_key.is_some()
    }

    #[must_use]
    pub const fn card(&self) -> &C {
        &self.card
    }

    #[cfg(test)]
    pub(crate) fn card_mut(&mut self) -> &mut C {
        &mut self.card
    }

    #[cfg(test)]
    pub(crate) const fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Discards the session key.
    ///
    /// The state returns to `AuthState::Idle`, except after a failed
    /// authentication where `AuthState::Failed` is kept until the next
    /// [`CardComms::authenticate`].
    pub fn end_session(&mut self) {
        if self.session_key.take().is_some() {
            trace!("Session key discarded");
        }
        if self.state != AuthState::Failed {
            self.state = AuthState::Idle;
        }
    }

    /// Sends an APDU to the card and receives the response.
    ///
    /// # Returns
    ///
    /// The response data and status bytes.
    ///
    /// # Errors
    ///
    /// * `ZairyuError` in case of failure of the transport.
    pub fn send(&mut self, apdu: &APDU) -> Result<(Vec<u8>, [u8; 2]), ZairyuError> {
        let apdu_bytes = apdu.to_bytes();
        trace!("Sending APDU: {}", bytes2hex(&apdu_bytes));

        let (data, sw1, sw2) = self.card.send_command(&apdu_bytes).map_err(|err| {
            error!("Error while sending APDU: {err}");
            err
        })?;

        trace!("APDU response ({sw1:02X}{sw2:02X}): {}", bytes2hex(&data));
        Ok((data, [sw1, sw2]))
    }

    /// Selects the Master File.
    ///
    /// # Errors
    ///
    /// `ZairyuError` in case of failure during sending the APDU or a non-success status word.
    pub fn select_mf(&mut self) -> Result<(), ZairyuError> {
        trace!("Selecting MF...");
        let apdu = APDU::new(CLA_PLAIN, INS_SELECT_FILE, 0x00, 0x00, None, None, None);
        let (_, status) = self.send(&apdu)?;
        check_status(status, "Select MF command")
    }

    /// Selects a Dedicated File by its application identifier.
    ///
    /// # Arguments
    ///
    /// * `aid` - Application identifier of the DF.
    /// * `name` - The name of the DF being selected (used for logging purposes).
    ///
    /// # Errors
    ///
    /// `ZairyuError` in case of failure during sending the APDU or a non-success status word.
    pub fn select_df(&mut self, aid: &[u8], name: &str) -> Result<(), ZairyuError> {
        info!("Selecting {name}: {}...", bytes2hex(aid));
        let lc = u8::try_from(aid.len()).map_err(|_| {
            error!("AID of {name} is {} bytes long", aid.len());
            ZairyuError::InvalidArgument("AID does not fit in a short APDU")
        })?;
        let apdu = APDU::new(
            CLA_PLAIN,
            INS_SELECT_FILE,
            0x04,
            0x0C,
            Some(vec![lc]),
            Some(aid.to_vec()),
            None,
        );
        let (_, status) = self.send(&apdu)?;
        check_status(status, "Select DF command")
    }

    /// Reads an unprotected EF with READ BINARY.
    ///
    /// `p1`/`p2` address the first chunk, usually a short EF identifier with
    /// `p1 = 0x80 | sfi`. Further chunks are requested at the accumulated
    /// offset until the card answers `62 82` (end of file), returns an empty
    /// chunk, or rejects the offset with `6B 00` once the end has been reached.
    /// The card may return fewer bytes than `ReaderConfig::max_response_len`
    /// with `90 00` in the middle of a file.
    ///
    /// # Errors
    ///
    /// * `ZairyuError` in case of failure during sending an APDU or a non-success status word.
    pub fn read_binary_plain(&mut self, p1: u8, p2: u8) -> Result<Vec<u8>, ZairyuError> {
        let le = le_bytes(self.config.max_response_len)?;

        trace!("Reading EF {p1:02X}{p2:02X}...");
        let (mut data, status) = self.send(&read_binary_apdu(p1, p2, le))?;
        if status == SW_END_OF_FILE {
            return Ok(data);
        }
        check_status(status, "READ BINARY")?;

        let mut chunk_len = data.len();
        while chunk_len > 0 {
            let offset = data.len();
            let (p1, p2) = offset_parameters(offset)?;
            trace!("Reading next chunk of EF at offset {offset}...");
            let (chunk, status) = self.send(&read_binary_apdu(p1, p2, le))?;
            if status == SW_WRONG_OFFSET {
                trace!("Offset {offset} is past the end of the EF");
                break;
            }
            let end_of_file = status == SW_END_OF_FILE;
            if !end_of_file {
                check_status(status, "READ BINARY")?;
            }

            chunk_len = chunk.len();
            data.extend_from_slice(&chunk);
            if end_of_file {
                break;
            }
        }

        trace!("Read {} bytes from EF", data.len());
        Ok(data)
    }

    /// Reads a protected EF with secure messaging READ BINARY and decrypts it.
    ///
    /// The whole `0x86` object is reassembled before decryption, see
    /// [`CardComms::read_sm_object`].
    ///
    /// # Errors
    ///
    /// * `ZairyuError::CryptographyError` if no session key has been established
    ///   or decryption fails.
    /// * `ZairyuError::InvalidResponse` if the response framing or padding is invalid.
    pub fn read_binary_sm(&mut self, p1: u8, p2: u8) -> Result<Vec<u8>, ZairyuError> {
        if self.session_key.is_none() {
            error!("Secure messaging read attempted without a session key");
            return Err(ZairyuError::CryptographyError(
                "secure messaging read requires an authenticated session",
            ));
        }

        let raw = self.read_sm_object(p1, p2)?;
        let Some(ref session_key) = self.session_key else {
            error!("Session key was discarded while reading");
            return Err(ZairyuError::CryptographyError(
                "secure messaging read requires an authenticated session",
            ));
        };
        decrypt_sm_object(&raw, session_key)
    }

    /// Reads the raw `0x86` secure messaging object of an EF.
    ///
    /// If the first response is shorter than the object size declared by its
    /// BER length, which happens whenever the card output hits the maximum
    /// response length, the remaining bytes are read at increasing offsets and
    /// concatenated.
    pub(crate) fn read_sm_object(&mut self, p1: u8, p2: u8) -> Result<Vec<u8>, ZairyuError> {
        let max_len = self.config.max_response_len;

        trace!("Reading protected EF {p1:02X}{p2:02X}...");
        let mut data = self.send_sm_read(p1, p2, max_len)?;
        if data.first() != Some(&TAG_SM_DATA) {
            error!(
                "Secure messaging response must start with tag {TAG_SM_DATA:02X}, found {:02X?}",
                data.first()
            );
            return Err(ZairyuError::InvalidResponse(
                "secure messaging response is not a 0x86 object",
            ));
        }
        let (value_len, value_offset) = parse_ber_length(&data, 1)?;
        let total_len = value_offset + value_len;

        if data.len() < total_len {
            trace!(
                "Secure messaging object is {total_len} bytes, received {}, reading in chunks...",
                data.len()
            );
        }
        while data.len() < total_len {
            let offset = data.len();
            let (p1, p2) = offset_parameters(offset)?;
            let chunk = self.send_sm_read(p1, p2, (total_len - offset).min(max_len))?;
            if chunk.is_empty() {
                error!("Requested bytes at offset {offset} but received 0 bytes.");
                return Err(ZairyuError::InvalidResponse(
                    "empty chunk while reading secure messaging object",
                ));
            }
            data.extend_from_slice(&chunk);
        }
        data.truncate(total_len);

        Ok(data)
    }

    fn send_sm_read(&mut self, p1: u8, p2: u8, le: usize) -> Result<Vec<u8>, ZairyuError> {
        let [le_hi, le_lo] = le_bytes(le)?;
        let le_object = vec![TAG_EXPECTED_LENGTH, 0x02, le_hi, le_lo];
        let apdu = APDU::new(
            CLA_SECURE_MESSAGING,
            INS_READ_BINARY,
            p1,
            p2,
            Some(vec![0x00, 0x00, 0x04]),
            Some(le_object),
            Some(vec![0x00, 0x00]),
        );
        let (data, status) = self.send(&apdu)?;
        check_status(status, "secure messaging READ BINARY")?;
        Ok(data)
    }

    /// Authenticates with the card and establishes the session key.
    ///
    /// Runs GET CHALLENGE, MUTUAL AUTHENTICATE and VERIFY with the access key
    /// derived from `card_number`. On failure all key material is discarded and
    /// the state becomes `AuthState::Failed`.
    ///
    /// # Errors
    ///
    /// * `ZairyuError::IncorrectCredential` if the card rejects the card number,
    ///   carrying the remaining retries.
    /// * `ZairyuError::CardError` for any other non-success status word.
    /// * `ZairyuError::CryptographyError` if the card response does not authenticate.
    pub fn authenticate(&mut self, card_number: &CardNumber) -> Result<(), ZairyuError> {
        self.end_session();

        match self.establish_session_key(card_number) {
            Ok(session_key) => {
                self.session_key = Some(session_key);
                self.state = AuthState::SessionVerified;
                info!("Session key established");
                Ok(())
            }
            Err(err) => {
                self.session_key = None;
                self.state = AuthState::Failed;
                error!("Error while authenticating with the card: {err}");
                Err(err)
            }
        }
    }

    fn establish_session_key(&mut self, card_number: &CardNumber) -> Result<SessionKey, ZairyuError> {
        trace!("Requesting challenge...");
        let apdu = APDU::new(
            CLA_PLAIN,
            INS_GET_CHALLENGE,
            0x00,
            0x00,
            None,
            None,
            Some(vec![RND_LEN as u8]),
        );
        let (rnd_icc, status) = self.send(&apdu)?;
        check_status(status, "GET CHALLENGE")?;
        let rnd_icc: [u8; RND_LEN] = rnd_icc.as_slice().try_into().map_err(|_| {
            error!(
                "GET CHALLENGE response must be {RND_LEN} bytes, found {}",
                rnd_icc.len()
            );
            ZairyuError::InvalidResponse("GET CHALLENGE response has wrong length")
        })?;
        self.state = AuthState::ChallengeReceived;

        trace!("Computing access key...");
        let access_key = derive_access_key(card_number)?;

        let mut rnd_ifd = Zeroizing::new([0_u8; RND_LEN]);
        self.rng.fill_bytes(&mut *rnd_ifd);
        let mut k_ifd = Zeroizing::new([0_u8; KEY_LEN]);
        self.rng.fill_bytes(&mut *k_ifd);

        let cmd_data = build_mutual_auth_data(&rnd_ifd, &rnd_icc, &k_ifd, &access_key)?;
        let apdu = APDU::new(
            CLA_PLAIN,
            INS_MUTUAL_AUTHENTICATE,
            0x00,
            0x00,
            Some(vec![MUTUAL_AUTH_RESPONSE_LEN as u8]),
            Some(cmd_data),
            Some(vec![MUTUAL_AUTH_RESPONSE_LEN as u8]),
        );
        let (response, status) = self.send(&apdu)?;
        check_status(status, "MUTUAL AUTHENTICATE")?;
        let k_icc = verify_mutual_auth_response(&response, &rnd_icc, &rnd_ifd, &access_key)?;
        self.state = AuthState::MutuallyAuthenticated;

        let session_key = derive_session_key(&k_ifd, &k_icc)?;

        trace!("Verifying card number...");
        let cmd_data = build_verify_data(card_number, &session_key)?;
        let lc = u8::try_from(cmd_data.len()).map_err(|_| {
            ZairyuError::InvalidArgument("VERIFY data does not fit in a short APDU")
        })?;
        let apdu = APDU::new(
            CLA_SECURE_MESSAGING,
            INS_VERIFY,
            0x00,
            TAG_SM_DATA,
            Some(vec![lc]),
            Some(cmd_data),
            None,
        );
        let (_, status) = self.send(&apdu)?;
        check_status(status, "VERIFY")?;

        Ok(session_key)
    }
}

/// Decrypts a reassembled `0x86` secure messaging object.
///
/// # Errors
///
/// * `ZairyuError::InvalidResponse` if the framing, padding indicator or padding is invalid.
/// * `ZairyuError::CryptographyError` if decryption fails.
pub(crate) fn decrypt_sm_object(
    raw: &[u8],
    session_key: &SessionKey,
) -> Result<Vec<u8>, ZairyuError> {
    if raw.first() != Some(&TAG_SM_DATA) {
        error!("Secure messaging object must start with tag {TAG_SM_DATA:02X}");
        return Err(ZairyuError::InvalidResponse(
            "secure messaging response is not a 0x86 object",
        ));
    }
    let (value_len, value_offset) = parse_ber_length(raw, 1)?;
    let Some(value) = raw.get(value_offset..value_offset + value_len) else {
        error!(
            "Secure messaging object is truncated, expected {}, found {}",
            value_offset + value_len,
            raw.len()
        );
        return Err(ZairyuError::InvalidResponse(
            "secure messaging object is truncated",
        ));
    };
    let Some((&PADDING_INDICATOR, ciphertext)) = value.split_first() else {
        error!("Secure messaging object does not start with padding indicator 01");
        return Err(ZairyuError::InvalidResponse(
            "padding indicator missing from secure messaging object",
        ));
    };

    let plaintext = Zeroizing::new(tdes_transform(ciphertext, session_key.as_bytes(), false)?);
    remove_padding(&plaintext)
}

fn read_binary_apdu(p1: u8, p2: u8, [le_hi, le_lo]: [u8; 2]) -> APDU {
    APDU::new(
        CLA_PLAIN,
        INS_READ_BINARY,
        p1,
        p2,
        None,
        None,
        Some(vec![0x00, le_hi, le_lo]),
    )
}

/// Encodes an expected length as two bytes, 65536 is encoded as `00 00`.
fn le_bytes(le: usize) -> Result<[u8; 2], ZairyuError> {
    match le {
        1..=0xFFFF => Ok((le as u16).to_be_bytes()),
        0x1_0000 => Ok([0x00, 0x00]),
        _ => {
            error!("Expected length must be between 1 and 65536, found {le}");
            Err(ZairyuError::InvalidArgument(
                "expected length must be between 1 and 65536",
            ))
        }
    }
}

fn offset_parameters(offset: usize) -> Result<(u8, u8), ZairyuError> {
    if offset > MAX_READ_OFFSET {
        error!("Offset {offset} can not be addressed with READ BINARY");
        return Err(ZairyuError::InvalidResponse(
            "file is larger than the READ BINARY offset range",
        ));
    }
    Ok((((offset >> 8) & 0x7F) as u8, (offset & 0xFF) as u8))
}
