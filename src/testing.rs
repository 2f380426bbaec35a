use std::{
    collections::{HashMap, VecDeque},
    sync::OnceLock,
};

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::{Padding, Rsa},
    x509::{X509NameBuilder, X509},
};
use rand::{CryptoRng, RngCore};

use crate::{
    apdu::split_status_word,
    crypto::{padding_method_2, retail_mac, tdes_transform, BLOCK_SIZE},
    derive_access_key, derive_session_key,
    profile::{
        CardProfile, ResidenceCardProfile, TAG_ADDRESS, TAG_ADDRESS_DATE, TAG_CARD_TYPE,
        TAG_CERTIFICATE, TAG_CHECK_CODE, TAG_FACE_IMAGE, TAG_FRONT_IMAGE,
        TAG_MUNICIPALITY_CODE, TAG_PERMISSION, TAG_VERSION,
    },
    signature::{image_digest, CHECK_CODE_LEN},
    tlv::{encode_tlv, parse_tlv},
    CardNumber, CardTransport, SessionKey, ZairyuError,
};

pub(crate) const CARD_NUMBER: &str = "AB12345678CD";

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub(crate) struct MockRng {
    data: Vec<u8>,
    index: usize,
}

impl Default for MockRng {
    fn default() -> MockRng {
        MockRng {
            data: hex_literal::hex!("781723860C06C226 0B795240CB7049B01C19B33E32804F0B").to_vec(),
            index: 0,
        }
    }
}

impl CryptoRng for MockRng {}

impl RngCore for MockRng {
    fn next_u32(&mut self) -> u32 {
        unimplemented!()
    }

    fn next_u64(&mut self) -> u64 {
        unimplemented!()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.data[self.index];
            self.index = (self.index + 1) % self.data.len();
        }
    }

    fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
        unimplemented!()
    }
}

/// Replays canned responses (data‖SW) in order and records every command.
pub(crate) struct ScriptedCard {
    responses: VecDeque<Vec<u8>>,
    pub commands: Vec<Vec<u8>>,
}

impl ScriptedCard {
    pub fn new(responses: Vec<Vec<u8>>) -> Self {
        Self {
            responses: responses.into(),
            commands: Vec::new(),
        }
    }
}

impl CardTransport for ScriptedCard {
    fn send_command(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, u8, u8), ZairyuError> {
        self.commands.push(apdu.to_vec());
        let response = self
            .responses
            .pop_front()
            .ok_or(ZairyuError::TransportError("no scripted response left"))?;
        split_status_word(&response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Directory {
    Mf,
    Df1,
    Df2,
    Df3,
}

/// A residence card that answers the commands used by `CardComms`.
///
/// Files are addressed by directory and short EF identifier. Protected reads
/// return the EF wrapped in a `0x86` object encrypted with the session key.
pub(crate) struct SimulatedCard {
    card_number: String,
    pub rnd_icc: [u8; 8],
    pub k_icc: [u8; 16],
    session_key: Option<SessionKey>,
    directory: Option<Directory>,
    current_ef: Option<Vec<u8>>,
    files: HashMap<(Directory, u8), Vec<u8>>,
    /// Responses are cut at this many bytes.
    pub max_response_len: usize,
    /// Status word answered to VERIFY.
    pub verify_status: [u8; 2],
    pub commands: Vec<Vec<u8>>,
}

impl SimulatedCard {
    pub fn new(card_number: &str) -> Self {
        Self {
            card_number: card_number.to_owned(),
            rnd_icc: hex_literal::hex!("4608F91988702212"),
            k_icc: hex_literal::hex!("0B4F80323EB3191CB04970CB4052790B"),
            session_key: None,
            directory: None,
            current_ef: None,
            files: HashMap::new(),
            max_response_len: 0x1_0000,
            verify_status: [0x90, 0x00],
            commands: Vec::new(),
        }
    }

    pub fn with_file(mut self, directory: Directory, sfi: u8, content: Vec<u8>) -> Self {
        self.files.insert((directory, sfi), content);
        self
    }

    pub fn file(&self, directory: Directory, sfi: u8) -> &[u8] {
        self.files.get(&(directory, sfi)).map_or(&[], Vec::as_slice)
    }

    pub fn file_mut(&mut self, directory: Directory, sfi: u8) -> &mut Vec<u8> {
        self.files.entry((directory, sfi)).or_default()
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// A complete card of type `card_type` signed by [`signing_fixture`].
    pub fn residence_card(card_type: &[u8]) -> Self {
        type P = ResidenceCardProfile;
        let tlv = |tag, value: &[u8]| encode_tlv(tag, value).expect("TLV should encode");

        let front = front_image_file(6000);
        let face = face_image_file(2500);
        let fixture = signing_fixture();
        let digest = image_digest(
            parse_tlv(&front, TAG_FRONT_IMAGE).expect("Front image record"),
            parse_tlv(&face, TAG_FACE_IMAGE).expect("Face image record"),
        );
        let signature = [
            tlv(TAG_CHECK_CODE, &sign_digest(&fixture.rsa, &digest)),
            tlv(TAG_CERTIFICATE, &fixture.certificate),
        ]
        .concat();
        let address = [
            tlv(TAG_ADDRESS_DATE, b"20240401"),
            tlv(TAG_MUNICIPALITY_CODE, b"131032"),
            tlv(TAG_ADDRESS, "東京都港区港南五丁目５番３０号".as_bytes()),
        ]
        .concat();

        Self::new(CARD_NUMBER)
            .with_file(Directory::Mf, P::COMMON_DATA_EF, tlv(TAG_VERSION, b"03"))
            .with_file(Directory::Mf, P::CARD_TYPE_EF, tlv(TAG_CARD_TYPE, card_type))
            .with_file(Directory::Df1, P::FRONT_IMAGE_EF, front)
            .with_file(Directory::Df1, P::FACE_IMAGE_EF, face)
            .with_file(Directory::Df2, P::ADDRESS_EF, address)
            .with_file(
                Directory::Df2,
                P::COMPREHENSIVE_PERMISSION_EF,
                tlv(TAG_PERMISSION, "資格外活動許可".as_bytes()),
            )
            .with_file(
                Directory::Df2,
                P::INDIVIDUAL_PERMISSION_EF,
                tlv(TAG_PERMISSION, "個別許可".as_bytes()),
            )
            .with_file(
                Directory::Df2,
                P::EXTENSION_APPLICATION_EF,
                tlv(TAG_PERMISSION, "在留期間更新許可申請中".as_bytes()),
            )
            .with_file(Directory::Df3, P::SIGNATURE_EF, signature)
    }

    fn select(&mut self, apdu: &[u8]) -> (Vec<u8>, u8, u8) {
        self.current_ef = None;
        match apdu[2] {
            0x00 => {
                self.directory = Some(Directory::Mf);
                (vec![], 0x90, 0x00)
            }
            0x04 => {
                let aid = &apdu[5..];
                let directory = if aid == ResidenceCardProfile::DF1_AID {
                    Directory::Df1
                } else if aid == ResidenceCardProfile::DF2_AID {
                    Directory::Df2
                } else if aid == ResidenceCardProfile::DF3_AID {
                    Directory::Df3
                } else {
                    return (vec![], 0x6A, 0x82);
                };
                self.directory = Some(directory);
                (vec![], 0x90, 0x00)
            }
            _ => (vec![], 0x6A, 0x86),
        }
    }

    fn mutual_authenticate(&mut self, data: &[u8]) -> Result<(Vec<u8>, u8, u8), ZairyuError> {
        let card_number = CardNumber::new(&self.card_number)?;
        let access_key = derive_access_key(&card_number)?;
        let (e_ifd, m_ifd) = data.split_at(32);
        if retail_mac(e_ifd, &*access_key)? != m_ifd {
            return Ok((vec![], 0x63, 0x00));
        }
        let s = tdes_transform(e_ifd, &*access_key, false)?;
        if s[8..16] != self.rnd_icc {
            return Ok((vec![], 0x63, 0x00));
        }
        let k_ifd: [u8; 16] = s[16..32].try_into().expect("K.IFD is 16 bytes");
        self.session_key = Some(derive_session_key(&k_ifd, &self.k_icc)?);

        let r = [&self.rnd_icc[..], &s[..8], &self.k_icc[..]].concat();
        let e_icc = tdes_transform(&r, &*access_key, true)?;
        let m_icc = retail_mac(&e_icc, &*access_key)?;
        Ok(([&e_icc[..], &m_icc[..]].concat(), 0x90, 0x00))
    }

    fn verify(&mut self, data: &[u8]) -> Result<(Vec<u8>, u8, u8), ZairyuError> {
        if self.verify_status != [0x90, 0x00] {
            return Ok((vec![], self.verify_status[0], self.verify_status[1]));
        }
        let Some(ref session_key) = self.session_key else {
            return Ok((vec![], 0x69, 0x82));
        };
        let value = parse_tlv(data, 0x86).unwrap_or_default();
        let expected = [self.card_number.as_bytes(), &[0x80, 0x00, 0x00, 0x00]].concat();
        match value.split_first() {
            Some((0x01, ciphertext))
                if tdes_transform(ciphertext, session_key.as_bytes(), false)? == expected =>
            {
                Ok((vec![], 0x90, 0x00))
            }
            _ => Ok((vec![], 0x63, 0xC2)),
        }
    }

    fn read_binary(
        &mut self,
        p1: u8,
        p2: u8,
        le: usize,
        secure: bool,
    ) -> Result<(Vec<u8>, u8, u8), ZairyuError> {
        let offset = if p1 & 0x80 != 0 {
            let Some(directory) = self.directory else {
                return Ok((vec![], 0x69, 0x86));
            };
            let Some(file) = self.files.get(&(directory, p1 & 0x1F)) else {
                return Ok((vec![], 0x6A, 0x82));
            };
            self.current_ef = Some(file.clone());
            usize::from(p2)
        } else {
            usize::from(p1) << 8 | usize::from(p2)
        };
        let Some(ref ef) = self.current_ef else {
            return Ok((vec![], 0x69, 0x86));
        };

        let content = if secure {
            let Some(ref session_key) = self.session_key else {
                return Ok((vec![], 0x69, 0x82));
            };
            let ciphertext = tdes_transform(
                &padding_method_2(ef, BLOCK_SIZE),
                session_key.as_bytes(),
                true,
            )?;
            encode_tlv(0x86, &[&[0x01][..], &ciphertext].concat())?
        } else {
            ef.clone()
        };
        if offset > content.len() {
            return Ok((vec![], 0x6B, 0x00));
        }

        let le = le.min(self.max_response_len);
        let end = (offset + le).min(content.len());
        let chunk = content[offset..end].to_vec();
        if !secure && end == content.len() && end - offset < le {
            Ok((chunk, 0x62, 0x82))
        } else {
            Ok((chunk, 0x90, 0x00))
        }
    }
}

impl CardTransport for SimulatedCard {
    fn send_command(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, u8, u8), ZairyuError> {
        self.commands.push(apdu.to_vec());
        let (cla, ins, p1, p2) = (apdu[0], apdu[1], apdu[2], apdu[3]);
        let body = |apdu: &[u8]| apdu[5..5 + usize::from(apdu[4])].to_vec();

        match (cla, ins) {
            (0x00, 0xA4) => Ok(self.select(apdu)),
            (0x00, 0x84) => Ok((self.rnd_icc.to_vec(), 0x90, 0x00)),
            (0x00, 0x82) => self.mutual_authenticate(&body(apdu)),
            (0x08, 0x20) => self.verify(&body(apdu)),
            (0x00, 0xB0) => {
                let le = usize::from(u16::from_be_bytes([apdu[5], apdu[6]]));
                self.read_binary(p1, p2, if le == 0 { 0x1_0000 } else { le }, false)
            }
            (0x08, 0xB0) => {
                // header‖00 00 04‖96 02 Le‖00 00
                let le = usize::from(u16::from_be_bytes([apdu[9], apdu[10]]));
                self.read_binary(p1, p2, if le == 0 { 0x1_0000 } else { le }, true)
            }
            _ => Ok((vec![], 0x6D, 0x00)),
        }
    }
}

pub(crate) struct SigningFixture {
    pub rsa: Rsa<Private>,
    pub certificate: Vec<u8>,
}

/// A 2048-bit issuer key and its self-signed certificate, generated once.
pub(crate) fn signing_fixture() -> &'static SigningFixture {
    static FIXTURE: OnceLock<SigningFixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let pkey = PKey::from_rsa(Rsa::generate(2048).expect("Failed to generate RSA key"))
            .expect("Failed to wrap RSA key");

        let mut name = X509NameBuilder::new().expect("Failed to create name builder");
        name.append_entry_by_text("C", "JP").expect("Failed to set C");
        name.append_entry_by_text("O", "Immigration Services Agency")
            .expect("Failed to set O");
        name.append_entry_by_text("CN", "Residence Card Issuer")
            .expect("Failed to set CN");
        let name = name.build();

        let mut builder = X509::builder().expect("Failed to create certificate builder");
        builder.set_version(2).expect("Failed to set version");
        let serial = BigNum::from_u32(1)
            .and_then(|serial| serial.to_asn1_integer())
            .expect("Failed to create serial");
        builder.set_serial_number(&serial).expect("Failed to set serial");
        builder.set_subject_name(&name).expect("Failed to set subject");
        builder.set_issuer_name(&name).expect("Failed to set issuer");
        builder.set_pubkey(&pkey).expect("Failed to set public key");
        builder
            .set_not_before(&Asn1Time::days_from_now(0).expect("Failed to create time"))
            .expect("Failed to set not before");
        builder
            .set_not_after(&Asn1Time::days_from_now(365).expect("Failed to create time"))
            .expect("Failed to set not after");
        builder
            .sign(&pkey, MessageDigest::sha256())
            .expect("Failed to sign certificate");

        SigningFixture {
            rsa: pkey.rsa().expect("Failed to extract RSA key"),
            certificate: builder.build().to_der().expect("Failed to encode certificate"),
        }
    })
}

/// Produces the raw RSA signature of a 256-byte block.
pub(crate) fn sign_block(rsa: &Rsa<Private>, block: &[u8]) -> Vec<u8> {
    let mut check_code = vec![0; rsa.size() as usize];
    let len = rsa
        .private_encrypt(block, &mut check_code, Padding::NONE)
        .expect("Failed to sign block");
    check_code.truncate(len);
    check_code
}

/// Produces a check code over `digest` with PKCS#1 v1.5 type 1 padding.
pub(crate) fn sign_digest(rsa: &Rsa<Private>, digest: &[u8]) -> Vec<u8> {
    let mut block = vec![0x00, 0x01];
    block.resize(CHECK_CODE_LEN - digest.len() - 1, 0xFF);
    block.push(0x00);
    block.extend_from_slice(digest);
    sign_block(rsa, &block)
}

pub(crate) fn front_image_file(len: usize) -> Vec<u8> {
    let image: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
    encode_tlv(TAG_FRONT_IMAGE, &image).expect("TLV should encode")
}

pub(crate) fn face_image_file(len: usize) -> Vec<u8> {
    let image: Vec<u8> = (0..len).map(|i| (i * 17 % 251) as u8).collect();
    encode_tlv(TAG_FACE_IMAGE, &image).expect("TLV should encode")
}
