//! Triple-DES, DES retail MAC and padding helpers used by the card protocol.

use cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
};
use core::iter;
use tracing::error;
use zeroize::Zeroizing;

use crate::ZairyuError;

/// DES and 3DES block size.
pub const BLOCK_SIZE: usize = 8;
/// Length of every symmetric key used by the card (2-key 3DES).
pub const KEY_LEN: usize = 16;
/// Length of the retail MAC.
pub const MAC_LEN: usize = 8;

const ZERO_IV: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

/// Encrypts or decrypts `data` with 2-key Triple-DES in CBC mode with a zero IV.
///
/// The 16-byte `key` K1‖K2 is expanded to the 3-key form K1‖K2‖K1.
/// When encrypting, PKCS#7 padding is applied only if `data` is not a multiple
/// of the block size. Decryption returns the raw block-aligned plaintext, the
/// caller removes the padding with [`remove_padding`].
///
/// # Errors
///
/// * `ZairyuError::CryptographyError` if `key` is not 16 bytes long or the
///   ciphertext is not block-aligned.
///
/// # Examples
///
/// ```
/// use zairyu::crypto::tdes_transform;
/// use hex_literal::hex;
///
/// let key = hex!("AB94FDECF2674FDFB9B391F85D7F76F2");
/// let data = hex!("781723860C06C2264608F919887022120B795240CB7049B01C19B33E32804F0B");
/// let encrypted = tdes_transform(&data, &key, true).unwrap();
/// assert_eq!(
///     encrypted,
///     hex!("72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F2")
/// );
/// assert_eq!(tdes_transform(&encrypted, &key, false).unwrap(), data);
/// ```
pub fn tdes_transform(data: &[u8], key: &[u8], encrypt: bool) -> Result<Vec<u8>, ZairyuError> {
    if key.len() != KEY_LEN {
        error!(
            "Wrong key size for 3DES, expected {KEY_LEN}, found {}",
            key.len()
        );
        return Err(ZairyuError::CryptographyError("3DES key must be 16 bytes"));
    }
    let key = Zeroizing::new([key, &key[..8]].concat());

    if encrypt {
        cbc_encrypt::<cbc::Encryptor<des::TdesEde3>>(&key, &ZERO_IV, data)
    } else {
        cbc_decrypt::<cbc::Decryptor<des::TdesEde3>>(&key, &ZERO_IV, data)
    }
}

/// Computes the ISO/IEC 9797-1 MAC Algorithm 3 (retail MAC) of `data`.
///
/// `data` is padded with padding method 2 before processing. Every block but the
/// last is chained through single DES with K1, the last block goes through
/// DES-EDE with K1, K2 and K1.
///
/// # Errors
///
/// * `ZairyuError::CryptographyError` if `key` is not 16 bytes long.
///
/// # Examples
///
/// ```
/// use zairyu::crypto::retail_mac;
/// use hex_literal::hex;
///
/// let mac = retail_mac(
///     &hex!("72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F2"),
///     &hex!("7962D9ECE03D1ACD4C76089DCE131543"),
/// );
/// assert_eq!(mac.unwrap(), hex!("5F1448EEA8AD90A7"));
/// ```
pub fn retail_mac(data: &[u8], key: &[u8]) -> Result<[u8; MAC_LEN], ZairyuError> {
    if key.len() != KEY_LEN {
        error!("Can not compute MAC, MAC key is invalid.");
        return Err(ZairyuError::CryptographyError("MAC key must be 16 bytes"));
    }

    let data = padding_method_2(data, BLOCK_SIZE);
    let (key1, key2) = key.split_at(BLOCK_SIZE);
    let (blocks, last) = data.split_at(data.len() - BLOCK_SIZE);

    let mut h = [0_u8; BLOCK_SIZE];
    for block in blocks.chunks_exact(BLOCK_SIZE) {
        h = des_encrypt_block(key1, &xor_block(&h, block))?;
    }

    let x = des_encrypt_block(key1, &xor_block(&h, last))?;
    let x = des_decrypt_block(key2, &x)?;
    des_encrypt_block(key1, &x)
}

/// Removes ISO/IEC 7816-4 padding, or PKCS#7 padding if no `0x80` byte is present.
///
/// # Errors
///
/// * `ZairyuError::InvalidResponse` if a `0x80` byte is followed by anything but
///   `0x00` bytes, or if the PKCS#7 fallback finds an inconsistent tail.
///
/// # Examples
///
/// ```
/// use zairyu::crypto::remove_padding;
///
/// assert_eq!(remove_padding(&[0x41, 0x42, 0x80, 0x00, 0x00]).unwrap(), b"AB");
/// assert_eq!(remove_padding(&[0x41, 0x42, 0x02, 0x02]).unwrap(), b"AB");
/// assert!(remove_padding(&[0x41, 0x80, 0x00, 0x01]).is_err());
/// ```
pub fn remove_padding(data: &[u8]) -> Result<Vec<u8>, ZairyuError> {
    if let Some(position) = data.iter().rposition(|&b| b == 0x80) {
        if data[position + 1..].iter().all(|&b| b == 0x00) {
            return Ok(data[..position].to_vec());
        }
        error!(
            "Invalid ISO/IEC 7816-4 padding, non-zero byte after 0x80 at offset {position}"
        );
        return Err(ZairyuError::InvalidResponse(
            "invalid ISO/IEC 7816-4 padding",
        ));
    }

    let Some(&pad) = data.last() else {
        error!("Can not remove padding from empty data");
        return Err(ZairyuError::InvalidResponse("padded data is empty"));
    };
    let pad_len = usize::from(pad);
    if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > data.len() {
        error!("Invalid PKCS#7 padding length {pad_len}");
        return Err(ZairyuError::InvalidResponse("invalid PKCS#7 padding"));
    }
    let (unpadded, tail) = data.split_at(data.len() - pad_len);
    if !tail.iter().all(|&b| b == pad) {
        error!("Invalid PKCS#7 padding, tail bytes differ from {pad:02X}");
        return Err(ZairyuError::InvalidResponse("invalid PKCS#7 padding"));
    }
    Ok(unpadded.to_vec())
}

/// Pads the input data using padding method 2.
///
/// <https://en.wikipedia.org/wiki/ISO/IEC_9797-1#Padding_method_2>
#[must_use]
pub fn padding_method_2(data: &[u8], pad_to: usize) -> Vec<u8> {
    let mut data = data.to_vec();
    data.push(0x80);
    if data.len() % pad_to != 0 {
        let padding_len = pad_to - (data.len() % pad_to);
        data.extend(iter::repeat(0).take(padding_len));
    }
    data
}

/// Encrypts a single 8-byte block with DES.
///
/// # Errors
///
/// * `ZairyuError::CryptographyError` if `key` or `block` is not 8 bytes long.
pub fn des_encrypt_block(key: &[u8], block: &[u8]) -> Result<[u8; BLOCK_SIZE], ZairyuError> {
    to_block(&ecb_encrypt::<ecb::Encryptor<des::Des>>(key, block)?)
}

/// Decrypts a single 8-byte block with DES.
///
/// # Errors
///
/// * `ZairyuError::CryptographyError` if `key` or `block` is not 8 bytes long.
pub fn des_decrypt_block(key: &[u8], block: &[u8]) -> Result<[u8; BLOCK_SIZE], ZairyuError> {
    to_block(&ecb_decrypt::<ecb::Decryptor<des::Des>>(key, block)?)
}

/// XORs two byte slices of equal length.
///
/// # Errors
///
/// * `ZairyuError::CryptographyError` if the inputs have different lengths.
pub fn xor_slices(a: &[u8], b: &[u8]) -> Result<Vec<u8>, ZairyuError> {
    if a.len() == b.len() {
        return Ok(a.iter().zip(b.iter()).map(|(&x, &y)| x ^ y).collect());
    }
    error!(
        "XORed slices must have the same length, found {}, {}",
        a.len(),
        b.len()
    );
    Err(ZairyuError::CryptographyError(
        "XORed slices must have the same length",
    ))
}

fn xor_block(a: &[u8; BLOCK_SIZE], b: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut out = *a;
    for (o, &x) in out.iter_mut().zip(b) {
        *o ^= x;
    }
    out
}

fn to_block(data: &[u8]) -> Result<[u8; BLOCK_SIZE], ZairyuError> {
    data.try_into().map_err(|_| {
        error!("Expected a single {BLOCK_SIZE} byte block, found {}", data.len());
        ZairyuError::CryptographyError("cipher output is not a single block")
    })
}

fn cbc_encrypt<CM>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, ZairyuError>
where
    CM: BlockEncryptMut + KeyIvInit,
{
    if key.len() != CM::key_size() || iv.len() != CM::iv_size() {
        error!(
            "Wrong key or IV size for cipher encryption, expected {}/{}, found {}/{}",
            CM::key_size(),
            CM::iv_size(),
            key.len(),
            iv.len()
        );
        return Err(ZairyuError::CryptographyError(
            "Wrong key or IV size for cipher encryption",
        ));
    }

    let cipher = CM::new(key.into(), iv.into());
    if data.len() % CM::block_size() == 0 {
        Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(data))
    } else {
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
    }
}

fn cbc_decrypt<CM>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, ZairyuError>
where
    CM: BlockDecryptMut + KeyIvInit,
{
    if key.len() != CM::key_size() || iv.len() != CM::iv_size() {
        error!(
            "Wrong key or IV size for cipher decryption, expected {}/{}, found {}/{}",
            CM::key_size(),
            CM::iv_size(),
            key.len(),
            iv.len()
        );
        return Err(ZairyuError::CryptographyError(
            "Wrong key or IV size for cipher decryption",
        ));
    }
    if data.len() % CM::block_size() != 0 {
        error!(
            "Wrong data size for cipher decryption, expected a multiple of {}, found {}",
            CM::block_size(),
            data.len()
        );
        return Err(ZairyuError::CryptographyError(
            "ciphertext is not a multiple of the block size",
        ));
    }

    CM::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<NoPadding>(data)
        .map_err(|_| {
            error!("3DES decryption failed");
            ZairyuError::CryptographyError("3DES decryption failed")
        })
}

fn ecb_encrypt<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ZairyuError>
where
    CM: BlockEncryptMut + KeyInit,
{
    if key.len() != CM::key_size() || data.len() % CM::block_size() != 0 {
        error!(
            "Wrong key or data size for cipher encryption, key {}, data {}",
            key.len(),
            data.len()
        );
        return Err(ZairyuError::CryptographyError(
            "Wrong key or data size for cipher encryption",
        ));
    }

    Ok(CM::new(key.into()).encrypt_padded_vec_mut::<NoPadding>(data))
}

fn ecb_decrypt<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ZairyuError>
where
    CM: BlockDecryptMut + KeyInit,
{
    if key.len() != CM::key_size() || data.len() % CM::block_size() != 0 {
        error!(
            "Wrong key or data size for cipher decryption, key {}, data {}",
            key.len(),
            data.len()
        );
        return Err(ZairyuError::CryptographyError(
            "Wrong key or data size for cipher decryption",
        ));
    }

    CM::new(key.into())
        .decrypt_padded_vec_mut::<NoPadding>(data)
        .map_err(|_| ZairyuError::CryptographyError("DES decryption failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_tdes_transform_two_key_vectors() -> Result<(), ZairyuError> {
        // Examples taken from https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf Appendix D.3
        let key = hex!("AB94FDECF2674FDFB9B391F85D7F76F2");
        let s = hex!("781723860C06C226 4608F91988702212 0B795240CB7049B01C19B33E32804F0B");
        let e_ifd = tdes_transform(&s, &key, true)?;
        assert_eq!(
            e_ifd,
            hex!("72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F2")
        );

        let e_icc = hex!("46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F");
        let r = tdes_transform(&e_icc, &key, false)?;
        assert_eq!(
            r,
            hex!("4608F91988702212 781723860C06C226 0B4F80323EB3191CB04970CB4052790B")
        );
        Ok(())
    }

    #[test]
    fn test_des_block_known_answer() -> Result<(), ZairyuError> {
        let key = hex!("0123456789ABCDEF");
        let ciphertext = des_encrypt_block(&key, b"Now is t")?;
        assert_eq!(ciphertext, hex!("3FA40E8A984D4815"));
        assert_eq!(des_decrypt_block(&key, &ciphertext)?, *b"Now is t");
        Ok(())
    }

    #[test]
    fn test_tdes_transform_known_answers() -> Result<(), ZairyuError> {
        // With K1 = K2 the cipher collapses to single DES.
        let key = hex!("0123456789ABCDEF 0123456789ABCDEF");
        assert_eq!(tdes_transform(b"Now is t", &key, true)?, hex!("3FA40E8A984D4815"));

        // First block of E.IFD in ICAO Doc 9303-11 Appendix D.3.
        let key = hex!("AB94FDECF2674FDF B9B391F85D7F76F2");
        let block = hex!("781723860C06C226");
        let ciphertext = tdes_transform(&block, &key, true)?;
        assert_eq!(ciphertext, hex!("72C29C2371CC9BDB"));
        assert_eq!(tdes_transform(&ciphertext, &key, false)?, block);
        Ok(())
    }

    #[test]
    fn test_tdes_transform_pads_unaligned_input() -> Result<(), ZairyuError> {
        let key = hex!("AB94FDECF2674FDFB9B391F85D7F76F2");
        let encrypted = tdes_transform(b"ABCDE", &key, true)?;
        assert_eq!(encrypted.len(), 8);
        let decrypted = tdes_transform(&encrypted, &key, false)?;
        assert_eq!(decrypted, hex!("4142434445030303"));
        assert_eq!(remove_padding(&decrypted)?, b"ABCDE");
        Ok(())
    }

    #[test]
    fn test_tdes_transform_invalid_input() {
        assert!(tdes_transform(&[0; 8], &[0; 24], true)
            .is_err_and(|e| matches!(e, ZairyuError::CryptographyError(_))));
        assert!(tdes_transform(&[0; 8], &[0; 8], false)
            .is_err_and(|e| matches!(e, ZairyuError::CryptographyError(_))));
        assert!(tdes_transform(&[0; 12], &[0; 16], false)
            .is_err_and(|e| matches!(e, ZairyuError::CryptographyError(_))));
    }

    #[test]
    fn test_retail_mac() -> Result<(), ZairyuError> {
        // Examples taken from https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf Appendix D.3
        let key = hex!("7962D9ECE03D1ACD4C76089DCE131543");
        let data = hex!("72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F2");
        assert_eq!(retail_mac(&data, &key)?, hex!("5F1448EEA8AD90A7"));

        let data = hex!("46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F");
        assert_eq!(retail_mac(&data, &key)?, hex!("2F2D235D074D7449"));

        // Examples taken from https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf Appendix D.4
        let key = hex!("F1CB1F1FB5ADF208806B89DC579DC1F8");
        let data = hex!("887022120C06C2270CA4020C800000008709016375432908C044F6");
        assert_eq!(retail_mac(&data, &key)?, hex!("BF8B92D635FF24F8"));

        let data = hex!("887022120C06C22899029000");
        assert_eq!(retail_mac(&data, &key)?, hex!("FA855A5D4C50A8ED"));

        let data = hex!("887022120C06C2290CB0000080000000970104");
        assert_eq!(retail_mac(&data, &key)?, hex!("ED6705417E96BA55"));

        let data =
            hex!("887022120C06C22C871901FB9235F4E4037F2327DCC8964F1F9B8C30F42C8E2FFF224A99029000");
        assert_eq!(retail_mac(&data, &key)?, hex!("C8B2787EAEA07D74"));

        Ok(())
    }

    #[test]
    fn test_retail_mac_invalid_key() {
        assert!(retail_mac(b"data", &[0; 8])
            .is_err_and(|e| matches!(e, ZairyuError::CryptographyError(_))));
    }

    #[test]
    fn test_remove_padding_valid() -> Result<(), ZairyuError> {
        assert_eq!(remove_padding(&hex!("0102038000000000"))?, hex!("010203"));
        assert_eq!(remove_padding(&hex!("0102030405060780"))?, hex!("01020304050607"));
        assert_eq!(remove_padding(&hex!("8000000000000000"))?, b"");
        // A 0x80 inside the data is fine as long as the padding follows it.
        assert_eq!(remove_padding(&hex!("8001800000000000"))?, hex!("8001"));

        assert_eq!(remove_padding(&hex!("0102030405060701"))?, hex!("01020304050607"));
        assert_eq!(remove_padding(&hex!("0102030404040404"))?, hex!("010203"));
        assert_eq!(remove_padding(&hex!("0808080808080808"))?, b"");
        Ok(())
    }

    #[test]
    fn test_remove_padding_invalid() {
        // 0x80 followed by a non-zero byte is rejected without PKCS#7 fallback.
        assert!(remove_padding(&hex!("0102038000000001"))
            .is_err_and(|e| matches!(e, ZairyuError::InvalidResponse(_))));
        assert!(remove_padding(&hex!("0102030405800101"))
            .is_err_and(|e| matches!(e, ZairyuError::InvalidResponse(_))));

        assert!(remove_padding(&hex!("0102030405030403"))
            .is_err_and(|e| matches!(e, ZairyuError::InvalidResponse(_))));
        assert!(remove_padding(&hex!("0102030405060700"))
            .is_err_and(|e| matches!(e, ZairyuError::InvalidResponse(_))));
        assert!(remove_padding(&hex!("0909090909090909"))
            .is_err_and(|e| matches!(e, ZairyuError::InvalidResponse(_))));
        assert!(remove_padding(&[])
            .is_err_and(|e| matches!(e, ZairyuError::InvalidResponse(_))));
    }

    #[test]
    fn test_padding_method_2() {
        assert_eq!(padding_method_2(&[], 8), hex!("8000000000000000"));
        assert_eq!(padding_method_2(&hex!("01020304050607"), 8), hex!("0102030405060780"));
        assert_eq!(
            padding_method_2(&hex!("0102030405060708"), 8),
            hex!("01020304050607088000000000000000")
        );
    }

    #[test]
    fn test_xor_slices() {
        assert_eq!(xor_slices(&hex!("F0F0"), &hex!("0FF0")).ok(), Some(hex!("FF00").to_vec()));
        assert!(xor_slices(&hex!("F0"), &hex!("0FF0")).is_err());
    }
}
