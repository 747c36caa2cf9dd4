//! Encrypted keystore files.
//!
//! Keys of the top-level object are compared case-insensitively. The format is
//! picked by the first marker field present, in this order:
//!
//! | marker                      | format                          |
//! |-----------------------------|---------------------------------|
//! | `encseed`                   | presale encrypted-seed export   |
//! | `crypto`                    | Web3 Secret Storage V3          |
//! | `hash`                      | EtherWallet export              |
//! | `publisher: "MyEtherWallet"`| MyEtherWallet plain export      |

use aes::{Aes128, Aes256};
use alloy::primitives::{hex, keccak256};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use super::{PrivateKey, SecretError};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const MYETHERWALLET_PUBLISHER: &str = "MyEtherWallet";
const MYETHERWALLET_KEY_LEN: usize = 64;
const PRESALE_PBKDF2_ROUNDS: u32 = 2000;
const ETHERWALLET_MIN_PASSWORD: usize = 7;
const MIN_DKLEN: usize = 32;
const MAX_DKLEN: usize = 64;
const MAX_PBKDF2_ROUNDS: u32 = 1 << 22;
const MAX_SCRYPT_LOG_N: u8 = 20;
const MAX_SCRYPT_R: u32 = 32;
const MAX_SCRYPT_P: u32 = 16;

/// Recognized keystore shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreFormat {
    /// Presale wallet with an `encseed` field.
    Presale,
    /// Web3 Secret Storage V3 with a `crypto` object.
    V3,
    /// EtherWallet export with a `hash` field.
    EtherWallet,
    /// MyEtherWallet export with a plain `privKey`.
    MyEtherWallet,
}

impl KeystoreFormat {
    /// Detect the format of a normalized (lowercase-keyed) keystore object.
    pub fn detect(fields: &Map<String, Value>) -> Result<Self, SecretError> {
        let present = |key: &str| fields.get(key).is_some_and(|v| !v.is_null());
        if present("encseed") {
            Ok(Self::Presale)
        } else if present("crypto") {
            Ok(Self::V3)
        } else if present("hash") {
            Ok(Self::EtherWallet)
        } else if fields.get("publisher").and_then(Value::as_str) == Some(MYETHERWALLET_PUBLISHER)
        {
            Ok(Self::MyEtherWallet)
        } else {
            Err(SecretError::UnrecognizedKeystore)
        }
    }
}

/// Decrypt a keystore JSON object with `password`.
pub fn keystore_to_private_key(file: &Value, password: &str) -> Result<PrivateKey, SecretError> {
    let Value::Object(raw) = file else {
        return Err(SecretError::UnrecognizedKeystore);
    };
    let fields: Map<String, Value> = raw
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect();

    let format = KeystoreFormat::detect(&fields)?;
    debug!(?format, "decrypting keystore");
    match format {
        KeystoreFormat::Presale => decrypt_presale(&fields, password),
        KeystoreFormat::V3 => decrypt_v3(&fields, password),
        KeystoreFormat::EtherWallet => decrypt_etherwallet(&fields, password),
        KeystoreFormat::MyEtherWallet => decode_myetherwallet(&fields),
    }
}

/// Parse keystore JSON text and decrypt it with `password`.
pub fn keystore_to_private_key_str(json: &str, password: &str) -> Result<PrivateKey, SecretError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| SecretError::malformed(format!("not JSON: {e}")))?;
    keystore_to_private_key(&value, password)
}

fn str_field<'a>(fields: &'a Map<String, Value>, key: &str) -> Result<&'a str, SecretError> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SecretError::malformed(format!("missing string field '{key}'")))
}

fn hex_field(value: &str, name: &str) -> Result<Vec<u8>, SecretError> {
    hex::decode(value.strip_prefix("0x").unwrap_or(value))
        .map_err(|e| SecretError::malformed(format!("field '{name}' is not hex: {e}")))
}

/// Compare a key's address against an address stored in the file.
fn check_address(key: &PrivateKey, expected: &str) -> Result<(), SecretError> {
    let expected = expected.strip_prefix("0x").unwrap_or(expected);
    let actual = key
        .address()
        .map(|a| hex::encode(a.as_slice()))
        .unwrap_or_default();
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(SecretError::WrongPassphrase(
            "decoded key does not match the stored address".into(),
        ))
    }
}

fn decrypt_presale(fields: &Map<String, Value>, password: &str) -> Result<PrivateKey, SecretError> {
    let encseed = hex_field(str_field(fields, "encseed")?, "encseed")?;
    if encseed.len() <= 16 {
        return Err(SecretError::malformed("encseed is too short"));
    }
    let (iv, ciphertext) = encseed.split_at(16);

    let mut derived = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        password.as_bytes(),
        PRESALE_PBKDF2_ROUNDS,
        &mut *derived,
    );

    let mut buf = Zeroizing::new(ciphertext.to_vec());
    let seed = Aes128CbcDec::new_from_slices(&derived[..16], iv)
        .map_err(|e| SecretError::malformed(format!("cipher init: {e}")))?
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| SecretError::WrongPassphrase("presale seed padding is invalid".into()))?;

    let key = PrivateKey::from_slice(keccak256(seed).as_slice())?;
    check_address(&key, str_field(fields, "ethaddr")?)?;
    Ok(key)
}

#[derive(Debug, Deserialize)]
struct V3Crypto {
    cipher: String,
    cipherparams: V3CipherParams,
    ciphertext: String,
    kdf: String,
    kdfparams: Value,
    mac: String,
}

#[derive(Debug, Deserialize)]
struct V3CipherParams {
    iv: String,
}

#[derive(Debug, Deserialize)]
struct ScryptParams {
    dklen: usize,
    n: u64,
    r: u32,
    p: u32,
    salt: String,
}

#[derive(Debug, Deserialize)]
struct Pbkdf2Params {
    c: u32,
    dklen: usize,
    prf: String,
    salt: String,
}

fn decrypt_v3(fields: &Map<String, Value>, password: &str) -> Result<PrivateKey, SecretError> {
    if fields.get("version").and_then(Value::as_u64) != Some(3) {
        return Err(SecretError::malformed("not a V3 wallet"));
    }
    let crypto: V3Crypto = fields
        .get("crypto")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| SecretError::malformed(format!("crypto section: {e}")))?
        .ok_or_else(|| SecretError::malformed("missing crypto section"))?;

    let derived = match crypto.kdf.as_str() {
        "scrypt" => {
            let params: ScryptParams = serde_json::from_value(crypto.kdfparams)
                .map_err(|e| SecretError::malformed(format!("scrypt params: {e}")))?;
            derive_scrypt(password, &params)?
        }
        "pbkdf2" => {
            let params: Pbkdf2Params = serde_json::from_value(crypto.kdfparams)
                .map_err(|e| SecretError::malformed(format!("pbkdf2 params: {e}")))?;
            derive_pbkdf2(password, &params)?
        }
        other => return Err(SecretError::Unsupported(format!("kdf '{other}'"))),
    };

    let mut ciphertext = Zeroizing::new(hex_field(&crypto.ciphertext, "ciphertext")?);
    let mut mac_input = Vec::with_capacity(16 + ciphertext.len());
    mac_input.extend_from_slice(&derived[16..32]);
    mac_input.extend_from_slice(&ciphertext);
    let mac = keccak256(&mac_input);
    if mac.as_slice() != hex_field(&crypto.mac, "mac")?.as_slice() {
        return Err(SecretError::WrongPassphrase("key derivation failed".into()));
    }

    if crypto.cipher != "aes-128-ctr" {
        return Err(SecretError::Unsupported(format!("cipher '{}'", crypto.cipher)));
    }
    let iv = hex_field(&crypto.cipherparams.iv, "iv")?;
    let mut cipher = Aes128Ctr::new_from_slices(&derived[..16], &iv)
        .map_err(|e| SecretError::malformed(format!("cipher init: {e}")))?;
    cipher.apply_keystream(&mut ciphertext);

    PrivateKey::from_slice(&ciphertext)
}

/// Derived keys feed both the cipher key and the MAC, so they are 32..=64 bytes.
fn check_dklen(dklen: usize) -> Result<(), SecretError> {
    if (MIN_DKLEN..=MAX_DKLEN).contains(&dklen) {
        Ok(())
    } else {
        Err(SecretError::Unsupported(format!("dklen = {dklen}")))
    }
}

fn derive_scrypt(password: &str, params: &ScryptParams) -> Result<Zeroizing<Vec<u8>>, SecretError> {
    check_dklen(params.dklen)?;
    if params.n < 2 || !params.n.is_power_of_two() {
        return Err(SecretError::Unsupported(format!("scrypt n = {}", params.n)));
    }
    let log_n = u8::try_from(params.n.trailing_zeros())
        .ok()
        .filter(|log_n| *log_n <= MAX_SCRYPT_LOG_N)
        .ok_or_else(|| SecretError::Unsupported(format!("scrypt n = {}", params.n)))?;
    if params.r == 0 || params.r > MAX_SCRYPT_R || params.p == 0 || params.p > MAX_SCRYPT_P {
        return Err(SecretError::Unsupported(format!(
            "scrypt r = {}, p = {}",
            params.r, params.p
        )));
    }
    let scrypt_params = scrypt::Params::new(log_n, params.r, params.p, params.dklen)
        .map_err(|e| SecretError::Unsupported(format!("scrypt params: {e}")))?;
    let salt = hex_field(&params.salt, "salt")?;

    let mut key = Zeroizing::new(vec![0u8; params.dklen]);
    scrypt::scrypt(password.as_bytes(), &salt, &scrypt_params, &mut key)
        .map_err(|e| SecretError::Unsupported(format!("scrypt: {e}")))?;
    Ok(key)
}

fn derive_pbkdf2(password: &str, params: &Pbkdf2Params) -> Result<Zeroizing<Vec<u8>>, SecretError> {
    if params.prf != "hmac-sha256" {
        return Err(SecretError::Unsupported(format!("prf '{}'", params.prf)));
    }
    check_dklen(params.dklen)?;
    if params.c == 0 || params.c > MAX_PBKDF2_ROUNDS {
        return Err(SecretError::Unsupported(format!("pbkdf2 c = {}", params.c)));
    }
    let salt = hex_field(&params.salt, "salt")?;
    let mut key = Zeroizing::new(vec![0u8; params.dklen]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, params.c, &mut key);
    Ok(key)
}

fn decrypt_etherwallet(
    fields: &Map<String, Value>,
    password: &str,
) -> Result<PrivateKey, SecretError> {
    let private = str_field(fields, "private")?;
    let locked = fields
        .get("locked")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let key = if locked {
        if password.len() < ETHERWALLET_MIN_PASSWORD {
            return Err(SecretError::WrongPassphrase(format!(
                "password must be at least {ETHERWALLET_MIN_PASSWORD} characters"
            )));
        }
        let encrypted = fields
            .get("encrypted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        // The "encrypted" variant appends four bytes of the address hash.
        let payload = if encrypted {
            private.get(..128).unwrap_or(private)
        } else {
            private
        };
        let raw = BASE64
            .decode(payload)
            .map_err(|e| SecretError::malformed(format!("private is not base64: {e}")))?;
        let (salt, ciphertext) = match raw.strip_prefix(b"Salted__") {
            Some(rest) if rest.len() > 8 => rest.split_at(8),
            _ => return Err(SecretError::Unsupported("EtherWallet key format".into())),
        };

        let material = evp_bytes_to_key(password.as_bytes(), salt);
        let mut buf = Zeroizing::new(ciphertext.to_vec());
        let plain = Aes256CbcDec::new_from_slices(&material[..32], &material[32..48])
            .map_err(|e| SecretError::malformed(format!("cipher init: {e}")))?
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|_| SecretError::WrongPassphrase("EtherWallet padding is invalid".into()))?;
        let text = std::str::from_utf8(plain)
            .map_err(|_| SecretError::WrongPassphrase("EtherWallet key is not text".into()))?;
        PrivateKey::from_hex(text)?
    } else {
        if private.len() != 64 {
            return Err(SecretError::InvalidKeyLength {
                expected: 64,
                actual: private.len(),
            });
        }
        PrivateKey::from_hex(private)?
    };

    check_address(&key, str_field(fields, "address")?)?;
    Ok(key)
}

/// OpenSSL `EVP_BytesToKey` with MD5 and one iteration, producing 48 bytes.
fn evp_bytes_to_key(password: &[u8], salt: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(48));
    let mut block: Vec<u8> = Vec::new();
    while out.len() < 48 {
        let mut hasher = Md5::new();
        hasher.update(&block);
        hasher.update(password);
        hasher.update(salt);
        block = hasher.finalize().to_vec();
        out.extend_from_slice(&block);
    }
    out
}

fn decode_myetherwallet(fields: &Map<String, Value>) -> Result<PrivateKey, SecretError> {
    let key = str_field(fields, "privkey")?;
    if key.len() != MYETHERWALLET_KEY_LEN {
        return Err(SecretError::InvalidKeyLength {
            expected: MYETHERWALLET_KEY_LEN,
            actual: key.len(),
        });
    }
    PrivateKey::from_hex(key)
}
