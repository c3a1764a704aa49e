//! The authenticator: password hashing and challenge/response state for
//! every scheme the handshake can meet. MD5 and the openGauss SHA-256 flow
//! are pure functions; SCRAM-SHA-256 keeps state across its three
//! messages; GSS/SSPI delegates to an injected token provider and never
//! inspects the blobs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::digest::FixedOutput;
use sha2::Sha256;
use std::fmt::Write;

use crate::constants::NONCE_LENGTH;
use crate::errors::Error;

/// SASLprep the password when it is valid UTF-8; Postgres passwords do not
/// have to be, and then the raw bytes go on the wire as-is.
fn normalize_password(raw: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(raw) else {
        return raw.to_vec();
    };
    match stringprep::saslprep(text) {
        Ok(prepared) => prepared.into_owned().into_bytes(),
        Err(_) => raw.to_vec(),
    }
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hash = Sha256::default();
    hash.update(data);
    hash.finalize_fixed().into()
}

fn xor32(a: [u8; 32], b: [u8; 32]) -> [u8; 32] {
    let mut out = a;
    for (byte, other) in out.iter_mut().zip(b) {
        *byte ^= other;
    }
    out
}

/// PBKDF2-HMAC-SHA256 restricted to a single output block, which is the
/// Hi() of RFC 5802.
fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut round = hmac_sha256(password, &[salt, &1u32.to_be_bytes()]);
    let mut block = round;
    for _ in 1..iterations {
        round = hmac_sha256(password, &[&round]);
        block = xor32(block, round);
    }
    block
}

/// `md5` literal plus the lowercase hex double hash, NUL-terminated: the
/// exact PasswordMessage payload for an MD5 challenge.
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();

    // First pass
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let output = md5.finalize_reset();

    // Second pass
    md5.update(format!("{output:x}"));
    md5.update(salt);

    let mut payload = format!("md5{:x}", md5.finalize()).into_bytes();
    payload.push(0);
    payload
}

/// PasswordMessage payload for a cleartext challenge.
pub fn cleartext_password(password: &str) -> Vec<u8> {
    let mut payload = password.as_bytes().to_vec();
    payload.push(0);
    payload
}

fn hex_decode(input: &str) -> Result<Vec<u8>, Error> {
    if input.len() % 2 != 0 {
        return Err(Error::AuthenticationFailed(
            "server sent a hex string of odd length".to_string(),
        ));
    }
    (0..input.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&input[i..i + 2], 16).map_err(|_| {
                Error::AuthenticationFailed("server sent a malformed hex string".to_string())
            })
        })
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Client proof for the openGauss SHA-256 challenge: derive the salted key
/// with PBKDF2, then XOR the client key with its signature under the
/// server-provided token. The reply is the lowercase hex of the proof.
pub fn gauss_sha256_proof(
    password: &str,
    salt_hex: &str,
    token_hex: &str,
    iteration: i32,
) -> Result<Vec<u8>, Error> {
    if iteration <= 0 {
        return Err(Error::AuthenticationFailed(format!(
            "server sent a non-positive iteration count: {iteration}"
        )));
    }
    let salt = hex_decode(salt_hex)?;
    let token = hex_decode(token_hex)?;

    let salted = derive_key(&normalize_password(password.as_bytes()), &salt, iteration as u32);
    let client_key = hmac_sha256(&salted, &[b"Client Key"]);
    let stored_key = sha256(&client_key);
    let signature = hmac_sha256(&stored_key, &[&token]);
    let proof = xor32(client_key, signature);

    Ok(hex_encode(&proof).into_bytes())
}

/// Opaque token exchange for GSS/SSPI. The core shuttles blobs between the
/// provider and AuthenticationGSSContinue messages without looking inside.
pub trait GssTokenProvider: Send + Sync {
    /// The first token, produced before any server data is seen.
    fn initial_token(&self, target: &str) -> Result<Vec<u8>, Error>;

    /// The next token in response to server data; `None` ends the exchange.
    fn continue_token(&self, server_token: &[u8]) -> Result<Option<Vec<u8>>, Error>;
}

// The gs2 header Postgres clients send: no channel binding, no authzid.
// The authcid stays empty too, because the user was already named in the
// startup packet.
const GS2_HEADER: &str = "n,,";

/// RFC 5802 SCRAM-SHA-256, client side. Three messages long: we open with
/// a fresh nonce, answer the salt/iteration challenge with the client
/// proof, and finally check the server's signature so a
/// password-oblivious server cannot fake its half of the exchange.
#[derive(Debug)]
pub struct ScramClient {
    password: String,
    client_nonce: String,
    client_first_bare: String,
    // Expected `v=` value, fixed once the proof is computed.
    server_signature: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(password: &str) -> ScramClient {
        let client_nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();
        Self::with_nonce(password, &client_nonce)
    }

    fn with_nonce(password: &str, client_nonce: &str) -> ScramClient {
        ScramClient {
            password: password.to_string(),
            client_nonce: client_nonce.to_string(),
            client_first_bare: format!("n=,r={client_nonce}"),
            server_signature: None,
        }
    }

    /// The SASLInitialResponse payload.
    pub fn client_first(&self) -> Vec<u8> {
        format!("{GS2_HEADER}{}", self.client_first_bare).into_bytes()
    }

    /// Answer the server-first message with the client-final one.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, Error> {
        let challenge = ServerChallenge::parse(server_first)?;
        if !challenge.nonce.starts_with(&self.client_nonce) {
            return Err(Error::ProtocolViolation(
                "SCRAM server nonce does not extend the client nonce".to_string(),
            ));
        }

        let salted = derive_key(
            &normalize_password(self.password.as_bytes()),
            &challenge.salt,
            challenge.iterations,
        );
        let client_key = hmac_sha256(&salted, &[b"Client Key"]);
        let stored_key = sha256(&client_key);

        let without_proof = format!(
            "c={},r={}",
            BASE64.encode(GS2_HEADER),
            challenge.nonce
        );
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare,
            String::from_utf8_lossy(server_first),
            without_proof
        );

        let proof = xor32(
            client_key,
            hmac_sha256(&stored_key, &[auth_message.as_bytes()]),
        );
        let server_key = hmac_sha256(&salted, &[b"Server Key"]);
        self.server_signature = Some(hmac_sha256(&server_key, &[auth_message.as_bytes()]));

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)).into_bytes())
    }

    /// Check the server-final message against the signature derived
    /// alongside the proof.
    pub fn verify_server_final(&self, message: &[u8]) -> Result<(), Error> {
        let text = std::str::from_utf8(message).map_err(|_| {
            Error::ProtocolViolation("SCRAM server-final message is not UTF-8".to_string())
        })?;
        if let Some(server_error) = text.strip_prefix("e=") {
            return Err(Error::AuthenticationFailed(format!(
                "SCRAM server error: {server_error}"
            )));
        }
        let value = text.strip_prefix("v=").ok_or_else(|| {
            Error::ProtocolViolation("SCRAM server-final message lacks a verifier".to_string())
        })?;
        let verifier = BASE64.decode(value.trim_end()).map_err(|_| {
            Error::ProtocolViolation("SCRAM verifier is not valid base64".to_string())
        })?;

        match &self.server_signature {
            Some(expected) if expected[..] == verifier[..] => Ok(()),
            Some(_) => Err(Error::AuthenticationFailed(
                "server signature verification failed".to_string(),
            )),
            None => Err(Error::ProtocolViolation(
                "SASL final before the exchange completed".to_string(),
            )),
        }
    }
}

/// The server-first message: `r=<nonce>,s=<salt>,i=<iterations>`, with
/// unknown attributes ignored as extensions.
struct ServerChallenge {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl ServerChallenge {
    fn parse(message: &[u8]) -> Result<ServerChallenge, Error> {
        let malformed =
            || Error::ProtocolViolation("malformed SCRAM server challenge".to_string());
        let text = std::str::from_utf8(message).map_err(|_| malformed())?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attribute in text.split(',') {
            let (key, value) = attribute.split_once('=').ok_or_else(malformed)?;
            match key {
                "r" => nonce = Some(value.to_string()),
                "s" => salt = Some(BASE64.decode(value).map_err(|_| malformed())?),
                "i" => iterations = Some(value.parse::<u32>().map_err(|_| malformed())?),
                _ => {}
            }
        }

        Ok(ServerChallenge {
            nonce: nonce.ok_or_else(malformed)?,
            salt: salt.ok_or_else(malformed)?,
            iterations: iterations.ok_or_else(malformed)?,
        })
    }
}
