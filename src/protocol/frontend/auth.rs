//! Authentication messages.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::codec::MessageBuilder;

/// Write a PasswordMessage (cleartext or MD5 hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish();
}

/// Compute MD5 password hash.
///
/// PostgreSQL MD5 password format: "md5" + md5(md5(password + username) + salt)
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::Md5;

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let inner = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

/// Write a SASLInitialResponse message.
pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, initial_response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(mechanism);
    msg.write_i32(initial_response.len() as i32);
    msg.write_bytes(initial_response);
    msg.finish();
}

/// Write a SASLResponse message.
pub fn write_sasl_response(buf: &mut Vec<u8>, response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_bytes(response);
    msg.finish();
}

/// SASL mechanism name for SCRAM-SHA-256.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// GS2 header without channel binding.
const GS2_HEADER: &str = "n,,";

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| Error::Auth(format!("HMAC key: {e}")))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Client side of a SCRAM-SHA-256 exchange.
///
/// The exchange goes `client_first_message` → `process_server_first` →
/// `verify_server_final`.
pub struct ScramSha256 {
    client_first_bare: String,
    nonce: String,
    password: String,
    /// Filled by `process_server_first`: (salted password, auth message)
    proof_state: Option<([u8; 32], String)>,
}

impl ScramSha256 {
    /// Start an exchange with a random 24-byte nonce.
    ///
    /// PostgreSQL takes the user name from the startup packet, so the SCRAM
    /// user name is left empty.
    pub fn new(password: &str) -> Self {
        use rand::Rng;

        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill(&mut nonce_bytes);
        Self::with_nonce("", password, &BASE64.encode(nonce_bytes))
    }

    /// Start an exchange with a caller-chosen user name and nonce.
    pub fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            client_first_bare: format!("n={},r={}", user, nonce),
            nonce: nonce.to_string(),
            password: password.to_string(),
            proof_state: None,
        }
    }

    /// The client-first-message.
    pub fn client_first_message(&self) -> String {
        format!("{}{}", GS2_HEADER, self.client_first_bare)
    }

    /// Process the server-first-message and produce the client-final-message.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String> {
        let mut combined_nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = value.parse::<u32>().ok();
            }
        }

        let (Some(combined_nonce), Some(salt), Some(iterations)) = (combined_nonce, salt, iterations)
        else {
            return Err(Error::Auth(format!(
                "malformed SCRAM server-first-message: {server_first}"
            )));
        };
        if !combined_nonce.starts_with(&self.nonce) || combined_nonce.len() == self.nonce.len() {
            return Err(Error::Auth("SCRAM server nonce does not extend the client nonce".into()));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|e| Error::Auth(format!("SCRAM salt: {e}")))?;

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!(
            "c={},r={}",
            BASE64.encode(GS2_HEADER.as_bytes()),
            combined_nonce
        );
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(signature) {
            *p ^= s;
        }

        self.proof_state = Some((salted_password, auth_message));
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Check the server signature in the server-final-message.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        if let Some(reason) = server_final.strip_prefix("e=") {
            return Err(Error::Auth(format!("SCRAM rejected: {reason}")));
        }
        let signature = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Auth("malformed SCRAM server-final-message".into()))?;
        let signature = BASE64
            .decode(signature.trim_end())
            .map_err(|e| Error::Auth(format!("SCRAM server signature: {e}")))?;

        let (salted_password, auth_message) = self
            .proof_state
            .as_ref()
            .ok_or_else(|| Error::Auth("SCRAM server-final before server-first".into()))?;
        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if signature.as_slice() != expected.as_slice() {
            return Err(Error::Auth("SCRAM server signature mismatch".into()));
        }
        Ok(())
    }
}
