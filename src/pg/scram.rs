//! SCRAM-SHA-256 authentication.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) without channel
//! binding, which is what PostgreSQL offers over plain TCP.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header "n,," base64-encoded.
const CHANNEL_BINDING: &str = "biws";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Missing {0} in server message")]
    MissingAttribute(&'static str),
    #[error("Server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("Server rejected authentication: {0}")]
    ServerError(String),
    #[error("Server signature verification failed")]
    BadServerSignature,
    #[error("SCRAM exchange out of order")]
    InvalidState,
}

impl From<ScramError> for crate::error::Error {
    fn from(e: ScramError) -> Self {
        crate::error::Error::Auth(e.to_string())
    }
}

enum State {
    Initial,
    AwaitingFinal {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// SCRAM-SHA-256 client state machine.
///
/// `client_first_message` -> `process_server_first` -> `verify_server_final`.
pub struct ScramClient {
    password: String,
    client_nonce: String,
    state: State,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(password: &str, client_nonce: String) -> Self {
        Self {
            password: password.to_string(),
            client_nonce,
            state: State::Initial,
        }
    }

    /// The user name is taken from the startup message, so it is left empty here.
    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.client_nonce)
    }

    /// `n,,n=,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume `r=<nonce>,s=<salt>,i=<iterations>` and produce the
    /// client-final-message carrying the proof.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.state, State::Initial) {
            return Err(ScramError::InvalidState);
        }
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            match part.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(BASE64.decode(v).map_err(|_| ScramError::InvalidSalt)?),
                Some(("i", v)) => {
                    iterations = Some(v.parse::<u32>().map_err(|_| ScramError::InvalidIterations)?)
                }
                Some(("e", v)) => return Err(ScramError::ServerError(v.to_string())),
                _ => {}
            }
        }

        let nonce = nonce.ok_or(ScramError::MissingAttribute("nonce"))?;
        let salt = salt.ok_or(ScramError::MissingAttribute("salt"))?;
        let iterations = iterations.ok_or(ScramError::MissingAttribute("iterations"))?;
        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature) {
            *p ^= s;
        }

        self.state = State::AwaitingFinal {
            salted_password,
            auth_message,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `v=<server-signature>` against the one we expect.
    pub fn verify_server_final(&mut self, server_msg: &[u8]) -> Result<(), ScramError> {
        let State::AwaitingFinal {
            salted_password,
            auth_message,
        } = &self.state
        else {
            return Err(ScramError::InvalidState);
        };

        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerError(err.to_string()));
        }
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::InvalidServerMessage)?;
        let signature = BASE64
            .decode(verifier.trim_end())
            .map_err(|_| ScramError::InvalidServerMessage)?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;
        if signature != expected {
            return Err(ScramError::BadServerSignature);
        }

        self.state = State::Done;
        Ok(())
    }
}

/// Hi(): PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::InvalidState)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| ScramError::InvalidState)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Plays the server side of the exchange for a known password.
    fn server_signature(password: &str, salt: &[u8], iterations: u32, auth_message: &str) -> String {
        let salted = hi(password, salt, iterations).unwrap();
        let server_key = hmac_sha256(&salted, b"Server Key").unwrap();
        BASE64.encode(hmac_sha256(&server_key, auth_message.as_bytes()).unwrap())
    }

    #[test]
    fn test_full_exchange() {
        let mut client = ScramClient::with_nonce("pencil", "rOprNGfwEbeRWgbNEkqO".to_string());
        assert_eq!(
            client.client_first_message(),
            b"n,,n=,r=rOprNGfwEbeRWgbNEkqO".to_vec()
        );

        let salt = b"salt1234salt1234";
        let server_first = format!(
            "r=rOprNGfwEbeRWgbNEkqOsrv,s={},i=4096",
            BASE64.encode(salt)
        );
        let final_msg = client.process_server_first(server_first.as_bytes()).unwrap();
        let final_str = String::from_utf8(final_msg).unwrap();
        assert!(final_str.starts_with("c=biws,r=rOprNGfwEbeRWgbNEkqOsrv,p="));

        let auth_message = format!(
            "n=,r=rOprNGfwEbeRWgbNEkqO,{},c=biws,r=rOprNGfwEbeRWgbNEkqOsrv",
            server_first
        );
        let v = server_signature("pencil", salt, 4096, &auth_message);
        client
            .verify_server_final(format!("v={}", v).as_bytes())
            .unwrap();
    }

    #[test]
    fn test_rejects_wrong_server_signature() {
        let mut client = ScramClient::with_nonce("pencil", "abc".to_string());
        let server_first = format!("r=abcdef,s={},i=1", BASE64.encode(b"salt"));
        client.process_server_first(server_first.as_bytes()).unwrap();

        let bogus = format!("v={}", BASE64.encode([0u8; 32]));
        assert_eq!(
            client.verify_server_final(bogus.as_bytes()),
            Err(ScramError::BadServerSignature)
        );
    }

    #[test]
    fn test_rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce("pencil", "abc".to_string());
        let server_first = format!("r=xyz123,s={},i=4096", BASE64.encode(b"salt"));
        assert_eq!(
            client.process_server_first(server_first.as_bytes()),
            Err(ScramError::NonceMismatch)
        );
    }

    #[test]
    fn test_out_of_order_final() {
        let mut client = ScramClient::new("pencil");
        assert_eq!(
            client.verify_server_final(b"v=AAAA"),
            Err(ScramError::InvalidState)
        );
    }
}
