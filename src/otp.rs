//! # Bootstrap / OTP Exchange
//!
//! The three-step exchange that precedes every MQTT connect:
//!
//! 1. **Environment query** — `GET /api/v1/env` on the cloud base URL,
//!    returning the auth endpoint, encoding, capabilities, transport list
//!    and backoff parameters.
//! 2. **Challenge** — `GET <auth>/node/<claim_id>/challenge`, returning an
//!    RSA-OAEP encrypted nonce which only the claimed agent can decrypt.
//! 3. **Password** — `POST <auth>/node/<claim_id>/password` with the
//!    decrypted nonce, returning MQTT credentials and the topic list.
//!
//! Any step can instead return a cloud error object; its `errorNonRetryable`
//! and `errorRetryDelaySeconds` fields are surfaced so the lifecycle can
//! disable the link or arm a reconnect block before backing off.
//!
//! Everything here is blocking and driven through `spawn_blocking`.

use std::time::Duration;

use rsa::Oaep;
use serde::Deserialize;
use sha1::Sha1;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::identity::AgentIdentity;
use crate::net::https::{https_request, HttpsError, HttpsRequest, Method};
use crate::net::proxy::ProxyConfig;
use crate::net::{b64_decode, b64_encode};
use crate::session::backoff::BackoffParams;
use crate::session::topics::TopicEntry;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);
/// Bootstrap responses are small; anything bigger is a misbehaving endpoint.
const MAX_BOOTSTRAP_RESPONSE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("HTTPS failure during {endpoint}: {source}")]
    Https {
        endpoint: &'static str,
        #[source]
        source: HttpsError,
    },

    #[error("Unexpected status {code} from {endpoint}")]
    Status { endpoint: &'static str, code: u16 },

    #[error("Malformed {endpoint} response: {reason}")]
    Malformed {
        endpoint: &'static str,
        reason: String,
    },

    #[error("Challenge decryption failed: {0}")]
    ChallengeDecrypt(String),

    /// Structured error object returned by the cloud. The caller applies
    /// `non_retryable` / `retry_delay` globally before backing off.
    #[error("Cloud error {code}: {message}")]
    Cloud {
        code: String,
        message: String,
        non_retryable: bool,
        retry_delay: Option<Duration>,
    },

    #[error("Cloud selected unsupported encoding \"{0}\"")]
    UnsupportedEncoding(String),

    #[error("Cloud environment lacks the \"{0}\" capability")]
    MissingCapability(&'static str),

    #[error("No usable transport in environment (need MQTT 3.1.1)")]
    NoUsableTransport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Proto,
    Unknown,
}

impl From<&str> for Encoding {
    fn from(s: &str) -> Self {
        match s {
            "json" => Encoding::Json,
            "proto" => Encoding::Proto,
            _ => Encoding::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Mqtt3,
    Mqtt5,
    Unknown,
}

impl From<&str> for TransportType {
    fn from(s: &str) -> Self {
        match s {
            "MQTTv3" => TransportType::Mqtt3,
            "MQTTv5" => TransportType::Mqtt5,
            _ => TransportType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TransportDescWire {
    #[serde(rename = "type")]
    kind: String,
    endpoint: String,
}

#[derive(Debug, Clone)]
pub struct TransportDesc {
    pub kind: TransportType,
    pub endpoint: String,
}

/// Parsed `/env` descriptor. Rebuilt on every reconnection attempt; the
/// previous one is dropped wholesale.
#[derive(Debug, Clone)]
pub struct EnvDescriptor {
    pub auth_endpoint: Url,
    pub encoding: Encoding,
    pub capabilities: Vec<String>,
    pub transports: Vec<TransportDesc>,
    pub backoff: BackoffParams,
}

impl EnvDescriptor {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }

    /// First transport entry carrying MQTT 3.1.1, the only type this link
    /// speaks.
    pub fn select_transport(&self) -> Option<&TransportDesc> {
        self.transports
            .iter()
            .find(|t| t.kind == TransportType::Mqtt3)
    }
}

#[derive(Debug, Deserialize)]
struct EnvWire {
    #[serde(rename = "authEndpoint")]
    auth_endpoint: String,
    encoding: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    transports: Vec<TransportDescWire>,
    backoff: BackoffParams,
}

/// Cloud error object shape shared by all bootstrap endpoints.
#[derive(Debug, Deserialize)]
struct CloudErrorWire {
    #[serde(rename = "errorCode")]
    error_code: String,
    #[serde(rename = "errorMsgKey")]
    #[allow(dead_code)]
    error_msg_key: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
    #[serde(rename = "errorNonRetryable")]
    error_non_retryable: Option<bool>,
    #[serde(rename = "errorRetryDelaySeconds")]
    error_retry_delay_seconds: Option<u64>,
}

/// MQTT credentials and topic list from the `/password` step.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttCredentials {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub topics: Vec<TopicEntry>,
}

/// Step 1: environment discovery.
pub fn fetch_env(
    cloud_base: &Url,
    identity: &AgentIdentity,
    agent_version: &str,
    proxy: Option<&ProxyConfig>,
) -> Result<EnvDescriptor, BootstrapError> {
    let mut url = cloud_base
        .join("api/v1/env")
        .map_err(|e| malformed("/env", e.to_string()))?;
    url.set_query(Some(&format!(
        "v={}&cap=proto&claim_id={}",
        agent_version,
        identity.claim_id_str()
    )));

    let response = get("/env", &url, proxy)?;
    if response.code != 200 {
        return Err(error_from_body("/env", &response.payload, response.code));
    }

    let wire: EnvWire = serde_json::from_slice(&response.payload)
        .map_err(|e| malformed("/env", e.to_string()))?;

    let auth_endpoint = Url::parse(&wire.auth_endpoint)
        .map_err(|e| malformed("/env", format!("bad authEndpoint: {e}")))?;

    if !wire.backoff.is_valid() {
        return Err(malformed("/env", "backoff parameters out of range".into()));
    }

    let env = EnvDescriptor {
        auth_endpoint,
        encoding: Encoding::from(wire.encoding.as_str()),
        capabilities: wire.capabilities,
        transports: wire
            .transports
            .into_iter()
            .map(|t| TransportDesc {
                kind: TransportType::from(t.kind.as_str()),
                endpoint: t.endpoint,
            })
            .collect(),
        backoff: wire.backoff,
    };
    info!("Cloud /env successful");
    Ok(env)
}

/// Steps 2 and 3: challenge/response yielding the MQTT credentials.
pub fn otp_exchange(
    auth_endpoint: &Url,
    identity: &AgentIdentity,
    proxy: Option<&ProxyConfig>,
) -> Result<MqttCredentials, BootstrapError> {
    let claim = identity.claim_id_str();

    let challenge_url = auth_join(auth_endpoint, &format!("node/{claim}/challenge"))?;
    let response = get("/challenge", &challenge_url, proxy)?;
    if response.code != 200 {
        return Err(error_from_body(
            "/challenge",
            &response.payload,
            response.code,
        ));
    }

    #[derive(Deserialize)]
    struct ChallengeWire {
        challenge: String,
    }
    let wire: ChallengeWire = serde_json::from_slice(&response.payload)
        .map_err(|e| malformed("/challenge", e.to_string()))?;

    let ciphertext = b64_decode(&wire.challenge)
        .ok_or_else(|| malformed("/challenge", "challenge is not valid base64".into()))?;

    let plaintext = identity
        .private_key
        .decrypt(Oaep::new::<Sha1>(), &ciphertext)
        .map_err(|e| BootstrapError::ChallengeDecrypt(e.to_string()))?;
    debug!("Decrypted {} byte challenge", plaintext.len());

    let password_url = auth_join(auth_endpoint, &format!("node/{claim}/password"))?;
    let body = serde_json::json!({ "response": b64_encode(&plaintext) }).to_string();
    let response = post("/password", &password_url, proxy, body.as_bytes())?;
    if response.code != 201 {
        return Err(error_from_body(
            "/password",
            &response.payload,
            response.code,
        ));
    }

    let creds: MqttCredentials = serde_json::from_slice(&response.payload)
        .map_err(|e| malformed("/password", e.to_string()))?;
    if creds.client_id.is_empty() || creds.username.is_empty() || creds.password.is_empty() {
        return Err(malformed(
            "/password",
            "clientID, username and password are compulsory".into(),
        ));
    }
    info!(
        "OTP exchange complete, {} topics received",
        creds.topics.len()
    );
    Ok(creds)
}

fn auth_join(auth_endpoint: &Url, suffix: &str) -> Result<Url, BootstrapError> {
    // the auth endpoint may carry a path prefix; keep it
    let mut base = auth_endpoint.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base)
        .and_then(|u| u.join(suffix))
        .map_err(|e| malformed("/challenge", e.to_string()))
}

fn get(
    endpoint: &'static str,
    url: &Url,
    proxy: Option<&ProxyConfig>,
) -> Result<crate::net::https::HttpsResponse, BootstrapError> {
    https_request(&HttpsRequest {
        method: Method::Get,
        url,
        headers: Vec::new(),
        payload: None,
        timeout: BOOTSTRAP_TIMEOUT,
        proxy,
        max_response: MAX_BOOTSTRAP_RESPONSE,
    })
    .map_err(|source| BootstrapError::Https { endpoint, source })
}

fn post(
    endpoint: &'static str,
    url: &Url,
    proxy: Option<&ProxyConfig>,
    payload: &[u8],
) -> Result<crate::net::https::HttpsResponse, BootstrapError> {
    https_request(&HttpsRequest {
        method: Method::Post,
        url,
        headers: vec![("Content-Type".into(), "application/json".into())],
        payload: Some(payload),
        timeout: BOOTSTRAP_TIMEOUT,
        proxy,
        max_response: MAX_BOOTSTRAP_RESPONSE,
    })
    .map_err(|source| BootstrapError::Https { endpoint, source })
}

fn malformed(endpoint: &'static str, reason: String) -> BootstrapError {
    BootstrapError::Malformed { endpoint, reason }
}

/// Non-2xx bodies may carry the structured cloud error object; fall back to
/// a plain status error when they do not.
fn error_from_body(endpoint: &'static str, body: &[u8], code: u16) -> BootstrapError {
    match serde_json::from_slice::<CloudErrorWire>(body) {
        Ok(err) => {
            warn!(
                "Cloud returned error {} on {endpoint}: {}",
                err.error_code,
                err.error_message.as_deref().unwrap_or("")
            );
            BootstrapError::Cloud {
                code: err.error_code,
                message: err.error_message.unwrap_or_default(),
                non_retryable: err.error_non_retryable.unwrap_or(false),
                retry_delay: err.error_retry_delay_seconds.map(Duration::from_secs),
            }
        }
        Err(_) => BootstrapError::Status { endpoint, code },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_descriptor_parses() {
        let body = r#"{
            "authEndpoint": "https://auth.cloud.example",
            "encoding": "proto",
            "capabilities": ["proto", "ctx"],
            "transports": [
                {"type": "MQTTv5", "endpoint": "wss://broker5:443/mqtt"},
                {"type": "MQTTv3", "endpoint": "wss://broker:443/mqtt"}
            ],
            "backoff": {"base": 2, "minSeconds": 1, "maxSeconds": 60}
        }"#;
        let wire: EnvWire = serde_json::from_str(body).unwrap();
        assert_eq!(wire.encoding, "proto");
        let env = EnvDescriptor {
            auth_endpoint: Url::parse(&wire.auth_endpoint).unwrap(),
            encoding: Encoding::from(wire.encoding.as_str()),
            capabilities: wire.capabilities,
            transports: wire
                .transports
                .into_iter()
                .map(|t| TransportDesc {
                    kind: TransportType::from(t.kind.as_str()),
                    endpoint: t.endpoint,
                })
                .collect(),
            backoff: wire.backoff,
        };
        assert!(env.has_capability("proto"));
        // the MQTT 3.1.1 entry is selected even when listed second
        assert_eq!(
            env.select_transport().unwrap().endpoint,
            "wss://broker:443/mqtt"
        );
        assert_eq!(env.backoff.base, 2);
    }

    #[test]
    fn cloud_error_body_parses() {
        let body = br#"{
            "errorCode": "ErrAgentBlocked",
            "errorMsgKey": "blocked",
            "errorMessage": "come back later",
            "errorNonRetryable": false,
            "errorRetryDelaySeconds": 30
        }"#;
        match error_from_body("/env", body, 403) {
            BootstrapError::Cloud {
                code,
                non_retryable,
                retry_delay,
                ..
            } => {
                assert_eq!(code, "ErrAgentBlocked");
                assert!(!non_retryable);
                assert_eq!(retry_delay, Some(Duration::from_secs(30)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_error_body_falls_back_to_status() {
        assert!(matches!(
            error_from_body("/env", b"<html>oops</html>", 500),
            BootstrapError::Status {
                endpoint: "/env",
                code: 500
            }
        ));
    }

    #[test]
    fn password_response_parses_with_topics() {
        let body = r#"{
            "clientID": "cid",
            "username": "u",
            "password": "p",
            "topics": [
                {"name": "agent-connection", "topic": "/agent/#{claim_id}/conn"}
            ]
        }"#;
        let creds: MqttCredentials = serde_json::from_str(body).unwrap();
        assert_eq!(creds.client_id, "cid");
        assert_eq!(creds.topics.len(), 1);
        assert_eq!(creds.topics[0].name, "agent-connection");
    }

    #[test]
    fn unknown_encoding_maps_to_unknown() {
        assert_eq!(Encoding::from("msgpack"), Encoding::Unknown);
        assert_eq!(TransportType::from("QUIC"), TransportType::Unknown);
    }

    #[test]
    fn auth_join_keeps_path_prefix() {
        let base = Url::parse("https://auth.example/api/v2").unwrap();
        let url = auth_join(&base, "node/c1/challenge").unwrap();
        assert_eq!(url.as_str(), "https://auth.example/api/v2/node/c1/challenge");
    }
}
