//! AWS MSK IAM authentication tokens
//!
//! MSK accepts, over SASL/OAUTHBEARER, a token that is the base64url encoding
//! of a SigV4-presigned `kafka-cluster:Connect` request URL.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::config::BaseConfig;
use crate::error::KafkaClientError;
use crate::Result;

const SERVICE: &str = "kafka-cluster";
const ACTION: &str = "kafka-cluster:Connect";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const EXPIRES_SECS: i64 = 900;
const USER_AGENT: &str = concat!("blueprint-kafka/", env!("CARGO_PKG_VERSION"));

/// Credentials used to sign connect requests
pub(crate) struct AwsCredentials {
    pub access_key: String,
    pub secret_key: Zeroizing<String>,
    /// Set for temporary (STS) credentials
    pub session_token: Option<Zeroizing<String>>,
}

impl AwsCredentials {
    /// Credentials from `base`, falling back to the standard `AWS_*`
    /// environment variables for whatever is not configured
    pub fn resolve(base: &BaseConfig) -> Result<Self> {
        Self::resolve_with(base, |name| std::env::var(name).ok())
    }

    fn resolve_with<F>(base: &BaseConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| env(name).filter(|value| !value.is_empty());

        let access_key = match base.aws_access_key.trim() {
            "" => lookup("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            key => key.to_string(),
        };
        let secret_key = if base.aws_secret.is_empty() {
            Zeroizing::new(lookup("AWS_SECRET_ACCESS_KEY").unwrap_or_default())
        } else {
            base.aws_secret.fetch()?
        };
        let session_token = if base.aws_session_token.is_empty() {
            lookup("AWS_SESSION_TOKEN").map(Zeroizing::new)
        } else {
            Some(base.aws_session_token.fetch()?).filter(|token| !token.is_empty())
        };

        if access_key.is_empty() || secret_key.is_empty() {
            return Err(KafkaClientError::Authentication(
                "no AWS credentials configured or found in the environment".to_string(),
            ));
        }
        Ok(Self {
            access_key,
            secret_key,
            session_token,
        })
    }
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key", &self.access_key)
            .field("session_token", &self.session_token.is_some())
            .finish_non_exhaustive()
    }
}

/// A signed token together with its expiry
#[derive(Debug, Clone)]
pub(crate) struct IamToken {
    pub token: String,
    pub expires_at_ms: i64,
}

/// Presign a connect request for the cluster in `region`.
pub(crate) fn sign_token(region: &str, credentials: &AwsCredentials, now: DateTime<Utc>) -> Result<IamToken> {
    let access_key = credentials.access_key.as_str();
    let secret_key = credentials.secret_key.as_str();
    let host = format!("kafka.{region}.amazonaws.com");
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let credential_scope = format!("{date_stamp}/{region}/{SERVICE}/aws4_request");

    // Already in canonical (sorted) order.
    let mut params = vec![
        ("Action", ACTION.to_string()),
        ("X-Amz-Algorithm", ALGORITHM.to_string()),
        ("X-Amz-Credential", format!("{access_key}/{credential_scope}")),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", EXPIRES_SECS.to_string()),
    ];
    if let Some(token) = &credentials.session_token {
        params.push(("X-Amz-Security-Token", token.as_str().to_string()));
    }
    params.push(("X-Amz-SignedHeaders", "host".to_string()));
    let query = params
        .iter()
        .map(|(key, value)| format!("{}={}", uri_encode(key), uri_encode(value)))
        .collect::<Vec<_>>()
        .join("&");

    let payload_hash = hex::encode(Sha256::digest(b""));
    let canonical_request = format!("GET\n/\n{query}\nhost:{host}\n\nhost\n{payload_hash}");
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{credential_scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    let url = format!(
        "https://{host}/?{query}&X-Amz-Signature={signature}&User-Agent={}",
        uri_encode(USER_AGENT)
    );

    Ok(IamToken {
        token: URL_SAFE_NO_PAD.encode(url),
        expires_at_ms: (now + ChronoDuration::seconds(EXPIRES_SECS)).timestamp_millis(),
    })
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| KafkaClientError::Authentication(format!("HMAC key error: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// SigV4 URI encoding: everything but unreserved characters is escaped.
fn uri_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    fn credentials(access_key: &str, secret_key: &str) -> AwsCredentials {
        AwsCredentials {
            access_key: access_key.to_string(),
            secret_key: Zeroizing::new(secret_key.to_string()),
            session_token: None,
        }
    }

    fn decode(token: &IamToken) -> String {
        String::from_utf8(URL_SAFE_NO_PAD.decode(&token.token).unwrap()).unwrap()
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("kafka-cluster:Connect"), "kafka-cluster%3AConnect");
        assert_eq!(uri_encode("a/b c~"), "a%2Fb%20c~");
    }

    #[test]
    fn test_token_is_presigned_connect_url() {
        let token = sign_token("us-east-1", &credentials("AKIDEXAMPLE", "secret"), fixed_now()).unwrap();
        let url = decode(&token);

        assert!(url.starts_with(
            "https://kafka.us-east-1.amazonaws.com/?Action=kafka-cluster%3AConnect&X-Amz-Algorithm=AWS4-HMAC-SHA256"
        ));
        assert!(url.contains(
            "X-Amz-Credential=AKIDEXAMPLE%2F20240301%2Fus-east-1%2Fkafka-cluster%2Faws4_request"
        ));
        assert!(url.contains("X-Amz-Date=20240301T123000Z"));
        assert!(url.contains("X-Amz-Expires=900&X-Amz-SignedHeaders=host"));
        assert!(!url.contains("X-Amz-Security-Token"));

        let signature = url
            .split('&')
            .find_map(|part| part.strip_prefix("X-Amz-Signature="))
            .unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));

        assert_eq!(token.expires_at_ms, fixed_now().timestamp_millis() + 900_000);
    }

    #[test]
    fn test_signature_depends_on_secret() {
        let a = sign_token("eu-west-1", &credentials("AKID", "one"), fixed_now()).unwrap();
        let b = sign_token("eu-west-1", &credentials("AKID", "two"), fixed_now()).unwrap();
        let again = sign_token("eu-west-1", &credentials("AKID", "one"), fixed_now()).unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(a.token, again.token);
    }

    #[test]
    fn test_session_token_is_signed() {
        let mut temporary = credentials("ASIAEXAMPLE", "secret");
        temporary.session_token = Some(Zeroizing::new("FwoG/token+value=".to_string()));

        let plain = sign_token("us-east-1", &credentials("ASIAEXAMPLE", "secret"), fixed_now()).unwrap();
        let signed = sign_token("us-east-1", &temporary, fixed_now()).unwrap();
        let url = decode(&signed);

        assert!(url.contains(
            "X-Amz-Expires=900&X-Amz-Security-Token=FwoG%2Ftoken%2Bvalue%3D&X-Amz-SignedHeaders=host"
        ));
        let signature = |url: &str| url.split('&').find_map(|p| p.strip_prefix("X-Amz-Signature=")).map(String::from);
        assert_ne!(signature(&url), signature(&decode(&plain)));
    }

    #[test]
    fn test_credentials_fall_back_to_environment() {
        let env = |name: &str| match name {
            "AWS_ACCESS_KEY_ID" => Some("ASIAENV".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("env-secret".to_string()),
            "AWS_SESSION_TOKEN" => Some("env-token".to_string()),
            _ => None,
        };

        let resolved = AwsCredentials::resolve_with(&BaseConfig::default(), env).unwrap();
        assert_eq!(resolved.access_key, "ASIAENV");
        assert_eq!(resolved.secret_key.as_str(), "env-secret");
        assert_eq!(resolved.session_token.as_deref().map(String::as_str), Some("env-token"));

        let mut base = BaseConfig::default();
        base.aws_access_key = "AKIDCONFIG".into();
        base.aws_secret = crate::credential::CredentialConfig::literal("config-secret");
        let resolved = AwsCredentials::resolve_with(&base, env).unwrap();
        assert_eq!(resolved.access_key, "AKIDCONFIG");
        assert_eq!(resolved.secret_key.as_str(), "config-secret");
        assert_eq!(resolved.session_token.as_deref().map(String::as_str), Some("env-token"));

        let missing = AwsCredentials::resolve_with(&BaseConfig::default(), |_: &str| None);
        assert!(matches!(missing, Err(KafkaClientError::Authentication(_))));
    }
}
