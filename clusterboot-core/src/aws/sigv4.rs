//! AWS Signature Version 4 request signing
//!
//! Signs the exact bytes that will be sent. Only what the bootstrap needs
//! is covered: requests to `/` with an empty query string.

use chrono::{DateTime, Utc};
use ring::{digest, hmac};

use super::credentials::Credentials;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Hex-encoded SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data)
}

/// Derive the per-day, per-region, per-service signing key
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(k_date.as_ref(), region.as_bytes());
    let k_service = hmac_sha256(k_region.as_ref(), service.as_bytes());
    let k_signing = hmac_sha256(k_service.as_ref(), b"aws4_request");
    k_signing.as_ref().to_vec()
}

/// Inputs that identify who signs and for which endpoint
#[derive(Debug, Clone, Copy)]
pub struct SigningParams<'a> {
    pub credentials: &'a Credentials,
    pub region: &'a str,
    pub service: &'a str,
    pub time: DateTime<Utc>,
}

impl SigningParams<'_> {
    /// `x-amz-date` value
    pub fn amz_date(&self) -> String {
        self.time.format("%Y%m%dT%H%M%SZ").to_string()
    }

    fn date_stamp(&self) -> String {
        self.time.format("%Y%m%d").to_string()
    }

    fn scope(&self) -> String {
        format!("{}/{}/{}/aws4_request", self.date_stamp(), self.region, self.service)
    }
}

/// Build the canonical request for `headers` (names in any case, values
/// already final). Returns the request and the signed-headers list.
pub fn canonical_request(
    method: &str,
    path: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> (String, String) {
    let mut normalized: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| (name.to_lowercase(), value.trim().to_string()))
        .collect();
    normalized.sort();

    let canonical_headers: String = normalized
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();
    let signed_headers = normalized
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method,
        path,
        canonical_headers,
        signed_headers,
        sha256_hex(body)
    );
    (request, signed_headers)
}

/// Compute the `Authorization` header for a request whose signed headers
/// (including `host` and `x-amz-date`) are `headers`
pub fn authorization(
    params: &SigningParams<'_>,
    method: &str,
    path: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> String {
    let (request, signed_headers) = canonical_request(method, path, headers, body);

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        params.amz_date(),
        params.scope(),
        sha256_hex(request.as_bytes())
    );

    let key = signing_key(
        &params.credentials.secret_access_key,
        &params.date_stamp(),
        params.region,
        params.service,
    );
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM,
        params.credentials.access_key_id,
        params.scope(),
        signed_headers,
        signature
    )
}

/// Headers to attach to a signed POST: the caller's headers plus
/// `x-amz-date`, the session token if any, and `authorization`
pub fn sign_post(
    params: &SigningParams<'_>,
    host: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Vec<(String, String)> {
    let mut signed: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    signed.push(("host".into(), host.into()));
    signed.push(("x-amz-date".into(), params.amz_date()));
    if let Some(token) = &params.credentials.session_token {
        signed.push(("x-amz-security-token".into(), token.clone()));
    }

    let auth = authorization(params, "POST", "/", &signed, body);

    // reqwest derives Host from the URL
    signed.retain(|(name, _)| name != "host");
    signed.push(("authorization".into(), auth));
    signed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn example_credentials() -> Credentials {
        Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY", None)
    }

    #[test]
    fn test_empty_payload_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_signing_key_derivation() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_vanilla_requests() {
        let credentials = example_credentials();
        let params = SigningParams {
            credentials: &credentials,
            region: "us-east-1",
            service: "service",
            time: Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap(),
        };
        let headers = vec![
            ("Host".to_string(), "example.amazonaws.com".to_string()),
            ("X-Amz-Date".to_string(), params.amz_date()),
        ];

        let get = authorization(&params, "GET", "/", &headers, b"");
        assert_eq!(
            get,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
             SignedHeaders=host;x-amz-date, \
             Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );

        let post = authorization(&params, "POST", "/", &headers, b"");
        assert_eq!(
            post,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
             SignedHeaders=host;x-amz-date, \
             Signature=5da7c1a2acd57cee7505fc6676e4e544621c30862966e37dddb68e92efbe5d6b"
        );
    }

    #[test]
    fn test_sign_post_headers() {
        let credentials = Credentials::new("AKID", "secret", Some("session".into()));
        let params = SigningParams {
            credentials: &credentials,
            region: "eu-west-1",
            service: "sqs",
            time: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        };
        let headers = sign_post(
            &params,
            "sqs.eu-west-1.amazonaws.com",
            &[("content-type", "application/x-amz-json-1.0")],
            br#"{"QueueName":"q"}"#,
        );

        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("x-amz-date").as_deref(), Some("20240102T030405Z"));
        assert_eq!(get("x-amz-security-token").as_deref(), Some("session"));
        assert!(get("host").is_none());

        let auth = get("authorization").unwrap();
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKID/20240102/eu-west-1/sqs/aws4_request, "
        ));
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-date;x-amz-security-token,"));
    }
}
