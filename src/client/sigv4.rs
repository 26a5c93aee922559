//! AWS Signature Version 4 request signing.
//!
//! K_i: The signature covers method, path, sorted query, signed headers and
//! the SHA-256 of the body; any mismatch is rejected by the service.

use crate::models::Credentials;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// The parts of an HTTP request that go into a signature.
#[derive(Debug)]
pub struct SignableRequest<'a> {
    pub method: &'a str,
    pub url: &'a reqwest::Url,
    /// Extra headers to sign (lowercase names)
    pub headers: &'a [(String, String)],
    pub body: &'a [u8],
}

/// Signs requests for one service in one region.
pub struct Signer<'a> {
    credentials: &'a Credentials,
    region: &'a str,
    service: &'a str,
}

impl<'a> Signer<'a> {
    pub fn new(credentials: &'a Credentials, region: &'a str, service: &'a str) -> Self {
        Self {
            credentials,
            region,
            service,
        }
    }

    /// Produce the headers to attach to the request, `authorization` last.
    ///
    /// `host` is signed but not returned; the HTTP client sets it from the URL.
    pub fn sign(&self, request: &SignableRequest<'_>, now: DateTime<Utc>) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let payload_hash = sha256_hex(request.body);

        let mut added: Vec<(String, String)> = vec![("x-amz-date".to_string(), amz_date.clone())];
        if self.service == "s3" {
            added.push(("x-amz-content-sha256".to_string(), payload_hash.clone()));
        }
        if let Some(token) = &self.credentials.session_token {
            added.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let mut to_sign: Vec<(String, String)> = request
            .headers
            .iter()
            .chain(added.iter())
            .map(|(k, v)| (k.to_ascii_lowercase(), normalize_header_value(v)))
            .collect();
        to_sign.push(("host".to_string(), host_header(request.url)));
        to_sign.sort();

        let signed_headers = to_sign
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical = canonical_request(request, &to_sign, &signed_headers, &payload_hash);
        let scope = format!(
            "{date_stamp}/{}/{}/aws4_request",
            self.region, self.service
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical.as_bytes())
        );

        let key = signing_key(
            &self.credentials.secret_access_key,
            &date_stamp,
            self.region,
            self.service,
        );
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

        added.push((
            "authorization".to_string(),
            format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.credentials.access_key_id
            ),
        ));
        added
    }
}

fn canonical_request(
    request: &SignableRequest<'_>,
    headers: &[(String, String)],
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    let path = match request.url.path() {
        "" => "/",
        p => p,
    };

    let mut query: Vec<(String, String)> = request
        .url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    query.sort();
    let query = query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_headers: String = headers.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();

    format!(
        "{}\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
        request.method
    )
}

fn host_header(url: &reqwest::Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Derive the per-day, per-region, per-service signing key.
pub fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Percent-encode everything except unreserved characters (RFC 3986).
pub fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // Published AWS SigV4 walkthrough: IAM ListUsers, 2015-08-30 12:36:00 UTC.
    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";

    fn example_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap()
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
        let key = signing_key(SECRET, "20150830", "us-east-1", "iam");
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn test_sign_list_users_example() {
        let creds = Credentials::new("AKIDEXAMPLE", SECRET, None);
        let url = reqwest::Url::parse("https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08")
            .unwrap();
        let headers = vec![(
            "content-type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        )];
        let request = SignableRequest {
            method: "GET",
            url: &url,
            headers: &headers,
            body: b"",
        };

        let signed = Signer::new(&creds, "us-east-1", "iam").sign(&request, example_time());

        assert_eq!(signed[0], ("x-amz-date".to_string(), "20150830T123600Z".to_string()));
        let (name, auth) = signed.last().unwrap();
        assert_eq!(name, "authorization");
        assert_eq!(
            auth,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date, \
             Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        );
    }

    #[test]
    fn test_session_token_and_s3_payload_are_signed() {
        let creds = Credentials::new("ASIAEXAMPLE", SECRET, Some("token".to_string()));
        let url = reqwest::Url::parse("https://bucket.s3.eu-west-1.amazonaws.com/?acl").unwrap();
        let request = SignableRequest {
            method: "GET",
            url: &url,
            headers: &[],
            body: b"",
        };

        let signed = Signer::new(&creds, "eu-west-1", "s3").sign(&request, example_time());
        let names: Vec<&str> = signed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            ["x-amz-date", "x-amz-content-sha256", "x-amz-security-token", "authorization"]
        );
        assert!(signed[3].1.contains(
            "SignedHeaders=host;x-amz-content-sha256;x-amz-date;x-amz-security-token"
        ));
    }

    #[test]
    fn test_canonical_query_encoding() {
        let url = reqwest::Url::parse("https://s3.amazonaws.com/b?acl").unwrap();
        let request = SignableRequest {
            method: "GET",
            url: &url,
            headers: &[],
            body: b"",
        };
        let canonical = canonical_request(&request, &[], "", "h");
        assert_eq!(canonical, "GET\n/b\nacl=\n\n\nh");

        assert_eq!(uri_encode("a b/c~:"), "a%20b%2Fc~%3A");
    }
}
