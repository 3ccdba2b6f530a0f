//! SIP Digest Authentication (RFC 2617, RFC 3261 22)
//!
//! Client side only: answers 401/407 challenges for requests the engine
//! sent, with a bounded number of attempts per realm.

use super::message::{SipError, SipRequest, SipResponse};
use metrics::counter;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Realm that matches any challenge
pub const ANY_REALM: &str = "*";

/// Credential supplied by the application.
///
/// The secret never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub realm: String,
    pub scheme: String,
    pub username: String,
    secret: String,
}

impl Credential {
    pub fn new(realm: &str, username: &str, secret: &str) -> Self {
        Self {
            realm: realm.to_string(),
            scheme: "Digest".to_string(),
            username: username.to_string(),
            secret: secret.to_string(),
        }
    }

    /// Credential usable for any realm
    pub fn any_realm(username: &str, secret: &str) -> Self {
        Self::new(ANY_REALM, username, secret)
    }

    fn matches(&self, challenge: &DigestChallenge) -> bool {
        self.scheme.eq_ignore_ascii_case("digest")
            && (self.realm == ANY_REALM || self.realm == challenge.realm)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("realm", &self.realm)
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Which header carried the challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// 401 / WWW-Authenticate, answered with Authorization
    Www,
    /// 407 / Proxy-Authenticate, answered with Proxy-Authorization
    Proxy,
}

impl ChallengeKind {
    pub fn challenge_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "WWW-Authenticate",
            ChallengeKind::Proxy => "Proxy-Authenticate",
        }
    }

    pub fn authorization_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }
}

/// Parsed digest challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub kind: ChallengeKind,
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Vec<String>,
    pub stale: bool,
}

impl DigestChallenge {
    pub fn parse(kind: ChallengeKind, value: &str) -> Result<Self, SipError> {
        let value = value.trim();
        let (scheme, rest) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
        if !scheme.eq_ignore_ascii_case("digest") {
            return Err(SipError::Authentication(format!("Unsupported scheme: {}", scheme)));
        }

        let params = parse_digest_params(rest);
        Ok(Self {
            kind,
            realm: params
                .get("realm")
                .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?
                .to_string(),
            nonce: params
                .get("nonce")
                .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?
                .to_string(),
            opaque: params.get("opaque").cloned(),
            algorithm: params.get("algorithm").cloned(),
            qop: params
                .get("qop")
                .map(|q| {
                    q.split(',')
                        .map(|v| v.trim().to_ascii_lowercase())
                        .filter(|v| !v.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            stale: params
                .get("stale")
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// Every digest challenge carried by a 401/407
    pub fn from_response(response: &SipResponse) -> Vec<Self> {
        let kind = match response.status_code() {
            401 => ChallengeKind::Www,
            407 => ChallengeKind::Proxy,
            _ => return Vec::new(),
        };
        response
            .headers
            .get_all(kind.challenge_header())
            .into_iter()
            .filter_map(|value| match Self::parse(kind, value) {
                Ok(challenge) => Some(challenge),
                Err(e) => {
                    warn!("Ignoring challenge: {}", e);
                    None
                }
            })
            .collect()
    }
}

/// Parse Digest authentication parameters.
///
/// Commas inside quoted values (such as `qop="auth,auth-int"`) are kept.
fn parse_digest_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut in_quotes = false;
    let mut current = String::new();
    let mut parts = Vec::new();

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}

/// Calculate digest response
#[allow(clippy::too_many_arguments)]
pub fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = {
        let digest = md5::compute(format!("{}:{}:{}", username, realm, password));
        format!("{:x}", digest)
    };

    // HA2 = MD5(method:uri)
    let ha2 = {
        let digest = md5::compute(format!("{}:{}", method, uri));
        format!("{:x}", digest)
    };

    // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
    if let Some(qop_value) = qop {
        let nc_value = nc.unwrap_or("00000001");
        let cnonce_value = cnonce.unwrap_or("");
        let digest = md5::compute(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc_value, cnonce_value, qop_value, ha2
        ));
        format!("{:x}", digest)
    } else {
        let digest = md5::compute(format!("{}:{}:{}", ha1, nonce, ha2));
        format!("{:x}", digest)
    }
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

/// Result of offering a challenge to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials were added; resend the request
    Retry,
    /// No credential for this realm; the application must supply one
    NoCredentials { realm: String },
    /// The realm rejected us too many times
    Exhausted { realm: String },
    /// The response carried no usable challenge
    Unusable,
}

/// Per-handle credential cache and retry budget
#[derive(Debug, Clone)]
pub struct AuthManager {
    credentials: Vec<Credential>,
    attempts: HashMap<String, u32>,
    nonce_counts: HashMap<String, u32>,
    max_retries: u32,
}

impl AuthManager {
    pub fn new(max_retries: u32) -> Self {
        Self {
            credentials: Vec::new(),
            attempts: HashMap::new(),
            nonce_counts: HashMap::new(),
            max_retries,
        }
    }

    /// Add or replace the credential for a realm. Resets that realm's budget.
    pub fn add_credential(&mut self, credential: Credential) {
        info!(
            "Credential for realm {} user {} added",
            credential.realm, credential.username
        );
        self.attempts.remove(&credential.realm);
        if credential.realm == ANY_REALM {
            self.attempts.clear();
        }
        self.credentials.retain(|c| c.realm != credential.realm);
        self.credentials.push(credential);
    }

    pub fn has_credentials(&self) -> bool {
        !self.credentials.is_empty()
    }

    /// Forget retry counts after a request got through
    pub fn reset(&mut self) {
        self.attempts.clear();
    }

    /// Answer every challenge of `response` on `request`.
    ///
    /// Existing Authorization/Proxy-Authorization lines for the challenged
    /// realms are replaced. The caller still has to give the request a new
    /// branch and CSeq before resending it.
    pub fn authorize(&mut self, request: &mut SipRequest, response: &SipResponse) -> AuthOutcome {
        let challenges = DigestChallenge::from_response(response);
        if challenges.is_empty() {
            return AuthOutcome::Unusable;
        }

        let mut answers = Vec::new();
        for challenge in &challenges {
            let Some(credential) = self.credentials.iter().find(|c| c.matches(challenge)).cloned() else {
                debug!("No credential for realm {}", challenge.realm);
                return AuthOutcome::NoCredentials {
                    realm: challenge.realm.clone(),
                };
            };

            if !challenge.stale {
                let attempts = self.attempts.entry(challenge.realm.clone()).or_insert(0);
                if *attempts >= self.max_retries {
                    warn!("Authentication retries exhausted for realm {}", challenge.realm);
                    return AuthOutcome::Exhausted {
                        realm: challenge.realm.clone(),
                    };
                }
                *attempts += 1;
            }

            answers.push((challenge.kind, challenge.realm.clone(), self.answer(challenge, &credential, request)));
        }

        for (kind, realm, value) in answers {
            let header = kind.authorization_header();
            let kept: Vec<String> = request
                .headers
                .get_all(header)
                .into_iter()
                .filter(|v| parse_digest_params(v).get("realm") != Some(&realm))
                .map(str::to_string)
                .collect();
            request.headers.remove(header);
            for value in kept {
                request.headers.push(header, value);
            }
            request.headers.push(header, value);
        }

        counter!("sip_auth_retries_total").increment(1);
        AuthOutcome::Retry
    }

    fn answer(&mut self, challenge: &DigestChallenge, credential: &Credential, request: &SipRequest) -> String {
        let method = request.method.as_str();
        let uri = request.uri.as_str();
        let username = &credential.username;

        let use_qop = challenge.qop.iter().any(|q| q == "auth");
        let mut value = if use_qop {
            let count = self.nonce_counts.entry(challenge.nonce.clone()).or_insert(0);
            *count += 1;
            let nc = format!("{:08x}", *count);
            let cnonce = generate_cnonce();
            let response = calculate_response(
                username,
                &credential.secret,
                &challenge.realm,
                &challenge.nonce,
                method,
                uri,
                Some("auth"),
                Some(&nc),
                Some(&cnonce),
            );
            format!(
                r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5, qop=auth, nc={}, cnonce="{}""#,
                username, challenge.realm, challenge.nonce, uri, response, nc, cnonce
            )
        } else {
            let response = calculate_response(
                username,
                &credential.secret,
                &challenge.realm,
                &challenge.nonce,
                method,
                uri,
                None,
                None,
                None,
            );
            format!(
                r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
                username, challenge.realm, challenge.nonce, uri, response
            )
        };
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }

        debug!("Answering {:?} challenge for realm {} as {}", challenge.kind, challenge.realm, username);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMethod;

    fn challenge_response(status: u16, header: &str, value: &str) -> SipResponse {
        let mut response = SipResponse::new(status);
        response.headers.push(header, value);
        response
    }

    fn register() -> SipRequest {
        SipRequest::new(SipMethod::Register, "sip:example.com")
    }

    #[test]
    fn test_parse_digest_params() {
        let auth_value = r#"username="alice", realm="test.com", nonce="abc123", qop="auth,auth-int", uri="sip:bob@test.com""#;
        let params = parse_digest_params(auth_value);

        assert_eq!(params.get("username").unwrap(), "alice");
        assert_eq!(params.get("realm").unwrap(), "test.com");
        assert_eq!(params.get("nonce").unwrap(), "abc123");
        assert_eq!(params.get("qop").unwrap(), "auth,auth-int");
    }

    #[test]
    fn test_calculate_response_rfc2617_vector() {
        let response = calculate_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some("auth"),
            Some("00000001"),
            Some("0a4f113b"),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_credential_debug_redacts_secret() {
        let credential = Credential::new("example.com", "alice", "hunter2");
        let text = format!("{:?}", credential);
        assert!(text.contains("alice"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_challenge_parse() {
        let challenge = DigestChallenge::parse(
            ChallengeKind::Proxy,
            r#"Digest realm="example.com", nonce="n1", opaque="o1", qop="auth", stale=TRUE"#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "example.com");
        assert_eq!(challenge.qop, vec!["auth".to_string()]);
        assert!(challenge.stale);
        assert!(DigestChallenge::parse(ChallengeKind::Www, "Basic realm=\"x\"").is_err());
    }

    #[test]
    fn test_authorize_adds_header_and_enforces_budget() {
        let mut manager = AuthManager::new(1);
        manager.add_credential(Credential::new("example.com", "alice", "secret"));

        let response = challenge_response(401, "WWW-Authenticate", r#"Digest realm="example.com", nonce="n1""#);
        let mut request = register();
        assert_eq!(manager.authorize(&mut request, &response), AuthOutcome::Retry);
        let value = request.headers.get("Authorization").unwrap();
        assert!(value.contains(r#"username="alice""#));
        assert!(!value.contains("secret"));

        // Same realm again: budget of one is spent
        assert_eq!(
            manager.authorize(&mut request, &response),
            AuthOutcome::Exhausted {
                realm: "example.com".to_string()
            }
        );
        assert_eq!(request.headers.get_all("Authorization").len(), 1);
    }

    #[test]
    fn test_stale_challenge_does_not_consume_budget() {
        let mut manager = AuthManager::new(1);
        manager.add_credential(Credential::any_realm("alice", "secret"));
        let first = challenge_response(407, "Proxy-Authenticate", r#"Digest realm="proxy", nonce="n1", qop="auth""#);
        let stale = challenge_response(407, "Proxy-Authenticate", r#"Digest realm="proxy", nonce="n2", qop="auth", stale=true"#);

        let mut request = register();
        assert_eq!(manager.authorize(&mut request, &first), AuthOutcome::Retry);
        assert_eq!(manager.authorize(&mut request, &stale), AuthOutcome::Retry);
        let values = request.headers.get_all("Proxy-Authorization");
        assert_eq!(values.len(), 1);
        assert!(values[0].contains(r#"nonce="n2""#));
        assert!(values[0].contains("nc=00000001"));
    }

    #[test]
    fn test_missing_credentials() {
        let mut manager = AuthManager::new(1);
        manager.add_credential(Credential::new("other.com", "alice", "secret"));
        let response = challenge_response(401, "WWW-Authenticate", r#"Digest realm="example.com", nonce="n1""#);
        assert_eq!(
            manager.authorize(&mut register(), &response),
            AuthOutcome::NoCredentials {
                realm: "example.com".to_string()
            }
        );
        assert_eq!(
            manager.authorize(&mut register(), &SipResponse::new(401)),
            AuthOutcome::Unusable
        );
    }
}
