//! Handshake authentication for the WebSocket upgrade.
//!
//! Browsers cannot set an Authorization header on a WebSocket upgrade, so the
//! gateway authenticates from the `agora_session` cookie instead. The cookie
//! value is `base64(jwt) "." hex(hmac_sha256(session_secret, base64(jwt)))`:
//! the HMAC proves the cookie was minted by us, the JWT inside carries the
//! user id and expiry.

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use jsonwebtoken::{DecodingKey, Validation, decode};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use agora_types::api::Claims;

pub const SESSION_COOKIE: &str = "agora_session";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("session cookie missing")]
    MissingCookie,
    #[error("session cookie malformed")]
    Malformed,
    #[error("session signature invalid")]
    BadSignature,
    #[error("session token invalid or expired")]
    BadToken,
}

/// Authenticate an upgrade request from its headers. Returns the user id.
pub fn authenticate(
    headers: &HeaderMap,
    session_secret: &str,
    jwt_secret: &str,
) -> Result<Uuid, AuthError> {
    let sealed = session_cookie(headers).ok_or(AuthError::MissingCookie)?;
    let token = unseal(&sealed, session_secret)?;

    let data = decode::<Claims>(
        &token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AuthError::BadToken)?;

    Ok(data.claims.sub)
}

/// Wrap a JWT into a signed cookie value.
pub fn seal(token: &str, session_secret: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(token.as_bytes());
    let tag = sign(&encoded, session_secret);
    format!("{encoded}.{tag}")
}

/// Verify the signature and recover the JWT.
fn unseal(sealed: &str, session_secret: &str) -> Result<String, AuthError> {
    let (encoded, tag) = sealed.split_once('.').ok_or(AuthError::Malformed)?;
    let tag_bytes = hex::decode(tag).map_err(|_| AuthError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(session_secret.as_bytes())
        .map_err(|_| AuthError::BadSignature)?;
    mac.update(encoded.as_bytes());
    mac.verify_slice(&tag_bytes)
        .map_err(|_| AuthError::BadSignature)?;

    let raw = URL_SAFE_NO_PAD
        .decode(encoded.as_bytes())
        .map_err(|_| AuthError::Malformed)?;
    String::from_utf8(raw).map_err(|_| AuthError::Malformed)
}

fn sign(encoded: &str, session_secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(session_secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(encoded.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let (name, value) = pair.trim().split_once('=')?;
        if name == SESSION_COOKIE {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SESSION_SECRET: &str = "session-secret";
    const JWT_SECRET: &str = "jwt-secret";

    fn token_for(user_id: Uuid) -> String {
        let claims = Claims {
            sub: user_id,
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn headers_with_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {SESSION_COOKIE}={value}")).unwrap(),
        );
        headers
    }

    #[test]
    fn sealed_cookie_roundtrips() {
        let user_id = Uuid::new_v4();
        let sealed = seal(&token_for(user_id), SESSION_SECRET);
        let headers = headers_with_cookie(&sealed);

        let authed = authenticate(&headers, SESSION_SECRET, JWT_SECRET).unwrap();
        assert_eq!(authed, user_id);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let sealed = seal(&token_for(Uuid::new_v4()), SESSION_SECRET);
        let (encoded, tag) = sealed.split_once('.').unwrap();
        let flipped = if tag.starts_with('0') {
            format!("{encoded}.1{}", &tag[1..])
        } else {
            format!("{encoded}.0{}", &tag[1..])
        };
        let headers = headers_with_cookie(&flipped);

        assert!(matches!(
            authenticate(&headers, SESSION_SECRET, JWT_SECRET),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn wrong_session_secret_is_rejected() {
        let sealed = seal(&token_for(Uuid::new_v4()), SESSION_SECRET);
        let headers = headers_with_cookie(&sealed);

        assert!(matches!(
            authenticate(&headers, "other-secret", JWT_SECRET),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let claims = Claims {
            sub: Uuid::new_v4(),
            exp: (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp() as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .unwrap();
        let headers = headers_with_cookie(&seal(&token, SESSION_SECRET));

        assert!(matches!(
            authenticate(&headers, SESSION_SECRET, JWT_SECRET),
            Err(AuthError::BadToken)
        ));
    }

    #[test]
    fn missing_cookie_is_its_own_error() {
        let headers = HeaderMap::new();
        assert!(matches!(
            authenticate(&headers, SESSION_SECRET, JWT_SECRET),
            Err(AuthError::MissingCookie)
        ));
    }
}
