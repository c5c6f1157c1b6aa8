use base64::prelude::*;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::Result;
use crate::config::ConfigError;

type HmacSha256 = Hmac<Sha256>;

/// Value of the `x-ms-date` header: RFC 1123 in GMT.
#[inline]
pub fn request_date(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Master-key `authorization` header for one request.
///
/// `resource_link` is case sensitive; verb, resource type and date are
/// signed in lower case.
#[inline]
pub fn master_key_token(
    verb: &str,
    resource_type: &str,
    resource_link: &str,
    date: &str,
    master_key: &str,
) -> Result<String> {
    let key = BASE64_STANDARD
        .decode(master_key.trim())
        .map_err(|_| ConfigError::InvalidKey("COSMOS_KEY"))?;

    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );

    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| ConfigError::InvalidKey("COSMOS_KEY"))?;
    mac.update(payload.as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    let token = format!("type=master&ver=1.0&sig={signature}");
    Ok(url::form_urlencoded::byte_serialize(token.as_bytes()).collect())
}
