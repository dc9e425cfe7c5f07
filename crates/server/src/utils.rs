use crate::error::SsoError;
use base64::Engine;
use std::future::Future;
use tokio::time::{Duration, timeout};

/// Run an external call under a deadline.
///
/// An elapsed deadline is reported as `Unavailable`; the caller must treat the
/// protocol step as not completed.
pub async fn within<T, E, F>(limit: Duration, what: &str, fut: F) -> Result<T, SsoError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SsoError>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            tracing::warn!(call = what, timeout_ms = limit.as_millis() as u64, "external call timed out");
            Err(SsoError::Unavailable(what.to_string()))
        }
    }
}

fn random_bytes<const N: usize>() -> Result<[u8; N], SsoError> {
    let mut bytes = [0u8; N];
    getrandom::fill(&mut bytes)
        .map_err(|e| SsoError::Internal(format!("random source failed: {e}")))?;
    Ok(bytes)
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> Result<String, SsoError> {
    let bytes = random_bytes::<32>()?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Uniformly distributed decimal code with exactly `digits` digits (leading zeros kept).
pub fn generate_numeric_code(digits: u32) -> Result<String, SsoError> {
    let modulus = 10u32.pow(digits);
    // Rejection sampling keeps the distribution uniform.
    let zone = u32::MAX - (u32::MAX % modulus);
    loop {
        let value = u32::from_be_bytes(random_bytes::<4>()?);
        if value < zone {
            return Ok(format!("{:0width$}", value % modulus, width = digits as usize));
        }
    }
}

/// Basic sanity check for phone numbers: optional leading `+`, then 9 to 15 digits.
pub fn is_valid_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    (9..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

pub fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}
