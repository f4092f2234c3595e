//! Device token validation.
//!
//! A device presents a token when it opens its link; the validator turns
//! it into the [`DeviceId`] the session is registered under.

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;

/// Maps a device token to the identifier it is allowed to claim.
///
/// Implemented for closures, so a validator can be a plain function:
///
/// ```ignore
/// let server = Server::bind(config).await?
///     .with_validator(|token: &str| lookup_device(token));
/// ```
pub trait TokenValidator: Send + Sync + 'static {
    /// Validates `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] if the token is refused.
    fn validate(&self, token: &str) -> Result<DeviceId>;
}

impl<F> TokenValidator for F
where
    F: Fn(&str) -> Result<DeviceId> + Send + Sync + 'static,
{
    fn validate(&self, token: &str) -> Result<DeviceId> {
        self(token)
    }
}

/// Accepts any non-empty token and uses it verbatim as the identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTokenValidator;

impl TokenValidator for PlainTokenValidator {
    fn validate(&self, token: &str) -> Result<DeviceId> {
        if token.is_empty() {
            return Err(Error::unauthorized("empty device token"));
        }
        Ok(DeviceId::new(token))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_validator() {
        let id = PlainTokenValidator.validate("device-1").unwrap();
        assert_eq!(id.as_str(), "device-1");

        let err = PlainTokenValidator.validate("").unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
    }

    #[test]
    fn test_closure_validator() {
        let validator = |token: &str| match token.strip_prefix("ok:") {
            Some(id) => Ok(DeviceId::new(id)),
            None => Err(Error::unauthorized("bad token")),
        };

        assert_eq!(validator.validate("ok:abc").unwrap().as_str(), "abc");
        assert!(validator.validate("abc").is_err());

        let boxed: Box<dyn TokenValidator> = Box::new(validator);
        assert!(boxed.validate("ok:x").is_ok());
    }
}
