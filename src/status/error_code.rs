//! Error codes derived from status events

use super::keyword::StatusKeyword;
use super::parser::StatusEvent;
use std::fmt;

/// A failure reason reported by gpg on the status channel
///
/// Numeric codes follow libgpg-error; only the code part of an
/// `ERROR`/`FAILURE` value (the low 16 bits) is significant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// GPG_ERR_GENERAL
    General,
    /// GPG_ERR_BAD_SIGNATURE, or a `BADSIG` event
    BadSignature,
    /// GPG_ERR_NO_PUBKEY, or a `NO_PUBKEY` event
    NoPublicKey,
    /// GPG_ERR_CHECKSUM
    ChecksumError,
    /// GPG_ERR_BAD_PASSPHRASE, or a `BAD_PASSPHRASE` event
    BadPassphrase,
    /// GPG_ERR_NO_SECKEY, or a `NO_SECKEY` event
    NoSecretKey,
    /// GPG_ERR_WRONG_SECKEY
    WrongSecretKey,
    /// GPG_ERR_BAD_KEY (session key)
    BadSessionKey,
    /// GPG_ERR_INV_PASSPHRASE
    InvalidPassphrase,
    /// GPG_ERR_UNUSABLE_PUBKEY, or an `INV_RECP` event
    InvalidRecipient,
    /// GPG_ERR_UNUSABLE_SECKEY, or an `INV_SGNR` event
    InvalidSigner,
    /// GPG_ERR_NO_DATA, or a `NODATA` event
    NoData,
    /// GPG_ERR_TIMEOUT
    Timeout,
    /// GPG_ERR_NO_AGENT
    NoAgent,
    /// GPG_ERR_NO_PIN_ENTRY
    NoPinentry,
    /// GPG_ERR_CANCELED
    Cancelled,
    /// GPG_ERR_DECRYPT_FAILED, or a `DECRYPTION_FAILED` event
    DecryptionFailed,
    /// GPG_ERR_KEY_EXPIRED
    KeyExpired,
    /// GPG_ERR_SIG_EXPIRED
    SignatureExpired,
    /// A `MISSING_PASSPHRASE` event
    MissingPassphrase,
    /// A `KEY_NOT_CREATED` event
    KeyNotCreated,
    /// Any other libgpg-error code
    Other(u32),
}

impl ErrorCode {
    /// Map a libgpg-error value (source bits included) to an error code
    pub fn from_gpg_error(value: u32) -> Self {
        match value & 0xFFFF {
            1 => ErrorCode::General,
            8 => ErrorCode::BadSignature,
            9 => ErrorCode::NoPublicKey,
            10 => ErrorCode::ChecksumError,
            11 => ErrorCode::BadPassphrase,
            17 => ErrorCode::NoSecretKey,
            18 => ErrorCode::WrongSecretKey,
            19 => ErrorCode::BadSessionKey,
            31 => ErrorCode::InvalidPassphrase,
            53 => ErrorCode::InvalidRecipient,
            54 => ErrorCode::InvalidSigner,
            58 => ErrorCode::NoData,
            62 => ErrorCode::Timeout,
            77 => ErrorCode::NoAgent,
            85 => ErrorCode::NoPinentry,
            99 => ErrorCode::Cancelled,
            152 => ErrorCode::DecryptionFailed,
            153 => ErrorCode::KeyExpired,
            154 => ErrorCode::SignatureExpired,
            code => ErrorCode::Other(code),
        }
    }

    /// The error code an event reports, if any
    pub fn from_event(event: &StatusEvent) -> Option<Self> {
        match event.keyword {
            StatusKeyword::BadPassphrase => Some(ErrorCode::BadPassphrase),
            StatusKeyword::MissingPassphrase => Some(ErrorCode::MissingPassphrase),
            StatusKeyword::DecryptionFailed => Some(ErrorCode::DecryptionFailed),
            StatusKeyword::NoData => Some(ErrorCode::NoData),
            StatusKeyword::NoSeckey => Some(ErrorCode::NoSecretKey),
            StatusKeyword::NoPubkey => Some(ErrorCode::NoPublicKey),
            StatusKeyword::BadSig => Some(ErrorCode::BadSignature),
            StatusKeyword::InvRecp => Some(ErrorCode::InvalidRecipient),
            StatusKeyword::InvSgnr => Some(ErrorCode::InvalidSigner),
            StatusKeyword::KeyNotCreated => Some(ErrorCode::KeyNotCreated),
            // ERROR <location> <code> [<more>], FAILURE <location> <code>
            StatusKeyword::Error | StatusKeyword::Failure => event
                .arg(1)
                .and_then(|code| code.parse::<u32>().ok())
                .filter(|code| code & 0xFFFF != 0)
                .map(ErrorCode::from_gpg_error),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Other(code) => write!(f, "gpg error {code}"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_keywords() {
        let event = StatusEvent::new("BAD_PASSPHRASE", "0123456789ABCDEF");
        assert_eq!(ErrorCode::from_event(&event), Some(ErrorCode::BadPassphrase));

        let event = StatusEvent::new("NODATA", "1");
        assert_eq!(ErrorCode::from_event(&event), Some(ErrorCode::NoData));

        let event = StatusEvent::new("GOODSIG", "0123456789ABCDEF Alice");
        assert_eq!(ErrorCode::from_event(&event), None);
    }

    #[test]
    fn error_events_strip_the_source_bits() {
        // GPG_ERR_SOURCE_GPGAGENT (4) << 24 | GPG_ERR_CANCELED
        let value = (4u32 << 24) | 99;
        let event = StatusEvent::new("ERROR", format!("pkdecrypt_failed {value}"));
        assert_eq!(ErrorCode::from_event(&event), Some(ErrorCode::Cancelled));

        let event = StatusEvent::new("FAILURE", "sign 67108875");
        assert_eq!(ErrorCode::from_event(&event), Some(ErrorCode::BadPassphrase));
    }

    #[test]
    fn error_events_without_a_code_are_ignored() {
        assert_eq!(
            ErrorCode::from_event(&StatusEvent::new("ERROR", "keylist")),
            None
        );
        assert_eq!(
            ErrorCode::from_event(&StatusEvent::new("FAILURE", "gpg-exit 0")),
            None
        );
        assert_eq!(
            ErrorCode::from_event(&StatusEvent::new("ERROR", "x notanumber")),
            None
        );
    }

    #[test]
    fn unknown_numbers_are_preserved() {
        assert_eq!(ErrorCode::from_gpg_error(245), ErrorCode::Other(245));
        assert_eq!(ErrorCode::Other(245).to_string(), "gpg error 245");
        assert_eq!(ErrorCode::NoData.to_string(), "NoData");
    }
}
