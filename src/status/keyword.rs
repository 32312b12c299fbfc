//! The closed status keyword vocabulary

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

macro_rules! status_keywords {
    ($($variant:ident => $name:literal,)+) => {
        /// A status keyword from gpg's `--status-fd` protocol
        ///
        /// Keywords gpg emits that are not listed here parse as
        /// [`StatusKeyword::Unexpected`]; the raw keyword text stays available on
        /// the [`StatusEvent`](super::StatusEvent).
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum StatusKeyword {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )+
        }

        impl StatusKeyword {
            /// Every keyword in the vocabulary, in table order
            pub const ALL: &'static [StatusKeyword] = &[$(StatusKeyword::$variant,)+];

            /// The keyword as it appears on the wire
            pub fn as_str(self) -> &'static str {
                match self {
                    $(StatusKeyword::$variant => $name,)+
                }
            }

            /// Look up a wire keyword, falling back to `Unexpected`
            pub fn from_name(name: &str) -> StatusKeyword {
                match name {
                    $($name => StatusKeyword::$variant,)+
                    _ => StatusKeyword::Unexpected,
                }
            }
        }
    };
}

status_keywords! {
    AlreadySigned => "ALREADY_SIGNED",
    Attribute => "ATTRIBUTE",
    BackupKeyCreated => "BACKUP_KEY_CREATED",
    BadArmor => "BADARMOR",
    BadMdc => "BADMDC",
    BadSig => "BADSIG",
    BadPassphrase => "BAD_PASSPHRASE",
    BeginDecryption => "BEGIN_DECRYPTION",
    BeginEncryption => "BEGIN_ENCRYPTION",
    BeginSigning => "BEGIN_SIGNING",
    BeginStream => "BEGIN_STREAM",
    CardCtrl => "CARDCTRL",
    DecryptionComplianceMode => "DECRYPTION_COMPLIANCE_MODE",
    DecryptionFailed => "DECRYPTION_FAILED",
    DecryptionInfo => "DECRYPTION_INFO",
    DecryptionKey => "DECRYPTION_KEY",
    DecryptionOkay => "DECRYPTION_OKAY",
    DeleteProblem => "DELETE_PROBLEM",
    EncTo => "ENC_TO",
    EndDecryption => "END_DECRYPTION",
    EndEncryption => "END_ENCRYPTION",
    EndStream => "END_STREAM",
    Error => "ERROR",
    ErrMdc => "ERRMDC",
    ErrSig => "ERRSIG",
    ExpKeySig => "EXPKEYSIG",
    Exported => "EXPORTED",
    ExportRes => "EXPORT_RES",
    ExpSig => "EXPSIG",
    Failure => "FAILURE",
    FileDone => "FILE_DONE",
    GetBool => "GET_BOOL",
    GetHidden => "GET_HIDDEN",
    GetLine => "GET_LINE",
    GoodMdc => "GOODMDC",
    GoodSig => "GOODSIG",
    GoodPassphrase => "GOOD_PASSPHRASE",
    GotIt => "GOT_IT",
    Imported => "IMPORTED",
    ImportCheck => "IMPORT_CHECK",
    ImportOk => "IMPORT_OK",
    ImportProblem => "IMPORT_PROBLEM",
    ImportRes => "IMPORT_RES",
    InquireMaxLen => "INQUIRE_MAXLEN",
    InvRecp => "INV_RECP",
    InvSgnr => "INV_SGNR",
    KeyConsidered => "KEY_CONSIDERED",
    KeyExpired => "KEYEXPIRED",
    KeyRevoked => "KEYREVOKED",
    KeyCreated => "KEY_CREATED",
    KeyNotCreated => "KEY_NOT_CREATED",
    MissingPassphrase => "MISSING_PASSPHRASE",
    NeedPassphrase => "NEED_PASSPHRASE",
    NeedPassphrasePin => "NEED_PASSPHRASE_PIN",
    NeedPassphraseSym => "NEED_PASSPHRASE_SYM",
    NewSig => "NEWSIG",
    NoData => "NODATA",
    NotationData => "NOTATION_DATA",
    NotationFlags => "NOTATION_FLAGS",
    NotationName => "NOTATION_NAME",
    NoPubkey => "NO_PUBKEY",
    NoRecp => "NO_RECP",
    NoSeckey => "NO_SECKEY",
    NoSgnr => "NO_SGNR",
    PinentryLaunched => "PINENTRY_LAUNCHED",
    PkaTrustBad => "PKA_TRUST_BAD",
    PkaTrustGood => "PKA_TRUST_GOOD",
    Plaintext => "PLAINTEXT",
    PlaintextLength => "PLAINTEXT_LENGTH",
    PolicyUrl => "POLICY_URL",
    Progress => "PROGRESS",
    RevKeySig => "REVKEYSIG",
    RsaOrIdea => "RSA_OR_IDEA",
    ScOpFailure => "SC_OP_FAILURE",
    ScOpSuccess => "SC_OP_SUCCESS",
    SessionKey => "SESSION_KEY",
    ShmGet => "SHM_GET",
    ShmGetBool => "SHM_GET_BOOL",
    ShmGetHidden => "SHM_GET_HIDDEN",
    ShmInfo => "SHM_INFO",
    SigExpired => "SIGEXPIRED",
    SigCreated => "SIG_CREATED",
    SigId => "SIG_ID",
    SigSubpacket => "SIG_SUBPACKET",
    Success => "SUCCESS",
    TofuStats => "TOFU_STATS",
    TofuUser => "TOFU_USER",
    Truncated => "TRUNCATED",
    TrustFully => "TRUST_FULLY",
    TrustMarginal => "TRUST_MARGINAL",
    TrustNever => "TRUST_NEVER",
    TrustUltimate => "TRUST_ULTIMATE",
    TrustUndefined => "TRUST_UNDEFINED",
    Unexpected => "UNEXPECTED",
    UserIdHint => "USERID_HINT",
    ValidSig => "VALIDSIG",
    VerificationComplianceMode => "VERIFICATION_COMPLIANCE_MODE",
    Warning => "WARNING",
}

impl StatusKeyword {
    /// Whether gpg blocks on the command channel after emitting this keyword
    pub fn is_prompt(self) -> bool {
        matches!(
            self,
            StatusKeyword::GetLine | StatusKeyword::GetBool | StatusKeyword::GetHidden
        )
    }

    /// Whether this keyword announces that a passphrase is about to be requested
    pub fn is_passphrase_request(self) -> bool {
        matches!(
            self,
            StatusKeyword::NeedPassphrase
                | StatusKeyword::NeedPassphraseSym
                | StatusKeyword::NeedPassphrasePin
        )
    }
}

impl fmt::Display for StatusKeyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StatusKeyword {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

// Keywords travel by wire name so that both ends of the helper protocol agree
// even if one of them knows a newer vocabulary
impl Serialize for StatusKeyword {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StatusKeyword {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}
