//! CTAP2 status codes
//!
//! The first byte of every CTAP2 response.
//!
//! <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#error-responses>

use std::fmt;

/// CTAP2 status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    InvalidCommand,
    InvalidParameter,
    InvalidLength,
    InvalidSeq,
    Timeout,
    ChannelBusy,
    LockRequired,
    InvalidChannel,
    CborUnexpectedType,
    InvalidCbor,
    MissingParameter,
    LimitExceeded,
    UnsupportedExtension,
    FpDatabaseFull,
    LargeBlobStorageFull,
    CredentialExcluded,
    Processing,
    InvalidCredential,
    /// Authenticator is waiting on the user
    UserActionPending,
    OperationPending,
    NoOperations,
    UnsupportedAlgorithm,
    OperationDenied,
    KeyStoreFull,
    NotBusy,
    NoOperationPending,
    UnsupportedOption,
    InvalidOption,
    /// Request was aborted by CTAPHID_CANCEL
    KeepaliveCancel,
    /// No credential in the allow list (or no resident credential) matched
    NoCredentials,
    UserActionTimeout,
    NotAllowed,
    PinInvalid,
    PinBlocked,
    PinAuthInvalid,
    PinAuthBlocked,
    PinNotSet,
    PinRequired,
    PinPolicyViolation,
    PinTokenExpired,
    RequestTooLarge,
    /// User did not act before the authenticator's own deadline
    ActionTimeout,
    UpRequired,
    UvBlocked,
    IntegrityFailure,
    InvalidSubcommand,
    UvInvalid,
    UnauthorizedPermission,
    Other(u8),
}

impl StatusCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::InvalidCommand,
            0x02 => Self::InvalidParameter,
            0x03 => Self::InvalidLength,
            0x04 => Self::InvalidSeq,
            0x05 => Self::Timeout,
            0x06 => Self::ChannelBusy,
            0x0A => Self::LockRequired,
            0x0B => Self::InvalidChannel,
            0x11 => Self::CborUnexpectedType,
            0x12 => Self::InvalidCbor,
            0x14 => Self::MissingParameter,
            0x15 => Self::LimitExceeded,
            0x16 => Self::UnsupportedExtension,
            0x17 => Self::FpDatabaseFull,
            0x18 => Self::LargeBlobStorageFull,
            0x19 => Self::CredentialExcluded,
            0x21 => Self::Processing,
            0x22 => Self::InvalidCredential,
            0x23 => Self::UserActionPending,
            0x24 => Self::OperationPending,
            0x25 => Self::NoOperations,
            0x26 => Self::UnsupportedAlgorithm,
            0x27 => Self::OperationDenied,
            0x28 => Self::KeyStoreFull,
            0x29 => Self::NotBusy,
            0x2A => Self::NoOperationPending,
            0x2B => Self::UnsupportedOption,
            0x2C => Self::InvalidOption,
            0x2D => Self::KeepaliveCancel,
            0x2E => Self::NoCredentials,
            0x2F => Self::UserActionTimeout,
            0x30 => Self::NotAllowed,
            0x31 => Self::PinInvalid,
            0x32 => Self::PinBlocked,
            0x33 => Self::PinAuthInvalid,
            0x34 => Self::PinAuthBlocked,
            0x35 => Self::PinNotSet,
            0x36 => Self::PinRequired,
            0x37 => Self::PinPolicyViolation,
            0x38 => Self::PinTokenExpired,
            0x39 => Self::RequestTooLarge,
            0x3A => Self::ActionTimeout,
            0x3B => Self::UpRequired,
            0x3C => Self::UvBlocked,
            0x3D => Self::IntegrityFailure,
            0x3E => Self::InvalidSubcommand,
            0x3F => Self::UvInvalid,
            0x40 => Self::UnauthorizedPermission,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::InvalidCommand => 0x01,
            Self::InvalidParameter => 0x02,
            Self::InvalidLength => 0x03,
            Self::InvalidSeq => 0x04,
            Self::Timeout => 0x05,
            Self::ChannelBusy => 0x06,
            Self::LockRequired => 0x0A,
            Self::InvalidChannel => 0x0B,
            Self::CborUnexpectedType => 0x11,
            Self::InvalidCbor => 0x12,
            Self::MissingParameter => 0x14,
            Self::LimitExceeded => 0x15,
            Self::UnsupportedExtension => 0x16,
            Self::FpDatabaseFull => 0x17,
            Self::LargeBlobStorageFull => 0x18,
            Self::CredentialExcluded => 0x19,
            Self::Processing => 0x21,
            Self::InvalidCredential => 0x22,
            Self::UserActionPending => 0x23,
            Self::OperationPending => 0x24,
            Self::NoOperations => 0x25,
            Self::UnsupportedAlgorithm => 0x26,
            Self::OperationDenied => 0x27,
            Self::KeyStoreFull => 0x28,
            Self::NotBusy => 0x29,
            Self::NoOperationPending => 0x2A,
            Self::UnsupportedOption => 0x2B,
            Self::InvalidOption => 0x2C,
            Self::KeepaliveCancel => 0x2D,
            Self::NoCredentials => 0x2E,
            Self::UserActionTimeout => 0x2F,
            Self::NotAllowed => 0x30,
            Self::PinInvalid => 0x31,
            Self::PinBlocked => 0x32,
            Self::PinAuthInvalid => 0x33,
            Self::PinAuthBlocked => 0x34,
            Self::PinNotSet => 0x35,
            Self::PinRequired => 0x36,
            Self::PinPolicyViolation => 0x37,
            Self::PinTokenExpired => 0x38,
            Self::RequestTooLarge => 0x39,
            Self::ActionTimeout => 0x3A,
            Self::UpRequired => 0x3B,
            Self::UvBlocked => 0x3C,
            Self::IntegrityFailure => 0x3D,
            Self::InvalidSubcommand => 0x3E,
            Self::UvInvalid => 0x3F,
            Self::UnauthorizedPermission => 0x40,
            Self::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Statuses a caller would answer by asking the user for a (different) PIN
    pub fn is_pin_error(self) -> bool {
        matches!(
            self,
            Self::PinInvalid
                | Self::PinBlocked
                | Self::PinAuthInvalid
                | Self::PinAuthBlocked
                | Self::PinNotSet
                | Self::PinRequired
                | Self::PinPolicyViolation
                | Self::PinTokenExpired
        )
    }
}

impl From<u8> for StatusCode {
    fn from(value: u8) -> Self {
        Self::from_u8(value)
    }
}

impl From<StatusCode> for u8 {
    fn from(status: StatusCode) -> u8 {
        status.to_u8()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Success => "success",
            Self::InvalidCommand => "invalid command",
            Self::InvalidParameter => "invalid parameter",
            Self::InvalidLength => "invalid length",
            Self::InvalidSeq => "invalid sequence",
            Self::Timeout => "timeout",
            Self::ChannelBusy => "channel busy",
            Self::LockRequired => "lock required",
            Self::InvalidChannel => "invalid channel",
            Self::CborUnexpectedType => "cbor unexpected type",
            Self::InvalidCbor => "invalid cbor",
            Self::MissingParameter => "missing parameter",
            Self::LimitExceeded => "limit exceeded",
            Self::UnsupportedExtension => "unsupported extension",
            Self::FpDatabaseFull => "fingerprint database full",
            Self::LargeBlobStorageFull => "large blob storage full",
            Self::CredentialExcluded => "credential excluded",
            Self::Processing => "processing",
            Self::InvalidCredential => "invalid credential",
            Self::UserActionPending => "user action pending",
            Self::OperationPending => "operation pending",
            Self::NoOperations => "no operations",
            Self::UnsupportedAlgorithm => "unsupported algorithm",
            Self::OperationDenied => "operation denied",
            Self::KeyStoreFull => "key store full",
            Self::NotBusy => "not busy",
            Self::NoOperationPending => "no operation pending",
            Self::UnsupportedOption => "unsupported option",
            Self::InvalidOption => "invalid option",
            Self::KeepaliveCancel => "keep alive cancel",
            Self::NoCredentials => "no credentials",
            Self::UserActionTimeout => "user action timeout",
            Self::NotAllowed => "not allowed",
            Self::PinInvalid => "pin invalid",
            Self::PinBlocked => "pin blocked",
            Self::PinAuthInvalid => "pin auth invalid",
            Self::PinAuthBlocked => "pin auth blocked",
            Self::PinNotSet => "pin not set",
            Self::PinRequired => "pin required",
            Self::PinPolicyViolation => "pin policy violation",
            Self::PinTokenExpired => "pin token expired",
            Self::RequestTooLarge => "request too large",
            Self::ActionTimeout => "action timeout",
            Self::UpRequired => "up required",
            Self::UvBlocked => "uv blocked",
            Self::IntegrityFailure => "integrity failure",
            Self::InvalidSubcommand => "invalid subcommand",
            Self::UvInvalid => "uv invalid",
            Self::UnauthorizedPermission => "unauthorized permission",
            Self::Other(code) => return write!(f, "ctap error 0x{code:02x}"),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for StatusCode {}
