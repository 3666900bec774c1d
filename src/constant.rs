//! Wire-level constants for the MySQL client protocol.

/// First byte of a client command packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandByte {
    Quit = 0x01,
    Query = 0x03,
    Ping = 0x0e,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtClose = 0x19,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapabilityFlags: u32 {
        const CLIENT_LONG_PASSWORD = 0x0000_0001;
        const CLIENT_FOUND_ROWS = 0x0000_0002;
        const CLIENT_LONG_FLAG = 0x0000_0004;
        /// Database (schema) name can be specified on connect
        const CLIENT_CONNECT_WITH_DB = 0x0000_0008;
        const CLIENT_NO_SCHEMA = 0x0000_0010;
        const CLIENT_COMPRESS = 0x0000_0020;
        const CLIENT_ODBC = 0x0000_0040;
        const CLIENT_LOCAL_FILES = 0x0000_0080;
        const CLIENT_IGNORE_SPACE = 0x0000_0100;
        /// New 4.1 protocol
        const CLIENT_PROTOCOL_41 = 0x0000_0200;
        const CLIENT_INTERACTIVE = 0x0000_0400;
        /// Use SSL encryption for the session
        const CLIENT_SSL = 0x0000_0800;
        const CLIENT_IGNORE_SIGPIPE = 0x0000_1000;
        /// Client knows about transactions
        const CLIENT_TRANSACTIONS = 0x0000_2000;
        const CLIENT_RESERVED = 0x0000_4000;
        /// 4.1 authentication
        const CLIENT_SECURE_CONNECTION = 0x0000_8000;
        const CLIENT_MULTI_STATEMENTS = 0x0001_0000;
        const CLIENT_MULTI_RESULTS = 0x0002_0000;
        const CLIENT_PS_MULTI_RESULTS = 0x0004_0000;
        /// Pluggable authentication
        const CLIENT_PLUGIN_AUTH = 0x0008_0000;
        const CLIENT_CONNECT_ATTRS = 0x0010_0000;
        /// Auth response may be longer than 255 bytes (length-encoded)
        const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA = 0x0020_0000;
        const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS = 0x0040_0000;
        const CLIENT_SESSION_TRACK = 0x0080_0000;
        /// OK packets replace EOF packets as result-set terminators
        const CLIENT_DEPRECATE_EOF = 0x0100_0000;
        const CLIENT_OPTIONAL_RESULTSET_METADATA = 0x0200_0000;
        const CLIENT_ZSTD_COMPRESSION_ALGORITHM = 0x0400_0000;
        const CLIENT_QUERY_ATTRIBUTES = 0x0800_0000;
        const CLIENT_MULTI_FACTOR_AUTHENTICATION = 0x1000_0000;
        const CLIENT_CAPABILITY_EXTENSION = 0x2000_0000;
        const CLIENT_SSL_VERIFY_SERVER_CERT = 0x4000_0000;
        const CLIENT_REMEMBER_OPTIONS = 0x8000_0000;
    }
}

/// Capabilities this client always negotiates.
///
/// CLIENT_CONNECT_WITH_DB and CLIENT_SSL are added per connection from the
/// options; everything else stays off.
pub const CAPABILITIES_ALWAYS_ENABLED: CapabilityFlags = CapabilityFlags::CLIENT_PROTOCOL_41
    .union(CapabilityFlags::CLIENT_SECURE_CONNECTION)
    .union(CapabilityFlags::CLIENT_TRANSACTIONS)
    .union(CapabilityFlags::CLIENT_PLUGIN_AUTH)
    .union(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
    .union(CapabilityFlags::CLIENT_DEPRECATE_EOF);

bitflags::bitflags! {
    /// MySQL server status flags
    /// Note: 0x0004 does not exist in the protocol
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServerStatusFlags: u16 {
        /// A transaction is active
        const SERVER_STATUS_IN_TRANS = 0x0001;
        /// Autocommit mode is enabled
        const SERVER_STATUS_AUTOCOMMIT = 0x0002;
        const SERVER_MORE_RESULTS_EXISTS = 0x0008;
        const SERVER_STATUS_NO_GOOD_INDEX_USED = 0x0010;
        const SERVER_STATUS_NO_INDEX_USED = 0x0020;
        const SERVER_STATUS_CURSOR_EXISTS = 0x0040;
        const SERVER_STATUS_LAST_ROW_SENT = 0x0080;
        const SERVER_STATUS_DB_DROPPED = 0x0100;
        const SERVER_STATUS_NO_BACKSLASH_ESCAPES = 0x0200;
        const SERVER_STATUS_METADATA_CHANGED = 0x0400;
        const SERVER_QUERY_WAS_SLOW = 0x0800;
        const SERVER_PS_OUT_PARAMS = 0x1000;
        const SERVER_STATUS_IN_TRANS_READONLY = 0x2000;
        const SERVER_SESSION_STATE_CHANGED = 0x4000;
    }
}

bitflags::bitflags! {
    /// MySQL column definition flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ColumnFlags: u16 {
        const NOT_NULL_FLAG = 0x0001;
        const PRI_KEY_FLAG = 0x0002;
        const UNIQUE_KEY_FLAG = 0x0004;
        const MULTIPLE_KEY_FLAG = 0x0008;
        const BLOB_FLAG = 0x0010;
        /// Field is unsigned
        const UNSIGNED_FLAG = 0x0020;
        const ZEROFILL_FLAG = 0x0040;
        const BINARY_FLAG = 0x0080;
        const ENUM_FLAG = 0x0100;
        const AUTO_INCREMENT_FLAG = 0x0200;
        const TIMESTAMP_FLAG = 0x0400;
        const SET_FLAG = 0x0800;
        const NO_DEFAULT_VALUE_FLAG = 0x1000;
        const ON_UPDATE_NOW_FLAG = 0x2000;
        const PART_KEY_FLAG = 0x4000;
        const NUM_FLAG = 0x8000;
    }
}

/// Column type byte from a column definition packet (Protocol::ColumnType).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0a,
    Time = 0x0b,
    Datetime = 0x0c,
    Year = 0x0d,
    NewDate = 0x0e,
    Varchar = 0x0f,
    Bit = 0x10,
    Timestamp2 = 0x11,
    Datetime2 = 0x12,
    Time2 = 0x13,
    Json = 0xf5,
    NewDecimal = 0xf6,
    Enum = 0xf7,
    Set = 0xf8,
    TinyBlob = 0xf9,
    MediumBlob = 0xfa,
    LongBlob = 0xfb,
    Blob = 0xfc,
    VarString = 0xfd,
    String = 0xfe,
    Geometry = 0xff,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Decimal),
            0x01 => Some(Self::Tiny),
            0x02 => Some(Self::Short),
            0x03 => Some(Self::Long),
            0x04 => Some(Self::Float),
            0x05 => Some(Self::Double),
            0x06 => Some(Self::Null),
            0x07 => Some(Self::Timestamp),
            0x08 => Some(Self::LongLong),
            0x09 => Some(Self::Int24),
            0x0a => Some(Self::Date),
            0x0b => Some(Self::Time),
            0x0c => Some(Self::Datetime),
            0x0d => Some(Self::Year),
            0x0e => Some(Self::NewDate),
            0x0f => Some(Self::Varchar),
            0x10 => Some(Self::Bit),
            0x11 => Some(Self::Timestamp2),
            0x12 => Some(Self::Datetime2),
            0x13 => Some(Self::Time2),
            0xf5 => Some(Self::Json),
            0xf6 => Some(Self::NewDecimal),
            0xf7 => Some(Self::Enum),
            0xf8 => Some(Self::Set),
            0xf9 => Some(Self::TinyBlob),
            0xfa => Some(Self::MediumBlob),
            0xfb => Some(Self::LongBlob),
            0xfc => Some(Self::Blob),
            0xfd => Some(Self::VarString),
            0xfe => Some(Self::String),
            0xff => Some(Self::Geometry),
            _ => None,
        }
    }
}

/// Known authentication plugin names.
pub const AUTH_NATIVE_PASSWORD: &[u8] = b"mysql_native_password";
pub const AUTH_CACHING_SHA2: &[u8] = b"caching_sha2_password";

/// Default charset sent in the handshake response (utf8mb4_general_ci).
pub const DEFAULT_CHARSET: u8 = 45;

/// Largest payload the client will frame or accept without splitting.
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;
