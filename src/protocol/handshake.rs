use crate::constant::{CapabilityFlags, DEFAULT_CHARSET};
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::protocol::response::server_error;

/// Initial handshake packet from the server (Protocol::HandshakeV10).
///
/// Wire layout:
/// ```text
/// 1   [0a] protocol version
/// n   server version (null-terminated)
/// 4   connection id
/// 8   auth-plugin-data part 1
/// 1   [00] filler
/// 2   capability flags (lower)
/// 1   character set
/// 2   status flags
/// 2   capability flags (upper)
/// 1   auth-plugin-data length
/// 10  reserved
/// n   auth-plugin-data part 2 (max(13, len - 8) bytes, trailing NUL)
/// n   auth plugin name (null-terminated)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Both scramble segments concatenated, trailing NUL stripped.
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: CapabilityFlags,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        // A server that refuses the connection outright answers with an ERR
        // packet in place of the handshake.
        if payload.first() == Some(&0xFF) {
            return Err(server_error(payload));
        }

        let (protocol_version, data) = read_u8(payload)?;
        let (server_version, data) = read_nul_bytes(data)?;
        let server_version = lossy_str(server_version);
        let (connection_id, data) = read_u32(data)?;
        let (scramble_head, data) = read_bytes(data, 8)?;
        let (_filler, data) = read_u8(data)?;
        let (caps_low, data) = read_u16(data)?;
        let (charset, data) = read_u8(data)?;
        let (status_flags, data) = read_u16(data)?;
        let (caps_high, data) = read_u16(data)?;
        let (auth_data_len, data) = read_u8(data)?;
        let (_reserved, data) = read_bytes(data, 10)?;

        let capability_flags =
            CapabilityFlags::from_bits_truncate(((caps_high as u32) << 16) | caps_low as u32);

        let tail_len = 13usize.max((auth_data_len as usize).saturating_sub(8));
        let (scramble_tail, data) = read_bytes(data, tail_len)?;
        let scramble_tail = match scramble_tail.last() {
            Some(0) => &scramble_tail[..scramble_tail.len() - 1],
            _ => scramble_tail,
        };

        let (auth_plugin_name, _rest) = read_nul_bytes(data)?;

        let mut auth_plugin_data = Vec::with_capacity(8 + scramble_tail.len());
        auth_plugin_data.extend_from_slice(scramble_head);
        auth_plugin_data.extend_from_slice(scramble_tail);

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data,
            capability_flags,
            charset,
            status_flags,
            auth_plugin_name: lossy_str(auth_plugin_name),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        write_u8(out, self.protocol_version);
        write_nul_bytes(out, self.server_version.as_bytes());
        write_u32(out, self.connection_id);
        out.extend_from_slice(&self.auth_plugin_data[..8]);
        write_u8(out, 0);
        let bits = self.capability_flags.bits();
        write_u16(out, bits as u16);
        write_u8(out, self.charset);
        write_u16(out, self.status_flags);
        write_u16(out, (bits >> 16) as u16);
        write_u8(out, (self.auth_plugin_data.len() + 1) as u8);
        out.extend_from_slice(&[0u8; 10]);
        // tail plus its trailing NUL, padded to the 13-byte minimum
        let tail = &self.auth_plugin_data[8..];
        out.extend_from_slice(tail);
        out.push(0);
        for _ in tail.len() + 1..13 {
            out.push(0);
        }
        write_nul_bytes(out, self.auth_plugin_name.as_bytes());
    }
}

/// Client handshake response (HandshakeResponse41).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capability_flags: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    pub fn new(
        capability_flags: CapabilityFlags,
        username: &str,
        auth_response: Vec<u8>,
        database: Option<&str>,
        auth_plugin_name: &str,
    ) -> Self {
        Self {
            capability_flags,
            max_packet_size: 1 << 24,
            charset: DEFAULT_CHARSET,
            username: username.to_string(),
            auth_response,
            database: database.map(ToString::to_string),
            auth_plugin_name: auth_plugin_name.to_string(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        write_u32(out, self.capability_flags.bits());
        write_u32(out, self.max_packet_size);
        write_u8(out, self.charset);
        out.extend_from_slice(&[0u8; 23]);
        write_nul_bytes(out, self.username.as_bytes());

        if self
            .capability_flags
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
        {
            write_lenenc_bytes(out, &self.auth_response);
        } else {
            write_u8(out, self.auth_response.len() as u8);
            out.extend_from_slice(&self.auth_response);
        }

        if let Some(db) = &self.database
            && self
                .capability_flags
                .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB)
        {
            write_nul_bytes(out, db.as_bytes());
        }

        if self
            .capability_flags
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
        {
            write_nul_bytes(out, self.auth_plugin_name.as_bytes());
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (bits, data) = read_u32(payload)?;
        let capability_flags = CapabilityFlags::from_bits_truncate(bits);
        let (max_packet_size, data) = read_u32(data)?;
        let (charset, data) = read_u8(data)?;
        let (_reserved, data) = read_bytes(data, 23)?;
        let (username, data) = read_nul_bytes(data)?;
        let username = lossy_str(username);

        let (auth_response, data) = if capability_flags
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
        {
            read_lenenc_bytes(data)?
        } else {
            let (len, rest) = read_u8(data)?;
            read_bytes(rest, len as usize)?
        };

        let (database, data) = if capability_flags.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB)
        {
            let (db, rest) = read_nul_bytes(data)?;
            (Some(lossy_str(db)), rest)
        } else {
            (None, data)
        };

        let auth_plugin_name = if capability_flags.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            let (name, _rest) = read_nul_bytes(data)?;
            lossy_str(name)
        } else {
            String::new()
        };

        Ok(Self {
            capability_flags,
            max_packet_size,
            charset,
            username,
            auth_response: auth_response.to_vec(),
            database,
            auth_plugin_name,
        })
    }
}

/// SSLRequest: the abbreviated handshake response sent before the TLS
/// handshake when CLIENT_SSL is negotiated.
pub fn write_ssl_request(out: &mut Vec<u8>, capability_flags: CapabilityFlags) {
    write_u32(out, capability_flags.bits());
    write_u32(out, 1 << 24);
    write_u8(out, DEFAULT_CHARSET);
    out.extend_from_slice(&[0u8; 23]);
}

/// Auth switch request (0xFE) sent when the server wants a different plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (header, data) = read_u8(payload)?;
        if header != 0xFE {
            return Err(Error::InvalidPacket);
        }
        let (plugin_name, data) = read_nul_bytes(data)?;
        let plugin_data = match data.last() {
            Some(0) => &data[..data.len() - 1],
            _ => data,
        };
        Ok(Self {
            plugin_name: lossy_str(plugin_name),
            plugin_data: plugin_data.to_vec(),
        })
    }
}

/// Extra authentication data (0x01 wrapper) used by caching_sha2_password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastAuthResult {
    /// 0x03: cached credentials matched; an OK packet follows.
    Success,
    /// 0x04: the cache missed; full authentication is required.
    FullAuthRequired,
}

pub fn parse_fast_auth_result(payload: &[u8]) -> Result<FastAuthResult> {
    let (header, data) = read_u8(payload)?;
    if header != 0x01 {
        return Err(Error::InvalidPacket);
    }
    match read_u8(data)?.0 {
        0x03 => Ok(FastAuthResult::Success),
        0x04 => Ok(FastAuthResult::FullAuthRequired),
        _ => Err(Error::InvalidPacket),
    }
}

/// `mysql_native_password`: `SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))`.
///
/// The empty password authenticates with an empty response.
pub fn auth_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};

    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let token = hasher.finalize();

    stage1
        .iter()
        .zip(token.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// `caching_sha2_password` fast path:
/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)`.
pub fn auth_caching_sha2(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};

    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(scramble);
    let token = hasher.finalize();

    stage1
        .iter()
        .zip(token.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Compute the auth response for a plugin by name.
pub fn auth_response_for(plugin: &str, password: &str, scramble: &[u8]) -> Result<Vec<u8>> {
    match plugin.as_bytes() {
        crate::constant::AUTH_NATIVE_PASSWORD => Ok(auth_native_password(password, scramble)),
        crate::constant::AUTH_CACHING_SHA2 => Ok(auth_caching_sha2(password, scramble)),
        _ => Err(Error::Unsupported(format!(
            "authentication plugin '{plugin}' is not supported"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_handshake() -> InitialHandshake {
        InitialHandshake {
            protocol_version: 10,
            server_version: "8.0.35".to_string(),
            connection_id: 99,
            auth_plugin_data: (1..=20).collect(),
            capability_flags: CapabilityFlags::from_bits_truncate(0x19FF_FFFF),
            charset: 0xFF,
            status_flags: 2,
            auth_plugin_name: "caching_sha2_password".to_string(),
        }
    }

    #[test]
    fn handshake_round_trips() {
        let handshake = sample_handshake();
        let mut wire = Vec::new();
        handshake.encode(&mut wire);
        assert_eq!(InitialHandshake::parse(&wire).unwrap(), handshake);
    }

    #[test]
    fn handshake_err_packet_becomes_server_error() {
        let mut wire = Vec::new();
        crate::protocol::response::ErrPayload {
            code: 1130,
            sql_state: "HY000".to_string(),
            message: "Host not allowed".to_string(),
        }
        .encode(&mut wire);
        match InitialHandshake::parse(&wire) {
            Err(Error::Server { code, .. }) => assert_eq!(code, 1130),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn handshake_response_round_trips_with_db() {
        let caps = crate::constant::CAPABILITIES_ALWAYS_ENABLED
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        let response = HandshakeResponse::new(
            caps,
            "alice",
            Vec::new(),
            Some("orders"),
            "mysql_native_password",
        );
        let mut wire = Vec::new();
        response.encode(&mut wire);
        assert_eq!(HandshakeResponse::parse(&wire).unwrap(), response);
    }

    #[test]
    fn native_password_known_vector() {
        // SHA1("secret") XOR SHA1(zero20 + SHA1(SHA1("secret")))
        let scramble = [0u8; 20];
        let token = auth_native_password("secret", &scramble);
        assert_eq!(token.len(), 20);

        use sha1::{Digest, Sha1};
        let stage1 = Sha1::digest(b"secret");
        let stage2 = Sha1::digest(stage1);
        let mut hasher = Sha1::new();
        hasher.update(scramble);
        hasher.update(stage2);
        let rhs = hasher.finalize();
        let expected: Vec<u8> = stage1.iter().zip(rhs.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(token, expected);
    }

    #[test]
    fn caching_sha2_has_32_bytes() {
        let scramble: Vec<u8> = (0..20).collect();
        assert_eq!(auth_caching_sha2("secret", &scramble).len(), 32);
    }

    #[test]
    fn empty_password_sends_empty_auth() {
        assert!(auth_native_password("", &[0u8; 20]).is_empty());
        assert!(auth_caching_sha2("", &[0u8; 20]).is_empty());
    }

    #[test]
    fn auth_switch_parse() {
        let mut wire = vec![0xFE];
        write_nul_bytes(&mut wire, b"mysql_native_password");
        wire.extend_from_slice(&[9u8; 20]);
        wire.push(0);
        let switch = AuthSwitchRequest::parse(&wire).unwrap();
        assert_eq!(switch.plugin_name, "mysql_native_password");
        assert_eq!(switch.plugin_data, vec![9u8; 20]);
    }

    #[test]
    fn fast_auth_results() {
        assert_eq!(
            parse_fast_auth_result(&[0x01, 0x03]).unwrap(),
            FastAuthResult::Success
        );
        assert_eq!(
            parse_fast_auth_result(&[0x01, 0x04]).unwrap(),
            FastAuthResult::FullAuthRequired
        );
        assert!(parse_fast_auth_result(&[0x02, 0x03]).is_err());
    }

    #[test]
    fn unknown_plugin_is_unsupported() {
        assert!(auth_response_for("sha256_password", "pw", &[0u8; 20]).is_err());
    }
}
