//! In-process MySQL server speaking just enough of the wire protocol to
//! exercise the client: handshake, native-password auth (with optional
//! auth-switch), COM_QUERY/PING/PREPARE/EXECUTE/STMT_CLOSE/QUIT.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use weft::constant::{CapabilityFlags, ColumnFlags, ColumnType};
use weft::protocol::column::Column;
use weft::protocol::command::encode_prepare_ok;
use weft::protocol::handshake::{HandshakeResponse, InitialHandshake, auth_native_password};
use weft::protocol::packet::write_frame;
use weft::protocol::response::{ErrPayload, OkPayload};
use weft::protocol::value::{Value, encode_binary_row, encode_text_row};

#[derive(Clone)]
pub struct ServerConfig {
    pub password: String,
    /// Advertise caching_sha2_password, then switch the client to
    /// mysql_native_password mid-auth.
    pub auth_switch: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            password: "secret".to_string(),
            auth_switch: false,
        }
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub fn start(config: ServerConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let log = Arc::new(Mutex::new(Vec::new()));

        let accept_log = Arc::clone(&log);
        thread::spawn(move || {
            let connection_ids = AtomicU32::new(1);
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let config = config.clone();
                let log = Arc::clone(&accept_log);
                let id = connection_ids.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || {
                    let _ = serve_connection(stream, &config, &log, id);
                });
            }
        });

        Self { addr, log }
    }

    pub fn dsn(&self, password: &str) -> String {
        format!("mysql://app:{}@{}", password, self.addr)
    }

    pub fn logged(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }
}

fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload)?;
    Ok((header[3], payload))
}

fn send_packet(stream: &mut TcpStream, sequence_id: u8, payload: &[u8]) -> io::Result<()> {
    let mut wire = Vec::with_capacity(4 + payload.len());
    write_frame(&mut wire, payload, sequence_id).map_err(|e| io::Error::other(e.to_string()))?;
    stream.write_all(&wire)
}

fn send_ok(stream: &mut TcpStream, sequence_id: u8) -> io::Result<()> {
    let mut payload = Vec::new();
    OkPayload::default().encode(&mut payload);
    send_packet(stream, sequence_id, &payload)
}

fn send_err(stream: &mut TcpStream, sequence_id: u8, code: u16, message: &str) -> io::Result<()> {
    let mut payload = Vec::new();
    ErrPayload {
        code,
        sql_state: "42000".to_string(),
        message: message.to_string(),
    }
    .encode(&mut payload);
    send_packet(stream, sequence_id, &payload)
}

fn send_eof(stream: &mut TcpStream, sequence_id: u8) -> io::Result<()> {
    let mut payload = Vec::new();
    OkPayload::default().encode_as_terminator(&mut payload);
    send_packet(stream, sequence_id, &payload)
}

fn text_column(name: &str) -> Column {
    Column {
        catalog: "def".to_string(),
        schema: "app".to_string(),
        table: "users".to_string(),
        org_table: "users".to_string(),
        name: name.to_string(),
        org_name: name.to_string(),
        charset: 45,
        column_length: 255,
        column_type: ColumnType::VarString,
        flags: ColumnFlags::empty(),
        decimals: 0,
    }
}

fn int_column(name: &str) -> Column {
    Column {
        catalog: "def".to_string(),
        schema: "app".to_string(),
        table: "t".to_string(),
        org_table: "t".to_string(),
        name: name.to_string(),
        org_name: name.to_string(),
        charset: 63,
        column_length: 20,
        column_type: ColumnType::LongLong,
        flags: ColumnFlags::empty(),
        decimals: 0,
    }
}

fn serve_connection(
    mut stream: TcpStream,
    config: &ServerConfig,
    log: &Arc<Mutex<Vec<String>>>,
    connection_id: u32,
) -> io::Result<()> {
    let scramble: Vec<u8> = (1..=20).collect();
    let advertised_plugin = if config.auth_switch {
        "caching_sha2_password"
    } else {
        "mysql_native_password"
    };

    let handshake = InitialHandshake {
        protocol_version: 10,
        server_version: "8.0.35-test".to_string(),
        connection_id,
        auth_plugin_data: scramble.clone(),
        capability_flags: CapabilityFlags::from_bits_truncate(u32::MAX),
        charset: 255,
        status_flags: 2,
        auth_plugin_name: advertised_plugin.to_string(),
    };
    let mut payload = Vec::new();
    handshake.encode(&mut payload);
    send_packet(&mut stream, 0, &payload)?;

    let (response_seq, response_payload) = read_packet(&mut stream)?;
    let response =
        HandshakeResponse::parse(&response_payload).map_err(|e| io::Error::other(e.to_string()))?;
    let mut next_seq = response_seq.wrapping_add(1);

    let authenticated = if config.auth_switch {
        // switch to native password with a fresh scramble
        let rescramble: Vec<u8> = (21..=40).collect();
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password");
        switch.push(0);
        switch.extend_from_slice(&rescramble);
        switch.push(0);
        send_packet(&mut stream, next_seq, &switch)?;

        let (token_seq, token) = read_packet(&mut stream)?;
        next_seq = token_seq.wrapping_add(1);
        token == auth_native_password(&config.password, &rescramble)
    } else {
        response.auth_response == auth_native_password(&config.password, &scramble)
    };

    if !authenticated {
        send_err(&mut stream, next_seq, 1045, "Access denied for user 'app'")?;
        return Ok(());
    }
    send_ok(&mut stream, next_seq)?;

    loop {
        let (_seq, command) = match read_packet(&mut stream) {
            Ok(packet) => packet,
            Err(_) => return Ok(()),
        };
        let Some(&opcode) = command.first() else {
            return Ok(());
        };
        match opcode {
            // COM_QUIT
            0x01 => return Ok(()),

            // COM_PING
            0x0e => send_ok(&mut stream, 1)?,

            // COM_QUERY
            0x03 => {
                let sql = String::from_utf8_lossy(&command[1..]).to_string();
                log.lock().expect("log lock").push(sql.clone());
                let upper = sql.trim_start().to_uppercase();
                if upper.contains("DIE") {
                    // abrupt close mid-command
                    return Ok(());
                }
                if upper.contains("BAD") {
                    send_err(&mut stream, 1, 1064, "You have an error in your SQL syntax")?;
                } else if upper.starts_with("SELECT") {
                    send_users_result_set(&mut stream)?;
                } else {
                    send_ok(&mut stream, 1)?;
                }
            }

            // COM_STMT_PREPARE
            0x16 => {
                let sql = String::from_utf8_lossy(&command[1..]).to_string();
                log.lock().expect("log lock").push(format!("PREPARE {sql}"));
                let num_params = sql.matches('?').count() as u16;
                let num_columns = if sql.trim_start().to_uppercase().starts_with("SELECT") {
                    1u16
                } else {
                    0
                };
                let mut payload = Vec::new();
                encode_prepare_ok(&mut payload, 1, num_columns, num_params);
                send_packet(&mut stream, 1, &payload)?;

                let mut seq = 2u8;
                for _ in 0..num_params {
                    let mut def = Vec::new();
                    text_column("?").encode(&mut def);
                    send_packet(&mut stream, seq, &def)?;
                    seq = seq.wrapping_add(1);
                }
                for _ in 0..num_columns {
                    let mut def = Vec::new();
                    int_column("n").encode(&mut def);
                    send_packet(&mut stream, seq, &def)?;
                    seq = seq.wrapping_add(1);
                }
            }

            // COM_STMT_EXECUTE
            0x17 => {
                log.lock().expect("log lock").push("EXECUTE".to_string());
                send_binary_result_set(&mut stream)?;
            }

            // COM_STMT_CLOSE (no response)
            0x19 => {
                log.lock().expect("log lock").push("STMT_CLOSE".to_string());
            }

            _ => send_err(&mut stream, 1, 1047, "Unknown command")?,
        }
    }
}

/// Fixed two-column result set: (1, "ada"), (2, "grace").
fn send_users_result_set(stream: &mut TcpStream) -> io::Result<()> {
    send_packet(stream, 1, &[0x02])?;

    let mut seq = 2u8;
    for name in ["id", "name"] {
        let mut def = Vec::new();
        text_column(name).encode(&mut def);
        send_packet(stream, seq, &def)?;
        seq = seq.wrapping_add(1);
    }

    for (id, name) in [("1", "ada"), ("2", "grace")] {
        let mut row = Vec::new();
        encode_text_row(
            &mut row,
            &[
                Value::Bytes(id.as_bytes().to_vec()),
                Value::Bytes(name.as_bytes().to_vec()),
            ],
        );
        send_packet(stream, seq, &row)?;
        seq = seq.wrapping_add(1);
    }
    send_eof(stream, seq)
}

/// One-column binary result set containing the single row (7).
fn send_binary_result_set(stream: &mut TcpStream) -> io::Result<()> {
    send_packet(stream, 1, &[0x01])?;

    let column = int_column("n");
    let mut def = Vec::new();
    column.encode(&mut def);
    send_packet(stream, 2, &def)?;

    let mut row = Vec::new();
    encode_binary_row(&mut row, std::slice::from_ref(&column), &[Value::Int(7)]);
    send_packet(stream, 3, &row)?;

    send_eof(stream, 4)
}
