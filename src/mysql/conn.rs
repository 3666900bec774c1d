use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::rc::{Rc, Weak};

use bytes::BytesMut;
use mio::Token;
use mio::net::TcpStream;
use tracing::{debug, trace};

use crate::constant::{CAPABILITIES_ALWAYS_ENABLED, CapabilityFlags};
use crate::error::{Error, Result};
use crate::mysql::command::{
    OkDriver, PrepareDriver, QueryDriver, ResponseDriver, SilentDriver, Step,
};
use crate::mysql::result::QueryResult;
use crate::mysql::statement::Statement;
use crate::opts::Opts;
use crate::promise::{Promise, Resolver};
use crate::protocol::command as protocol_command;
use crate::protocol::handshake::{
    AuthSwitchRequest, FastAuthResult, HandshakeResponse, InitialHandshake, auth_response_for,
    parse_fast_auth_result,
};
use crate::protocol::packet::{take_packet, write_frame};
use crate::protocol::response::{is_err_packet, is_ok_packet, server_error};
use crate::protocol::value::Param;
use crate::runtime::Handle;

const READ_CHUNK: usize = 16 * 1024;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Authenticating,
    EnablingTls,
    Idle,
    Busy,
    Closing,
}

enum NetStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Handshaking(Option<native_tls::MidHandshakeTlsStream<TcpStream>>),
    #[cfg(feature = "tls")]
    Tls(Box<native_tls::TlsStream<TcpStream>>),
    Gone,
}

impl NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            NetStream::Tls(stream) => stream.read(buf),
            _ => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            NetStream::Tls(stream) => stream.write(buf),
            _ => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn tcp_mut(&mut self) -> Option<&mut TcpStream> {
        match self {
            NetStream::Plain(stream) => Some(stream),
            #[cfg(feature = "tls")]
            NetStream::Handshaking(mid) => mid.as_mut().map(|m| m.get_mut()),
            #[cfg(feature = "tls")]
            NetStream::Tls(stream) => Some(stream.get_mut()),
            NetStream::Gone => None,
        }
    }
}

struct QueuedCommand {
    payload: Vec<u8>,
    driver: Box<dyn ResponseDriver>,
    /// COM_QUIT: tear the connection down once the bytes are flushed.
    quit: bool,
}

struct CurrentCommand {
    driver: Box<dyn ResponseDriver>,
    quit: bool,
}

struct ServerInfo {
    capabilities: CapabilityFlags,
    connection_id: u32,
    server_version: String,
}

struct AuthContext {
    scramble: Vec<u8>,
    plugin: String,
}

/// Deferred side effects computed under the connection borrow and applied
/// after it is released, so reactor and pool callbacks never re-enter a
/// borrowed connection.
enum Effect {
    ArmWrite,
    Teardown,
    NotifyDisconnect,
    #[cfg(feature = "tls")]
    BeginTls,
}

struct ConnInner {
    handle: Handle,
    /// Back-reference to the owning Rc, set right after construction; used
    /// to mint new `Conn` handles from inside the state machine.
    self_ref: Weak<RefCell<ConnInner>>,
    opts: Opts,
    stream: NetStream,
    token: Option<Token>,
    state: ConnState,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    write_pos: usize,
    next_seq: u8,
    current: Option<CurrentCommand>,
    queue: VecDeque<QueuedCommand>,
    server: Option<ServerInfo>,
    auth: Option<AuthContext>,
    connect_resolver: Option<Resolver<Conn>>,
    broken: bool,
    /// Open prepared statements holding this connection; the pool will not
    /// reclaim it while nonzero.
    pin_count: usize,
    /// Pool notification, fired once when the connection dies.
    on_disconnect: Option<Box<dyn FnOnce()>>,
    /// Fired when the pin count drops to zero; set by the pool when a
    /// still-pinned connection is handed back.
    on_unpinned: Option<Box<dyn FnOnce()>>,
    /// SSLRequest was flushed; the TLS handshake starts next.
    #[cfg(feature = "tls")]
    tls_pending: bool,
}

/// A single MySQL connection driven by the event loop's reactor.
///
/// `Conn` is a cheap handle; clones refer to the same connection. Exactly
/// one command is in flight at a time, additional commands wait in the
/// connection's FIFO queue.
#[derive(Clone)]
pub struct Conn {
    inner: Rc<RefCell<ConnInner>>,
}

impl Conn {
    /// Open a connection and resolve with the authenticated handle.
    pub fn connect(handle: &Handle, opts: Opts) -> Promise<Conn> {
        let (promise, resolver) = Promise::pending_with(handle);

        let stream = match open_stream(&opts) {
            Ok(stream) => stream,
            Err(err) => {
                resolver.reject(err);
                return promise;
            }
        };

        let inner = Rc::new(RefCell::new(ConnInner {
            handle: handle.clone(),
            self_ref: Weak::new(),
            opts,
            stream: NetStream::Plain(stream),
            token: None,
            state: ConnState::Connecting,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: Vec::new(),
            write_pos: 0,
            next_seq: 0,
            current: None,
            queue: VecDeque::new(),
            server: None,
            auth: None,
            connect_resolver: Some(resolver.clone()),
            broken: false,
            pin_count: 0,
            on_disconnect: None,
            on_unpinned: None,
            #[cfg(feature = "tls")]
            tls_pending: false,
        }));
        inner.borrow_mut().self_ref = Rc::downgrade(&inner);

        let token = {
            let mut guard = inner.borrow_mut();
            let ConnInner { handle, stream, .. } = &mut *guard;
            match stream.tcp_mut() {
                Some(tcp) => handle.with_reactor(|reactor| reactor.attach(tcp)),
                None => None,
            }
        };

        match token {
            Some(Ok(token)) => {
                inner.borrow_mut().token = Some(token);
                let conn = Conn { inner: Rc::clone(&inner) };

                let weak = Rc::downgrade(&inner);
                let _ = conn.loop_handle().with_reactor(|reactor| {
                    let read_weak = weak.clone();
                    reactor.set_read(
                        token,
                        Some(Rc::new(move || {
                            if let Some(rc) = read_weak.upgrade() {
                                Conn::on_readable(&rc);
                            }
                        })),
                    );
                    let write_weak = weak.clone();
                    reactor.arm_write(
                        token,
                        Box::new(move || {
                            if let Some(rc) = write_weak.upgrade() {
                                Conn::on_writable(&rc);
                            }
                        }),
                    );
                });

                let cancel_weak = weak;
                promise.on_cancel(move || {
                    if let Some(rc) = cancel_weak.upgrade() {
                        Conn::fatal(&rc, Error::Cancelled);
                    }
                });
            }
            Some(Err(err)) => resolver.reject(err.into()),
            None => resolver.reject(Error::Cancelled),
        }
        promise
    }

    pub(crate) fn loop_handle(&self) -> Handle {
        self.inner.borrow().handle.clone()
    }

    pub fn state(&self) -> ConnState {
        self.inner.borrow().state
    }

    pub fn is_broken(&self) -> bool {
        let guard = self.inner.borrow();
        guard.broken || guard.state == ConnState::Disconnected
    }

    /// Usable for new commands: authenticated and not torn down.
    pub fn is_usable(&self) -> bool {
        matches!(self.state(), ConnState::Idle | ConnState::Busy) && !self.is_broken()
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.inner.borrow().server.as_ref().map(|s| s.connection_id)
    }

    /// Capabilities advertised by the server during the handshake.
    pub fn server_capabilities(&self) -> Option<CapabilityFlags> {
        self.inner.borrow().server.as_ref().map(|s| s.capabilities)
    }

    /// Example: `"8.0.35"`.
    pub fn server_version(&self) -> Option<String> {
        self.inner
            .borrow()
            .server
            .as_ref()
            .map(|s| s.server_version.clone())
    }

    pub fn same_conn(&self, other: &Conn) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable identity for bookkeeping without holding a handle.
    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn set_on_disconnect(&self, callback: impl FnOnce() + 'static) {
        self.inner.borrow_mut().on_disconnect = Some(Box::new(callback));
    }

    /// A prepared statement took a reference to this connection.
    pub(crate) fn pin(&self) {
        self.inner.borrow_mut().pin_count += 1;
    }

    /// Release one statement pin. When the last pin drops, the deferred
    /// pool release (if any) runs.
    pub(crate) fn unpin(&self) {
        let callback = {
            let mut guard = self.inner.borrow_mut();
            guard.pin_count = guard.pin_count.saturating_sub(1);
            if guard.pin_count == 0 {
                guard.on_unpinned.take()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.inner.borrow().pin_count > 0
    }

    pub(crate) fn set_on_unpinned(&self, callback: impl FnOnce() + 'static) {
        self.inner.borrow_mut().on_unpinned = Some(Box::new(callback));
    }

    /// Execute a text-protocol query and collect the full result set.
    pub fn query(&self, sql: &str) -> Promise<QueryResult> {
        let (promise, resolver) = Promise::pending_with(&self.loop_handle());
        let mut payload = Vec::with_capacity(1 + sql.len());
        protocol_command::write_query(&mut payload, sql);
        self.enqueue(payload, Box::new(QueryDriver::text(resolver)), false);
        promise
    }

    /// Execute a query, discarding the result.
    pub fn query_drop(&self, sql: &str) -> Promise<()> {
        self.query(sql).then(|_| Ok(()))
    }

    /// Prepare a statement. The returned handle stays pinned to this
    /// connection; see [`Statement`].
    pub fn prepare(&self, sql: &str) -> Promise<Statement> {
        let (promise, resolver) = Promise::pending_with(&self.loop_handle());
        let mut payload = Vec::with_capacity(1 + sql.len());
        protocol_command::write_prepare(&mut payload, sql);
        self.enqueue(payload, Box::new(PrepareDriver::new(resolver)), false);

        let conn = self.clone();
        promise.then(move |info| Ok(Statement::new(conn, &info)))
    }

    /// Execute a prepared statement by id (used by [`Statement::exec`]).
    pub(crate) fn execute_statement(
        &self,
        statement_id: u32,
        params: &[Param],
    ) -> Promise<QueryResult> {
        let (promise, resolver) = Promise::pending_with(&self.loop_handle());
        let mut payload = Vec::new();
        protocol_command::write_execute(&mut payload, statement_id, params);
        self.enqueue(payload, Box::new(QueryDriver::binary(resolver)), false);
        promise
    }

    /// Deallocate a prepared statement. COM_STMT_CLOSE has no response.
    pub(crate) fn close_statement(&self, statement_id: u32) {
        let mut payload = Vec::with_capacity(5);
        protocol_command::write_stmt_close(&mut payload, statement_id);
        self.enqueue(payload, Box::new(SilentDriver::new(None)), false);
    }

    /// COM_PING health check.
    pub fn ping(&self) -> Promise<()> {
        let (promise, resolver) = Promise::pending_with(&self.loop_handle());
        let mut payload = Vec::with_capacity(1);
        protocol_command::write_ping(&mut payload);
        self.enqueue(payload, Box::new(OkDriver::new(resolver)), false);
        promise
    }

    /// Close the connection. When idle, a COM_QUIT is flushed first; pending
    /// commands are rejected with [`Error::ConnectionLost`].
    pub fn close(&self) -> Promise<()> {
        let graceful = {
            let guard = self.inner.borrow();
            guard.state == ConnState::Idle && guard.current.is_none() && guard.queue.is_empty()
        };
        if graceful {
            let (promise, resolver) = Promise::pending_with(&self.loop_handle());
            let mut payload = Vec::with_capacity(1);
            protocol_command::write_quit(&mut payload);
            self.enqueue(payload, Box::new(SilentDriver::new(Some(resolver))), true);
            promise
        } else {
            Conn::fatal(&self.inner, Error::ConnectionLost);
            Promise::fulfilled_with(&self.loop_handle(), ())
        }
    }

    fn enqueue(&self, payload: Vec<u8>, driver: Box<dyn ResponseDriver>, quit: bool) {
        let effects = {
            let mut guard = self.inner.borrow_mut();
            if guard.broken
                || matches!(guard.state, ConnState::Disconnected | ConnState::Closing)
            {
                drop(guard);
                driver.fail(Error::ConnectionLost);
                return;
            }
            guard.queue.push_back(QueuedCommand { payload, driver, quit });
            let mut effects = Vec::new();
            guard.pump_queue(&mut effects);
            effects
        };
        Conn::apply(&self.inner, effects);
    }

    // ---- reactor callbacks ----------------------------------------------

    fn on_readable(inner: &Rc<RefCell<ConnInner>>) {
        #[cfg(feature = "tls")]
        {
            let handshaking = matches!(
                inner.borrow().state,
                ConnState::EnablingTls
            ) && matches!(inner.borrow().stream, NetStream::Handshaking(_));
            if handshaking {
                Conn::continue_tls(inner);
                return;
            }
        }

        let effects = {
            let mut guard = inner.borrow_mut();
            let mut effects = Vec::new();
            // A readable event can beat the connect-completion edge when
            // both land in one poll batch.
            if guard.state == ConnState::Connecting {
                guard.finish_connect(&mut effects);
            }
            if guard.state != ConnState::Connecting {
                guard.fill_read_buffer(&mut effects);
                if !matches!(guard.state, ConnState::Disconnected) {
                    guard.process_packets(&mut effects);
                }
            }
            effects
        };
        Conn::apply(inner, effects);
    }

    fn on_writable(inner: &Rc<RefCell<ConnInner>>) {
        #[cfg(feature = "tls")]
        {
            let handshaking = matches!(inner.borrow().stream, NetStream::Handshaking(_));
            if handshaking {
                Conn::continue_tls(inner);
                return;
            }
        }

        let effects = {
            let mut guard = inner.borrow_mut();
            let mut effects = Vec::new();
            if guard.state == ConnState::Connecting {
                guard.finish_connect(&mut effects);
            } else {
                guard.flush_write(&mut effects);
            }
            effects
        };
        Conn::apply(inner, effects);
    }

    /// Unrecoverable failure: reject everything, notify the pool, tear down.
    fn fatal(inner: &Rc<RefCell<ConnInner>>, err: Error) {
        let effects = {
            let mut guard = inner.borrow_mut();
            let mut effects = Vec::new();
            guard.fail_all(err, &mut effects);
            effects
        };
        Conn::apply(inner, effects);
    }

    fn apply(inner: &Rc<RefCell<ConnInner>>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ArmWrite => {
                    let weak = Rc::downgrade(inner);
                    let mut guard = inner.borrow_mut();
                    let ConnInner { handle, token, .. } = &mut *guard;
                    if let Some(token) = *token {
                        let _ = handle.with_reactor(|reactor| {
                            reactor.arm_write(
                                token,
                                Box::new(move || {
                                    if let Some(rc) = weak.upgrade() {
                                        Conn::on_writable(&rc);
                                    }
                                }),
                            );
                        });
                    }
                }
                Effect::Teardown => {
                    let mut guard = inner.borrow_mut();
                    let ConnInner {
                        handle,
                        stream,
                        token,
                        ..
                    } = &mut *guard;
                    if let Some(tok) = token.take() {
                        match stream.tcp_mut() {
                            Some(tcp) => {
                                let _ = handle.with_reactor(|reactor| reactor.detach(tcp, tok));
                            }
                            None => {
                                let _ = handle.with_reactor(|reactor| reactor.forget(tok));
                            }
                        }
                    }
                    guard.stream = NetStream::Gone;
                    guard.state = ConnState::Disconnected;
                }
                Effect::NotifyDisconnect => {
                    let callback = inner.borrow_mut().on_disconnect.take();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
                #[cfg(feature = "tls")]
                Effect::BeginTls => Conn::begin_tls(inner),
            }
        }
    }

    #[cfg(feature = "tls")]
    fn begin_tls(inner: &Rc<RefCell<ConnInner>>) {
        let outcome = {
            let mut guard = inner.borrow_mut();
            let host = guard.opts.host.clone();
            let stream = std::mem::replace(&mut guard.stream, NetStream::Gone);
            let NetStream::Plain(tcp) = stream else {
                return;
            };
            let connector = match native_tls::TlsConnector::new() {
                Ok(connector) => connector,
                Err(err) => {
                    drop(guard);
                    Conn::fatal(inner, Error::Auth(format!("TLS setup failed: {err}")));
                    return;
                }
            };
            match connector.connect(&host, tcp) {
                Ok(tls) => {
                    guard.stream = NetStream::Tls(Box::new(tls));
                    Ok(())
                }
                Err(native_tls::HandshakeError::WouldBlock(mid)) => {
                    guard.stream = NetStream::Handshaking(Some(mid));
                    Ok(())
                }
                Err(native_tls::HandshakeError::Failure(err)) => {
                    Err(Error::Auth(format!("TLS handshake failed: {err}")))
                }
            }
        };
        match outcome {
            Ok(()) => Conn::after_tls_progress(inner),
            Err(err) => Conn::fatal(inner, err),
        }
    }

    #[cfg(feature = "tls")]
    fn continue_tls(inner: &Rc<RefCell<ConnInner>>) {
        let outcome = {
            let mut guard = inner.borrow_mut();
            let NetStream::Handshaking(mid) = &mut guard.stream else {
                return;
            };
            let Some(mid) = mid.take() else { return };
            match mid.handshake() {
                Ok(tls) => {
                    guard.stream = NetStream::Tls(Box::new(tls));
                    Ok(())
                }
                Err(native_tls::HandshakeError::WouldBlock(mid)) => {
                    guard.stream = NetStream::Handshaking(Some(mid));
                    Ok(())
                }
                Err(native_tls::HandshakeError::Failure(err)) => {
                    Err(Error::Auth(format!("TLS handshake failed: {err}")))
                }
            }
        };
        match outcome {
            Ok(()) => Conn::after_tls_progress(inner),
            Err(err) => Conn::fatal(inner, err),
        }
    }

    /// Once the TLS session is up, send the real handshake response over it.
    #[cfg(feature = "tls")]
    fn after_tls_progress(inner: &Rc<RefCell<ConnInner>>) {
        let effects = {
            let mut guard = inner.borrow_mut();
            let mut effects = Vec::new();
            if matches!(guard.stream, NetStream::Tls(_)) && guard.state == ConnState::EnablingTls {
                guard.state = ConnState::Authenticating;
                if let Err(err) = guard.send_auth_response(&mut effects) {
                    guard.fail_all(err, &mut effects);
                }
            }
            effects
        };
        Conn::apply(inner, effects);
    }
}

impl ConnInner {
    // ---- I/O ------------------------------------------------------------

    fn fill_read_buffer(&mut self, effects: &mut Vec<Effect>) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if self.state == ConnState::Closing {
                        // orderly shutdown after COM_QUIT
                        self.complete_quit(effects);
                    } else {
                        self.fail_all(Error::ConnectionLost, effects);
                    }
                    return;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fail_all(err.into(), effects);
                    return;
                }
            }
        }
    }

    fn flush_write(&mut self, effects: &mut Vec<Effect>) {
        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(n) => self.write_pos += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    effects.push(Effect::ArmWrite);
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fail_all(err.into(), effects);
                    return;
                }
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        self.after_flush(effects);
    }

    fn after_flush(&mut self, effects: &mut Vec<Effect>) {
        #[cfg(feature = "tls")]
        if self.tls_pending {
            self.tls_pending = false;
            effects.push(Effect::BeginTls);
            return;
        }

        // Fire-and-forget commands complete once their bytes are out.
        let silent = self
            .current
            .as_ref()
            .is_some_and(|c| !c.driver.expects_response());
        if silent {
            if let Some(current) = self.current.take() {
                current.driver.complete_without_response();
                if current.quit {
                    self.complete_quit(effects);
                    return;
                }
            }
            if self.state == ConnState::Busy {
                self.state = ConnState::Idle;
            }
            self.pump_queue(effects);
        }
    }

    fn complete_quit(&mut self, effects: &mut Vec<Effect>) {
        self.state = ConnState::Closing;
        self.broken = true;
        effects.push(Effect::Teardown);
        effects.push(Effect::NotifyDisconnect);
    }

    fn finish_connect(&mut self, effects: &mut Vec<Effect>) {
        let NetStream::Plain(tcp) = &mut self.stream else {
            return;
        };
        match tcp.take_error() {
            Ok(Some(err)) | Err(err) => {
                self.fail_all(err.into(), effects);
                return;
            }
            Ok(None) => {}
        }
        match tcp.peer_addr() {
            Ok(_) => {
                trace!("connection established");
                self.state = ConnState::AwaitingHandshake;
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                // connect still in progress; wait for the next edge
                effects.push(Effect::ArmWrite);
            }
            Err(err) => self.fail_all(err.into(), effects),
        }
    }

    // ---- packet dispatch -------------------------------------------------

    fn process_packets(&mut self, effects: &mut Vec<Effect>) {
        loop {
            let packet = match take_packet(&mut self.read_buf) {
                Ok(Some(packet)) => packet,
                Ok(None) => return,
                Err(err) => {
                    self.fail_all(err, effects);
                    return;
                }
            };
            let (seq, payload) = packet;
            self.next_seq = seq.wrapping_add(1);
            if let Err(err) = self.dispatch_packet(&payload[..], effects) {
                if err.is_fatal_for_connection() {
                    self.fail_all(err, effects);
                    return;
                }
                // Server-level failure: only the current command dies.
                if let Some(current) = self.current.take() {
                    current.driver.fail(err);
                } else {
                    self.fail_all(err, effects);
                    return;
                }
                if self.state == ConnState::Busy {
                    self.state = ConnState::Idle;
                }
                self.pump_queue(effects);
            }
            if matches!(self.state, ConnState::Disconnected | ConnState::Closing) {
                return;
            }
        }
    }

    fn dispatch_packet(&mut self, payload: &[u8], effects: &mut Vec<Effect>) -> Result<()> {
        match self.state {
            ConnState::AwaitingHandshake => self.handle_handshake(payload, effects),
            ConnState::Authenticating => self.handle_auth_packet(payload, effects),
            ConnState::Busy => {
                let Some(current) = &mut self.current else {
                    return Err(Error::InvalidPacket);
                };
                match current.driver.on_packet(payload)? {
                    Step::Continue => Ok(()),
                    Step::Done => {
                        self.current = None;
                        self.state = ConnState::Idle;
                        self.pump_queue(effects);
                        Ok(())
                    }
                }
            }
            // No packet is legitimate in any other state.
            _ => Err(Error::InvalidPacket),
        }
    }

    fn handle_handshake(&mut self, payload: &[u8], effects: &mut Vec<Effect>) -> Result<()> {
        let handshake = InitialHandshake::parse(payload)?;
        debug!(
            server = %handshake.server_version,
            connection_id = handshake.connection_id,
            plugin = %handshake.auth_plugin_name,
            "handshake received"
        );

        if !handshake
            .capability_flags
            .contains(CAPABILITIES_ALWAYS_ENABLED)
        {
            return Err(Error::Unsupported(
                "server lacks required capabilities (PROTOCOL_41 / PLUGIN_AUTH / DEPRECATE_EOF)"
                    .to_string(),
            ));
        }

        self.server = Some(ServerInfo {
            capabilities: handshake.capability_flags,
            connection_id: handshake.connection_id,
            server_version: handshake.server_version.clone(),
        });
        self.auth = Some(AuthContext {
            scramble: handshake.auth_plugin_data.clone(),
            plugin: handshake.auth_plugin_name.clone(),
        });

        if self.opts.tls {
            #[cfg(feature = "tls")]
            {
                if !handshake
                    .capability_flags
                    .contains(CapabilityFlags::CLIENT_SSL)
                {
                    return Err(Error::Unsupported(
                        "server does not support TLS".to_string(),
                    ));
                }
                self.state = ConnState::EnablingTls;
                let mut payload = Vec::new();
                crate::protocol::handshake::write_ssl_request(&mut payload, self.client_capabilities());
                self.write_handshake_packet(&payload)?;
                self.tls_pending = true;
                self.flush_write(effects);
                return Ok(());
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(Error::BadConfig(
                    "TLS requested but the tls feature is not enabled".to_string(),
                ));
            }
        }

        self.state = ConnState::Authenticating;
        self.send_auth_response(effects)?;
        Ok(())
    }

    fn client_capabilities(&self) -> CapabilityFlags {
        let mut caps = CAPABILITIES_ALWAYS_ENABLED;
        if self.opts.db.is_some() {
            caps |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        }
        if self.opts.tls {
            caps |= CapabilityFlags::CLIENT_SSL;
        }
        caps
    }

    fn send_auth_response(&mut self, effects: &mut Vec<Effect>) -> Result<()> {
        let auth = self.auth.as_ref().ok_or(Error::InvalidPacket)?;
        let password = self.opts.password.clone().unwrap_or_default();
        let token = auth_response_for(&auth.plugin, &password, &auth.scramble)?;
        let plugin = auth.plugin.clone();

        let response = HandshakeResponse::new(
            self.client_capabilities(),
            &self.opts.user,
            token,
            self.opts.db.as_deref(),
            &plugin,
        );
        let mut payload = Vec::new();
        response.encode(&mut payload);
        self.write_handshake_packet(&payload)?;
        self.flush_write(effects);
        Ok(())
    }

    fn handle_auth_packet(&mut self, payload: &[u8], effects: &mut Vec<Effect>) -> Result<()> {
        if is_err_packet(payload) {
            let err = server_error(payload);
            return Err(Error::Auth(err.to_string()));
        }

        if is_ok_packet(payload) {
            self.finish_authentication(effects);
            return Ok(());
        }

        match payload.first() {
            // Auth switch: answer with the new plugin, sequence continued.
            Some(0xFE) => {
                let switch = AuthSwitchRequest::parse(payload)?;
                debug!(plugin = %switch.plugin_name, "auth switch requested");
                let password = self.opts.password.clone().unwrap_or_default();
                let token =
                    auth_response_for(&switch.plugin_name, &password, &switch.plugin_data)?;
                self.auth = Some(AuthContext {
                    scramble: switch.plugin_data,
                    plugin: switch.plugin_name,
                });
                self.write_handshake_packet(&token)?;
                self.flush_write(effects);
                Ok(())
            }
            // caching_sha2 extra data
            Some(0x01) => match parse_fast_auth_result(payload)? {
                FastAuthResult::Success => Ok(()),
                FastAuthResult::FullAuthRequired => {
                    if self.stream_is_tls() {
                        let mut cleartext =
                            self.opts.password.clone().unwrap_or_default().into_bytes();
                        cleartext.push(0);
                        self.write_handshake_packet(&cleartext)?;
                        self.flush_write(effects);
                        Ok(())
                    } else {
                        Err(Error::Auth(
                            "caching_sha2_password full authentication requires TLS".to_string(),
                        ))
                    }
                }
            },
            _ => Err(Error::InvalidPacket),
        }
    }

    fn stream_is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            matches!(self.stream, NetStream::Tls(_))
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    fn finish_authentication(&mut self, effects: &mut Vec<Effect>) {
        self.auth = None;
        self.state = ConnState::Idle;
        debug!("authenticated");

        if let Some(init) = self.opts.init_command.clone() {
            let (_, resolver) = Promise::<QueryResult>::pending_with(&self.handle);
            let mut payload = Vec::with_capacity(1 + init.len());
            protocol_command::write_query(&mut payload, &init);
            self.queue.push_back(QueuedCommand {
                payload,
                driver: Box::new(QueryDriver::text(resolver)),
                quit: false,
            });
        }

        if let Some(resolver) = self.connect_resolver.take() {
            if let Some(inner) = self.self_ref.upgrade() {
                resolver.resolve(Conn { inner });
            } else {
                resolver.reject(Error::ConnectionLost);
            }
        }
        self.pump_queue(effects);
    }

    // ---- command queue ---------------------------------------------------

    fn pump_queue(&mut self, effects: &mut Vec<Effect>) {
        while self.state == ConnState::Idle && self.current.is_none() {
            let Some(command) = self.queue.pop_front() else {
                return;
            };
            self.next_seq = 0;
            if let Err(err) = write_frame(&mut self.write_buf, &command.payload, 0) {
                command.driver.fail(err);
                continue;
            }
            self.state = ConnState::Busy;
            self.current = Some(CurrentCommand {
                driver: command.driver,
                quit: command.quit,
            });
            self.flush_write(effects);
            return;
        }
    }

    fn write_handshake_packet(&mut self, payload: &[u8]) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(1);
        write_frame(&mut self.write_buf, payload, seq)
    }

    /// Reject the in-flight command, the queue and any pending connect, then
    /// tear the connection down.
    fn fail_all(&mut self, err: Error, effects: &mut Vec<Effect>) {
        if self.state == ConnState::Disconnected && self.broken {
            return;
        }
        debug!(%err, "connection failed");
        self.broken = true;

        if let Some(resolver) = self.connect_resolver.take() {
            resolver.reject(err.clone());
        }
        if let Some(current) = self.current.take() {
            current.driver.fail(err.clone());
        }
        while let Some(command) = self.queue.pop_front() {
            command.driver.fail(err.clone());
        }
        effects.push(Effect::Teardown);
        effects.push(Effect::NotifyDisconnect);
    }

}

fn open_stream(opts: &Opts) -> Result<TcpStream> {
    if opts.host.is_empty() {
        return Err(Error::BadConfig("missing host".to_string()));
    }
    let mut addrs = (opts.host.as_str(), opts.port)
        .to_socket_addrs()
        .map_err(|e| Error::BadConfig(format!("failed to resolve {}: {e}", opts.host)))?;
    let addr = addrs
        .next()
        .ok_or_else(|| Error::BadConfig(format!("no addresses for {}", opts.host)))?;
    let stream = TcpStream::connect(addr)?;
    if opts.tcp_nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(stream)
}
