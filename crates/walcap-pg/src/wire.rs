//! Replication connection over the PostgreSQL wire protocol.
//!
//! Opens a `replication=database` session over TCP (optionally TLS),
//! authenticates, runs replication commands through the simple query
//! protocol and then streams COPY-both data.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::message::backend::{self, ErrorFields};
use postgres_protocol::message::frontend;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::connect::tls_client_config;
use crate::conninfo::ConnInfo;
use crate::error::{PgError, PgResult};
use crate::replication::lsn::Lsn;
use crate::replication::slot::{create_slot_command, find_slot_query, start_replication_command};
use crate::replication::transport::{
    Frame, ReceiveError, ReplicationCommands, ReplicationSlot, ReplicationTransport, ServerError,
    ShutdownHandle, SlotInfo, SystemIdentification,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_MESSAGE_LEN: usize = 1 << 30;
const APPLICATION_NAME: &str = "walcap";

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// A backend message. CopyBothResponse is handled here because the
/// protocol crate's parser does not know the tag.
enum Backend {
    CopyBothResponse,
    Message(backend::Message),
}

/// One row of a simple query result; `None` is SQL NULL.
type TextRow = Vec<Option<String>>;

pub struct PgWireTransport {
    stream: Box<dyn Io>,
    read_buf: BytesMut,
    shutdown: ShutdownHandle,
    closed: bool,
}

impl PgWireTransport {
    /// Connect and authenticate a replication connection.
    pub async fn connect(connection_string: &str) -> PgResult<Self> {
        let info = ConnInfo::parse(connection_string)?;
        info!(
            host = %info.host,
            port = info.port,
            user = %info.user,
            database = %info.database,
            tls = info.ssl_mode.requires_tls(),
            "Opening replication connection"
        );

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((info.host.as_str(), info.port)))
            .await
            .map_err(|_| PgError::Connection(format!("timed out connecting to {}", info.host)))?
            .map_err(|e| PgError::Connection(format!("{}:{}: {}", info.host, info.port, e)))?;
        tcp.set_nodelay(true)?;

        let stream: Box<dyn Io> = if info.ssl_mode.requires_tls() {
            Box::new(negotiate_tls(tcp, &info.host).await?)
        } else {
            Box::new(tcp)
        };

        let mut transport = Self {
            stream,
            read_buf: BytesMut::with_capacity(64 * 1024),
            shutdown: ShutdownHandle::new(),
            closed: false,
        };
        transport.startup(&info).await?;
        Ok(transport)
    }

    /// Handle that closes this connection from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    async fn startup(&mut self, info: &ConnInfo) -> PgResult<()> {
        let mut buf = BytesMut::new();
        frontend::startup_message(startup_params(info), &mut buf)?;
        self.write(&buf).await?;

        let mut scram: Option<ScramSha256> = None;
        loop {
            let message = match self.next_backend().await.map_err(command_error)? {
                Backend::Message(m) => m,
                Backend::CopyBothResponse => {
                    return Err(PgError::Connection("unexpected CopyBothResponse".into()))
                }
            };

            let mut buf = BytesMut::new();
            match message {
                backend::Message::AuthenticationOk => debug!("Authentication successful"),
                backend::Message::AuthenticationCleartextPassword => {
                    frontend::password_message(password(info)?.as_bytes(), &mut buf)?;
                    self.write(&buf).await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let hash = md5_hash(info.user.as_bytes(), password(info)?.as_bytes(), body.salt());
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                    self.write(&buf).await?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        supported |= mechanism == SCRAM_SHA_256;
                    }
                    if !supported {
                        return Err(PgError::Authentication(
                            "server offered no supported SASL mechanism".into(),
                        ));
                    }
                    let client =
                        ScramSha256::new(password(info)?.as_bytes(), ChannelBinding::unsupported());
                    frontend::sasl_initial_response(SCRAM_SHA_256, client.message(), &mut buf)?;
                    self.write(&buf).await?;
                    scram = Some(client);
                }
                backend::Message::AuthenticationSaslContinue(body) => {
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Authentication("unexpected SASL continue".into()))?;
                    client
                        .update(body.data())
                        .map_err(|e| PgError::Authentication(e.to_string()))?;
                    frontend::sasl_response(client.message(), &mut buf)?;
                    self.write(&buf).await?;
                }
                backend::Message::AuthenticationSaslFinal(body) => {
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Authentication("unexpected SASL final".into()))?;
                    client
                        .finish(body.data())
                        .map_err(|e| PgError::Authentication(e.to_string()))?;
                }
                backend::Message::ErrorResponse(body) => {
                    let error = server_error(body.fields())?;
                    return Err(PgError::Authentication(error.to_string()));
                }
                backend::Message::ReadyForQuery(_) => {
                    debug!("Replication connection ready");
                    return Ok(());
                }
                backend::Message::ParameterStatus(_)
                | backend::Message::BackendKeyData(_)
                | backend::Message::NoticeResponse(_) => {}
                _ => {
                    return Err(PgError::Connection(
                        "unexpected message during startup".into(),
                    ))
                }
            }
        }
    }

    /// Run one statement through the simple query protocol and collect its
    /// rows as text.
    async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<TextRow>> {
        debug!(query = %sql, "Simple query");
        let mut buf = BytesMut::new();
        frontend::query(sql, &mut buf)?;
        self.write(&buf).await?;

        let mut rows = Vec::new();
        let mut error = None;
        loop {
            match self.next_backend().await.map_err(command_error)? {
                Backend::Message(backend::Message::DataRow(body)) => {
                    let mut row = Vec::new();
                    let mut ranges = body.ranges();
                    while let Some(range) = ranges.next()? {
                        row.push(range.map(|r| {
                            String::from_utf8_lossy(&body.buffer()[r]).into_owned()
                        }));
                    }
                    rows.push(row);
                }
                Backend::Message(backend::Message::ErrorResponse(body)) => {
                    error = Some(server_error(body.fields())?);
                }
                Backend::Message(backend::Message::ReadyForQuery(_)) => break,
                Backend::CopyBothResponse => {
                    return Err(PgError::Replication(
                        "unexpected CopyBothResponse to simple query".into(),
                    ))
                }
                // RowDescription, CommandComplete, notices
                Backend::Message(_) => {}
            }
        }

        match error {
            Some(e) => Err(PgError::Postgres(e.to_string())),
            None => Ok(rows),
        }
    }

    /// Next complete backend message, reading from the socket as needed.
    ///
    /// Cancel safe: partial messages stay in `read_buf`.
    async fn next_backend(&mut self) -> Result<Backend, ReceiveError> {
        loop {
            if let Some(message) = self.parse_buffered()? {
                return Ok(message);
            }
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                self.closed = true;
                return Err(ReceiveError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )));
            }
        }
    }

    fn parse_buffered(&mut self) -> Result<Option<Backend>, ReceiveError> {
        if self.read_buf.len() < 5 {
            return Ok(None);
        }

        let tag = self.read_buf[0];
        let len = i32::from_be_bytes([
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
            self.read_buf[4],
        ]);
        let len = usize::try_from(len)
            .ok()
            .filter(|l| (4..=MAX_MESSAGE_LEN).contains(l))
            .ok_or_else(|| ReceiveError::Protocol(format!("invalid message length {}", len)))?;

        let total = 1 + len;
        if self.read_buf.len() < total {
            self.read_buf.reserve(total - self.read_buf.len());
            return Ok(None);
        }

        if tag == b'W' {
            self.read_buf.advance(total);
            return Ok(Some(Backend::CopyBothResponse));
        }

        match backend::Message::parse(&mut self.read_buf) {
            Ok(Some(message)) => Ok(Some(Backend::Message(message))),
            Ok(None) => Ok(None),
            Err(e) => Err(ReceiveError::Protocol(format!(
                "message '{}': {}",
                tag as char, e
            ))),
        }
    }

    async fn write(&mut self, data: &[u8]) -> PgResult<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Leave COPY mode and terminate the session. Best effort.
    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut buf = BytesMut::new();
        frontend::copy_done(&mut buf);
        frontend::terminate(&mut buf);
        if let Err(e) = self.write(&buf).await {
            debug!(error = %e, "Failed to send terminate");
        }
        let _ = self.stream.shutdown().await;
        info!("Replication connection closed");
    }
}

#[async_trait]
impl ReplicationTransport for PgWireTransport {
    async fn receive_frame(&mut self, deadline: Instant) -> Result<Frame, ReceiveError> {
        if self.closed {
            return Err(ReceiveError::Closed);
        }

        let shutdown = self.shutdown.clone();
        let received = tokio::select! {
            _ = shutdown.triggered() => None,
            result = timeout_at(deadline, self.next_backend()) => Some(result),
        };

        let message = match received {
            None => {
                self.close().await;
                return Err(ReceiveError::Closed);
            }
            Some(Err(_elapsed)) => return Err(ReceiveError::Timeout),
            Some(Ok(result)) => result?,
        };

        let frame = match message {
            Backend::Message(backend::Message::CopyData(body)) => Frame::CopyData(body.into_bytes()),
            Backend::Message(backend::Message::CopyDone) => Frame::CopyDone,
            Backend::Message(backend::Message::ErrorResponse(body)) => Frame::Error(
                server_error(body.fields()).map_err(|e| ReceiveError::Protocol(e.to_string()))?,
            ),
            Backend::Message(backend::Message::NoticeResponse(body)) => {
                match server_error(body.fields()) {
                    Ok(notice) => warn!(notice = %notice, "Server notice"),
                    Err(e) => warn!(error = %e, "Unreadable server notice"),
                }
                Frame::Other("NoticeResponse".into())
            }
            Backend::Message(backend::Message::ParameterStatus(_)) => {
                Frame::Other("ParameterStatus".into())
            }
            Backend::Message(_) => Frame::Other("unexpected backend message".into()),
            Backend::CopyBothResponse => Frame::Other("CopyBothResponse".into()),
        };
        Ok(frame)
    }

    async fn send_copy_data(&mut self, data: Bytes) -> PgResult<()> {
        if self.closed {
            return Err(PgError::ConnectionClosed);
        }
        let mut buf = BytesMut::new();
        frontend::CopyData::new(data)?.write(&mut buf);
        self.write(&buf).await
    }
}

#[async_trait]
impl ReplicationCommands for PgWireTransport {
    async fn identify_system(&mut self) -> PgResult<SystemIdentification> {
        let rows = self
            .simple_query("IDENTIFY_SYSTEM")
            .await
            .map_err(|e| PgError::IdentifySystem(e.to_string()))?;

        let row = match rows.as_slice() {
            [row] if row.len() >= 4 => row,
            _ => {
                return Err(PgError::IdentifySystem(format!(
                    "expected one row of four columns, got {:?}",
                    rows
                )))
            }
        };

        let field = |i: usize, name: &str| {
            row[i]
                .clone()
                .ok_or_else(|| PgError::IdentifySystem(format!("{} is null", name)))
        };

        let timeline = field(1, "timeline")?;
        let xlog_pos = field(2, "xlogpos")?;
        Ok(SystemIdentification {
            system_id: field(0, "systemid")?,
            timeline: timeline
                .parse()
                .map_err(|_| PgError::IdentifySystem(format!("invalid timeline '{}'", timeline)))?,
            xlog_pos: xlog_pos
                .parse()
                .map_err(|_| PgError::IdentifySystem(format!("invalid xlogpos '{}'", xlog_pos)))?,
            dbname: row[3].clone().unwrap_or_default(),
        })
    }

    async fn find_slot(&mut self, name: &str) -> PgResult<Option<SlotInfo>> {
        let rows = self.simple_query(&find_slot_query(name)).await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        let mut columns = row.into_iter();
        let slot_name = columns.next().flatten().unwrap_or_else(|| name.to_string());
        let plugin = columns.next().flatten();
        let confirmed_flush = columns
            .next()
            .flatten()
            .map(|l| l.parse::<Lsn>())
            .transpose()?;
        let temporary = columns.next().flatten().as_deref() == Some("t");

        Ok(Some(SlotInfo {
            name: slot_name,
            plugin,
            confirmed_flush,
            temporary,
        }))
    }

    async fn create_slot(&mut self, slot: &ReplicationSlot) -> PgResult<()> {
        self.simple_query(&create_slot_command(slot))
            .await
            .map_err(|e| PgError::SlotCreationFailed(e.to_string()))?;
        Ok(())
    }

    async fn start_replication(
        &mut self,
        slot: &str,
        start: Lsn,
        options: &[String],
    ) -> PgResult<()> {
        let mut buf = BytesMut::new();
        frontend::query(&start_replication_command(slot, start, options), &mut buf)?;
        self.write(&buf).await?;

        loop {
            match self.next_backend().await.map_err(command_error)? {
                Backend::CopyBothResponse => {
                    info!(slot = %slot, lsn = %start, "Entered CopyBoth mode");
                    return Ok(());
                }
                Backend::Message(backend::Message::ErrorResponse(body)) => {
                    let error = server_error(body.fields())?;
                    return Err(PgError::StartReplication(error.to_string()));
                }
                Backend::Message(backend::Message::NoticeResponse(_)) => {}
                Backend::Message(_) => {
                    return Err(PgError::StartReplication(
                        "unexpected response to START_REPLICATION".into(),
                    ))
                }
            }
        }
    }
}

async fn negotiate_tls(
    mut tcp: TcpStream,
    host: &str,
) -> PgResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut buf = BytesMut::new();
    frontend::ssl_request(&mut buf);
    tcp.write_all(&buf).await?;

    match tcp.read_u8().await? {
        b'S' => {}
        b'N' => return Err(PgError::Tls("server does not support TLS".into())),
        other => {
            return Err(PgError::Tls(format!(
                "unexpected SSLRequest response '{}'",
                other as char
            )))
        }
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| PgError::Tls(format!("invalid server name: {}", host)))?;
    let connector = TlsConnector::from(Arc::new(tls_client_config()?));
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| PgError::Tls(format!("handshake failed: {}", e)))
}

/// Tuple values arrive in the server's text output, so pin the styles the
/// date and interval decoders parse.
fn startup_params(info: &ConnInfo) -> [(&str, &str); 6] {
    [
        ("user", info.user.as_str()),
        ("database", info.database.as_str()),
        ("replication", "database"),
        ("application_name", APPLICATION_NAME),
        ("DateStyle", "ISO"),
        ("IntervalStyle", "postgres"),
    ]
}

fn password(info: &ConnInfo) -> PgResult<&str> {
    info.password
        .as_deref()
        .ok_or_else(|| PgError::Authentication("password required but not provided".into()))
}

fn server_error(mut fields: ErrorFields<'_>) -> PgResult<ServerError> {
    let mut error = ServerError::default();
    while let Some(field) = fields.next()? {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => error.severity = value,
            b'C' => error.code = value,
            b'M' => error.message = value,
            b'D' => error.detail = Some(value),
            _ => {}
        }
    }
    Ok(error)
}

fn command_error(e: ReceiveError) -> PgError {
    match e {
        ReceiveError::Closed => PgError::ConnectionClosed,
        ReceiveError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => PgError::ConnectionClosed,
        ReceiveError::Io(e) => PgError::Io(e),
        ReceiveError::Protocol(msg) => PgError::Replication(msg),
        ReceiveError::Timeout => PgError::Connection("timed out".into()),
    }
}
