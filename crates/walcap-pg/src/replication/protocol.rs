//! Messages carried inside CopyData frames on a streaming replication
//! connection.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-replication.html

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::lsn::Lsn;
use crate::error::{PgError, PgResult};

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;
const XLOG_HEADER_LEN: usize = 1 + 8 + 8 + 8;
const STATUS_UPDATE_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// Primary keepalive message ('k').
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryKeepalive {
    pub wal_end: Lsn,
    pub server_time: i64,
    pub reply_requested: bool,
}

/// WAL data message ('w').
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub server_time: i64,
    pub payload: Bytes,
}

impl XLogData {
    /// Position just past this chunk's payload.
    pub fn end_position(&self) -> PgResult<Lsn> {
        self.wal_start.checked_add(self.payload.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyDataMessage {
    Keepalive(PrimaryKeepalive),
    XLogData(XLogData),
    Unknown(u8),
}

/// Parse the body of a CopyData frame received during streaming.
pub fn parse_copy_data(data: &Bytes) -> PgResult<CopyDataMessage> {
    match data.first() {
        None => Err(PgError::MalformedFrame("empty CopyData".into())),
        Some(b'k') => parse_keepalive(data).map(CopyDataMessage::Keepalive),
        Some(b'w') => parse_xlog_data(data).map(CopyDataMessage::XLogData),
        Some(&other) => Ok(CopyDataMessage::Unknown(other)),
    }
}

pub fn parse_keepalive(data: &[u8]) -> PgResult<PrimaryKeepalive> {
    if data.len() < KEEPALIVE_LEN {
        return Err(PgError::MalformedFrame(format!(
            "keepalive needs {} bytes, got {}",
            KEEPALIVE_LEN,
            data.len()
        )));
    }

    let mut buf = &data[1..];
    let wal_end = Lsn::new(buf.get_u64());
    let server_time = buf.get_i64();
    let reply_requested = buf.get_u8() == 1;

    Ok(PrimaryKeepalive {
        wal_end,
        server_time,
        reply_requested,
    })
}

pub fn parse_xlog_data(data: &Bytes) -> PgResult<XLogData> {
    if data.len() < XLOG_HEADER_LEN {
        return Err(PgError::MalformedFrame(format!(
            "XLogData header needs {} bytes, got {}",
            XLOG_HEADER_LEN,
            data.len()
        )));
    }

    let mut header = &data[1..XLOG_HEADER_LEN];
    let wal_start = Lsn::new(header.get_u64());
    let wal_end = Lsn::new(header.get_u64());
    let server_time = header.get_i64();

    Ok(XLogData {
        wal_start,
        wal_end,
        server_time,
        payload: data.slice(XLOG_HEADER_LEN..),
    })
}

/// Standby status update ('r'). Write, flush and apply all report the
/// same confirmed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub position: Lsn,
    pub client_time: i64,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    pub fn new(position: Lsn) -> Self {
        Self {
            position,
            client_time: pg_timestamp_now(),
            reply_requested: false,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATUS_UPDATE_LEN);
        buf.put_u8(b'r');
        buf.put_u64(self.position.as_u64()); // written
        buf.put_u64(self.position.as_u64()); // flushed
        buf.put_u64(self.position.as_u64()); // applied
        buf.put_i64(self.client_time);
        buf.put_u8(u8::from(self.reply_requested));
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> PgResult<Self> {
        if data.len() < STATUS_UPDATE_LEN || data[0] != b'r' {
            return Err(PgError::MalformedFrame("not a standby status update".into()));
        }
        let mut buf = &data[1..];
        let position = Lsn::new(buf.get_u64());
        buf.advance(16);
        let client_time = buf.get_i64();
        let reply_requested = buf.get_u8() == 1;
        Ok(Self {
            position,
            client_time,
            reply_requested,
        })
    }
}

/// Current time in microseconds since 2000-01-01 00:00:00 UTC.
pub fn pg_timestamp_now() -> i64 {
    let unix_micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Convert a PostgreSQL timestamp (microseconds since 2000-01-01) to UTC.
pub fn pg_timestamp_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    let unix_micros = micros.checked_add(PG_EPOCH_OFFSET_SECS * 1_000_000)?;
    DateTime::from_timestamp_micros(unix_micros)
}
