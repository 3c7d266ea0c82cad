//! The streaming session loop.
//!
//! One session owns one transport, one relation cache and one position
//! tracker. The only place it waits is `receive_frame`, whose deadline is
//! the next standby status update: a timeout is the cue to send one.

use std::io;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use walcap_core::{ChangeEvent, ChangeRecord, ChangeSink, RowMap, TableRef};

use super::lsn::Lsn;
use super::pgoutput::{PgOutputDecoder, PgOutputMessage, TupleData};
use super::protocol::{parse_copy_data, pg_timestamp_to_datetime, CopyDataMessage, StandbyStatusUpdate, XLogData};
use super::relation_cache::{RelationCache, RelationSchema};
use super::tracker::{PositionTracker, DEFAULT_STATUS_INTERVAL};
use super::transport::{Frame, OutputFormat, ReceiveError, ReplicationTransport, ServerError};
use super::tuple::{TupleDecoder, TupleError};
use super::wal2json::{decode_wal2json, Wal2JsonError};
use crate::error::{PgError, PgResult};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub status_interval: Duration,
    pub output_format: OutputFormat,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            status_interval: DEFAULT_STATUS_INTERVAL,
            output_format: OutputFormat::PgOutput,
        }
    }
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// The connection was shut down locally.
    Closed,
    /// The server left COPY mode.
    CopyDone,
    /// The server sent an ErrorResponse.
    ServerError(ServerError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub events: u64,
    pub skipped_rows: u64,
    pub skipped_messages: u64,
    /// Chunks that ended at or before the confirmed position.
    pub stale_chunks: u64,
    pub status_updates: u64,
}

pub struct ReplicationSession<T> {
    transport: T,
    config: SessionConfig,
    tracker: PositionTracker,
    relations: RelationCache,
    pgoutput: PgOutputDecoder,
    tuples: TupleDecoder,
    stats: SessionStats,
}

impl<T: ReplicationTransport> ReplicationSession<T> {
    /// A session over a transport already in streaming mode at `start`.
    pub fn new(transport: T, start: Lsn, config: SessionConfig) -> Self {
        Self {
            transport,
            tracker: PositionTracker::new(start, Instant::now(), config.status_interval),
            config,
            relations: RelationCache::new(),
            pgoutput: PgOutputDecoder::new(),
            tuples: TupleDecoder::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn confirmed_lsn(&self) -> Lsn {
        self.tracker.confirmed()
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Stream until the connection ends or a fatal error occurs.
    pub async fn run<S>(&mut self, sink: &mut S) -> PgResult<SessionEnd>
    where
        S: ChangeSink + Send + ?Sized,
    {
        info!(
            lsn = %self.tracker.confirmed(),
            format = %self.config.output_format,
            interval_secs = self.config.status_interval.as_secs(),
            "Streaming replication session started"
        );

        let result = self.run_loop(sink).await;
        let stats = self.stats;
        match &result {
            Ok(end) => info!(
                lsn = %self.tracker.confirmed(),
                end = ?end,
                events = stats.events,
                skipped_rows = stats.skipped_rows,
                skipped_messages = stats.skipped_messages,
                stale_chunks = stats.stale_chunks,
                status_updates = stats.status_updates,
                "Replication session ended"
            ),
            Err(e) => error!(
                lsn = %self.tracker.confirmed(),
                error = %e,
                events = stats.events,
                skipped_rows = stats.skipped_rows,
                skipped_messages = stats.skipped_messages,
                stale_chunks = stats.stale_chunks,
                status_updates = stats.status_updates,
                "Replication session failed"
            ),
        }
        result
    }

    async fn run_loop<S>(&mut self, sink: &mut S) -> PgResult<SessionEnd>
    where
        S: ChangeSink + Send + ?Sized,
    {
        loop {
            let now = Instant::now();
            if self.tracker.due_for_status_update(now) {
                self.send_status_update(now).await?;
            }

            let frame = match self.transport.receive_frame(self.tracker.next_deadline()).await {
                Ok(frame) => frame,
                Err(ReceiveError::Timeout) => continue,
                Err(ReceiveError::Closed) => return Ok(SessionEnd::Closed),
                Err(ReceiveError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(PgError::ConnectionClosed)
                }
                Err(ReceiveError::Io(e)) => return Err(PgError::Io(e)),
                Err(ReceiveError::Protocol(msg)) => return Err(PgError::MalformedFrame(msg)),
            };

            match frame {
                Frame::CopyData(data) => match parse_copy_data(&data)? {
                    CopyDataMessage::Keepalive(keepalive) => {
                        trace!(
                            wal_end = %keepalive.wal_end,
                            reply = keepalive.reply_requested,
                            "Primary keepalive"
                        );
                        if keepalive.reply_requested {
                            self.tracker.request_immediate_update(Instant::now());
                        }
                    }
                    CopyDataMessage::XLogData(xlog) => {
                        self.handle_xlog_data(&xlog, sink)?;
                        let end = xlog.end_position()?;
                        if !self.tracker.advance(end) {
                            warn!(
                                lsn = %end,
                                confirmed = %self.tracker.confirmed(),
                                "Chunk ends at or before the confirmed position"
                            );
                            self.stats.stale_chunks += 1;
                        }
                    }
                    CopyDataMessage::Unknown(tag) => {
                        warn!(
                            tag = %(tag as char),
                            lsn = %self.tracker.confirmed(),
                            "Ignoring unknown CopyData message"
                        );
                    }
                },
                Frame::CopyDone => {
                    info!(lsn = %self.tracker.confirmed(), "Server ended the COPY stream");
                    return Ok(SessionEnd::CopyDone);
                }
                Frame::Error(server_error) => {
                    warn!(
                        lsn = %self.tracker.confirmed(),
                        error = %server_error,
                        "Server reported an error, ending session"
                    );
                    return Ok(SessionEnd::ServerError(server_error));
                }
                Frame::Other(name) => {
                    debug!(message = %name, "Ignoring backend message");
                }
            }
        }
    }

    async fn send_status_update(&mut self, now: Instant) -> PgResult<()> {
        let position = self.tracker.confirmed();
        let update = StandbyStatusUpdate::new(position);
        self.transport
            .send_copy_data(update.encode())
            .await
            .map_err(|e| PgError::StatusSend(e.to_string()))?;

        self.tracker.on_status_sent(now, self.config.status_interval);
        self.stats.status_updates += 1;
        debug!(lsn = %position, "Sent standby status update");
        Ok(())
    }

    fn handle_xlog_data<S>(&mut self, xlog: &XLogData, sink: &mut S) -> PgResult<()>
    where
        S: ChangeSink + ?Sized,
    {
        match self.config.output_format {
            OutputFormat::PgOutput => match self.pgoutput.decode(&xlog.payload) {
                Ok(message) => self.dispatch(message, xlog.wal_start, sink),
                Err(e @ (PgError::UnknownMessageType(_) | PgError::PgOutput(_))) => {
                    warn!(lsn = %xlog.wal_start, error = %e, "Skipping undecodable logical message");
                    self.stats.skipped_messages += 1;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            OutputFormat::Wal2Json => match decode_wal2json(&xlog.payload, &self.tuples) {
                Ok(Some(event)) => self.emit(sink, xlog.wal_start, event),
                Ok(None) => Ok(()),
                Err(e @ Wal2JsonError::Malformed(_)) => {
                    warn!(lsn = %xlog.wal_start, error = %e, "Skipping undecodable wal2json payload");
                    self.stats.skipped_messages += 1;
                    Ok(())
                }
                Err(e @ Wal2JsonError::Row { .. }) => {
                    warn!(lsn = %xlog.wal_start, error = %e, "Rejecting row");
                    self.stats.skipped_rows += 1;
                    Ok(())
                }
            },
        }
    }

    fn dispatch<S>(&mut self, message: PgOutputMessage, lsn: Lsn, sink: &mut S) -> PgResult<()>
    where
        S: ChangeSink + ?Sized,
    {
        trace!(lsn = %lsn, kind = message.kind(), "Logical message");
        let event = match message {
            PgOutputMessage::Relation(relation) => {
                let schema = RelationSchema::from(relation);
                debug!(
                    lsn = %lsn,
                    relation_id = schema.relation_id,
                    relation = %schema.table_ref(),
                    columns = schema.columns.len(),
                    "Relation"
                );
                let event = ChangeEvent::SchemaChange {
                    relation_id: schema.relation_id,
                    relation: schema.table_ref(),
                    columns: schema.column_meta(),
                };
                self.relations.put(schema);
                event
            }
            PgOutputMessage::Begin(begin) => ChangeEvent::Begin {
                xid: begin.xid,
                final_lsn: begin.final_lsn,
                commit_time: pg_timestamp_to_datetime(begin.timestamp),
            },
            PgOutputMessage::Commit(commit) => ChangeEvent::Commit {
                commit_lsn: commit.commit_lsn,
                end_lsn: commit.end_lsn,
                commit_time: pg_timestamp_to_datetime(commit.timestamp),
            },
            PgOutputMessage::Insert(insert) => {
                let (relation, row) = self.materialize(insert.relation_id, &insert.tuple, lsn)?;
                match row {
                    Some(row) => ChangeEvent::Insert { relation, row },
                    None => return Ok(()),
                }
            }
            PgOutputMessage::Update(update) => {
                let (relation, after) =
                    match self.materialize(update.relation_id, &update.new_tuple, lsn)? {
                        (relation, Some(after)) => (relation, after),
                        (_, None) => return Ok(()),
                    };
                let before = match &update.old_tuple {
                    Some(old) => match self.materialize(update.relation_id, old, lsn)?.1 {
                        Some(before) => Some(before),
                        None => return Ok(()),
                    },
                    None => None,
                };
                ChangeEvent::Update {
                    relation,
                    before,
                    after,
                }
            }
            PgOutputMessage::Delete(delete) => {
                let (relation, before) =
                    self.materialize(delete.relation_id, &delete.old_tuple, lsn)?;
                match before {
                    Some(before) => ChangeEvent::Delete { relation, before },
                    None => return Ok(()),
                }
            }
            PgOutputMessage::Truncate(truncate) => {
                let relations = truncate
                    .relation_ids
                    .iter()
                    .map(|id| self.relations.get(*id).map(RelationSchema::table_ref))
                    .collect::<PgResult<Vec<TableRef>>>()
                    .inspect_err(|e| error!(lsn = %lsn, error = %e, "Truncate of unknown relation"))?;
                ChangeEvent::Truncate {
                    relations,
                    cascade: truncate.cascade(),
                    restart_identity: truncate.restart_identity(),
                }
            }
            PgOutputMessage::Type(ty) => {
                debug!(lsn = %lsn, type_id = ty.type_id, name = %ty.name, "Type");
                return Ok(());
            }
            PgOutputMessage::Origin(origin) => {
                debug!(lsn = %lsn, origin = %origin.origin_name, "Origin");
                return Ok(());
            }
            PgOutputMessage::Message(message) => {
                debug!(
                    lsn = %lsn,
                    prefix = %message.prefix,
                    len = message.content.len(),
                    "Logical decoding message"
                );
                return Ok(());
            }
        };

        self.emit(sink, lsn, event)
    }

    /// Turn a tuple into a named row using the cached schema.
    ///
    /// A missing relation or a column count mismatch is fatal. A column
    /// that fails to decode rejects the row (`None`), binary columns are
    /// left out.
    fn materialize(
        &mut self,
        relation_id: u32,
        tuple: &TupleData,
        lsn: Lsn,
    ) -> PgResult<(TableRef, Option<RowMap>)> {
        let schema = self
            .relations
            .get(relation_id)
            .inspect_err(|e| error!(lsn = %lsn, relation_id, error = %e, "Row change for unknown relation"))?;

        if tuple.columns.len() != schema.columns.len() {
            let err = PgError::ColumnCountMismatch {
                relation_id,
                expected: schema.columns.len(),
                actual: tuple.columns.len(),
            };
            error!(lsn = %lsn, relation_id, error = %err, "Tuple does not match cached schema");
            return Err(err);
        }

        let mut row = RowMap::new();
        for (column, value) in schema.columns.iter().zip(&tuple.columns) {
            match self.tuples.decode(value, column.type_oid) {
                Ok(decoded) => {
                    row.insert(column.name.clone(), decoded);
                }
                Err(e @ TupleError::BinaryUnsupported { .. }) => {
                    warn!(
                        lsn = %lsn,
                        relation_id,
                        column = %column.name,
                        error = %e,
                        "Omitting binary column"
                    );
                }
                Err(e) => {
                    warn!(
                        lsn = %lsn,
                        relation_id,
                        column = %column.name,
                        error = %e,
                        "Rejecting row"
                    );
                    self.stats.skipped_rows += 1;
                    return Ok((schema.table_ref(), None));
                }
            }
        }

        Ok((schema.table_ref(), Some(row)))
    }

    fn emit<S>(&mut self, sink: &mut S, lsn: Lsn, event: ChangeEvent) -> PgResult<()>
    where
        S: ChangeSink + ?Sized,
    {
        trace!(lsn = %lsn, kind = event.kind(), "Emitting change event");
        sink.accept(ChangeRecord::new(lsn.as_u64(), event))?;
        self.stats.events += 1;
        Ok(())
    }
}
