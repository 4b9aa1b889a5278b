use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt, StreamExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{
    ClientInfo, ClientPortalStore, ErrorHandler, NoopHandler, PgWireConnectionState,
    PgWireServerHandlers, Type,
};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::server::{negotiate_tls, process_error, process_message};
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::ascii::DEFAULT_COLUMN_WIDTH;
use crate::auth::SlotdAuthSource;
use crate::engine::{ChangeAction, Engine, EngineError};
use crate::model::*;
use crate::notify::{owner_channel, Notification, SCHEDULE_CHANNEL};
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Backend process id reported in NotificationResponse messages.
static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// Notifications queued for one connection before the client reads them.
const NOTIFY_QUEUE_DEPTH: usize = 1024;
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

type Delivery = (String, Notification);

/// Query handler of one connection. Every LISTEN spawns a task that forwards
/// the channel into the connection's delivery queue.
pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
    deliveries: mpsc::Sender<Delivery>,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, deliveries: mpsc::Sender<Delivery>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
            deliveries,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Run one command and record its metrics.
    async fn run(
        &self,
        engine: &Engine,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!(command = label, "query failed: {e}");
        }
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::ConfigureConference {
                timezone,
                default_duration,
            } => {
                engine
                    .configure_conference(timezone, default_duration)
                    .await
                    .map_err(engine_err)?;
                Ok(execution("UPDATE", 1))
            }
            Command::InsertOwner {
                kind,
                id,
                name,
                position,
            } => {
                engine
                    .create_owner(id, kind, name, position)
                    .await
                    .map_err(engine_err)?;
                Ok(execution("INSERT", 1))
            }
            Command::DeleteOwner { kind, id } => {
                engine.delete_owner(id, kind).await.map_err(engine_err)?;
                Ok(execution("DELETE", 1))
            }
            Command::InsertSubmission { submission } => {
                engine.save_submission(submission).await.map_err(engine_err)?;
                Ok(execution("INSERT", 1))
            }
            Command::UpdateSubmissionState { id, state } => {
                engine
                    .set_submission_state(id, state)
                    .await
                    .map_err(engine_err)?;
                Ok(execution("UPDATE", 1))
            }
            Command::InsertAvailability {
                id,
                owner_id,
                start,
                end,
            } => {
                engine
                    .add_availability(id, owner_id, span(start, end)?)
                    .await
                    .map_err(engine_err)?;
                Ok(execution("INSERT", 1))
            }
            Command::BatchInsertAvailabilities { entries } => {
                let count = entries.len();
                let batch = entries
                    .into_iter()
                    .map(|(id, owner_id, start, end)| Ok((id, owner_id, span(start, end)?)))
                    .collect::<PgWireResult<Vec<_>>>()?;
                engine
                    .batch_add_availabilities(batch)
                    .await
                    .map_err(engine_err)?;
                Ok(execution("INSERT", count))
            }
            Command::DeleteAvailability { id } => {
                engine.remove_availability(id).await.map_err(engine_err)?;
                Ok(execution("DELETE", 1))
            }
            Command::InsertSlot { slot } => {
                engine.place_slot(slot).await.map_err(engine_err)?;
                Ok(execution("INSERT", 1))
            }
            Command::UpdateSlot { id, patch } => {
                engine.update_slot(id, &patch).await.map_err(engine_err)?;
                Ok(execution("UPDATE", 1))
            }
            Command::DeleteSlot { id } => {
                engine.remove_slot(id).await.map_err(engine_err)?;
                Ok(execution("DELETE", 1))
            }
            Command::Freeze {
                version,
                comment,
                notify,
            } => {
                engine
                    .freeze(&version, comment, notify)
                    .await
                    .map_err(engine_err)?;
                Ok(execution("INSERT", 1))
            }
            Command::Unfreeze { version } => {
                let slots = engine.unfreeze(&version).await.map_err(engine_err)?;
                Ok(execution("UPDATE", slots))
            }
            Command::SelectConference => {
                let config = engine.conference_config().await;
                rows("conference", format, [config], |enc, c| {
                    enc.encode_field(&c.timezone)?;
                    enc.encode_field(&c.default_duration)
                })
            }
            Command::SelectOwners { kind } => {
                let table = match kind {
                    OwnerKind::Room => "rooms",
                    OwnerKind::Speaker => "speakers",
                };
                rows(table, format, engine.list_owners(Some(kind)).await, |enc, o| {
                    enc.encode_field(&o.id.to_string())?;
                    enc.encode_field(&o.name)?;
                    enc.encode_field(&i64::from(o.position))?;
                    enc.encode_field(&(o.availability_count as i64))
                })
            }
            Command::SelectSubmissions => {
                rows("submissions", format, engine.list_submissions().await, |enc, s| {
                    let speakers: Vec<String> = s.speakers.iter().map(Ulid::to_string).collect();
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.title)?;
                    enc.encode_field(&s.state.as_str().to_string())?;
                    enc.encode_field(&speakers.join(","))?;
                    enc.encode_field(&s.duration)
                })
            }
            Command::SelectSchedules => {
                rows("schedules", format, engine.list_schedules().await, |enc, s| {
                    enc.encode_field(&s.version.as_deref().unwrap_or("wip").to_string())?;
                    enc.encode_field(&s.published)?;
                    enc.encode_field(&s.comment)?;
                    enc.encode_field(&(s.slot_count as i64))
                })
            }
            Command::SelectSlots { version } => {
                let slots = engine.get_slots(&version).await.map_err(engine_err)?;
                rows("slots", format, slots, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.submission_id.map(|u| u.to_string()))?;
                    enc.encode_field(&s.room_id.map(|u| u.to_string()))?;
                    enc.encode_field(&s.start)?;
                    enc.encode_field(&s.end)?;
                    enc.encode_field(&s.description)?;
                    enc.encode_field(&s.is_visible)
                })
            }
            Command::SelectAvailability {
                owner_id,
                start,
                end,
                min_duration,
            } => {
                let spans = engine
                    .compute_availability(owner_id, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;
                let owner = owner_id.to_string();
                rows("availability", format, spans, |enc, s| {
                    enc.encode_field(&owner)?;
                    enc.encode_field(&s.start)?;
                    enc.encode_field(&s.end)
                })
            }
            Command::SelectCommonAvailability {
                owner_ids,
                start,
                end,
                min_duration,
            } => {
                let spans = engine
                    .compute_common_availability(&owner_ids, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;
                rows("common_availability", format, spans, |enc, s| {
                    enc.encode_field(&s.start)?;
                    enc.encode_field(&s.end)
                })
            }
            Command::SelectFreeTime {
                room_id,
                start,
                end,
                min_duration,
            } => {
                let spans = engine
                    .compute_free_time(room_id, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;
                let room = room_id.to_string();
                rows("free_time", format, spans, |enc, s| {
                    enc.encode_field(&room)?;
                    enc.encode_field(&s.start)?;
                    enc.encode_field(&s.end)
                })
            }
            Command::SelectChanges { version, base } => {
                let changes = engine
                    .schedule_changes(&version, base.as_ref())
                    .await
                    .map_err(engine_err)?;
                let action = match changes.action {
                    ChangeAction::Create => "create",
                    ChangeAction::Update => "update",
                }
                .to_string();
                let mut entries: Vec<(&str, &TalkSlot, Option<&TalkSlot>)> = Vec::new();
                entries.extend(changes.new_talks.iter().map(|s| ("new", s, None)));
                entries.extend(changes.canceled_talks.iter().map(|s| ("canceled", s, None)));
                entries.extend(changes.moved_talks.iter().map(|m| ("moved", &m.new, Some(&m.old))));
                rows("changes", format, entries, |enc, (change, slot, old)| {
                    enc.encode_field(&action)?;
                    enc.encode_field(&change.to_string())?;
                    enc.encode_field(&slot.submission_id.map(|u| u.to_string()))?;
                    enc.encode_field(&slot.id.to_string())?;
                    enc.encode_field(&slot.room_id.map(|u| u.to_string()))?;
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)?;
                    enc.encode_field(&old.and_then(|o| o.room_id).map(|u| u.to_string()))?;
                    enc.encode_field(&old.and_then(|o| o.start))
                })
            }
            Command::SelectNotifications { version } => {
                let notifications = engine.notifications(&version).await.map_err(engine_err)?;
                let payloads = notifications
                    .into_iter()
                    .map(|(speaker, n)| Ok((speaker.to_string(), n.to_payload().map_err(api_err)?)))
                    .collect::<PgWireResult<Vec<_>>>()?;
                rows("notifications", format, payloads, |enc, (speaker, payload)| {
                    enc.encode_field(&speaker)?;
                    enc.encode_field(&payload)
                })
            }
            Command::SelectWarnings { version } => {
                let warnings = engine.warnings(&version).await.map_err(engine_err)?;
                rows("warnings", format, warnings, |enc, w| {
                    enc.encode_field(&w.slot_id.to_string())?;
                    enc.encode_field(&w.submission_id.map(|u| u.to_string()))?;
                    enc.encode_field(&w.kind.as_str().to_string())?;
                    enc.encode_field(&w.owner_id.map(|u| u.to_string()))?;
                    enc.encode_field(&w.message)
                })
            }
            Command::SelectTimetable {
                version,
                format: layout,
                width,
            } => {
                let lines = engine
                    .timetable(&version, layout, width.unwrap_or(DEFAULT_COLUMN_WIDTH))
                    .await
                    .map_err(engine_err)?;
                rows("timetable", format, lines, |enc, line| enc.encode_field(&line))
            }
            Command::Listen { channel } => {
                let channel = canonical_channel(&channel)?;
                let mut listeners = self.listeners.lock().await;
                // A finished forwarder means the channel closed; subscribe afresh.
                if listeners.get(&channel).is_none_or(|task| task.is_finished()) {
                    let rx = engine.notify.subscribe(&channel);
                    let task = forward(channel.clone(), rx, self.deliveries.clone());
                    listeners.insert(channel, task);
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let channel = canonical_channel(&channel)?;
                if let Some(task) = self.listeners.lock().await.remove(&channel) {
                    task.abort();
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                for (_, task) in self.listeners.lock().await.drain() {
                    task.abort();
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    async fn is_listening(&self, channel: &str) -> bool {
        self.listeners.lock().await.contains_key(channel)
    }
}

impl Drop for SlotdHandler {
    fn drop(&mut self) {
        for task in self.listeners.get_mut().values() {
            task.abort();
        }
    }
}

/// Move one channel's notifications into the connection's delivery queue.
fn forward(
    channel: String,
    mut rx: broadcast::Receiver<Notification>,
    deliveries: mpsc::Sender<Delivery>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    if deliveries.send((channel.clone(), notification)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%channel, skipped, "listener lagged, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// `schedule`, `room_{id}` or `speaker_{id}`, with the ULID normalised.
fn canonical_channel(channel: &str) -> PgWireResult<String> {
    let lower = channel.to_ascii_lowercase();
    if lower == SCHEDULE_CHANNEL {
        return Ok(SCHEDULE_CHANNEL.to_string());
    }
    let (kind, id) = if let Some(id) = lower.strip_prefix("room_") {
        (OwnerKind::Room, id)
    } else if let Some(id) = lower.strip_prefix("speaker_") {
        (OwnerKind::Speaker, id)
    } else {
        return Err(channel_err(format!(
            "invalid channel: {channel} (expected schedule, room_{{id}} or speaker_{{id}})"
        )));
    };
    let id = Ulid::from_string(id).map_err(|e| channel_err(format!("bad ULID in channel: {e}")))?;
    Ok(owner_channel(kind, id))
}

fn span(start: Ms, end: Ms) -> PgWireResult<Span> {
    Span::try_new(start, end).ok_or_else(|| engine_err(EngineError::InvalidSpan { start, end }))
}

fn execution(tag: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

/// Encode `items` as a result set of `table`.
fn rows<T, I, F>(table: &str, format: Option<&Format>, items: I, mut encode: F) -> PgWireResult<Response>
where
    I: IntoIterator<Item = T>,
    F: FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
{
    let schema = Arc::new(result_schema(table, format));
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Column layout of every readable table.
fn result_schema(table: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    let columns: Vec<(&str, Type)> = match table {
        "conference" => vec![("timezone", Type::VARCHAR), ("default_duration", Type::INT8)],
        "rooms" | "speakers" => vec![
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("position", Type::INT8),
            ("availability_count", Type::INT8),
        ],
        "submissions" => vec![
            ("id", Type::VARCHAR),
            ("title", Type::VARCHAR),
            ("state", Type::VARCHAR),
            ("speakers", Type::VARCHAR),
            ("duration", Type::INT8),
        ],
        "schedules" => vec![
            ("version", Type::VARCHAR),
            ("published", Type::INT8),
            ("comment", Type::VARCHAR),
            ("slot_count", Type::INT8),
        ],
        "slots" => vec![
            ("id", Type::VARCHAR),
            ("submission_id", Type::VARCHAR),
            ("room_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("description", Type::VARCHAR),
            ("is_visible", Type::BOOL),
        ],
        "availability" => vec![
            ("owner_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
        "common_availability" => vec![("start", Type::INT8), ("end", Type::INT8)],
        "free_time" => vec![
            ("room_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
        "changes" => vec![
            ("action", Type::VARCHAR),
            ("change", Type::VARCHAR),
            ("submission_id", Type::VARCHAR),
            ("slot_id", Type::VARCHAR),
            ("room_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("old_room_id", Type::VARCHAR),
            ("old_start", Type::INT8),
        ],
        "notifications" => vec![("speaker_id", Type::VARCHAR), ("payload", Type::VARCHAR)],
        "warnings" => vec![
            ("slot_id", Type::VARCHAR),
            ("submission_id", Type::VARCHAR),
            ("kind", Type::VARCHAR),
            ("owner_id", Type::VARCHAR),
            ("message", Type::VARCHAR),
        ],
        "timetable" => vec![("line", Type::VARCHAR)],
        _ => Vec::new(),
    };
    columns
        .into_iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
            FieldInfo::new(name.into(), None, None, ty, field_format)
        })
        .collect()
}

fn statement_schema(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    sql::select_table(sql)
        .map(|table| result_schema(&table, format))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            // The first failing statement ends the batch.
            match self.run(&engine, cmd, None).await {
                Ok(response) => responses.push(response),
                Err(PgWireError::UserError(info)) => {
                    responses.push(Response::Error(info));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd, Some(&portal.result_column_format))
            .await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement, None),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// Highest `$n` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute `$1`, `$2`, ... with the bound parameters as text literals.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so `$1` never clobbers the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(
        tenant_manager: Arc<TenantManager>,
        password: String,
        deliveries: mpsc::Sender<Delivery>,
    ) -> Self {
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager, deliveries)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler<Statement = String>> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes. Every connection gets its
/// own handler, and with it its own LISTEN state.
///
/// Client messages and LISTEN deliveries are multiplexed on one loop, so an
/// idle subscriber receives NotificationResponse as soon as it is published.
/// Deliveries wait while a query is in progress.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    let (deliveries, mut pending) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
    let factory = SlotdFactory::new(tenant_manager, password, deliveries);

    let startup_deadline = tokio::time::sleep(STARTUP_TIMEOUT);
    tokio::pin!(startup_deadline);
    let negotiated = tokio::select! {
        _ = &mut startup_deadline => return Ok(()),
        socket = negotiate_tls::<String>(socket, tls) => socket?,
    };
    // A direct TLS handshake without a configured acceptor.
    let Some(mut socket) = negotiated else {
        return Ok(());
    };

    let startup = factory.startup_handler();
    let simple = factory.simple_query_handler();
    let extended = factory.extended_query_handler();
    let copy = factory.copy_handler();
    let cancel = factory.cancel_handler();
    let errors = factory.error_handler();

    loop {
        let state = socket.state();
        let starting = matches!(
            state,
            PgWireConnectionState::AwaitingStartup | PgWireConnectionState::AuthenticationInProgress
        );
        let idle = matches!(state, PgWireConnectionState::ReadyForQuery);

        tokio::select! {
            _ = &mut startup_deadline, if starting => break,
            msg = socket.next() => {
                let Some(Ok(msg)) = msg else { break };
                let is_extended_query = match socket.state() {
                    PgWireConnectionState::CopyInProgress(in_extended) => in_extended,
                    _ => msg.is_extended_query(),
                };
                if let Err(mut e) = process_message(
                    msg,
                    &mut socket,
                    startup.clone(),
                    simple.clone(),
                    extended.clone(),
                    copy.clone(),
                    cancel.clone(),
                )
                .await
                {
                    errors.on_error(&socket, &mut e);
                    process_error(&mut socket, e, is_extended_query).await?;
                }
            }
            Some((channel, notification)) = pending.recv(), if idle => {
                // Deliveries queued before an UNLISTEN are dropped.
                if !factory.handler.is_listening(&channel).await {
                    continue;
                }
                let payload = notification.to_payload().map_err(api_err)?;
                socket
                    .send(PgWireBackendMessage::NotificationResponse(
                        NotificationResponse::new(pid, channel, payload),
                    ))
                    .await?;
                metrics::counter!(observability::NOTIFICATIONS_DELIVERED_TOTAL).increment(1);
            }
        }
    }
    Ok(())
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

fn channel_err(message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42000".into(),
        message,
    )))
}

fn api_err(e: serde_json::Error) -> PgWireError {
    PgWireError::ApiError(Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_normalised() {
        let id = Ulid::new();
        assert_eq!(canonical_channel("SCHEDULE").unwrap(), "schedule");
        assert_eq!(
            canonical_channel(&format!("speaker_{}", id.to_string().to_lowercase())).unwrap(),
            owner_channel(OwnerKind::Speaker, id)
        );
        assert_eq!(
            canonical_channel(&format!("room_{id}")).unwrap(),
            owner_channel(OwnerKind::Room, id)
        );
        assert!(canonical_channel("booth_1").is_err());
        assert!(canonical_channel("room_nope").is_err());
    }

    #[test]
    fn params_are_counted() {
        assert_eq!(count_params("SELECT * FROM rooms"), 0);
        assert_eq!(count_params("SELECT * FROM free_time WHERE room_id = $1 AND start >= $3"), 3);
        assert_eq!(count_params("x = $12"), 12);
    }

    #[test]
    fn schemas_follow_tables() {
        let names: Vec<String> = statement_schema("SELECT * FROM slots WHERE version = $1", None)
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(
            names,
            ["id", "submission_id", "room_id", "start", "end", "description", "is_visible"]
        );
        assert!(statement_schema("INSERT INTO rooms (id) VALUES ($1)", None).is_empty());
    }
}
