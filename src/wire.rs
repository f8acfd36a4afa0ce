use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use ulid::Ulid;

use crate::auth::SamayAuthSource;
use crate::engine::{now_local, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::policy::{authorize, Action, Actor, Resource};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Credentials shared by every connection.
#[derive(Debug, Clone)]
pub struct Access {
    pub password: String,
    /// Login name that acts as the built-in admin.
    pub admin_user: String,
}

struct Subscription {
    channel: String,
    rx: broadcast::Receiver<String>,
}

/// One per connection: LISTEN subscriptions live here.
pub struct SamayHandler {
    tenant_manager: Arc<TenantManager>,
    admin_user: String,
    query_parser: Arc<SamayQueryParser>,
    listening: Mutex<Vec<Subscription>>,
}

impl SamayHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, admin_user: String) -> Self {
        Self {
            tenant_manager,
            admin_user,
            query_parser: Arc::new(SamayQueryParser),
            listening: Mutex::new(Vec::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C, engine: &Engine) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        if user == self.admin_user {
            return Ok(Actor::system());
        }
        engine
            .find_user(&user)
            .map(|u| Actor::new(u.id, u.role))
            .ok_or_else(|| user_error("28000", format!("unknown user: {user}")))
    }

    /// Parse, run and record one statement, flushing pending notifications first.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let started = Instant::now();
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client, &engine)?;
        self.deliver_notifications(client).await?;

        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let result = self.execute_command(&engine, &actor, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut subs = self.listening.lock().await;
            for sub in subs.iter_mut() {
                loop {
                    match sub.rx.try_recv() {
                        Ok(payload) => pending.push((sub.channel.clone(), payload)),
                        Err(TryRecvError::Lagged(n)) => {
                            tracing::warn!(
                                "{}: listener fell behind, {n} notifications dropped",
                                sub.channel
                            );
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        for (channel, payload) in pending {
            let msg = NotificationResponse::new(0, channel, payload);
            client.send(PgWireBackendMessage::NotificationResponse(msg)).await?;
        }
        Ok(())
    }

    async fn listen(
        &self,
        engine: &Engine,
        actor: &Actor,
        channel: String,
    ) -> PgWireResult<Vec<Response>> {
        let trainer_id = channel
            .strip_prefix("trainer_")
            .and_then(|id| Ulid::from_string(id).ok())
            .ok_or_else(|| {
                user_error("42000", format!("invalid channel: {channel} (expected trainer_{{id}})"))
            })?;
        engine.trainer_info(trainer_id).await.map_err(engine_err)?;
        authorize(actor, Action::Read, &Resource::Commitment { trainer_id }).map_err(engine_err)?;

        let mut subs = self.listening.lock().await;
        if !subs.iter().any(|s| s.channel == channel) {
            let rx = engine.notify.subscribe(trainer_id);
            subs.push(Subscription { channel, rx });
        }
        Ok(vec![Response::Execution(Tag::new("LISTEN"))])
    }

    async fn unlisten(&self, channel: Option<String>) -> Vec<Response> {
        let mut subs = self.listening.lock().await;
        match channel {
            Some(channel) => subs.retain(|s| s.channel != channel),
            None => subs.clear(),
        }
        vec![Response::Execution(Tag::new("UNLISTEN"))]
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertUser {
                id,
                username,
                role,
                superuser,
            } => {
                check(actor, Action::Create, Resource::Users)?;
                engine
                    .register_user(id, &username, role, superuser)
                    .await
                    .map_err(engine_err)?;
                Ok(done("INSERT", 1))
            }
            Command::UpdateProfile {
                trainer_id,
                specialties,
                bio,
                experience_years,
            } => {
                check(actor, Action::UpdateStatus, Resource::Profile { user_id: trainer_id })?;
                let current = engine.trainer_info(trainer_id).await.map_err(engine_err)?;
                let profile = TrainerProfile {
                    specialties: specialties.or(current.specialties),
                    bio: bio.or(current.bio),
                    experience_years: experience_years.unwrap_or(current.experience_years),
                };
                engine
                    .set_trainer_profile(trainer_id, profile)
                    .await
                    .map_err(engine_err)?;
                Ok(done("UPDATE", 1))
            }
            Command::InsertWindow { id, trainer_id, spec } => {
                check(actor, Action::Create, Resource::Availability { trainer_id })?;
                engine
                    .add_availability(id, trainer_id, spec)
                    .await
                    .map_err(engine_err)?;
                Ok(done("INSERT", 1))
            }
            Command::DeleteWindow { id } => {
                let trainer_id = owner_of(engine, id)?;
                check(actor, Action::Delete, Resource::Availability { trainer_id })?;
                engine.remove_availability(id).await.map_err(engine_err)?;
                Ok(done("DELETE", 1))
            }
            Command::ReplaceSchedule { trainer_id, windows } => {
                check(actor, Action::Create, Resource::Availability { trainer_id })?;
                let count = windows.len();
                engine
                    .replace_availability(trainer_id, windows)
                    .await
                    .map_err(engine_err)?;
                Ok(done(if count == 0 { "DELETE" } else { "INSERT" }, count))
            }
            Command::InsertCommitment { draft } => {
                let trainer_id = draft.trainer_id;
                check(actor, Action::Create, Resource::Commitment { trainer_id })?;
                engine.schedule_commitment(draft).await.map_err(engine_err)?;
                Ok(done("INSERT", 1))
            }
            Command::RescheduleCommitment { id, start, end } => {
                let trainer_id = owner_of(engine, id)?;
                check(actor, Action::Reschedule, Resource::Commitment { trainer_id })?;
                engine
                    .reschedule_commitment(id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(done("UPDATE", 1))
            }
            Command::SetCommitmentStatus { id, status, feedback } => {
                let trainer_id = owner_of(engine, id)?;
                check(actor, Action::UpdateStatus, Resource::Commitment { trainer_id })?;
                engine
                    .set_commitment_status(id, status, feedback)
                    .await
                    .map_err(engine_err)?;
                Ok(done("UPDATE", 1))
            }
            Command::DeleteCommitment { id } => {
                let trainer_id = owner_of(engine, id)?;
                check(actor, Action::Delete, Resource::Commitment { trainer_id })?;
                engine.remove_commitment(id).await.map_err(engine_err)?;
                Ok(done("DELETE", 1))
            }
            Command::InsertBooking {
                id,
                trainer_id,
                start,
                end,
                notes,
            } => {
                if actor.id.is_nil() {
                    return Err(engine_err(EngineError::Forbidden(
                        "bookings are made by a registered user",
                    )));
                }
                check(
                    actor,
                    Action::Create,
                    Resource::Booking { client_id: actor.id, trainer_id },
                )?;
                engine
                    .create_booking(id, actor.id, trainer_id, start, end, notes)
                    .await
                    .map_err(engine_err)?;
                Ok(done("INSERT", 1))
            }
            Command::UpdateBooking { id, patch } => {
                engine
                    .update_booking(id, patch, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(done("UPDATE", 1))
            }
            Command::TransitionBooking { id, status } => {
                engine
                    .transition_booking(id, status, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(done("UPDATE", 1))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id, actor).await.map_err(engine_err)?;
                Ok(done("DELETE", 1))
            }
            Command::SelectAvailableTrainers { date, start, end } => {
                check(actor, Action::Read, Resource::TrainerSearch)?;
                let ids = engine
                    .find_available(date, start, end)
                    .await
                    .map_err(engine_err)?;
                let mut trainers = Vec::with_capacity(ids.len());
                for id in ids {
                    // Skip anyone removed since the search.
                    if let Ok(info) = engine.trainer_info(id).await {
                        trainers.push(info);
                    }
                }
                Ok(vec![rows(trainer_schema(), trainers, encode_trainer)])
            }
            Command::SelectSlotCheck {
                trainer_id,
                start,
                end,
                exclude,
            } => {
                check(actor, Action::Read, Resource::TrainerSearch)?;
                let checked = engine.validate_slot(trainer_id, start, end, None, exclude).await;
                let verdict = match checked {
                    Ok(()) => (true, None),
                    Err(e @ (EngineError::NotFound(_) | EngineError::NotATrainer(_))) => {
                        return Err(engine_err(e));
                    }
                    Err(e) => (false, Some(e.to_string())),
                };
                Ok(vec![rows(slot_check_schema(), vec![verdict], |enc, (ok, reason)| {
                    enc.encode_field(&trainer_id.to_string())?;
                    enc.encode_field(&ok)?;
                    enc.encode_field(&reason)
                })])
            }
            Command::SelectOpenSlots { trainer_id, date } => {
                check(actor, Action::Read, Resource::TrainerSearch)?;
                let slots = engine
                    .open_slots(trainer_id, date)
                    .await
                    .map_err(engine_err)?;
                let tid = trainer_id.to_string();
                Ok(vec![rows(open_slots_schema(), slots, |enc, slot| {
                    enc.encode_field(&tid)?;
                    enc.encode_field(&fmt_stamp(slot.start))?;
                    enc.encode_field(&fmt_stamp(slot.end))
                })])
            }
            Command::SelectWindows { trainer_id } => {
                check(actor, Action::Read, Resource::Availability { trainer_id })?;
                let windows = engine.get_windows(trainer_id).await.map_err(engine_err)?;
                Ok(vec![rows(window_schema(), windows, |enc, w| {
                    enc.encode_field(&w.id.to_string())?;
                    enc.encode_field(&w.trainer_id.to_string())?;
                    enc.encode_field(&weekday_name(w.day).to_string())?;
                    enc.encode_field(&w.start.format("%H:%M:%S").to_string())?;
                    enc.encode_field(&w.end.format("%H:%M:%S").to_string())
                })])
            }
            Command::SelectCommitments { trainer_id, from, to } => {
                check(actor, Action::Read, Resource::Commitment { trainer_id })?;
                let commitments = engine
                    .get_commitments(trainer_id, from, to)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(commitment_schema(), commitments, encode_commitment)])
            }
            Command::SelectBookings { filter } => {
                let mut bookings = engine.get_bookings(&filter).await;
                bookings.retain(|b| {
                    let resource =
                        Resource::Booking { client_id: b.client_id, trainer_id: b.trainer_id };
                    authorize(actor, Action::Read, &resource).is_ok()
                });
                Ok(vec![rows(booking_schema(), bookings, encode_booking)])
            }
            Command::SelectTrainers { filter } => {
                check(actor, Action::Read, Resource::TrainerSearch)?;
                let trainers = engine.list_trainers(&filter).await;
                Ok(vec![rows(trainer_schema(), trainers, encode_trainer)])
            }
            Command::SelectNextSession { trainer_id } => {
                let trainer_id = trainer_id.unwrap_or(actor.id);
                check(actor, Action::Read, Resource::Commitment { trainer_id })?;
                let now = now_local(self.tenant_manager.utc_offset());
                let next = engine
                    .next_session(trainer_id, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(next_session_schema(), next.into_iter().collect(), encode_next)])
            }
            Command::Listen { channel } => self.listen(engine, actor, channel).await,
            Command::Unlisten { channel } => Ok(self.unlisten(channel).await),
        }
    }
}

fn check(actor: &Actor, action: Action, resource: Resource) -> PgWireResult<()> {
    authorize(actor, action, &resource).map_err(engine_err)
}

fn owner_of(engine: &Engine, id: Ulid) -> PgWireResult<Ulid> {
    engine
        .get_trainer_for_entity(&id)
        .ok_or_else(|| engine_err(EngineError::NotFound(id)))
}

fn done(tag: &str, rows: usize) -> Vec<Response> {
    vec![Response::Execution(Tag::new(tag).with_rows(rows))]
}

fn fmt_stamp(stamp: Stamp) -> String {
    stamp.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_trainer(enc: &mut DataRowEncoder, t: TrainerInfo) -> PgWireResult<()> {
    enc.encode_field(&t.id.to_string())?;
    enc.encode_field(&t.username)?;
    enc.encode_field(&t.specialties)?;
    enc.encode_field(&t.bio)?;
    enc.encode_field(&i64::from(t.experience_years))
}

fn encode_commitment(enc: &mut DataRowEncoder, c: Commitment) -> PgWireResult<()> {
    enc.encode_field(&c.id.to_string())?;
    enc.encode_field(&c.trainer_id.to_string())?;
    enc.encode_field(&fmt_stamp(c.span.start))?;
    enc.encode_field(&fmt_stamp(c.span.end))?;
    enc.encode_field(&c.label)?;
    enc.encode_field(&c.location)?;
    enc.encode_field(&c.notes)?;
    enc.encode_field(&c.feedback)?;
    enc.encode_field(&c.status.as_str().to_string())?;
    enc.encode_field(&c.booking_id.map(|id| id.to_string()))
}

fn encode_next(enc: &mut DataRowEncoder, next: NextSession) -> PgWireResult<()> {
    let (kind, booking) = match &next {
        NextSession::Booking(b, _) => ("booking", Some(b)),
        NextSession::Session(_) => ("session", None),
    };
    let c = next.session();
    enc.encode_field(&kind.to_string())?;
    enc.encode_field(&c.trainer_id.to_string())?;
    enc.encode_field(&fmt_stamp(c.span.start))?;
    enc.encode_field(&fmt_stamp(c.span.end))?;
    enc.encode_field(&c.label)?;
    enc.encode_field(&c.id.to_string())?;
    enc.encode_field(&booking.map(|b| b.id.to_string()))?;
    enc.encode_field(&booking.map(|b| b.client_id.to_string()))
}

fn encode_booking(enc: &mut DataRowEncoder, b: Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.client_id.to_string())?;
    enc.encode_field(&b.trainer_id.to_string())?;
    enc.encode_field(&fmt_stamp(b.span.start))?;
    enc.encode_field(&fmt_stamp(b.span.end))?;
    enc.encode_field(&b.status.as_str().to_string())?;
    enc.encode_field(&b.notes)?;
    enc.encode_field(&b.linked_commitment.map(|id| id.to_string()))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn text_fields(names: &[&str]) -> Vec<FieldInfo> {
    names.iter().map(|n| field(n, Type::VARCHAR)).collect()
}

fn trainer_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["trainer_id", "username", "specialties", "bio"]);
    fields.push(field("experience_years", Type::INT8));
    fields
}

fn slot_check_schema() -> Vec<FieldInfo> {
    vec![
        field("trainer_id", Type::VARCHAR),
        field("ok", Type::BOOL),
        field("reason", Type::VARCHAR),
    ]
}

fn open_slots_schema() -> Vec<FieldInfo> {
    text_fields(&["trainer_id", "start_time", "end_time"])
}

fn window_schema() -> Vec<FieldInfo> {
    text_fields(&["id", "trainer_id", "day_of_week", "start_time", "end_time"])
}

fn commitment_schema() -> Vec<FieldInfo> {
    text_fields(&[
        "id",
        "trainer_id",
        "start_time",
        "end_time",
        "label",
        "location",
        "notes",
        "feedback",
        "status",
        "booking_id",
    ])
}

fn booking_schema() -> Vec<FieldInfo> {
    text_fields(&[
        "id",
        "client_id",
        "trainer_id",
        "start_time",
        "end_time",
        "status",
        "notes",
        "commitment_id",
    ])
}

fn next_session_schema() -> Vec<FieldInfo> {
    text_fields(&[
        "kind",
        "trainer_id",
        "start_time",
        "end_time",
        "label",
        "commitment_id",
        "booking_id",
        "client_id",
    ])
}

/// Row shape of a statement, judged from its FROM table so placeholders
/// need not be bound yet.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if !lower.starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_end_matches(';'));
    match table {
        Some("trainers" | "available_trainers") => trainer_schema(),
        Some("slot_check") => slot_check_schema(),
        Some("open_slots") => open_slots_schema(),
        Some("availability" | "weekly_schedule") => window_schema(),
        Some("commitments") => commitment_schema(),
        Some("bookings") => booking_schema(),
        Some("next_session") => next_session_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SamayHandler {
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
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SamayQueryParser;

#[async_trait]
impl QueryParser for SamayQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SamayHandler {
    type Statement = String;
    type QueryParser = SamayQueryParser;

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
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
        Ok(responses.remove(0))
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// `(start, end, n)` byte ranges.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        if let Some(q) = quote {
            // A doubled quote closes and reopens, which nets out.
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'$' => {
                let start = i - 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start, i, n));
                }
            }
            _ => {}
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one pass, so text
/// inside a bound value is never read as a placeholder.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (start, end, n) in placeholders(sql) {
        out.push_str(&sql[last..start]);
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[start..end]),
        }
        last = end;
    }
    out.push_str(&sql[last..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SamayFactory {
    handler: Arc<SamayHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SamayAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SamayFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, access: Access) -> Self {
        let auth_source = SamayAuthSource::new(
            access.password,
            access.admin_user.clone(),
            tenant_manager.clone(),
        );
        Self {
            handler: Arc::new(SamayHandler::new(tenant_manager, access.admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SamayFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects. Each connection gets its own
/// handler, so LISTEN state is never shared.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    access: Access,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SamayFactory::new(tenant_manager, access);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Overlap(_) => "23P01",
        EngineError::InvalidRange
        | EngineError::OutsideAvailability
        | EngineError::DurationTooShort { .. }
        | EngineError::SelfBooking
        | EngineError::InvalidTransition { .. } => "23514",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Forbidden(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::NotATrainer(_)
        | EngineError::OwnedByBooking(_)
        | EngineError::WalError(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM trainers"), 0);
        assert_eq!(
            count_params("SELECT * FROM bookings WHERE trainer_id = $2 AND client_id = $1"),
            2
        );
        assert_eq!(count_params("UPDATE bookings SET notes = $10 WHERE id = $1"), 10);
        assert_eq!(count_params("SELECT '$' FROM trainers"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE notes = 'it''s $3'"), 0);
    }

    #[test]
    fn bound_text_is_never_rescanned() {
        let sql = "INSERT INTO bookings (id, notes) VALUES ($1, $2)";
        let params = [Some("01J0000000000000000000000A"), Some("pay $1 at desk")];
        assert_eq!(
            bind_params(sql, &params),
            "INSERT INTO bookings (id, notes) VALUES ('01J0000000000000000000000A', 'pay $1 at desk')"
        );

        let quoted = [Some("o'neil $2"), None];
        assert_eq!(
            bind_params("SELECT $1, $2, '$1', $3", &quoted),
            "SELECT 'o''neil $2', NULL, '$1', $3"
        );
    }

    #[test]
    fn schema_follows_from_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM available_trainers WHERE date = $1")[0], "trainer_id");
        assert_eq!(names("select * from slot_check where trainer_id = $1")[1], "ok");
        assert_eq!(names("SELECT * FROM bookings;").len(), 8);
        assert!(names("INSERT INTO bookings VALUES ($1)").is_empty());
        assert!(names("SELECT * FROM rooms").is_empty());
    }

    #[test]
    fn sqlstates_follow_error_kind() {
        assert_eq!(sqlstate(&EngineError::Overlap(Ulid::nil())), "23P01");
        assert_eq!(sqlstate(&EngineError::OutsideAvailability), "23514");
        assert_eq!(
            sqlstate(&EngineError::InvalidTransition {
                from: BookingStatus::Completed,
                to: BookingStatus::Pending,
            }),
            "23514"
        );
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::nil())), "02000");
        assert_eq!(sqlstate(&EngineError::Forbidden("no")), "42501");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "P0001");
    }
}
