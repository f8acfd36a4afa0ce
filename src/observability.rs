use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "samay_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "samay_query_duration_seconds";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: applied booking status changes. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "samay_booking_transitions_total";

/// Counter: slots refused by the conflict check. Labels: reason.
pub const SLOT_REJECTIONS_TOTAL: &str = "samay_slot_rejections_total";

/// Counter: sessions the sweep marked absent.
pub const SESSIONS_ABSENT_TOTAL: &str = "samay_sessions_absent_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "samay_connections_active";
pub const CONNECTIONS_TOTAL: &str = "samay_connections_total";
/// Counter: connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "samay_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "samay_tenants_active";

/// Counter: logins refused because the name matches no user of the database.
pub const AUTH_FAILURES_TOTAL: &str = "samay_auth_failures_total";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "samay_wal_flush_duration_seconds";
/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "samay_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if unset.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateProfile { .. } => "update_profile",
        Command::InsertWindow { .. } => "insert_window",
        Command::DeleteWindow { .. } => "delete_window",
        Command::ReplaceSchedule { .. } => "replace_schedule",
        Command::InsertCommitment { .. } => "insert_commitment",
        Command::RescheduleCommitment { .. } => "reschedule_commitment",
        Command::SetCommitmentStatus { .. } => "set_commitment_status",
        Command::DeleteCommitment { .. } => "delete_commitment",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::TransitionBooking { .. } => "transition_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectAvailableTrainers { .. } => "select_available_trainers",
        Command::SelectSlotCheck { .. } => "select_slot_check",
        Command::SelectOpenSlots { .. } => "select_open_slots",
        Command::SelectWindows { .. } => "select_windows",
        Command::SelectCommitments { .. } => "select_commitments",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectTrainers { .. } => "select_trainers",
        Command::SelectNextSession { .. } => "select_next_session",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
