use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use tracing::info;

use crate::engine::{now_local, Engine};
use crate::model::Stamp;

/// One pass of the absent sweep at `now`. Returns how many sessions were marked.
pub async fn sweep_absent(engine: &Engine, now: Stamp) -> usize {
    let mut marked = 0;
    for (commitment_id, trainer_id) in engine.collect_overdue_commitments(now) {
        match engine.mark_absent(commitment_id).await {
            Ok(true) => {
                marked += 1;
                info!("session {commitment_id} of trainer {trainer_id} marked absent");
            }
            Ok(false) => {}
            // Removed or rebooked since collection.
            Err(e) => tracing::debug!("absent sweep skip {commitment_id}: {e}"),
        }
    }
    marked
}

/// Periodically marks sessions nobody closed out as absent.
pub async fn run_absent_sweep(engine: Arc<Engine>, period: Duration, offset: FixedOffset) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        sweep_absent(&engine, now_local(offset)).await;
    }
}

/// Compacts the WAL once enough appends pile up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!("WAL compaction failed after {appends} appends: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::{NaiveDate, NaiveTime, TimeDelta, Weekday};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("samay_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn monday(h: u32, m: u32) -> Stamp {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    async fn engine_with_trainer(name: &str) -> (Arc<Engine>, Ulid) {
        let engine = Arc::new(Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap());
        let tid = Ulid::new();
        engine.register_user(tid, "coach", Role::Trainer, false).await.unwrap();
        engine
            .replace_availability(
                tid,
                vec![WindowSpec {
                    day: Weekday::Mon,
                    start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                    end: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                }],
            )
            .await
            .unwrap();
        (engine, tid)
    }

    async fn session(engine: &Engine, tid: Ulid, start: Stamp, minutes: i64) -> Ulid {
        let id = Ulid::new();
        engine
            .schedule_commitment(CommitmentDraft {
                id,
                trainer_id: tid,
                start,
                end: start + TimeDelta::minutes(minutes),
                label: "1:1".into(),
                location: None,
                notes: None,
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn short_session_grace_is_half_duration() {
        let (engine, tid) = engine_with_trainer("half.wal").await;
        let id = session(&engine, tid, monday(10, 0), 40).await;

        // 20 minute grace for a 40 minute session
        assert_eq!(sweep_absent(&engine, monday(10, 20)).await, 0);
        assert_eq!(sweep_absent(&engine, monday(10, 21)).await, 1);
        assert_eq!(engine.get_commitment(id).await.unwrap().status, CommitmentStatus::Absent);
    }

    #[tokio::test]
    async fn long_session_grace_is_thirty_minutes() {
        let (engine, tid) = engine_with_trainer("long.wal").await;
        session(&engine, tid, monday(10, 0), 120).await;

        assert_eq!(sweep_absent(&engine, monday(10, 30)).await, 0);
        assert_eq!(sweep_absent(&engine, monday(10, 31)).await, 1);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let (engine, tid) = engine_with_trainer("idempotent.wal").await;
        session(&engine, tid, monday(9, 0), 60).await;
        session(&engine, tid, monday(11, 0), 60).await;

        let late = monday(20, 0);
        assert_eq!(sweep_absent(&engine, late).await, 2);
        assert_eq!(sweep_absent(&engine, late).await, 0);
        assert!(engine.collect_overdue_commitments(late).is_empty());
    }

    #[tokio::test]
    async fn closed_sessions_are_left_alone() {
        let (engine, tid) = engine_with_trainer("closed.wal").await;
        let done = session(&engine, tid, monday(9, 0), 60).await;
        engine
            .set_commitment_status(done, Some(CommitmentStatus::Completed), Some("great".into()))
            .await
            .unwrap();

        assert_eq!(sweep_absent(&engine, monday(20, 0)).await, 0);
        let c = engine.get_commitment(done).await.unwrap();
        assert_eq!(c.status, CommitmentStatus::Completed);
        assert_eq!(c.feedback.as_deref(), Some("great"));
    }
}
