use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use samay::tenant::{TenantManager, TenantSettings};
use samay::wire::{self, Access};

const ADMIN: &str = "samay";
const PASSWORD: &str = "samay";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("samay_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, TenantSettings::default()));
    let access = Access { password: PASSWORD.into(), admin_user: ADMIN.into() };

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            let access = access.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, access, None).await;
            });
        }
    });

    addr
}

async fn try_connect(
    addr: SocketAddr,
    user: &str,
) -> Result<(tokio_postgres::Client, mpsc::UnboundedReceiver<Notification>), tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("gym")
        .user(user)
        .password(PASSWORD);

    let (client, mut connection) = config.connect(NoTls).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    Ok((client, rx))
}

async fn connect(addr: SocketAddr, user: &str) -> (tokio_postgres::Client, mpsc::UnboundedReceiver<Notification>) {
    try_connect(addr, user).await.unwrap()
}

async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

struct Gym {
    addr: SocketAddr,
    coach: Ulid,
}

/// A trainer free Monday 9-17 and Wednesday 13-18, plus clients alice and bob.
async fn open_gym() -> Gym {
    let addr = start_test_server().await;
    let (admin, _) = connect(addr, ADMIN).await;

    let coach = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO users (id, username, role) VALUES ('{coach}', 'coach', 'trainer')"
        ))
        .await
        .unwrap();
    for name in ["alice", "bob"] {
        admin
            .batch_execute(&format!(
                "INSERT INTO users (id, username, role) VALUES ('{}', '{name}', 'client')",
                Ulid::new()
            ))
            .await
            .unwrap();
    }
    admin
        .batch_execute(&format!(
            "INSERT INTO weekly_schedule (trainer_id, day_of_week, start_time, end_time) VALUES \
             ('{coach}', 'Monday', '09:00:00', '17:00:00'), ('{coach}', 'Wednesday', '13:00:00', '18:00:00')"
        ))
        .await
        .unwrap();

    Gym { addr, coach }
}

async fn book(client: &tokio_postgres::Client, trainer: Ulid, start: &str, end: &str) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, trainer_id, start_time, end_time) VALUES ('{id}', '{trainer}', '{start}', '{end}')"
        ))
        .await?;
    Ok(id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_login_is_refused() {
    let gym = open_gym().await;
    assert!(try_connect(gym.addr, "mallory").await.is_err());
    assert!(try_connect(gym.addr, "alice").await.is_ok());
}

#[tokio::test]
async fn book_confirm_and_conflict() {
    let gym = open_gym().await;
    let (alice, _) = connect(gym.addr, "alice").await;
    let (bob, _) = connect(gym.addr, "bob").await;
    let (coach, _) = connect(gym.addr, "coach").await;

    let a = book(&alice, gym.coach, "2024-06-03 10:00:00", "2024-06-03 11:00:00").await.unwrap();
    coach
        .batch_execute(&format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{a}'"))
        .await
        .unwrap();

    let listed = rows(&alice, "SELECT * FROM bookings").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(a.to_string().as_str()));
    assert_eq!(listed[0].get("status"), Some("confirmed"));
    let session = listed[0].get("commitment_id").unwrap().to_string();

    let sessions = rows(&coach, &format!("SELECT * FROM commitments WHERE trainer_id = '{}'", gym.coach)).await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].get("id"), Some(session.as_str()));
    assert_eq!(sessions[0].get("booking_id"), Some(a.to_string().as_str()));

    let err = book(&bob, gym.coach, "2024-06-03 10:30:00", "2024-06-03 11:30:00").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let err = book(&bob, gym.coach, "2024-06-03 07:00:00", "2024-06-03 08:00:00").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("23514"));

    // Bob only sees his own bookings.
    assert!(rows(&bob, "SELECT * FROM bookings").await.is_empty());
}

#[tokio::test]
async fn illegal_transition_is_a_check_violation() {
    let gym = open_gym().await;
    let (alice, _) = connect(gym.addr, "alice").await;
    let (coach, _) = connect(gym.addr, "coach").await;

    let a = book(&alice, gym.coach, "2024-06-03 10:00:00", "2024-06-03 11:00:00").await.unwrap();
    let err = coach
        .batch_execute(&format!("UPDATE bookings SET status = 'completed' WHERE id = '{a}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23514"));

    // Trainers cannot move bookings.
    let err = coach
        .batch_execute(&format!("UPDATE bookings SET start_time = '2024-06-03 12:00:00' WHERE id = '{a}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));
}

#[tokio::test]
async fn trainer_search_and_slot_check() {
    let gym = open_gym().await;
    let (alice, _) = connect(gym.addr, "alice").await;

    let found = rows(
        &alice,
        "SELECT * FROM available_trainers WHERE date = '2024-06-05' AND start_time = '14:00' AND end_time = '15:00'",
    )
    .await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("trainer_id"), Some(gym.coach.to_string().as_str()));
    assert_eq!(found[0].get("username"), Some("coach"));

    let verdict = rows(
        &alice,
        &format!(
            "SELECT * FROM slot_check WHERE trainer_id = '{}' AND start_time = '2024-06-05 12:00:00' AND end_time = '2024-06-05 13:30:00'",
            gym.coach
        ),
    )
    .await;
    assert_eq!(verdict[0].get("ok"), Some("f"));
    assert!(verdict[0].get("reason").is_some());

    let err = alice
        .simple_query("SELECT * FROM available_trainers WHERE date = '2024-06-05' AND start_time = '15:00' AND end_time = '14:00'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23514"));
}

#[tokio::test]
async fn trainer_hears_about_new_bookings() {
    let gym = open_gym().await;
    let (coach, mut notifications) = connect(gym.addr, "coach").await;
    coach.batch_execute(&format!("LISTEN trainer_{}", gym.coach)).await.unwrap();

    let (alice, _) = connect(gym.addr, "alice").await;
    let a = book(&alice, gym.coach, "2024-06-03 10:00:00", "2024-06-03 11:00:00").await.unwrap();

    // Pending notifications go out ahead of the listener's next statement.
    rows(&coach, "SELECT * FROM trainers").await;
    let notif = recv_notification(&mut notifications, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("trainer_{}", gym.coach));
    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(payload["BookingCreated"]["booking"]["id"], a.to_string());

    coach.batch_execute("UNLISTEN *").await.unwrap();
    book(&alice, gym.coach, "2024-06-03 12:00:00", "2024-06-03 13:00:00").await.unwrap();
    rows(&coach, "SELECT * FROM trainers").await;
    assert!(recv_notification(&mut notifications, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn clients_cannot_listen_to_trainer_channels() {
    let gym = open_gym().await;
    let (alice, _) = connect(gym.addr, "alice").await;
    let err = alice
        .batch_execute(&format!("LISTEN trainer_{}", gym.coach))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let err = alice.batch_execute("LISTEN lobby").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42000"));
}

#[tokio::test]
async fn trainer_manages_schedule_and_sessions() {
    let gym = open_gym().await;
    let (coach, _) = connect(gym.addr, "coach").await;

    let window = Ulid::new();
    coach
        .batch_execute(&format!(
            "INSERT INTO availability (id, trainer_id, day_of_week, start_time, end_time) \
             VALUES ('{window}', '{}', 'Friday', '08:00:00', '10:00:00')",
            gym.coach
        ))
        .await
        .unwrap();
    let windows = rows(&coach, &format!("SELECT * FROM availability WHERE trainer_id = '{}'", gym.coach)).await;
    let days: Vec<_> = windows.iter().filter_map(|r| r.get("day_of_week")).collect();
    assert_eq!(days, vec!["Monday", "Wednesday", "Friday"]);

    let session = Ulid::new();
    coach
        .batch_execute(&format!(
            "INSERT INTO commitments (id, trainer_id, start_time, end_time, label) \
             VALUES ('{session}', '{}', '2024-06-07 08:00:00', '2024-06-07 09:00:00', 'Assessment')",
            gym.coach
        ))
        .await
        .unwrap();
    coach
        .batch_execute(&format!("UPDATE commitments SET status = 'completed', feedback = 'great' WHERE id = '{session}'"))
        .await
        .unwrap();

    let slots = rows(
        &coach,
        &format!("SELECT * FROM open_slots WHERE trainer_id = '{}' AND date = '2024-06-07'", gym.coach),
    )
    .await;
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].get("start_time"), Some("2024-06-07 09:00:00"));

    // Trainers reschedule through the admin, not directly.
    let err = coach
        .batch_execute(&format!(
            "UPDATE commitments SET start_time = '2024-06-07 08:30:00', end_time = '2024-06-07 09:30:00' WHERE id = '{session}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));
}

#[tokio::test]
async fn bound_notes_may_contain_placeholders() {
    let gym = open_gym().await;
    let (alice, _) = connect(gym.addr, "alice").await;

    let id = Ulid::new().to_string();
    let trainer = gym.coach.to_string();
    let inserted = alice
        .execute(
            "INSERT INTO bookings (id, trainer_id, start_time, end_time, notes) VALUES ($1, $2, $3, $4, $5)",
            &[&id, &trainer, &"2024-06-03 10:00:00", &"2024-06-03 11:00:00", &"pay $1 at desk, o'clock"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let listed = rows(&alice, "SELECT * FROM bookings").await;
    assert_eq!(listed[0].get("id"), Some(id.as_str()));
    assert_eq!(listed[0].get("notes"), Some("pay $1 at desk, o'clock"));
}

#[tokio::test]
async fn trainer_sees_next_session_and_directory_filters() {
    let gym = open_gym().await;
    let (alice, _) = connect(gym.addr, "alice").await;
    let (coach, _) = connect(gym.addr, "coach").await;

    assert!(rows(&coach, "SELECT * FROM next_session").await.is_empty());

    // 2030-01-07 is a Monday, safely in the future.
    let a = book(&alice, gym.coach, "2030-01-07 10:00:00", "2030-01-07 11:00:00").await.unwrap();
    coach
        .batch_execute(&format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{a}'"))
        .await
        .unwrap();
    let next = rows(&coach, "SELECT * FROM next_session").await;
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].get("kind"), Some("booking"));
    assert_eq!(next[0].get("booking_id"), Some(a.to_string().as_str()));
    assert_eq!(next[0].get("start_time"), Some("2030-01-07 10:00:00"));

    let err = alice.simple_query("SELECT * FROM next_session").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    coach
        .batch_execute(&format!(
            "UPDATE trainers SET specialties = 'Strength, Mobility', experience_years = 6 WHERE id = '{}'",
            gym.coach
        ))
        .await
        .unwrap();
    let found = rows(&alice, "SELECT * FROM trainers WHERE specialties = 'mobility'").await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("username"), Some("coach"));
    assert!(rows(&alice, "SELECT * FROM trainers WHERE experience_years = 2").await.is_empty());
}
