use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use slotd::tenant::TenantManager;
use slotd::wire;

const H: i64 = 3_600_000;
/// 2024-05-01T00:00:00Z
const DAY: i64 = 1_714_521_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotd".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, dbname: &str) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("orga")
        .password("slotd");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

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

    (client, rx)
}

async fn recv_notification(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Option<Notification> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .ok()
        .flatten()
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Notification>) {
    if let Ok(Some(n)) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
        panic!("unexpected notification on {}: {}", n.channel(), n.payload());
    }
}

/// Values of one column across all returned rows.
async fn column(client: &Client, sql: &str, name: &str) -> Vec<Option<String>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row.get(name).map(str::to_string)),
            _ => None,
        })
        .collect()
}

struct Conference {
    hall: Ulid,
    alice: Ulid,
    rust: Ulid,
    rust_slot: Ulid,
}

/// Berlin conference with one room, one speaker, one talk at 10:00 local
/// time and a lunch break at 12:00.
async fn seed(client: &Client) -> Conference {
    let hall = Ulid::new();
    let alice = Ulid::new();
    let rust = Ulid::new();
    let rust_slot = Ulid::new();
    client
        .batch_execute(&format!(
            r#"UPDATE conference SET timezone = 'Europe/Berlin';
               INSERT INTO rooms (id, name, position) VALUES ('{hall}', 'Hall', 0);
               INSERT INTO speakers (id, name) VALUES ('{alice}', 'Alice');
               INSERT INTO submissions (id, title, state, speakers) VALUES ('{rust}', 'Rust', 'confirmed', '{alice}');
               INSERT INTO slots (id, submission_id, room_id, start, "end") VALUES ('{rust_slot}', '{rust}', '{hall}', {}, {});
               INSERT INTO slots (id, room_id, start, "end", description) VALUES ('{}', '{hall}', {}, {}, 'Lunch')"#,
            DAY + 8 * H,
            DAY + 9 * H,
            Ulid::new(),
            DAY + 10 * H,
            DAY + 11 * H,
        ))
        .await
        .unwrap();
    Conference {
        hall,
        alice,
        rust,
        rust_slot,
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn listings_round_trip() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "listings").await;
    let conf = seed(&client).await;

    assert_eq!(
        column(&client, "SELECT * FROM rooms", "name").await,
        vec![Some("Hall".to_string())]
    );
    assert_eq!(
        column(&client, "SELECT * FROM submissions", "speakers").await,
        vec![Some(conf.alice.to_string())]
    );
    assert_eq!(
        column(&client, "SELECT * FROM conference", "timezone").await,
        vec![Some("Europe/Berlin".to_string())]
    );
    let slots = column(&client, "SELECT * FROM slots WHERE version = 'wip'", "submission_id").await;
    assert_eq!(slots.len(), 2);
    assert!(slots.contains(&Some(conf.rust.to_string())));
    assert!(slots.contains(&None));
}

#[tokio::test]
async fn release_notifies_listening_speaker() {
    let addr = start_test_server().await;
    let (organiser, _rx) = connect(addr, "release").await;
    let conf = seed(&organiser).await;

    let (speaker_conn, mut speaker_rx) = connect(addr, "release").await;
    speaker_conn
        .batch_execute(&format!("LISTEN speaker_{}", conf.alice))
        .await
        .unwrap();

    organiser
        .batch_execute("INSERT INTO schedules (version, comment, notify) VALUES ('v1', 'first', true)")
        .await
        .unwrap();

    // The speaker connection stays idle; the notification is pushed to it.
    let n = recv_notification(&mut speaker_rx)
        .await
        .expect("expected a speaker notification");
    assert_eq!(n.channel(), format!("speaker_{}", conf.alice));

    let payload: serde_json::Value = serde_json::from_str(n.payload()).unwrap();
    assert_eq!(payload["type"], "speaker_schedule");
    assert_eq!(payload["version"], "v1");
    assert_eq!(payload["create"][0]["title"], "Rust");
    assert_eq!(payload["create"][0]["room"], "Hall");
    assert_eq!(payload["create"][0]["start"], "2024-05-01 10:00");

    assert_eq!(
        column(&organiser, "SELECT * FROM schedules", "version").await,
        vec![Some("wip".to_string()), Some("v1".to_string())]
    );
}

#[tokio::test]
async fn release_without_notify_flag_only_hits_schedule_channel() {
    let addr = start_test_server().await;
    let (client, mut rx) = connect(addr, "silent").await;
    let conf = seed(&client).await;

    client
        .batch_execute(&format!("LISTEN schedule; LISTEN speaker_{}", conf.alice))
        .await
        .unwrap();
    client
        .batch_execute("INSERT INTO schedules (version, notify) VALUES ('v1', false)")
        .await
        .unwrap();

    // The frozen event comes first, then the release announcement.
    let mut released = None;
    while let Some(n) = recv_notification(&mut rx).await {
        assert_eq!(n.channel(), "schedule");
        let payload: serde_json::Value = serde_json::from_str(n.payload()).unwrap();
        if payload["type"] == "schedule_released" {
            released = Some(payload);
            break;
        }
        assert_eq!(payload["type"], "changed");
    }
    let released = released.expect("release announcement");
    assert_eq!(released["version"], "v1");
    assert_eq!(released["action"], "create");

    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn unlisten_stops_delivery() {
    let addr = start_test_server().await;
    let (client, mut rx) = connect(addr, "unlisten").await;
    seed(&client).await;

    client.batch_execute("LISTEN schedule").await.unwrap();
    client.batch_execute("UNLISTEN *").await.unwrap();
    client
        .batch_execute("INSERT INTO schedules (version) VALUES ('v1')")
        .await
        .unwrap();
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn moved_talk_shows_up_in_changes() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "changes").await;
    let conf = seed(&client).await;

    client
        .batch_execute("INSERT INTO schedules (version) VALUES ('v1')")
        .await
        .unwrap();
    assert!(column(&client, "SELECT * FROM changes WHERE version = 'v1'", "change")
        .await
        .is_empty());

    client
        .batch_execute(&format!(
            r#"UPDATE slots SET start = {}, "end" = {} WHERE id = '{}'"#,
            DAY + 13 * H,
            DAY + 14 * H,
            conf.rust_slot
        ))
        .await
        .unwrap();

    let sql = "SELECT * FROM changes WHERE version = 'wip'";
    assert_eq!(column(&client, sql, "change").await, vec![Some("moved".to_string())]);
    assert_eq!(column(&client, sql, "action").await, vec![Some("update".to_string())]);
    assert_eq!(
        column(&client, sql, "old_start").await,
        vec![Some((DAY + 8 * H).to_string())]
    );
    assert_eq!(
        column(&client, sql, "room_id").await,
        vec![Some(conf.hall.to_string())]
    );
}

#[tokio::test]
async fn timetable_and_warnings() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "timetable").await;
    let conf = seed(&client).await;

    let lines = column(&client, "SELECT * FROM timetable WHERE format = 'list'", "line").await;
    let lines: Vec<String> = lines.into_iter().flatten().collect();
    assert_eq!(
        lines,
        ["2024-05-01", "* 10:00 Rust, Alice; in Hall", "* 12:00 Lunch in Hall"]
    );

    // Alice is only available in the afternoon.
    client
        .batch_execute(&format!(
            r#"INSERT INTO availabilities (id, owner_id, start, "end") VALUES ('{}', '{}', {}, {})"#,
            Ulid::new(),
            conf.alice,
            DAY + 12 * H,
            DAY + 16 * H
        ))
        .await
        .unwrap();
    let kinds = column(&client, "SELECT * FROM warnings", "kind").await;
    assert_eq!(kinds, vec![Some("speaker".to_string())]);
}

#[tokio::test]
async fn availability_queries() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "availability").await;
    let conf = seed(&client).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO availabilities (id, owner_id, start, "end") VALUES
                 ('{}', '{alice}', {}, {}),
                 ('{}', '{alice}', {}, {}),
                 ('{}', '{hall}', {}, {})"#,
            Ulid::new(),
            DAY + 7 * H,
            DAY + 10 * H,
            Ulid::new(),
            DAY + 9 * H,
            DAY + 12 * H,
            Ulid::new(),
            DAY + 8 * H,
            DAY + 18 * H,
            alice = conf.alice,
            hall = conf.hall,
        ))
        .await
        .unwrap();

    let union = format!(
        r#"SELECT * FROM availability WHERE owner_id = '{}' AND start >= {} AND "end" <= {}"#,
        conf.alice,
        DAY,
        DAY + 24 * H
    );
    assert_eq!(
        column(&client, &union, "start").await,
        vec![Some((DAY + 7 * H).to_string())]
    );
    assert_eq!(
        column(&client, &union, "end").await,
        vec![Some((DAY + 12 * H).to_string())]
    );

    let common = format!(
        r#"SELECT * FROM common_availability WHERE owner_id IN ('{}', '{}') AND start >= {} AND "end" <= {}"#,
        conf.alice,
        conf.hall,
        DAY,
        DAY + 24 * H
    );
    assert_eq!(
        column(&client, &common, "start").await,
        vec![Some((DAY + 8 * H).to_string())]
    );

    // Hall is open 08-18, busy 08-09 (talk) and 10-11 (lunch).
    let free = format!(
        r#"SELECT * FROM free_time WHERE room_id = '{}' AND start >= {} AND "end" <= {}"#,
        conf.hall,
        DAY,
        DAY + 24 * H
    );
    assert_eq!(
        column(&client, &free, "start").await,
        vec![Some((DAY + 9 * H).to_string()), Some((DAY + 11 * H).to_string())]
    );
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "errors").await;
    seed(&client).await;

    let err = client.simple_query("SELECT * FROM nonsense").await.unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("42601"));

    client
        .batch_execute("INSERT INTO schedules (version) VALUES ('v1')")
        .await
        .unwrap();
    let err = client
        .batch_execute("INSERT INTO schedules (version) VALUES ('v1')")
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("P0001"));

    let err = client.batch_execute("LISTEN resource_1").await.unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("42000"));
}

#[tokio::test]
async fn conferences_are_isolated() {
    let addr = start_test_server().await;
    let (a, _rx_a) = connect(addr, "conf_a").await;
    let (b, _rx_b) = connect(addr, "conf_b").await;
    seed(&a).await;

    assert_eq!(column(&a, "SELECT * FROM rooms", "name").await.len(), 1);
    assert!(column(&b, "SELECT * FROM rooms", "name").await.is_empty());
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server().await;
    let (client, _rx) = connect(addr, "extended").await;

    let room = Ulid::new().to_string();
    client
        .execute(
            "INSERT INTO rooms (id, name, position) VALUES ($1, $2, $3)",
            &[&room, &"Annex", &"3"],
        )
        .await
        .unwrap();

    let rows = client.query("SELECT * FROM rooms", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    let id: String = rows[0].get("id");
    let name: Option<String> = rows[0].get("name");
    let position: i64 = rows[0].get("position");
    assert_eq!(id, room);
    assert_eq!(name.as_deref(), Some("Annex"));
    assert_eq!(position, 3);
}
