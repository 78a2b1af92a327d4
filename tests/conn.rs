//! Connection tests against a scripted backend.

mod common;

use std::time::Duration;

use common::*;
use reactive_pg::{AsyncMessage, Error, TransactionStatus};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_startup_collects_session() {
    let (conn, _backend) = connect().await;

    let session = conn.session().await.unwrap();
    assert_eq!(
        session.server_params.get("server_version").map(String::as_str),
        Some("16.2")
    );
    assert_eq!(session.transaction_status, TransactionStatus::Idle);
    let key = conn.cancel_token().unwrap().backend_key();
    assert_eq!((key.pid, key.secret), (4242, 99));
}

#[tokio::test]
async fn test_update_then_rows() {
    let (conn, mut backend) = connect().await;

    let results = conn
        .query("UPDATE t SET x = 1; SELECT x FROM t")
        .await
        .unwrap();
    assert_eq!(
        backend.read_query().await,
        "UPDATE t SET x = 1; SELECT x FROM t"
    );

    let mut reply = command_complete("UPDATE 3");
    reply.extend(numbered_rows("x", 2));
    reply.extend(ready(b'I'));
    backend.send(&reply).await;

    let update = results.next_update().await.unwrap();
    assert_eq!(update.command, "UPDATE");
    assert_eq!(update.rows_affected, Some(3));
    assert_eq!(update.result_index, 0);
    assert!(update.has_more);

    let (rows, outcome) = results.next_rows().collect().await.unwrap();
    let values: Vec<_> = rows
        .iter()
        .map(|row| row.get_str(0).unwrap().unwrap().to_string())
        .collect();
    assert_eq!(values, ["1", "2"]);
    assert_eq!(rows[0].meta().columns()[0].name, "x");
    assert_eq!(outcome.rows_affected, Some(2));
    assert_eq!(outcome.result_index, 1);
    assert!(!outcome.has_more);

    assert!(matches!(
        results.next_update().await,
        Err(Error::NoMoreResults)
    ));
}

#[tokio::test]
async fn test_subscriptions_before_results() {
    let (conn, mut backend) = connect().await;

    let results = conn.query("SELECT 1; SELECT 2").await.unwrap();
    let first = results.next_rows();
    let second = results.next_rows();
    backend.read_query().await;

    let mut reply = numbered_rows("a", 1);
    reply.extend(numbered_rows("b", 3));
    reply.extend(ready(b'I'));
    backend.send(&reply).await;

    let (rows, _) = second.collect().await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].meta().columns()[0].name, "b");
    let (rows, _) = first.collect().await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_extended_query() {
    let (conn, mut backend) = connect().await;

    let results = conn
        .execute("SELECT $1::text, $2::text", &[Some("hello"), None])
        .await
        .unwrap();

    let mut types = Vec::new();
    for _ in 0..5 {
        types.push(backend.read_message().await.0);
    }
    assert_eq!(types, b"PBDES");

    let mut reply = frame(b'1', &[]);
    reply.extend(frame(b'2', &[]));
    reply.extend(row_description(&["a", "b"]));
    reply.extend(data_row(&[Some("hello"), None]));
    reply.extend(command_complete("SELECT 1"));
    reply.extend(ready(b'I'));
    backend.send(&reply).await;

    let (rows, _) = results.next_rows().collect().await.unwrap();
    assert_eq!(rows[0].get_str_by_name("a").unwrap(), Some("hello"));
    assert!(rows[0].is_null(1));
}

#[tokio::test]
async fn test_server_error_reaches_remaining_subscriptions() {
    let (conn, mut backend) = connect().await;

    let results = conn
        .query("SELECT 1; SELECT boom; SELECT 3")
        .await
        .unwrap();
    let first = results.next_rows();
    let second = results.next_rows();
    let third = results.next_update();
    backend.read_query().await;

    let mut reply = numbered_rows("n", 1);
    reply.extend(error_response("42703", "column \"boom\" does not exist"));
    reply.extend(ready(b'I'));
    backend.send(&reply).await;

    assert_eq!(first.collect().await.unwrap().0.len(), 1);
    let err = second.collect().await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("42703"));
    assert!(err.is_access_error());
    assert_eq!(third.await.unwrap_err().sqlstate(), Some("42703"));

    // The connection stays usable.
    let results = conn.query("UPDATE t SET x = 1").await.unwrap();
    backend.read_query().await;
    let mut reply = command_complete("UPDATE 1");
    reply.extend(ready(b'I'));
    backend.send(&reply).await;
    assert_eq!(results.next_update().await.unwrap().rows_affected, Some(1));
}

#[tokio::test]
async fn test_kind_mismatch_keeps_result() {
    let (conn, mut backend) = connect().await;

    let results = conn.query("DELETE FROM t").await.unwrap();
    backend.read_query().await;
    let mut reply = command_complete("DELETE 4");
    reply.extend(ready(b'I'));
    backend.send(&reply).await;

    let err = results.next_rows().collect().await.unwrap_err();
    assert!(matches!(err, Error::KindMismatch { .. }));
    assert!(err.is_subscription_error());
    assert_eq!(results.next_update().await.unwrap().rows_affected, Some(4));
}

#[tokio::test]
async fn test_too_many_results() {
    let (conn, mut backend) = connect().await;

    let results = conn.query("UPDATE t SET x = 1").await.unwrap();
    backend.read_query().await;
    let mut reply = command_complete("UPDATE 1");
    reply.extend(command_complete("UPDATE 2"));
    reply.extend(ready(b'I'));
    backend.send(&reply).await;

    assert_eq!(results.next_update().await.unwrap().rows_affected, Some(1));
    assert!(matches!(
        results.next_update().await,
        Err(Error::TooManyResults { declared: 1 })
    ));
    assert!(matches!(
        results.next_update().await,
        Err(Error::NoMoreResults)
    ));
}

#[tokio::test]
async fn test_slow_consumer_receives_every_row() {
    let mut opts = opts();
    opts.row_prefetch = 2;
    let (conn, mut backend) = connect_with(opts).await;

    let results = conn.query("SELECT n FROM big").await.unwrap();
    backend.read_query().await;
    let mut reply = numbered_rows("n", 50);
    reply.extend(ready(b'I'));
    backend.send(&reply).await;

    let mut stream = results.next_rows();
    let mut seen = Vec::new();
    while let Some(row) = stream.next().await {
        let row = row.unwrap();
        seen.push(row.get_str(0).unwrap().unwrap().parse::<usize>().unwrap());
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(seen, (1..=50).collect::<Vec<_>>());
    assert_eq!(stream.outcome().await.unwrap().rows_affected, Some(50));
}

#[tokio::test]
async fn test_cancelled_stream_still_completes() {
    let mut opts = opts();
    opts.row_prefetch = 1;
    let (conn, mut backend) = connect_with(opts).await;

    let results = conn.query("SELECT n FROM t; SELECT 1").await.unwrap();
    backend.read_query().await;
    let mut reply = numbered_rows("n", 5);
    reply.extend(command_complete("SELECT 0"));
    reply.extend(ready(b'I'));
    backend.send(&reply).await;

    let mut stream = results.next_rows();
    assert_eq!(stream.next().await.unwrap().unwrap().get_str(0).unwrap(), Some("1"));
    let outcome = stream.outcome().await.unwrap();
    assert_eq!(outcome.rows_affected, Some(5));
    assert!(outcome.has_more);

    assert_eq!(results.next_update().await.unwrap().rows_affected, Some(0));
}

#[tokio::test]
async fn test_dropped_results_are_released() {
    let (conn, mut backend) = connect().await;

    drop(conn.query("SELECT 1").await.unwrap());
    backend.read_query().await;
    let mut reply = numbered_rows("n", 3);
    reply.extend(ready(b'I'));
    backend.send(&reply).await;

    let results = conn.query("SELECT 2").await.unwrap();
    backend.read_query().await;
    let mut reply = numbered_rows("m", 1);
    reply.extend(ready(b'T'));
    backend.send(&reply).await;
    assert_eq!(results.next_rows().collect().await.unwrap().0.len(), 1);
    let status = conn.session().await.unwrap().transaction_status;
    assert_eq!(status, TransactionStatus::InTransaction);
    assert!(status.in_transaction());
}

#[tokio::test]
async fn test_async_messages_reach_handler() {
    let (conn, mut backend) = connect().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.set_async_message_handler(move |message: &AsyncMessage| {
        let _ = tx.send(message.clone());
    })
    .unwrap();
    conn.session().await.unwrap();

    backend.send(&notification(7, "jobs", "42")).await;
    assert_eq!(
        rx.recv().await.unwrap(),
        AsyncMessage::Notification {
            pid: 7,
            channel: "jobs".into(),
            payload: "42".into(),
        }
    );

    backend
        .send(&parameter_status("TimeZone", "UTC"))
        .await;
    assert!(matches!(
        rx.recv().await.unwrap(),
        AsyncMessage::ParameterChanged { .. }
    ));
    assert_eq!(
        conn.session().await.unwrap().server_params.get("TimeZone").map(String::as_str),
        Some("UTC")
    );

    // Clearing drops the handler before the next notification is read.
    conn.clear_async_message_handler().unwrap();
    backend.send(&notification(7, "jobs", "43")).await;
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_notice_becomes_warning() {
    let (conn, mut backend) = connect().await;

    let results = conn.query("DROP TABLE IF EXISTS t").await.unwrap();
    backend.read_query().await;
    let mut reply = notice("table \"t\" does not exist, skipping");
    reply.extend(command_complete("DROP TABLE"));
    reply.extend(ready(b'I'));
    backend.send(&reply).await;

    let outcome = results.next_update().await.unwrap();
    assert_eq!(outcome.command, "DROP");
    assert_eq!(outcome.rows_affected, None);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].code.as_deref(), Some("01000"));
}

#[tokio::test]
async fn test_queue_overflow() {
    let mut opts = opts();
    opts.task_queue_capacity = 1;
    let (conn, _backend) = connect_with(opts).await;

    // The first task runs, the second waits, the third does not fit.
    let _running = conn.query("SELECT 1").await.unwrap();
    let _queued = conn.query("SELECT 2").await.unwrap();
    assert!(matches!(
        conn.query("SELECT 3").await,
        Err(Error::QueueOverflow(1))
    ));
}

#[tokio::test]
async fn test_connection_lost() {
    let (conn, mut backend) = connect().await;

    let results = conn.query("SELECT pg_sleep(10)").await.unwrap();
    let pending = results.next_update();
    backend.read_query().await;
    drop(backend);

    assert!(matches!(pending.await, Err(Error::ConnectionClosed)));
    let err = match conn.query("SELECT 1").await {
        Ok(_) => panic!("query on a closed connection"),
        Err(err) => err,
    };
    assert!(matches!(err, Error::ConnectionClosed));
    assert!(err.is_connection_broken());
}

#[tokio::test]
async fn test_close_sends_terminate() {
    let (conn, mut backend) = connect().await;

    let ((), (type_byte, _)) = tokio::join!(
        async { conn.close().await.unwrap() },
        backend.read_message()
    );
    assert_eq!(type_byte, b'X');
}

#[tokio::test]
async fn test_cleartext_password() {
    let (client, server) = tokio::io::duplex(1 << 16);
    let mut backend = Backend::new(server);
    let mut opts = opts();
    opts.password = Some("hunter2".into());

    let server = async {
        backend.read_startup().await;
        backend.send(&auth(3, &[])).await;
        let (type_byte, body) = backend.read_message().await;
        assert_eq!(type_byte, b'p');
        assert_eq!(body, b"hunter2\0");
        let mut reply = auth_ok();
        reply.extend(ready(b'I'));
        backend.send(&reply).await;
    };
    let (conn, ()) = tokio::join!(
        reactive_pg::tokio::Conn::connect_with_stream(
            reactive_pg::tokio::Stream::custom(client),
            opts
        ),
        server
    );
    let conn = conn.unwrap();
    assert!(conn.cancel_token().is_none());
}

#[tokio::test]
async fn test_authentication_failure() {
    let (client, server) = tokio::io::duplex(1 << 16);
    let mut backend = Backend::new(server);

    let server = async {
        backend.read_startup().await;
        let mut payload = Vec::new();
        for (field, value) in [(b'S', "FATAL"), (b'V', "FATAL"), (b'C', "28000"), (b'M', "no")] {
            payload.push(field);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        backend.send(&frame(b'E', &payload)).await;
    };
    let (conn, ()) = tokio::join!(
        reactive_pg::tokio::Conn::connect_with_stream(
            reactive_pg::tokio::Stream::custom(client),
            opts()
        ),
        server
    );
    let err = match conn {
        Ok(_) => panic!("startup should fail"),
        Err(err) => err,
    };
    assert_eq!(err.sqlstate(), Some("28000"));
    assert!(err.is_connection_broken());
}
