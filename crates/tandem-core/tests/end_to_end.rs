//! End-to-end tests: a real listener on a loopback port, driven by
//! `Connection` and plain `reqwest` clients.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_rpc::{
    Callee, Caller, ConnectConfig, Connection, ConnectionState, Credentials, ListenConfig,
    Listener, ListenerHandle, TandemError,
};
use tokio::sync::mpsc;

/// The demo table used by most tests: `echo(x) = x` and an `echo` stream
/// repeating its argument every 100ms.
fn echo_callee() -> Arc<Callee> {
    let callee = Callee::builder()
        .method("echo", |params| async move {
            Ok(params.into_iter().next().unwrap_or(Value::Null))
        })
        .stream("echo", |publisher, params| {
            let value = params.into_iter().next().unwrap_or(Value::Null);
            let task = tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(100));
                loop {
                    interval.tick().await;
                    if publisher.publish(value.clone()).await.is_err() {
                        break;
                    }
                }
            });
            Ok(move || task.abort())
        })
        .build();
    Arc::new(callee)
}

async fn start(listener: Listener) -> (ListenerHandle, String) {
    let handle = listener.bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://127.0.0.1:{}/", handle.port());
    (handle, url)
}

#[tokio::test]
async fn test_echo_over_http_only() {
    let config = ListenConfig::default().with_websocket(false);
    let (_handle, url) = start(Listener::new(echo_callee(), config)).await;

    let conn = Connection::new(ConnectConfig::new(url), None).unwrap();
    let result = conn.execute("echo", vec![json!("hi")]).await.unwrap();

    assert_eq!(result, json!("hi"));
    assert_eq!(conn.state(), ConnectionState::UpgradeFailed);

    // Sticky: the next call goes straight to HTTP.
    let result = conn.execute("echo", vec![json!(2)]).await.unwrap();
    assert_eq!(result, json!(2));
    assert_eq!(conn.state(), ConnectionState::UpgradeFailed);
}

#[tokio::test]
async fn test_echo_over_websocket() {
    let (_handle, url) = start(Listener::new(echo_callee(), ListenConfig::default())).await;

    let conn = Connection::new(ConnectConfig::new(url), None).unwrap();
    let result = conn.execute("echo", vec![json!("hi")]).await.unwrap();

    assert_eq!(result, json!("hi"));
    assert_eq!(conn.state(), ConnectionState::PersistentAvailable);

    let err = conn.execute("missing", vec![]).await.unwrap_err();
    assert_eq!(err.remote_code(), Some(-32601));
    assert!(!err.is_transport());
}

#[tokio::test]
async fn test_concurrent_calls_share_one_upgrade() {
    let accepted = Arc::new(AtomicUsize::new(0));
    let listener = Listener::new(echo_callee(), ListenConfig::default()).on_caller({
        let accepted = accepted.clone();
        move |_| {
            accepted.fetch_add(1, Ordering::SeqCst);
        }
    });
    let (_handle, url) = start(listener).await;

    let conn = Connection::new(ConnectConfig::new(url), None).unwrap();
    let calls = (0..5).map(|i| conn.execute("echo", vec![json!(i)]));
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(i));
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_streaming_subscription() {
    let (_handle, url) = start(Listener::new(echo_callee(), ListenConfig::default())).await;
    let conn = Connection::new(ConnectConfig::new(url), None).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = conn
        .subscribe(
            move |value| {
                let _ = tx.send(value);
            },
            "echo",
            vec![json!("tick")],
        )
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("no value within 500ms");
    assert_eq!(first, Some(json!("tick")));

    while rx.try_recv().is_ok() {}
    assert!(subscription.close().await.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_reverse_call() {
    let (callers_tx, mut callers_rx) = mpsc::unbounded_channel::<Caller>();
    let listener = Listener::new(echo_callee(), ListenConfig::default()).on_caller(move |caller| {
        let _ = callers_tx.send(caller);
    });
    let (_handle, url) = start(listener).await;

    let client_callee = Callee::builder()
        .method("test", |_| async { Ok(json!(420)) })
        .build();
    let conn = Connection::new(ConnectConfig::new(url), Some(Arc::new(client_callee))).unwrap();
    conn.listen().await.unwrap();

    let reverse = tokio::time::timeout(Duration::from_secs(5), callers_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reverse.execute("test", vec![]).await.unwrap(), json!(420));
}

#[tokio::test]
async fn test_missing_credentials_are_rejected() {
    let config = ListenConfig::default().with_credentials(Credentials::basic("user", "pass"));
    let (_handle, url) = start(Listener::new(echo_callee(), config)).await;

    let response = reqwest::Client::new()
        .post(&url)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": ["x"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
    assert!(response.headers().contains_key("www-authenticate"));

    let anonymous = Connection::new(ConnectConfig::new(url.clone()), None).unwrap();
    let err = anonymous.execute("echo", vec![json!("x")]).await.unwrap_err();
    assert!(matches!(err, TandemError::Unauthorized));

    let config = ConnectConfig::new(url).with_credentials(Credentials::basic("user", "pass"));
    let authorized = Connection::new(config, None).unwrap();
    let result = authorized.execute("echo", vec![json!("x")]).await.unwrap();
    assert_eq!(result, json!("x"));
    assert_eq!(authorized.state(), ConnectionState::PersistentAvailable);
}

#[tokio::test]
async fn test_bearer_token_over_http() {
    let config = ListenConfig::default()
        .with_credentials(Credentials::bearer("s3cret"))
        .with_websocket(false);
    let (_handle, url) = start(Listener::new(echo_callee(), config)).await;

    let config = ConnectConfig::new(url).with_credentials(Credentials::bearer("s3cret"));
    let conn = Connection::new(config, None).unwrap();
    assert_eq!(conn.execute("echo", vec![json!(1)]).await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_subscribe_without_websocket_fails() {
    let config = ListenConfig::default().with_websocket(false);
    let (_handle, url) = start(Listener::new(echo_callee(), config)).await;

    let conn = Connection::new(ConnectConfig::new(url), None).unwrap();
    let err = conn.subscribe(|_| {}, "echo", vec![]).await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_batch_over_http() {
    let (_handle, url) = start(Listener::new(echo_callee(), ListenConfig::default())).await;

    let reply: Value = reqwest::Client::new()
        .post(&url)
        .json(&json!([
            {"jsonrpc": "2.0", "id": 1, "method": "echo", "params": ["a"]},
            {"jsonrpc": "2.0", "id": 2, "method": "nope"},
            {"id": 3},
        ]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let items = reply.as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["result"], "a");
    assert_eq!(items[1]["error"]["code"], -32601);
    assert_eq!(items[2]["error"]["code"], -32600);
    assert_eq!(items[2]["id"], 3);
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let (handle, url) = start(Listener::new(echo_callee(), ListenConfig::default())).await;
    let conn = Connection::new(ConnectConfig::new(url), None).unwrap();
    let caller = conn.listen().await.unwrap();

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), caller.closed())
        .await
        .unwrap();
    assert_eq!(conn.state(), ConnectionState::NoTransport);
}
