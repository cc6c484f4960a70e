/// REST history store against a loopback HTTP server
use bytes::Bytes;
use chatsync_core::message_store::HistoryStore;
use chatsync_core::http_store::HttpHistoryStore;
use chatsync_core::protocol::OutboundEvent;
use chatsync_core::reconciler::PageState;
use chatsync_core::transport::Transport;
use chatsync_core::{Config, ConversationKey, LocalUser, Result, Session, SyncError};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Seen {
    method: String,
    path: String,
    auth: Option<String>,
    body: Value,
}

type Log = Arc<Mutex<Vec<Seen>>>;

struct NullTransport;

#[async_trait::async_trait]
impl Transport for NullTransport {
    async fn emit(&self, _event: OutboundEvent) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}
}

fn doc(id: &str, sender: &str, minute: u32) -> Value {
    let receiver = if sender == "bob" { "alice" } else { "bob" };
    json!({
        "_id": id,
        "message": format!("text {}", id),
        "senderId": { "_id": sender, "name": sender },
        "receiverId": receiver,
        "createdAt": format!("2024-05-01T10:{:02}:00Z", minute),
        "status": "delivered"
    })
}

async fn handle(req: Request<Incoming>, log: Log) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();
    let auth = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let raw = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
    let body: Value = serde_json::from_slice(&raw).unwrap_or(Value::Null);
    log.lock().unwrap().push(Seen {
        method: method.clone(),
        path: path.clone(),
        auth,
        body: body.clone(),
    });

    let (status, reply) = match (method.as_str(), path.as_str()) {
        ("GET", "/api/chat/bob?page=1&limit=2") => (
            StatusCode::OK,
            json!({
                "messages": [doc("m4", "bob", 4), doc("m3", "alice", 3)],
                "pagination": { "hasMore": true, "totalPages": 2 }
            }),
        ),
        ("GET", "/api/chat/bob?page=2&limit=2") => (
            StatusCode::OK,
            json!({
                "messages": [doc("m1", "bob", 1), doc("m2", "bob", 2)],
                "pagination": { "hasMore": false, "totalPages": 2 }
            }),
        ),
        ("POST", "/api/chat") => (
            StatusCode::CREATED,
            json!({
                "_id": "srv-1",
                "message": body["message"],
                "senderId": "alice",
                "receiverId": body["receiverId"],
                "createdAt": "2024-05-01T10:05:00Z",
                "status": "sent"
            }),
        ),
        ("POST", "/api/group/message") => (
            StatusCode::FORBIDDEN,
            json!({ "message": "Not a member of this group" }),
        ),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "message": "boom" })),
    };

    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(reply.to_string())))
        .unwrap())
}

async fn serve() -> (String, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let server_log = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let log = server_log.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, log.clone()));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (format!("http://{}/api", addr), log)
}

fn store(base: &str) -> HttpHistoryStore {
    HttpHistoryStore::new(base, Some("tok-123".to_string()), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_fetches_pages_with_bearer_token() {
    let (base, log) = serve().await;
    let history = store(&base);
    let bob = ConversationKey::direct("bob");

    let page = history.get_messages(&bob, 1, 2).await.unwrap();
    let ids: Vec<_> = page.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m3", "m4"]);
    assert!(page.has_more);

    let seen = log.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].auth.as_deref(), Some("Bearer tok-123"));
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let (base, _log) = serve().await;
    let history = store(&base);

    let err = history
        .get_messages(&ConversationKey::group("g1"), 1, 50)
        .await
        .unwrap_err();
    match err {
        SyncError::Transport(reason) => assert!(reason.contains("500")),
        other => panic!("unexpected error {}", other),
    }
}

#[tokio::test]
async fn test_synchronizer_loads_and_sends_over_http() {
    let (base, log) = serve().await;
    let config = Config {
        user_id: "alice".to_string(),
        user_name: "Alice".to_string(),
        page_size: 2,
        prefetch_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let session = Session::login(
        LocalUser::new("alice", "Alice"),
        config,
        Arc::new(NullTransport),
        Arc::new(store(&base)),
    );
    let sync = session.synchronizer();
    let bob = ConversationKey::direct("bob");

    let mut rx = sync.on_active_view_change();
    sync.open_conversation(bob.clone()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let done = {
                let view = rx.borrow_and_update();
                view.messages.len() == 4 && !view.has_more
            };
            if done {
                break;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("history never fully loaded");

    let sent = sync.send("over http").await.unwrap();
    assert_eq!(sent.id.as_str(), "srv-1");

    let view = sync.active_view();
    assert_eq!(view.state, PageState::Ready);
    let ids: Vec<_> = view.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3", "m4", "srv-1"]);

    let post = log
        .lock()
        .unwrap()
        .iter()
        .find(|s| s.method == "POST")
        .cloned()
        .expect("no create request");
    assert_eq!(post.path, "/api/chat");
    assert_eq!(post.body, json!({ "receiverId": "bob", "message": "over http" }));
}

#[tokio::test]
async fn test_rejected_group_send_reports_status() {
    let (base, _log) = serve().await;
    let history = store(&base);

    let err = history
        .create_message(&ConversationKey::group("g1"), "hello team")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("403"));
}
