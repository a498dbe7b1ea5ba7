use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duperagent::config::{CacheConfig, Config, CookieJarConfig};
use duperagent::{Agent, EventKind, RequestEvent};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Incoming {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Incoming {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Incoming> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut start = lines.next()?.split(' ');
    let method = start.next()?.to_string();
    let path = start.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let mut request = Incoming {
        method,
        path,
        headers,
        body: buf[head_end..].to_vec(),
    };

    if let Some(len) = request.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
        while request.body.len() < len {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            request.body.extend_from_slice(&chunk[..n]);
        }
    } else if request.header("transfer-encoding").is_some() {
        while !request.body.ends_with(b"0\r\n\r\n") {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            request.body.extend_from_slice(&chunk[..n]);
        }
    }

    Some(request)
}

fn reply(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: {}\r\n", body.len());
    for (k, v) in headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("\r\n");
    let mut out = out.into_bytes();
    out.extend_from_slice(body);
    out
}

async fn respond(request: Incoming) -> Vec<u8> {
    match request.path.as_str() {
        "/hello" => reply(
            "200 OK",
            &[("Content-Type", "text/plain"), ("Set-Cookie", "visit=1; Path=/")],
            b"hello",
        ),
        "/json" => reply("200 OK", &[("Content-Type", "application/json")], br#"{"a":1,"list":[1,2]}"#),
        "/redirect" => reply("302 Found", &[("Location", "/hello")], b""),
        "/see-other" => reply("303 See Other", &[("Location", "/echo")], b""),
        "/loop" => reply("302 Found", &[("Location", "/loop")], b""),
        "/missing" => reply("404 Not Found", &[("Content-Type", "text/plain")], b"nope"),
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            reply("200 OK", &[], b"late")
        }
        path if path.starts_with("/echo") => {
            let echo = json!({
                "method": request.method,
                "path": request.path,
                "cookie": request.header("cookie"),
                "contentType": request.header("content-type"),
                "authorization": request.header("authorization"),
                "body": String::from_utf8_lossy(&request.body),
            });
            reply(
                "200 OK",
                &[("Content-Type", "application/json")],
                echo.to_string().as_bytes(),
            )
        }
        _ => reply("500 Internal Server Error", &[], b""),
    }
}

async fn serve() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                if let Some(request) = read_request(&mut stream).await {
                    let out = respond(request).await;
                    let _ = stream.write_all(&out).await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });

    addr
}

fn agent() -> Agent {
    let config = Config::builder()
        .cache(CacheConfig::Disabled)
        .cookie_jar(CookieJarConfig::Memory)
        .build()
        .unwrap();
    Agent::new(config).unwrap()
}

#[tokio::test]
async fn get_parses_json() {
    let addr = serve().await;
    let downloads = Arc::new(AtomicUsize::new(0));
    let counter = downloads.clone();

    let res = agent()
        .get(&format!("http://{addr}/json"))
        .on(EventKind::Progress, move |_: &RequestEvent<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .send_async()
        .await
        .unwrap();

    assert!(res.ok());
    assert_eq!(res.json(), Some(&json!({ "a": 1, "list": [1, 2] })));
    assert!(downloads.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn redirect_is_followed_and_cookies_are_replayed() {
    let addr = serve().await;
    let agent = agent();

    let res = agent.get(&format!("http://{addr}/redirect")).send_async().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text(), "hello");
    assert_eq!(res.url().path(), "/hello");

    let jar = agent.cookie_jar().unwrap();
    assert_eq!(jar.read().unwrap().cookies(), "visit=1");

    let echo = agent.get(&format!("http://{addr}/echo")).send_async().await.unwrap();
    assert_eq!(echo.json().unwrap()["cookie"], "visit=1");
}

#[tokio::test]
async fn redirect_loop_is_cut_off() {
    let addr = serve().await;
    let err = agent()
        .get(&format!("http://{addr}/loop"))
        .redirects(2)
        .send_async()
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Too many redirects"));
    assert_eq!(err.response().unwrap().status(), 302);
}

#[tokio::test]
async fn see_other_turns_post_into_get() {
    let addr = serve().await;
    let res = agent()
        .post(&format!("http://{addr}/see-other"))
        .send("a=1")
        .send("b=2")
        .send_async()
        .await
        .unwrap();

    let echo = res.json().unwrap();
    assert_eq!(echo["method"], "GET");
    assert_eq!(echo["body"], "");
    assert_eq!(echo["contentType"], Value::Null);
}

#[tokio::test]
async fn post_sends_json_query_and_auth() {
    let addr = serve().await;
    let res = agent()
        .post(&format!("http://{addr}/echo"))
        .query(json!({ "q": "a b" }))
        .auth("user", "pass")
        .send(json!({ "name": "widget" }))
        .send(json!({ "count": 2 }))
        .send_async()
        .await
        .unwrap();

    let echo = res.json().unwrap();
    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["path"], "/echo?q=a+b");
    assert_eq!(echo["contentType"], "application/json");
    assert_eq!(echo["authorization"], "Basic dXNlcjpwYXNz");
    assert_eq!(echo["body"], r#"{"name":"widget","count":2}"#);
}

#[tokio::test]
async fn multipart_fields_are_uploaded() {
    let addr = serve().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "file-content").unwrap();

    let res = agent()
        .post(&format!("http://{addr}/echo"))
        .field("title", "hello-field")
        .attach("upload", &path, None)
        .send_async()
        .await
        .unwrap();

    let echo = res.json().unwrap();
    assert!(echo["contentType"].as_str().unwrap().starts_with("multipart/form-data"));
    let body = echo["body"].as_str().unwrap();
    assert!(body.contains("hello-field"));
    assert!(body.contains("file-content"));
    assert!(body.contains("filename=\"notes.txt\""));
}

#[tokio::test]
async fn error_status_resolves() {
    let addr = serve().await;
    let res = agent().get(&format!("http://{addr}/missing")).send_async().await.unwrap();
    assert!(res.not_found());
    assert_eq!(res.text(), "nope");
}

#[tokio::test]
async fn slow_reply_times_out() {
    let addr = serve().await;
    let err = agent()
        .get(&format!("http://{addr}/slow"))
        .timeout(100)
        .send_async()
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(err.is_abort());
}

#[tokio::test]
async fn refused_connection_is_a_transport_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let err = agent().get(&format!("http://{addr}/")).send_async().await.unwrap_err();
    assert!(err.code().is_some());
    assert!(!err.is_abort());
    assert!(err.response().is_none());
}

#[tokio::test]
async fn all_collects_in_order() {
    let addr = serve().await;
    let agent = agent();

    let promises = vec![
        agent.get(&format!("http://{addr}/hello")).promise(),
        agent.get(&format!("http://{addr}/json")).promise(),
    ];
    let responses = duperagent::all(promises).wait().await.unwrap();

    assert_eq!(responses[0].text(), "hello");
    assert_eq!(responses[1].json().unwrap()["a"], 1);
}

#[tokio::test]
async fn post_with_callback_dispatches() {
    let addr = serve().await;
    let (tx, rx) = tokio::sync::oneshot::channel();
    let callback: duperagent::Callback = Box::new(move |result| {
        let _ = tx.send(result);
    });

    agent().post_with(&format!("http://{addr}/echo"), Some(json!({ "id": 7 })), Some(callback));

    let echo = rx.await.unwrap().unwrap();
    assert_eq!(echo.json().unwrap()["body"], r#"{"id":7}"#);
}
