//! End-to-end tests: an in-process kontrol plus real kites on
//! ephemeral ports. Registration, discovery, tokens, watchers,
//! version ranges, renewal, and the HTTP register/heartbeat pair.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use kite_protocol::{EventAction, KiteQuery, RegisterHttpRequest, RegisterResult};
use kontrol::{KeyPair, KeyPairs, Kontrol, KontrolConfig, MemoryStorage, TokenSigner};

const PRIVATE: &str = include_str!("keys/kontrol.pem");
const PUBLIC: &str = include_str!("keys/kontrol.pub.pem");

struct TestKontrol {
    kontrol: Arc<Kontrol>,
    url: String,
    signer: TokenSigner,
}

async fn start_kontrol() -> TestKontrol {
    start_kontrol_with(|_config| {}).await
}

async fn start_kontrol_with(tweak: impl FnOnce(&mut KontrolConfig)) -> TestKontrol {
    let mut config = KontrolConfig::new(PUBLIC.to_string(), PRIVATE.to_string());
    config.ip = "127.0.0.1".into();
    config.port = 0;
    config.environment = "test".into();
    tweak(&mut config);

    let kontrol = Arc::new(Kontrol::new(config, Arc::new(MemoryStorage::new())).unwrap());
    let serving = kontrol.clone();
    tokio::spawn(async move {
        if let Err(e) = serving.serve().await {
            eprintln!("kontrol serve failed: {e}");
        }
    });

    let mut ready = kontrol.kite().ready();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !*ready.borrow_and_update() {
            ready.changed().await.unwrap();
        }
    })
    .await
    .expect("kontrol never became ready");

    let port = kontrol.kite().local_addr().unwrap().port();
    TestKontrol {
        kontrol,
        url: format!("http://127.0.0.1:{port}/kite"),
        signer: TokenSigner::new(
            "kontrol".into(),
            KeyPairs::new(KeyPair::new(PUBLIC.into(), PRIVATE.into()).unwrap()),
        ),
    }
}

impl TestKontrol {
    /// A kite belonging to `alice`, wired to this kontrol.
    fn kite(&self, name: &str, version: &str) -> kite::Kite {
        let mut config = kite::Config::new(name, version);
        config.username = "alice".into();
        config.environment = "test".into();
        config.ip = "127.0.0.1".into();
        config.port = 0;
        config.kontrol_url = Some(self.url.clone());
        config.kontrol_user = "kontrol".into();
        config.kontrol_key = Some(PUBLIC.to_string());
        config.kite_key = Some(self.signer.sign_kite_key("alice", &self.url).unwrap());
        kite::Kite::with_config(config)
    }
}

/// Serve a kite and keep it registered; returns once registration
/// confirmed.
async fn serve_registered(kite: &kite::Kite) {
    let serving = kite.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    let mut ready = kite.ready();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !*ready.borrow_and_update() {
            ready.changed().await.unwrap();
        }
    })
    .await
    .expect("kite never became ready");

    let port = kite.local_addr().unwrap().port();
    let url = format!("http://127.0.0.1:{port}/kite");
    let mut registered = kite.register_forever(&url).unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !*registered.borrow_and_update() {
            registered.changed().await.unwrap();
        }
    })
    .await
    .expect("kite never registered");
}

fn query(name: &str) -> KiteQuery {
    KiteQuery {
        username: "alice".into(),
        environment: "test".into(),
        name: name.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn register_discover_call() {
    let tk = start_kontrol().await;

    let worker = tk.kite("mathworker", "1.0.0");
    worker.handle_func("square", |req| async move {
        let n: f64 = req.one()?;
        Ok(json!(n * n))
    });
    serve_registered(&worker).await;

    let caller = tk.kite("caller", "1.0.0");
    let kontrol_client = caller.kontrol().unwrap();
    let clients = kontrol_client.get_kites(query("mathworker")).await.unwrap();
    assert_eq!(clients.len(), 1);

    let remote = &clients[0];
    assert_eq!(remote.remote_kite().name, "mathworker");
    remote.dial().await.unwrap();
    // The attached token authenticates the call end to end.
    let result = remote.tell("square", vec![json!(3.0)]).await.unwrap();
    assert_eq!(result, json!(9.0));

    worker.close();
    tk.kontrol.close();
}

#[tokio::test]
async fn version_range_queries_filter() {
    let tk = start_kontrol().await;

    let mut kites = Vec::new();
    for version in ["0.1.0", "0.2.0", "1.0.0"] {
        let worker = tk.kite("vermath", version);
        serve_registered(&worker).await;
        kites.push(worker);
    }

    let caller = tk.kite("caller", "1.0.0");
    let kontrol_client = caller.kontrol().unwrap();
    let mut range_query = query("vermath");
    range_query.version = ">=0.2.0, <1.0.0".into();
    let clients = kontrol_client.get_kites(range_query).await.unwrap();

    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].remote_kite().version, "0.2.0");

    for worker in &kites {
        worker.close();
    }
    tk.kontrol.close();
}

#[tokio::test]
async fn watcher_sees_registration() {
    // Short heartbeat window so deregistration shows up quickly once
    // the newcomer stops beating.
    let tk = start_kontrol_with(|config| {
        config.heartbeat_interval = Duration::from_secs(1);
        config.heartbeat_delay = Duration::from_secs(2);
    })
    .await;

    let watcher_kite = tk.kite("watcher", "1.0.0");
    let kontrol_client = watcher_kite.kontrol().unwrap();
    kontrol_client.wait_connected().await;

    let (event_tx, mut event_rx) = mpsc::channel(4);
    let handle = kontrol_client
        .watch_kites(
            KiteQuery {
                username: "alice".into(),
                ..Default::default()
            },
            move |event| {
                let _ = event_tx.try_send(event);
            },
        )
        .await
        .unwrap();
    assert!(!handle.id().is_empty());

    let newcomer = tk.kite("m", "1.0.0");
    serve_registered(&newcomer).await;

    let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
        .await
        .expect("no watcher event within 2s")
        .unwrap();
    assert_eq!(event.action, EventAction::Register);
    assert_eq!(event.kite.name, "m");
    assert!(event.token.is_some());

    // Deregistration flows once the heartbeat window lapses.
    newcomer.close();
    let event = tokio::time::timeout(Duration::from_secs(10), event_rx.recv())
        .await
        .expect("no deregister event")
        .unwrap();
    assert_eq!(event.action, EventAction::Deregister);

    handle.cancel().await.unwrap();
    tk.kontrol.close();
}

#[tokio::test]
async fn token_renewal_swaps_the_auth_key() {
    let tk = start_kontrol_with(|config| {
        config.token_ttl = Duration::from_secs(3);
    })
    .await;

    let worker = tk.kite("renewtarget", "1.0.0");
    worker.handle_func("hello", |_req| async { Ok(json!("hi")) });
    serve_registered(&worker).await;

    let caller = tk.kite("caller", "1.0.0");
    let kontrol_client = caller.kontrol().unwrap();
    let clients = kontrol_client.get_kites(query("renewtarget")).await.unwrap();
    let remote = &clients[0];
    remote.dial().await.unwrap();

    let before = remote.auth().expect("token auth attached").key;
    assert_eq!(remote.tell("hello", vec![]).await.unwrap(), json!("hi"));

    // TTL 3s with the renewer's 1s floor: the key must rotate well
    // within 4s, and calls keep working with the fresh token.
    tokio::time::sleep(Duration::from_secs(4)).await;
    let after = remote.auth().expect("token auth still attached").key;
    assert_ne!(before, after, "auth key was never renewed");
    assert_eq!(remote.tell("hello", vec![]).await.unwrap(), json!("hi"));

    worker.close();
    tk.kontrol.close();
}

#[tokio::test]
async fn get_token_and_get_key() {
    let tk = start_kontrol().await;

    let worker = tk.kite("target", "1.0.0");
    serve_registered(&worker).await;

    let caller = tk.kite("caller", "1.0.0");
    let kontrol_client = caller.kontrol().unwrap();
    kontrol_client.wait_connected().await;

    let token = kontrol_client.get_token(&worker.kite()).await.unwrap();
    let claims = kite_protocol::KiteClaims::peek(&token).unwrap();
    assert_eq!(claims.aud.as_deref(), Some(worker.kite().key().as_str()));
    assert_eq!(claims.sub, "alice");

    let key = kontrol_client.get_key().await.unwrap();
    assert_eq!(key.trim(), PUBLIC.trim());

    worker.close();
    tk.kontrol.close();
}

#[tokio::test]
async fn http_register_and_heartbeat() {
    let tk = start_kontrol().await;
    let root = tk.url.trim_end_matches("/kite").to_string();
    let http = reqwest::Client::new();

    let identity = kite_protocol::Kite {
        username: "alice".into(),
        environment: "test".into(),
        name: "httpworker".into(),
        version: "1.0.0".into(),
        region: "r".into(),
        hostname: "h".into(),
        id: "http-kite-1".into(),
    };
    let body = RegisterHttpRequest {
        url: "http://127.0.0.1:7777/kite".into(),
        kite: identity,
        authentication: kite_protocol::Authentication::kite_key(
            tk.signer.sign_kite_key("alice", &tk.url).unwrap(),
        ),
    };

    let result: RegisterResult = http
        .post(format!("{root}/register"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result.heartbeat_interval, 10);

    let pong = http
        .get(format!("{root}/heartbeat"))
        .query(&[("id", "http-kite-1")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(pong, "pong");

    let again = http
        .get(format!("{root}/heartbeat"))
        .query(&[("id", "never-registered")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(again, "registeragain");

    // Bad credentials are refused.
    let mut bad = RegisterHttpRequest {
        authentication: kite_protocol::Authentication::kite_key("garbage"),
        ..body
    };
    bad.url = "http://127.0.0.1:7778/kite".into();
    let status = http
        .post(format!("{root}/register"))
        .json(&bad)
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);

    tk.kontrol.close();
}

#[tokio::test]
async fn unauthenticated_get_kites_is_refused() {
    let tk = start_kontrol().await;

    // A kite with no kite key at all.
    let mut config = kite::Config::new("anon", "0.0.1");
    config.environment = "test".into();
    config.kontrol_url = Some(tk.url.clone());
    config.kontrol_key = Some(PUBLIC.to_string());
    let anon = kite::Kite::with_config(config);

    let kontrol_client = anon.kontrol().unwrap();
    kontrol_client.wait_connected().await;
    let err = kontrol_client.get_kites(query("anything")).await.unwrap_err();
    assert_eq!(err.kind(), "authenticationError");

    tk.kontrol.close();
}

#[tokio::test]
async fn register_machine_issues_a_kite_key() {
    let tk = start_kontrol().await;
    tk.kontrol.set_machine_authenticator(Arc::new(|args| {
        if args.key == "letmein" {
            Ok(())
        } else {
            Err("bad machine credential".into())
        }
    }));

    let mut config = kite::Config::new("fresh-machine", "0.0.1");
    config.environment = "test".into();
    config.kontrol_url = Some(tk.url.clone());
    config.kontrol_key = Some(PUBLIC.to_string());
    let fresh = kite::Kite::with_config(config);
    let client = fresh.client(&tk.url);
    client.dial().await.unwrap();

    let denied = client
        .tell(
            "registerMachine",
            vec![json!({"username": "bob", "authType": "password", "key": "wrong"})],
        )
        .await
        .unwrap_err();
    assert_eq!(denied.kind(), "authenticationError");

    let token = client
        .tell(
            "registerMachine",
            vec![json!({"username": "bob", "authType": "password", "key": "letmein"})],
        )
        .await
        .unwrap();
    let Value::String(token) = token else {
        panic!("expected a kite key string, got {token:?}");
    };
    let claims = kite_protocol::KiteClaims::peek(&token).unwrap();
    assert_eq!(claims.sub, "bob");
    assert_eq!(claims.iss, "kontrol");
    assert!(claims.kontrol_key.is_some());

    tk.kontrol.close();
}
