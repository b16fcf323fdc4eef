#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::{sync::Arc, time::Duration};

use {
    webirc_config::{AcmeConfig, GatewayConfig, ServerConfig},
    webirc_gateway::{Collaborators, Gateway, ListenerKind, RunMode},
};

use common::{
    EchoTransport, config_with, http1_get, plain_server, tls_connect, within, write_key_pair,
    write_named_pair,
};

fn gateway(config: GatewayConfig) -> Arc<Gateway> {
    Gateway::new(
        RunMode::Gateway,
        config,
        Collaborators::new().with_transport(Arc::new(EchoTransport)),
    )
}

#[tokio::test]
async fn static_tls_negotiates_http1_and_serves_routes() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_key_pair(dir.path());

    let server = ServerConfig {
        tls: true,
        cert: Some(cert.display().to_string()),
        key: Some(key.display().to_string()),
        ..plain_server()
    };
    let gateway = gateway(config_with(vec![server]));
    gateway.start().unwrap();
    within(gateway.wait_ready()).await;

    let listener = gateway.listeners().remove(0);
    assert_eq!(listener.kind, ListenerKind::StaticTls);
    let addr = listener.local_addr.unwrap();

    let mut stream = within(tls_connect(addr, "localhost", &cert)).await.unwrap();
    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

    let response = within(http1_get(&mut stream, "localhost", "/webirc/info")).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"webircgateway\""), "{response}");

    gateway.close();
    within(gateway.wait_close()).await;
}

#[tokio::test]
async fn acme_tls_serves_cached_certificate() {
    let cache = tempfile::tempdir().unwrap();
    let (cert, _) = write_named_pair(cache.path(), "irc.example.org", "irc.example.org");

    let server = ServerConfig {
        tls: true,
        letsencrypt_cache: Some(cache.path().display().to_string()),
        ..plain_server()
    };
    let gateway = gateway(GatewayConfig {
        acme: AcmeConfig {
            // Nothing here may reach a real CA.
            directory: "https://127.0.0.1:9/directory".into(),
            ..AcmeConfig::default()
        },
        ..config_with(vec![server])
    });
    gateway.start().unwrap();
    within(gateway.wait_ready()).await;

    let listener = gateway.listeners().remove(0);
    assert_eq!(listener.kind, ListenerKind::AcmeTls);
    let addr = listener.local_addr.unwrap();

    let mut stream = within(tls_connect(addr, "irc.example.org", &cert))
        .await
        .unwrap();
    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));
    let response = within(http1_get(&mut stream, "irc.example.org", "/webirc/info")).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    // No certificate for this name yet: the handshake fails and an order starts.
    let uncached = within(tls_connect(addr, "other.example.org", &cert)).await;
    assert!(uncached.is_err());
    // One provider for the directory; the valid cached certificate needs no order.
    assert_eq!(gateway.acme().len(), 1);
    assert!(!gateway.acme().get(cache.path()).is_pending("irc.example.org"));

    gateway.close();
    within(gateway.wait_close()).await;
}

#[tokio::test]
async fn closed_tls_listener_leaves_no_tasks_behind() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_key_pair(dir.path());
    let server = ServerConfig {
        tls: true,
        cert: Some(cert.display().to_string()),
        key: Some(key.display().to_string()),
        ..plain_server()
    };
    let gateway = gateway(config_with(vec![server]));
    gateway.start().unwrap();
    within(gateway.wait_ready()).await;

    let addr = gateway.listeners()[0].local_addr.unwrap();
    drop(within(tls_connect(addr, "localhost", &cert)).await.unwrap());

    gateway.close();
    within(gateway.wait_close()).await;

    let metrics = tokio::runtime::Handle::current().metrics();
    within(async {
        while metrics.num_alive_tasks() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}
