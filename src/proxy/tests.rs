//! Tests for the proxy module

#[cfg(test)]
mod proxy_service_tests {
    use crate::proxy::test_utils::test_helpers::*;
    use crate::proxy::{Proxy, ProxyConfig, Switch};
    use axum::http::StatusCode;
    use std::time::Duration;
    use tower::ServiceExt;

    #[test]
    fn test_proxy_config_defaults() {
        let config = ProxyConfig::default();

        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.pool_capacity.into_inner(), 256);
    }

    #[test]
    fn test_pool_follows_configured_capacity() {
        let proxy = Proxy::new(test_proxy_config());
        assert_eq!(proxy.pool().capacity(), 8);
        assert_eq!(proxy.pool().available(), 0);
        assert_eq!(proxy.pool().free_slots(), 8);
    }

    #[tokio::test]
    async fn test_router_serves_any_method_and_path() {
        let upstream = spawn_upstream(echo_router()).await;
        let proxy = Proxy::new(test_proxy_config());
        proxy.primary(Switch::new(&format!("http://{upstream}")).unwrap());
        let app = proxy.router();

        for (method, uri) in [
            ("GET", "/"),
            ("OPTIONS", "/deeply/nested/resource"),
            ("HEAD", "/head"),
            ("PATCH", "/x?y=z"),
        ] {
            let response = app
                .clone()
                .oneshot(proxy_request(method, uri, ""))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn test_replacing_primary_takes_effect() {
        let first = spawn_upstream(fixed_router(StatusCode::OK, "first")).await;
        let second = spawn_upstream(fixed_router(StatusCode::OK, "second")).await;
        let proxy = Proxy::new(test_proxy_config());
        let app = proxy.router();

        proxy.primary(Switch::new(&format!("http://{first}")).unwrap());
        let response = app
            .clone()
            .oneshot(proxy_request("GET", "/", ""))
            .await
            .unwrap();
        assert_eq!(&read_body(response).await[..], b"first");

        proxy.primary(Switch::new(&format!("http://{second}")).unwrap());
        let response = app.oneshot(proxy_request("GET", "/", "")).await.unwrap();
        assert_eq!(&read_body(response).await[..], b"second");
    }
}

#[cfg(test)]
mod hook_tests {
    use crate::proxy::test_utils::test_helpers::*;
    use crate::proxy::{CorrelationId, Proxy, Switch};
    use axum::http::StatusCode;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    #[derive(Debug)]
    struct Seen {
        id: CorrelationId,
        response: bool,
        status: Option<u16>,
        body: Vec<u8>,
        remote_addr: Option<std::net::SocketAddr>,
    }

    #[tokio::test]
    async fn test_hooks_observe_primary_call() {
        let upstream = spawn_upstream(fixed_router(StatusCode::ACCEPTED, "upstream body")).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (pre_seen, post_seen) = (Arc::clone(&seen), Arc::clone(&seen));

        let primary = Switch::new(&format!("http://{upstream}"))
            .unwrap()
            .with_pre_hook(move |record| {
                pre_seen.lock().unwrap().push(Seen {
                    id: record.correlation_id,
                    response: record.is_response(),
                    status: record.status.map(|s| s.as_u16()),
                    body: record.body.to_vec(),
                    remote_addr: record.remote_addr,
                })
            })
            .with_post_hook(move |record| {
                post_seen.lock().unwrap().push(Seen {
                    id: record.correlation_id,
                    response: record.is_response(),
                    status: record.status.map(|s| s.as_u16()),
                    body: record.body.to_vec(),
                    remote_addr: record.remote_addr,
                })
            });

        let proxy = Proxy::new(test_proxy_config());
        proxy.primary(primary);
        let response = proxy
            .router()
            .oneshot(proxy_request("POST", "/hooked", "request body"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].response);
        assert_eq!(seen[0].status, None);
        assert_eq!(seen[0].body, b"request body");
        assert!(seen[1].response);
        assert_eq!(seen[1].status, Some(202));
        assert_eq!(seen[1].body, b"upstream body");
        assert_eq!(seen[0].id, seen[1].id);
        // oneshot bypasses the accept loop, so no peer address is known
        assert_eq!(seen[0].remote_addr, None);
    }

    #[tokio::test]
    async fn test_each_call_gets_its_own_correlation_id() {
        let primary = spawn_upstream(echo_router()).await;
        let mirror = spawn_upstream(echo_router()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (primary_tx, mirror_tx) = (tx.clone(), tx);

        let proxy = Proxy::new(test_proxy_config());
        proxy.primary(
            Switch::new(&format!("http://{primary}"))
                .unwrap()
                .with_post_hook(move |record| {
                    primary_tx.send(record.correlation_id).ok();
                }),
        );
        proxy.add_secondary([Switch::new(&format!("http://{mirror}"))
            .unwrap()
            .with_post_hook(move |record| {
                mirror_tx.send(record.correlation_id).ok();
            })]);

        proxy
            .router()
            .oneshot(proxy_request("GET", "/", ""))
            .await
            .unwrap();

        let wait = Duration::from_secs(5);
        let first = tokio::time::timeout(wait, rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(wait, rx.recv()).await.unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_panicking_hook_does_not_fail_request() {
        let upstream = spawn_upstream(fixed_router(StatusCode::OK, "fine")).await;
        let proxy = Proxy::new(test_proxy_config());
        proxy.primary(
            Switch::new(&format!("http://{upstream}"))
                .unwrap()
                .with_pre_hook(|_| panic!("pre hook failure"))
                .with_post_hook(|_| panic!("post hook failure")),
        );

        let response = proxy
            .router()
            .oneshot(proxy_request("GET", "/", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&read_body(response).await[..], b"fine");
    }
}
