use super::*;
use crate::error::CorralError;
use crate::protocol::{ErrorCode, Request, Response};
use crate::shutdown::Shutdown;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;

async fn spawn_echo_server(shutdown: Shutdown) -> SocketAddr {
    let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        server
            .run_with_handler(
                |request: Request| async move {
                    if request.method == "fail" {
                        return Err(CorralError::Remote("handler failed".into()));
                    }
                    Ok(Response::success(request.id, request.args))
                },
                shutdown,
            )
            .await
    });
    addr
}

#[tokio::test]
async fn test_request_response_over_tcp() {
    let shutdown = Shutdown::new();
    let addr = spawn_echo_server(shutdown.clone()).await;

    let transport = TcpTransport::new();
    let mut stream = transport
        .connect(&addr.to_string(), Duration::from_secs(1))
        .await
        .unwrap();

    let request = Request::new("echo", json!({"value": 42}));
    let response = transport.send_request(&mut stream, &request).await.unwrap();
    assert_eq!(response.id, request.id);
    assert_eq!(response.result, Some(json!({"value": 42})));

    // Same connection serves a second request.
    let request = Request::new("echo", json!([1, 2, 3]));
    let response = transport.send_request(&mut stream, &request).await.unwrap();
    assert_eq!(response.result, Some(json!([1, 2, 3])));

    shutdown.trigger();
}

#[tokio::test]
async fn test_handler_error_becomes_error_response() {
    let shutdown = Shutdown::new();
    let addr = spawn_echo_server(shutdown.clone()).await;

    let transport = TcpTransport::new();
    let mut stream = transport
        .connect(&addr.to_string(), Duration::from_secs(1))
        .await
        .unwrap();

    let request = Request::new("fail", json!(null));
    let response = transport.send_request(&mut stream, &request).await.unwrap();
    assert!(!response.success);
    assert_eq!(response.code, Some(ErrorCode::Internal));
    assert!(response.error.unwrap().contains("handler failed"));

    shutdown.trigger();
}

#[tokio::test]
async fn test_connect_refused() {
    // Grab a free port and release it so nothing is listening there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = TcpTransport::new()
        .connect(&addr.to_string(), Duration::from_millis(500))
        .await;
    assert!(matches!(result, Err(CorralError::Connection(_))));
}

#[tokio::test]
async fn test_server_stops_on_shutdown() {
    let shutdown = Shutdown::new();
    let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
    let signal = shutdown.clone();
    let handle = tokio::spawn(async move {
        server
            .run_with_handler(
                |request: Request| async move { Ok(Response::success(request.id, json!(null))) },
                signal,
            )
            .await
    });

    shutdown.trigger();
    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("server should stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_connect_enables_keepalive() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _conn = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let transport = TcpTransport::new().with_keepalive(Some(Duration::from_secs(360)));
    let stream = transport.connect(&addr, Duration::from_secs(1)).await.unwrap();

    let sock = socket2::SockRef::from(&stream);
    assert!(sock.keepalive().unwrap());
    #[cfg(target_os = "linux")]
    assert_eq!(sock.tcp_keepalive_time().unwrap(), Duration::from_secs(360));
}

#[tokio::test]
async fn test_connect_without_keepalive_leaves_it_off() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _conn = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let stream = TcpTransport::new()
        .connect(&addr, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!socket2::SockRef::from(&stream).keepalive().unwrap());
}
