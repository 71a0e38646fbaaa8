use super::*;
use crate::config::{HealthCheckConfig, ProbeSettings};
use crate::test_support::test_definition;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn bound_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn service_with(port: u16, health_check: HealthCheckConfig) -> crate::config::ResolvedService {
    let mut service = test_definition("db", port);
    service.health_check = health_check;
    service
}

#[tokio::test]
async fn test_tcp_probe_healthy_when_listening() {
    let (listener, port) = bound_listener().await;
    tokio::spawn(async move {
        loop {
            let _ = listener.accept().await;
        }
    });

    let service = service_with(port, HealthCheckConfig::default());
    let outcome = run_probe(&service, &CancellationToken::new()).await;
    assert_eq!(outcome, ProbeOutcome::Healthy);
}

#[tokio::test]
async fn test_tcp_probe_unhealthy_when_refused() {
    let (listener, port) = bound_listener().await;
    drop(listener);

    let service = service_with(port, HealthCheckConfig::default());
    match run_probe(&service, &CancellationToken::new()).await {
        ProbeOutcome::Unhealthy(reason) => assert!(reason.contains(&port.to_string())),
        other => panic!("expected unhealthy, got {other:?}"),
    }
}

#[tokio::test]
async fn test_probe_cancellation_wins() {
    let (listener, port) = bound_listener().await;
    // Accept but never answer; with a long timeout, only the token can end this
    tokio::spawn(async move {
        let _keep = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let health_check = HealthCheckConfig {
        kind: crate::config::ProbeKind::Kafka,
        timeout: Duration::from_secs(60),
        ..HealthCheckConfig::default()
    };
    let service = service_with(port, health_check);

    let token = CancellationToken::new();
    token.cancel();
    let outcome = run_probe(&service, &token).await;
    assert_eq!(outcome, ProbeOutcome::Cancelled);
}

#[tokio::test]
async fn test_probe_timeout_is_unhealthy() {
    let (listener, port) = bound_listener().await;
    // Accept the connection but never reply to the metadata request
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let health_check = HealthCheckConfig {
        kind: crate::config::ProbeKind::Kafka,
        timeout: Duration::from_millis(200),
        ..HealthCheckConfig::default()
    };
    let service = service_with(port, health_check);

    match run_probe(&service, &CancellationToken::new()).await {
        ProbeOutcome::Unhealthy(reason) => assert!(reason.contains("timed out")),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_http_probe_expected_status() {
    let (listener, port) = bound_listener().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                .await;
        }
    });

    let make_service = |expected: Option<Vec<u16>>| {
        let health_check = HealthCheckConfig {
            kind: crate::config::ProbeKind::Http,
            config: ProbeSettings {
                expected_status: expected,
                ..ProbeSettings::default()
            },
            ..HealthCheckConfig::default()
        };
        service_with(port, health_check)
    };

    // 204 is not in the default expected set
    match run_probe(&make_service(None), &CancellationToken::new()).await {
        ProbeOutcome::Unhealthy(reason) => assert!(reason.contains("204")),
        other => panic!("expected unhealthy, got {other:?}"),
    }

    // ... but passes when configured
    let outcome = run_probe(&make_service(Some(vec![200, 204])), &CancellationToken::new()).await;
    assert_eq!(outcome, ProbeOutcome::Healthy);
}

/// Canned Metadata v0 response with the given broker count
fn kafka_metadata_response(correlation_id: i32, broker_count: i32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&correlation_id.to_be_bytes());
    body.extend_from_slice(&broker_count.to_be_bytes());
    for node_id in 0..broker_count {
        body.extend_from_slice(&node_id.to_be_bytes());
        body.extend_from_slice(&(9i16).to_be_bytes());
        body.extend_from_slice(b"localhost");
        body.extend_from_slice(&9092i32.to_be_bytes());
    }
    body.extend_from_slice(&0i32.to_be_bytes()); // topics: empty

    let mut frame = Vec::new();
    frame.extend_from_slice(&(body.len() as i32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

async fn stub_kafka_broker(listener: TcpListener, broker_count: i32) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            break;
        };
        let mut length_buf = [0u8; 4];
        if socket.read_exact(&mut length_buf).await.is_err() {
            continue;
        }
        let length = u32::from_be_bytes(length_buf) as usize;
        let mut request = vec![0u8; length];
        if socket.read_exact(&mut request).await.is_err() {
            continue;
        }
        let correlation_id = i32::from_be_bytes([request[4], request[5], request[6], request[7]]);
        let _ = socket
            .write_all(&kafka_metadata_response(correlation_id, broker_count))
            .await;
    }
}

#[tokio::test]
async fn test_kafka_probe_healthy_with_brokers() {
    let (listener, port) = bound_listener().await;
    tokio::spawn(stub_kafka_broker(listener, 1));

    let health_check = HealthCheckConfig {
        kind: crate::config::ProbeKind::Kafka,
        ..HealthCheckConfig::default()
    };
    let service = service_with(port, health_check);
    let outcome = run_probe(&service, &CancellationToken::new()).await;
    assert_eq!(outcome, ProbeOutcome::Healthy);
}

#[tokio::test]
async fn test_kafka_probe_unhealthy_without_brokers() {
    let (listener, port) = bound_listener().await;
    tokio::spawn(stub_kafka_broker(listener, 0));

    let health_check = HealthCheckConfig {
        kind: crate::config::ProbeKind::Kafka,
        ..HealthCheckConfig::default()
    };
    let service = service_with(port, health_check);
    match run_probe(&service, &CancellationToken::new()).await {
        ProbeOutcome::Unhealthy(reason) => assert!(reason.contains("no brokers")),
        other => panic!("expected unhealthy, got {other:?}"),
    }
}

#[test]
fn test_kafka_request_frame_shape() {
    let frame = super::kafka::request_frame_for_tests();
    let length = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    assert_eq!(length, frame.len() - 4);
    // api key 3 (Metadata), version 0
    assert_eq!(&frame[4..8], &[0, 3, 0, 0]);
}

async fn stub_postgres_server(listener: TcpListener, reply: Vec<u8>) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            break;
        };
        let mut length_buf = [0u8; 4];
        if socket.read_exact(&mut length_buf).await.is_err() {
            continue;
        }
        let length = u32::from_be_bytes(length_buf) as usize;
        let mut startup = vec![0u8; length - 4];
        if socket.read_exact(&mut startup).await.is_err() {
            continue;
        }
        let _ = socket.write_all(&reply).await;
    }
}

fn postgres_message(message_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut message = vec![message_type];
    message.extend_from_slice(&((payload.len() as i32 + 4).to_be_bytes()));
    message.extend_from_slice(payload);
    message
}

fn postgres_service(port: u16) -> crate::config::ResolvedService {
    let health_check = HealthCheckConfig {
        kind: crate::config::ProbeKind::Postgres,
        config: ProbeSettings {
            database: Some("app".to_string()),
            user: Some("app".to_string()),
            ..ProbeSettings::default()
        },
        ..HealthCheckConfig::default()
    };
    service_with(port, health_check)
}

#[tokio::test]
async fn test_postgres_probe_healthy_on_auth_request() {
    let (listener, port) = bound_listener().await;
    // AuthenticationCleartextPassword (code 3): a live server answered
    tokio::spawn(stub_postgres_server(
        listener,
        postgres_message(b'R', &3i32.to_be_bytes()),
    ));

    let outcome = run_probe(&postgres_service(port), &CancellationToken::new()).await;
    assert_eq!(outcome, ProbeOutcome::Healthy);
}

#[tokio::test]
async fn test_postgres_probe_unhealthy_on_error_response() {
    let (listener, port) = bound_listener().await;
    let mut payload = Vec::new();
    payload.push(b'S');
    payload.extend_from_slice(b"FATAL\0");
    payload.push(b'M');
    payload.extend_from_slice(b"the database system is starting up\0");
    payload.push(0);
    tokio::spawn(stub_postgres_server(listener, postgres_message(b'E', &payload)));

    match run_probe(&postgres_service(port), &CancellationToken::new()).await {
        ProbeOutcome::Unhealthy(reason) => {
            assert!(reason.contains("the database system is starting up"))
        }
        other => panic!("expected unhealthy, got {other:?}"),
    }
}

#[test]
fn test_postgres_startup_message_layout() {
    let message = super::postgres::startup_message_for_tests("app", "appdb");
    let length = i32::from_be_bytes([message[0], message[1], message[2], message[3]]) as usize;
    assert_eq!(length, message.len());
    // protocol 3.0
    assert_eq!(&message[4..8], &[0, 3, 0, 0]);
    let text = String::from_utf8_lossy(&message[8..]);
    assert!(text.contains("user"));
    assert!(text.contains("appdb"));
    assert_eq!(message.last(), Some(&0));
}

#[test]
fn test_compose_policy() {
    use crate::state::HealthVerdict::*;

    // Either side unhealthy -> unhealthy
    assert_eq!(compose(Healthy, true), Unhealthy);
    assert_eq!(compose(Unknown, true), Unhealthy);
    assert_eq!(compose(Unhealthy, false), Unhealthy);

    // Cluster silent -> local verdict stands
    assert_eq!(compose(Healthy, false), Healthy);
    assert_eq!(compose(Unknown, false), Unknown);
}
