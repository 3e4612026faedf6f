use std::net::SocketAddr;
use std::time::Duration;

use coapbench_client::{ClientConfig, VirtualClient};
use coapbench_common::config::{registration_uri, BenchConfig, Registration};
use coapbench_common::{BenchError, Method};
use coapbench_runner::{ClientManager, ManagerConfig, MemorySink};
use coapbench_server::{Behavior, RequestLog, Server, ServerConfig};

const TIMEOUT: Duration = Duration::from_millis(300);

/// Start an in-process responder and return its address and request log.
async fn start_server(behavior: Behavior, stale_responses: usize) -> (SocketAddr, RequestLog) {
    let config = ServerConfig {
        behavior,
        stale_responses,
        record: true,
        ..ServerConfig::new("127.0.0.1:0".parse().unwrap())
    };
    let server = Server::new(config);
    let log = server.log();
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        server.run(ready_tx).await.expect("server failed");
    });
    (ready_rx.await.expect("server did not start"), log)
}

fn manager_config(target: String) -> ManagerConfig {
    ManagerConfig {
        receive_timeout: TIMEOUT,
        settle_interval: Duration::from_millis(100),
        final_settle_interval: Duration::from_millis(10),
        ..ManagerConfig::new(target)
    }
}

/// Run one phase on a blocking thread; the manager drives plain std threads.
async fn run_phase(
    config: ManagerConfig,
    clients: usize,
    duration: Duration,
) -> (coapbench_common::Result<coapbench_runner::PhaseResult>, Vec<u64>) {
    tokio::task::spawn_blocking(move || {
        let mut manager = ClientManager::new(config, MemorySink::new());
        let result = manager.run_phase(clients, duration);
        let counts = manager.clients().iter().map(|c| c.count()).collect();
        (result, counts)
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_phase_totals_match_clients() {
    let (addr, log) = start_server(Behavior::Echo, 0).await;
    let target = format!("coap://{addr}/benchmark");

    let (result, counts) = run_phase(manager_config(target), 4, Duration::from_millis(500)).await;
    let result = result.unwrap();

    assert_eq!(result.concurrency, 4);
    assert_eq!(counts.len(), 4);
    assert!(counts.iter().all(|&c| c > 0), "{counts:?}");
    assert_eq!(counts.iter().sum::<u64>(), result.completed);
    assert_eq!(result.timeouts, 0);
    assert!(result.throughput > 0.0);

    let requests = log.lock().await;
    assert!(requests.len() as u64 >= result.completed);
    assert!(requests.iter().all(|r| r.path == vec!["benchmark"] && r.method() == Some(Method::Get)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_latency_tracking() {
    let (addr, _log) = start_server(Behavior::Echo, 0).await;
    let config = ManagerConfig { track_latency: true, ..manager_config(format!("coap://{addr}/x")) };

    let (result, _) = run_phase(config, 2, Duration::from_millis(300)).await;
    let result = result.unwrap();

    let latency = result.latency.as_ref().expect("latency samples");
    assert_eq!(latency.samples as u64, result.completed);
    assert!(latency.get(0) <= latency.get(50));
    assert!(latency.get(50) <= latency.get(100));
    assert!(result.to_string().contains(" | "));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_server_gives_reduced_record() {
    let (addr, log) = start_server(Behavior::Silent, 0).await;
    let target = format!("coap://{addr}/quiet");

    let (result, counts) = run_phase(manager_config(target.clone()), 2, Duration::from_millis(700)).await;
    let result = result.unwrap();

    assert_eq!(result.completed, 0);
    assert_eq!(counts, vec![0, 0]);
    assert!(result.timeouts >= 2);
    assert!(result.latency.is_none());
    assert!(result.to_string().starts_with("c=2, t="));
    assert!(result.to_string().ends_with(&format!("uri={target}")));
    assert!(!log.lock().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unexpected_code_is_protocol_violation() {
    let (addr, _log) = start_server(Behavior::Code(0x84), 0).await;
    let target = format!("coap://{addr}/missing");

    let (result, _) = run_phase(manager_config(target), 2, Duration::from_secs(5)).await;
    match result {
        Err(BenchError::ProtocolViolation { code, method }) => {
            assert_eq!(code.to_string(), "4.04");
            assert_eq!(method, Method::Get);
        }
        other => panic!("expected protocol violation, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_responses_are_skipped() {
    let (addr, _log) = start_server(Behavior::Echo, 3).await;
    let target = format!("coap://{addr}/stale");

    let (result, _) = run_phase(manager_config(target), 1, Duration::from_millis(400)).await;
    let result = result.unwrap();
    assert!(result.completed > 0);
    assert_eq!(result.timeouts, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registration_then_updates() {
    let (addr, log) = start_server(Behavior::Echo, 0).await;
    let scheme = format!("coap://{addr}");
    let config = ManagerConfig {
        method: Method::Post,
        registration_scheme: Some(scheme.clone()),
        ..manager_config(registration_uri(&scheme, "node", 60))
    };

    let (result, _) = run_phase(config, 2, Duration::from_millis(400)).await;
    let result = result.unwrap();
    assert!(result.completed >= 2);

    let requests = log.lock().await;
    let registrations: Vec<_> = requests.iter().filter(|r| r.is_registration()).collect();
    assert_eq!(registrations.len(), 2);
    let mut endpoints: Vec<_> = registrations
        .iter()
        .flat_map(|r| r.query.iter().filter(|q| q.starts_with("ep=")).cloned())
        .collect();
    endpoints.sort();
    assert_eq!(endpoints, vec!["ep=node0", "ep=node1"]);
    assert!(registrations.iter().all(|r| r.query.contains(&"lt=60".to_string())));

    let updates: Vec<_> = requests.iter().filter(|r| !r.is_registration()).collect();
    assert!(!updates.is_empty());
    for update in updates {
        assert_eq!(update.method(), Some(Method::Post));
        assert_eq!(update.path.len(), 2);
        assert_eq!(update.path[0], "rd");
        assert!(update.payload.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registration_pool_target_from_bench_config() {
    let (addr, _log) = start_server(Behavior::Echo, 0).await;
    let bench = BenchConfig {
        target: format!("coap://{addr}"),
        registration: Some(Registration { endpoint: "dev".to_string(), lifetime_secs: Some(5) }),
        duration_secs: 1,
        ..BenchConfig::default()
    };
    assert_eq!(bench.pool_target(), format!("coap://{addr}/rd?lt=60&ep=dev"));
    assert_eq!(bench.effective_method(), Method::Post);

    let mut client = tokio::task::spawn_blocking(move || {
        let config = ClientConfig {
            method: bench.effective_method(),
            receive_timeout: TIMEOUT,
            mode: coapbench_client::ClientMode::RegisterThenSteady { scheme: bench.target.clone() },
            ..ClientConfig::new(format!("{}0", bench.pool_target()))
        };
        let mut client = VirtualClient::new(0, config).unwrap();
        client.register().unwrap();
        client
    })
    .await
    .unwrap();

    assert_eq!(client.count(), 1);
    assert_eq!(client.target().path(), "/rd/a000");
    assert!(matches!(client.mode(), coapbench_client::ClientMode::Steady));
    client = tokio::task::spawn_blocking(move || {
        client.exchange().unwrap();
        client
    })
    .await
    .unwrap();
    assert_eq!(client.count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_series_keeps_pool_between_levels() {
    let (addr, _log) = start_server(Behavior::Echo, 0).await;
    let config = manager_config(format!("coap://{addr}/series"));

    let (results, lines, pool) = tokio::task::spawn_blocking(move || {
        let mut manager = ClientManager::new(config, MemorySink::new());
        let results = manager.run_series(&[1, 3, 2], Duration::from_millis(250)).unwrap();
        let pool = manager.clients().len();
        (results, manager.sink().lines.clone(), pool)
    })
    .await
    .unwrap();

    let levels: Vec<_> = results.iter().map(|r| r.concurrency).collect();
    assert_eq!(levels, vec![1, 3, 2]);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "Run series: 1, 3, 2");
    assert!(results.iter().all(|r| r.completed > 0));
    assert_eq!(pool, 2);
}
