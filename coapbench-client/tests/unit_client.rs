use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use coapbench_client::{ClientConfig, ClientMode, VirtualClient};
use coapbench_common::{BenchError, CorrelationToken, Method, ResponseCode};

const TIMEOUT: Duration = Duration::from_millis(300);

// Helper: a loopback "server" running `script` on its own thread.
fn fake_target<F>(script: F) -> SocketAddr
where
    F: FnOnce(UdpSocket) + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    thread::spawn(move || script(socket));
    addr
}

fn recv_request(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 1500];
    let (len, from) = socket.recv_from(&mut buf).unwrap();
    (buf[..len].to_vec(), from)
}

fn response(code: ResponseCode, token: u16, location: Option<&str>) -> Vec<u8> {
    let mut bytes = vec![0x60, code.0, 0, 0];
    CorrelationToken(token).write_into(&mut bytes);
    if let Some(location) = location {
        bytes.extend_from_slice(&[0x82, b'r', b'd', location.len() as u8]);
        bytes.extend_from_slice(location.as_bytes());
    }
    bytes
}

fn token_of(request: &[u8]) -> u16 {
    CorrelationToken::from_datagram(request).unwrap().0
}

fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        bind: Some("127.0.0.1:0".parse().unwrap()),
        receive_timeout: TIMEOUT,
        track_latency: true,
        ..ClientConfig::new(format!("coap://{addr}/bench"))
    }
}

#[test]
fn test_matching_response_counts_one_completion() {
    let addr = fake_target(|socket| {
        let (request, from) = recv_request(&socket);
        socket.send_to(&response(ResponseCode::CONTENT, token_of(&request), None), from).unwrap();
    });
    let mut client = VirtualClient::new(0, config(addr)).unwrap();

    client.exchange().unwrap();

    assert_eq!(client.count(), 1);
    assert_eq!(client.timeouts(), 0);
    assert_eq!(client.latencies().len(), 1);
}

#[test]
fn test_mismatched_tokens_are_discarded_until_match() {
    let addr = fake_target(|socket| {
        let (request, from) = recv_request(&socket);
        let token = token_of(&request);
        for stale in 1..=3u16 {
            thread::sleep(Duration::from_millis(20));
            socket
                .send_to(&response(ResponseCode::CONTENT, token.wrapping_sub(stale), None), from)
                .unwrap();
        }
        thread::sleep(Duration::from_millis(40));
        socket.send_to(&response(ResponseCode::CONTENT, token, None), from).unwrap();
    });
    let mut client = VirtualClient::new(0, config(addr)).unwrap();

    client.exchange().unwrap();

    assert_eq!(client.count(), 1, "only the matching response counts");
    assert_eq!(client.timeouts(), 0);
    // three 20ms gaps plus 40ms before the match
    assert!(client.latencies()[0] >= 100, "latency {} ms", client.latencies()[0]);
}

#[test]
fn test_silence_counts_one_loss() {
    let addr = fake_target(|socket| {
        let _ = recv_request(&socket);
    });
    let mut client = VirtualClient::new(0, config(addr)).unwrap();

    let start = Instant::now();
    client.exchange().unwrap();

    assert!(start.elapsed() >= TIMEOUT - Duration::from_millis(20));
    assert_eq!(client.count(), 0);
    assert_eq!(client.timeouts(), 1);
    assert!(client.latencies().is_empty());
}

#[test]
fn test_endless_mismatches_cannot_extend_the_cycle() {
    let addr = fake_target(|socket| {
        let (request, from) = recv_request(&socket);
        let stale = token_of(&request).wrapping_add(100);
        // keep answering with the wrong token well past the receive timeout
        for _ in 0..40 {
            thread::sleep(Duration::from_millis(25));
            let _ = socket.send_to(&response(ResponseCode::CONTENT, stale, None), from);
        }
    });
    let mut client = VirtualClient::new(0, config(addr)).unwrap();

    let start = Instant::now();
    client.exchange().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(client.timeouts(), 1);
    assert_eq!(client.count(), 0);
    assert!(elapsed < TIMEOUT + Duration::from_millis(200), "cycle took {elapsed:?}");
}

#[test]
fn test_unexpected_code_is_protocol_violation() {
    let addr = fake_target(|socket| {
        let (request, from) = recv_request(&socket);
        socket.send_to(&response(ResponseCode::NOT_FOUND, token_of(&request), None), from).unwrap();
    });
    let mut client = VirtualClient::new(0, config(addr)).unwrap();

    let result = client.exchange();

    assert_eq!(
        result,
        Err(BenchError::ProtocolViolation { code: ResponseCode::NOT_FOUND, method: Method::Get })
    );
    assert_eq!(client.count(), 0);
}

#[test]
fn test_unexpected_code_with_wrong_token_is_protocol_violation() {
    let addr = fake_target(|socket| {
        let (request, from) = recv_request(&socket);
        let stale = token_of(&request).wrapping_sub(1);
        socket.send_to(&response(ResponseCode::NOT_FOUND, stale, None), from).unwrap();
    });
    let mut client = VirtualClient::new(0, config(addr)).unwrap();

    let result = client.exchange();

    assert_eq!(
        result,
        Err(BenchError::ProtocolViolation { code: ResponseCode::NOT_FOUND, method: Method::Get })
    );
    assert_eq!(client.count(), 0);
    assert_eq!(client.timeouts(), 0);
}

#[test]
fn test_refused_send_counts_one_loss() {
    // sending to the limited broadcast address without SO_BROADCAST is refused locally
    let config = ClientConfig {
        receive_timeout: TIMEOUT,
        ..ClientConfig::new("coap://255.255.255.255:5683/bench")
    };
    let mut client = VirtualClient::new(0, config).unwrap();

    let start = Instant::now();
    client.exchange().unwrap();

    assert!(start.elapsed() >= TIMEOUT - Duration::from_millis(20));
    assert_eq!(client.count(), 0);
    assert_eq!(client.timeouts(), 1);
}

#[test]
fn test_registration_rewrites_target() {
    let addr = fake_target(|socket| {
        let (registration, from) = recv_request(&socket);
        assert_eq!(registration[1], Method::Post.code());
        socket
            .send_to(&response(ResponseCode::CREATED, token_of(&registration), Some("a1b2")), from)
            .unwrap();
        let (update, from) = recv_request(&socket);
        socket.send_to(&response(ResponseCode::CHANGED, token_of(&update), None), from).unwrap();
    });
    let mut cfg = config(addr);
    cfg.target = format!("coap://{addr}/rd?lt=60&ep=node0");
    cfg.method = Method::Post;
    cfg.mode = ClientMode::RegisterThenSteady { scheme: format!("coap://{addr}") };
    let mut client = VirtualClient::new(0, cfg).unwrap();

    client.register().unwrap();
    assert_eq!(client.target().as_str(), format!("coap://{addr}/rd/a1b2"));
    assert_eq!(client.mode(), &ClientMode::Steady);
    assert_eq!(client.method(), Method::Post);

    client.exchange().unwrap();
    assert_eq!(client.count(), 2);
    assert_eq!(client.timeouts(), 0);
}

#[test]
fn test_registration_timeout_counts_loss_and_keeps_mode() {
    let addr = fake_target(|socket| {
        let _ = recv_request(&socket);
    });
    let mut cfg = config(addr);
    cfg.method = Method::Post;
    cfg.mode = ClientMode::RegisterThenSteady { scheme: format!("coap://{addr}") };
    let mut client = VirtualClient::new(0, cfg).unwrap();

    client.register().unwrap();

    assert_eq!(client.timeouts(), 1);
    assert!(matches!(client.mode(), ClientMode::RegisterThenSteady { .. }));
}

#[test]
fn test_run_returns_after_stop() {
    let addr = fake_target(|socket| loop {
        let (request, from) = recv_request(&socket);
        let _ = socket.send_to(&response(ResponseCode::CONTENT, token_of(&request), None), from);
    });
    let mut client = VirtualClient::new(0, config(addr)).unwrap();
    let stop = client.stop_handle();

    let worker = thread::spawn(move || {
        let outcome = client.run();
        (client, outcome)
    });
    thread::sleep(Duration::from_millis(200));
    stop.stop();
    let (client, outcome) = worker.join().unwrap();

    assert!(outcome.is_ok());
    assert!(!client.is_running());
    assert!(client.count() > 0);
    assert_eq!(client.latencies().len() as u64, client.count());
}

#[test]
fn test_reset_clears_counters() {
    let addr = fake_target(|socket| {
        let _ = recv_request(&socket);
    });
    let mut client = VirtualClient::new(0, config(addr)).unwrap();
    client.exchange().unwrap();
    client.stop();
    assert_eq!(client.timeouts(), 1);

    client.reset();

    assert!(client.is_running());
    assert_eq!(client.count(), 0);
    assert_eq!(client.timeouts(), 0);
}

#[test]
fn test_default_port_and_invalid_uri() {
    let client = VirtualClient::new(0, ClientConfig::new("coap://127.0.0.1/bench")).unwrap();
    assert_eq!(client.target().port(), None);
    assert!(client.local_addr().is_ok());

    let err = VirtualClient::new(0, ClientConfig::new("not a uri")).err().unwrap();
    assert!(matches!(err, BenchError::InvalidUri { .. }));
}

#[test]
fn test_resolve_uses_default_port() {
    let uri = coapbench_client::parse_uri("coap://127.0.0.1/bench").unwrap();
    let dest = coapbench_client::resolve(&uri, None).unwrap();
    assert_eq!(dest, "127.0.0.1:5683".parse().unwrap());
}

#[test]
fn test_bind_to_unavailable_address_fails() {
    let mut cfg = ClientConfig::new("coap://127.0.0.1/bench");
    // TEST-NET-3, never assigned to a local interface
    cfg.bind = Some("203.0.113.7:0".parse().unwrap());
    let err = VirtualClient::new(0, cfg).err().unwrap();
    assert!(matches!(err, BenchError::Bind { .. }));
}
