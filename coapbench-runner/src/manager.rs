use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use coapbench_client::{ClientConfig, ClientMode, ClientSnapshot, StopHandle, VirtualClient};
use coapbench_common::config::{
    validate_series, BindMode, DRAIN_GRACE, FINAL_SETTLE_INTERVAL, RECEIVE_TIMEOUT, SETTLE_INTERVAL,
};
use coapbench_common::{BenchError, Method, Result};
use tracing::{debug, info, warn};

use crate::metrics::{throughput, PhaseResult};
use crate::sink::StatsSink;

/// How the pool is built and paced.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Target URI; in registration mode the client index is appended to it.
    pub target: String,
    pub bind: BindMode,
    pub method: Method,
    pub payload: Option<Vec<u8>>,
    pub track_latency: bool,
    /// Base URI the registration updates are built from; `Some` turns on
    /// registration mode.
    pub registration_scheme: Option<String>,
    pub receive_timeout: Duration,
    pub settle_interval: Duration,
    pub final_settle_interval: Duration,
}

impl ManagerConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            bind: BindMode::System,
            method: Method::Get,
            payload: None,
            track_latency: false,
            registration_scheme: None,
            receive_timeout: RECEIVE_TIMEOUT,
            settle_interval: SETTLE_INTERVAL,
            final_settle_interval: FINAL_SETTLE_INTERVAL,
        }
    }

    fn client_config(&self, index: usize) -> ClientConfig {
        let (target, mode) = match &self.registration_scheme {
            Some(scheme) => (
                format!("{}{}", self.target, index),
                ClientMode::RegisterThenSteady { scheme: scheme.clone() },
            ),
            None => (self.target.clone(), ClientMode::Steady),
        };
        ClientConfig {
            target,
            method: self.method,
            payload: self.payload.clone(),
            bind: self.bind.address_for(index),
            receive_timeout: self.receive_timeout,
            track_latency: self.track_latency,
            mode,
        }
    }
}

/// What a client thread hands back when `run` returns.
struct Report {
    index: usize,
    client: VirtualClient,
    outcome: Result<()>,
}

/// A phase between `start` and `stop`. The clients live on their threads.
struct ActivePhase {
    concurrency: usize,
    started: Instant,
    deadline: Instant,
    stop_handles: Vec<StopHandle>,
    reports: Receiver<Report>,
    workers: Vec<JoinHandle<()>>,
    /// Reports that arrived before the deadline.
    early: Vec<Report>,
}

/// Owns the pool of virtual clients and runs timed concurrency phases.
pub struct ClientManager<S: StatsSink> {
    config: ManagerConfig,
    clients: Vec<VirtualClient>,
    sink: S,
    active: Option<ActivePhase>,
}

impl<S: StatsSink> ClientManager<S> {
    pub fn new(config: ManagerConfig, sink: S) -> Self {
        Self { config, clients: Vec::new(), sink, active: None }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn clients(&self) -> &[VirtualClient] {
        &self.clients
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Grow or shrink the pool to exactly `count` clients. Clients below
    /// `count` keep their sockets and any registration rewrite.
    pub fn set_client_count(&mut self, count: usize) -> Result<()> {
        if self.active.is_some() {
            return Err(BenchError::PhaseActive);
        }
        while self.clients.len() > count {
            if let Some(client) = self.clients.pop() {
                client.close();
            }
        }
        for index in self.clients.len()..count {
            let client = VirtualClient::new(index, self.config.client_config(index))?;
            self.clients.push(client);
        }
        Ok(())
    }

    /// Redirect every client, and every client created later, to `uri`.
    pub fn set_uri(&mut self, uri: &str) -> Result<()> {
        if self.active.is_some() {
            return Err(BenchError::PhaseActive);
        }
        for client in &mut self.clients {
            client.configure_target(uri, self.config.method, self.config.payload.as_deref())?;
        }
        self.config.target = uri.to_string();
        Ok(())
    }

    /// Run one phase per level; phases start `duration` plus the settle
    /// interval apart.
    pub fn run_series(&mut self, levels: &[usize], duration: Duration) -> Result<Vec<PhaseResult>> {
        validate_series(levels)?;
        if duration.is_zero() {
            return Err(BenchError::Config("phase duration must be positive".to_string()));
        }

        let listing = levels.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(", ");
        info!("Run series: {}", listing);
        self.sink.note(&format!("Run series: {listing}"))?;

        let mut results = Vec::with_capacity(levels.len());
        for (i, &level) in levels.iter().enumerate() {
            let phase_start = Instant::now();
            results.push(self.run_phase(level, duration)?);

            let settle = if i + 1 < levels.len() {
                self.config.settle_interval
            } else {
                self.config.final_settle_interval
            };
            let resume_at = phase_start + duration + settle;
            thread::sleep(resume_at.saturating_duration_since(Instant::now()));
        }
        Ok(results)
    }

    /// `start`, wait out the phase, `stop`.
    pub fn run_phase(&mut self, count: usize, duration: Duration) -> Result<PhaseResult> {
        self.start(count, duration)?;
        self.wait();
        self.stop()
    }

    /// Resize the pool, reset every client and start one thread per client.
    pub fn start(&mut self, count: usize, duration: Duration) -> Result<()> {
        if self.active.is_some() {
            return Err(BenchError::PhaseActive);
        }
        self.set_client_count(count)?;

        let (tx, reports) = mpsc::channel();
        let mut stop_handles = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for mut client in self.clients.drain(..) {
            client.reset();
            stop_handles.push(client.stop_handle());
            let tx = tx.clone();
            workers.push(thread::spawn(move || {
                let outcome = client.run();
                let index = client.index();
                // the manager may have given up on this phase already
                let _ = tx.send(Report { index, client, outcome });
            }));
        }

        info!("Start {} virtual clients for {} ms", count, duration.as_millis());
        let started = Instant::now();
        self.active = Some(ActivePhase {
            concurrency: count,
            started,
            deadline: started + duration,
            stop_handles,
            reports,
            workers,
            early: Vec::new(),
        });
        Ok(())
    }

    /// Block until the phase deadline, or until a client fails.
    pub fn wait(&mut self) {
        let Some(phase) = self.active.as_mut() else {
            return;
        };
        loop {
            let remaining = phase.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match phase.reports.recv_timeout(remaining) {
                Ok(report) => {
                    let failed = report.outcome.is_err();
                    phase.early.push(report);
                    if failed {
                        warn!("Virtual client failed, ending phase early");
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Stop every client, collect their final counters and emit the phase
    /// summary. Fails with the first client error of the phase, if any.
    pub fn stop(&mut self) -> Result<PhaseResult> {
        let mut phase = self.active.take().ok_or(BenchError::NoActivePhase)?;
        let elapsed = phase.started.elapsed();
        debug!("Stop virtual clients and collect results");
        for handle in &phase.stop_handles {
            handle.stop();
        }

        let expected = phase.stop_handles.len();
        let mut reports = std::mem::take(&mut phase.early);
        let drain_deadline = Instant::now() + self.config.receive_timeout + DRAIN_GRACE;
        while reports.len() < expected {
            let remaining = drain_deadline.saturating_duration_since(Instant::now());
            match phase.reports.recv_timeout(remaining) {
                Ok(report) => reports.push(report),
                Err(_) => break,
            }
        }
        reports.sort_by_key(|r| r.index);

        let missing = (0..expected).find(|i| reports.get(*i).map(|r| r.index) != Some(*i));
        if reports.len() == expected {
            for worker in phase.workers {
                let _ = worker.join();
            }
        }

        let mut snapshots: Vec<ClientSnapshot> = Vec::with_capacity(reports.len());
        let mut failure = None;
        for report in reports {
            let snapshot = report.client.snapshot();
            debug!(
                "Virtual client {:2} received {:7}, timeout {:3}, throughput {} /s",
                snapshot.index,
                snapshot.count,
                snapshot.timeouts,
                throughput(snapshot.count, elapsed) as u64
            );
            snapshots.push(snapshot);
            if let Err(e) = report.outcome {
                failure.get_or_insert(e);
            }
            self.clients.push(report.client);
        }

        if let Some(index) = missing {
            // the pool lost clients that never reported; later indices would be wrong
            for client in self.clients.drain(..) {
                client.close();
            }
            return Err(failure.unwrap_or(BenchError::ClientUnresponsive(index)));
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let result = PhaseResult::aggregate(phase.concurrency, elapsed, &snapshots, self.config.target.clone());
        info!(
            concurrency = result.concurrency,
            completed = result.completed,
            timeouts = result.timeouts,
            "Phase finished"
        );
        self.sink.emit(&result)?;
        Ok(result)
    }
}

/// Dropping the manager mid-phase stops every client. A client thread closes
/// its socket once its current cycle ends, so endpoints are released within
/// one receive timeout; the threads are not joined.
impl<S: StatsSink> Drop for ClientManager<S> {
    fn drop(&mut self) {
        if let Some(phase) = self.active.take() {
            for handle in &phase.stop_handles {
                handle.stop();
            }
        }
    }
}
