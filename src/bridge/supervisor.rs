//! Worker process supervision.
//!
//! Owns the single child process, the tasks pumping its stdio, and the
//! restart policy. The write path and the decode loop run as independent
//! tasks so neither blocks callers; all state transitions go through one
//! watch channel.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};

use crate::bridge::codec::{Decoded, FrameDecoder};
use crate::bridge::router::CorrelationRouter;
use crate::errors::BridgeError;

/// State of the supervised worker process.
///
/// Transitions are monotonic except `Degraded -> Ready` after a successful
/// restart; `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Ready,
    Degraded,
    Terminated,
}

/// Bounded auto-restart budget: at most `max_restarts` restarts within a
/// rolling `window`. Beyond that the worker stays degraded until an
/// operator-triggered restart.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
}

/// Handles for one worker session. Replaced wholesale on restart; the
/// `ended` flag makes exit handling exactly-once per session.
struct Session {
    writer: mpsc::Sender<Vec<u8>>,
    ended: Arc<AtomicBool>,
    stop_tx: Option<watch::Sender<Option<bool>>>,
    done_rx: watch::Receiver<bool>,
}

pub struct Supervisor {
    command: String,
    args: Vec<String>,
    restart_policy: RestartPolicy,
    shutdown_grace: Duration,
    router: Arc<CorrelationRouter>,
    state_tx: watch::Sender<WorkerState>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    restarts: Mutex<VecDeque<Instant>>,
    stopping: AtomicBool,
}

impl Supervisor {
    pub fn new(
        command: String,
        args: Vec<String>,
        restart_policy: RestartPolicy,
        shutdown_grace: Duration,
        router: Arc<CorrelationRouter>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(WorkerState::Starting);
        Arc::new(Self {
            command,
            args,
            restart_policy,
            shutdown_grace,
            router,
            state_tx,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            restarts: Mutex::new(VecDeque::new()),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    /// Restart generation, incremented on every successful (re)spawn. The
    /// tool catalog cache keys off this to implement session-lifetime
    /// caching.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Spawn the worker and wire its streams. Spawn success is readiness;
    /// the worker protocol has no explicit handshake.
    pub async fn start(self: &Arc<Self>) -> Result<(), BridgeError> {
        self.spawn_session().await
    }

    async fn spawn_session(self: &Arc<Self>) -> Result<(), BridgeError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(BridgeError::WorkerUnavailable);
        }
        self.state_tx.send_replace(WorkerState::Starting);

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            self.state_tx.send_replace(WorkerState::Degraded);
            BridgeError::Spawn {
                reason: err.to_string(),
            }
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.state_tx.send_replace(WorkerState::Degraded);
            return Err(BridgeError::Spawn {
                reason: "failed to capture worker stdio".to_string(),
            });
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        self.attach(stdin, stdout, Some(child)).await;
        tracing::info!(
            command = %self.command,
            generation = self.generation(),
            "worker process spawned"
        );
        Ok(())
    }

    /// Wire a worker session from its byte streams and transition to Ready.
    /// Split from `spawn_session` so tests can drive a scripted in-memory
    /// worker through the same code path.
    pub(crate) fn attach<'a, W, R>(
        self: &'a Arc<Self>,
        stdin: W,
        stdout: R,
        child: Option<Child>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Box::pin(async move {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let ended = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(64);
        let (done_tx, done_rx) = watch::channel(false);

        let (stop_tx, reader_done) = match child {
            Some(child) => {
                let (stop_tx, stop_rx) = watch::channel::<Option<bool>>(None);
                tokio::spawn(monitor_child(
                    self.clone(),
                    child,
                    ended.clone(),
                    stop_rx,
                    done_tx,
                ));
                (Some(stop_tx), None)
            }
            None => (None, Some(done_tx)),
        };

        tokio::spawn(writer_loop(stdin, frame_rx));
        tokio::spawn(reader_loop(
            self.clone(),
            stdout,
            self.router.clone(),
            ended.clone(),
            reader_done,
        ));

        *self.session.lock().await = Some(Session {
            writer: frame_tx,
            ended,
            stop_tx,
            done_rx,
        });
        self.state_tx.send_replace(WorkerState::Ready);
        })
    }

    /// Hand an encoded frame to the worker's input channel. Fails fast with
    /// `WorkerUnavailable` once the worker is degraded or terminated —
    /// frames are never queued for a dead worker.
    pub async fn write(&self, frame: Vec<u8>) -> Result<(), BridgeError> {
        let sender = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(session) => session.writer.clone(),
                None => return Err(BridgeError::WorkerUnavailable),
            }
        };
        sender
            .send(frame)
            .await
            .map_err(|_| BridgeError::WorkerUnavailable)
    }

    /// Stop the worker for good. Graceful: close stdin, give the worker the
    /// configured grace period to exit, then kill. Idempotent; Terminated is
    /// final.
    pub async fn stop(&self, graceful: bool) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state_tx.send_replace(WorkerState::Terminated);

        let session = self.session.lock().await.take();
        self.router.fail_all().await;

        if let Some(session) = session {
            session.ended.store(true, Ordering::Release);
            drop(session.writer);
            if let Some(stop_tx) = session.stop_tx {
                let _ = stop_tx.send(Some(graceful));
                let mut done_rx = session.done_rx;
                let _ = done_rx.wait_for(|done| *done).await;
            }
        }
        tracing::info!("worker supervisor stopped");
    }

    /// Operator-triggered restart: tear down any live session, reset the
    /// rolling restart window, and spawn a fresh worker.
    pub async fn restart(self: &Arc<Self>) -> Result<(), BridgeError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(BridgeError::WorkerUnavailable);
        }

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.ended.store(true, Ordering::Release);
            drop(session.writer);
            if let Some(stop_tx) = session.stop_tx {
                let _ = stop_tx.send(Some(false));
                let mut done_rx = session.done_rx;
                let _ = done_rx.wait_for(|done| *done).await;
            }
        }
        self.router.fail_all().await;
        self.restarts.lock().await.clear();
        self.spawn_session().await
    }

    /// Unexpected end of the current session: fail pending requests
    /// immediately, go Degraded, and auto-restart within the policy bound.
    async fn end_session(self: &Arc<Self>, ended: &Arc<AtomicBool>) {
        if ended.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.stopping.load(Ordering::Acquire) {
            return;
        }

        let session = {
            let mut slot = self.session.lock().await;
            match slot.as_ref() {
                // Only the session that raised the event may tear down; a
                // late event from a replaced session must not touch the
                // current one.
                Some(current) if Arc::ptr_eq(&current.ended, ended) => slot.take(),
                _ => return,
            }
        };

        self.state_tx.send_replace(WorkerState::Degraded);
        self.router.fail_all().await;

        if let Some(session) = session {
            drop(session.writer);
            if let Some(stop_tx) = session.stop_tx {
                let _ = stop_tx.send(Some(false));
                let mut done_rx = session.done_rx;
                let _ = done_rx.wait_for(|done| *done).await;
            }
        }

        if self.take_restart_token().await {
            tracing::warn!("worker exited unexpectedly; restarting");
            match self.spawn_session().await {
                Ok(()) => {
                    tracing::info!(generation = self.generation(), "worker restarted")
                }
                Err(err) => tracing::error!(error = %err, "worker restart failed"),
            }
        } else {
            tracing::warn!(
                "restart budget exhausted; worker stays degraded until operator restart"
            );
        }
    }

    async fn take_restart_token(&self) -> bool {
        let now = Instant::now();
        let mut restarts = self.restarts.lock().await;
        while restarts
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.restart_policy.window)
        {
            restarts.pop_front();
        }
        if restarts.len() >= self.restart_policy.max_restarts as usize {
            return false;
        }
        restarts.push_back(now);
        true
    }
}

async fn writer_loop<W>(mut stdin: W, mut frames: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(err) = stdin.write_all(&frame).await {
            tracing::warn!(error = %err, "worker stdin write failed");
            break;
        }
        if let Err(err) = stdin.flush().await {
            tracing::warn!(error = %err, "worker stdin flush failed");
            break;
        }
    }
    // Dropping stdin closes the worker's input channel.
}

async fn reader_loop<R>(
    supervisor: Arc<Supervisor>,
    mut stdout: R,
    router: Arc<CorrelationRouter>,
    ended: Arc<AtomicBool>,
    done_tx: Option<watch::Sender<bool>>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for event in decoder.push(&buf[..n]) {
                    match event {
                        Decoded::Reply(reply) => router.resolve(reply).await,
                        Decoded::Diagnostic(line) => {
                            tracing::debug!(%line, "uncorrelated worker output")
                        }
                        Decoded::Malformed { reason } => {
                            tracing::warn!(%reason, "malformed frame from worker")
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "worker stdout read failed");
                break;
            }
        }
    }
    if let Some(done_tx) = done_tx {
        let _ = done_tx.send(true);
    }
    supervisor.end_session(&ended).await;
}

async fn monitor_child(
    supervisor: Arc<Supervisor>,
    mut child: Child,
    ended: Arc<AtomicBool>,
    mut stop_rx: watch::Receiver<Option<bool>>,
    done_tx: watch::Sender<bool>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => tracing::info!(%status, "worker process exited"),
                Err(err) => tracing::warn!(error = %err, "failed to await worker process"),
            }
            let _ = done_tx.send(true);
            supervisor.end_session(&ended).await;
        }
        _ = stop_rx.changed() => {
            let graceful = (*stop_rx.borrow()).unwrap_or(false);
            if graceful {
                match tokio::time::timeout(supervisor.shutdown_grace, child.wait()).await {
                    Ok(_) => tracing::info!("worker exited within grace period"),
                    Err(_) => {
                        tracing::warn!("worker did not exit within grace period; killing");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
            } else {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            let _ = done_tx.send(true);
        }
    }
}

async fn drain_stderr<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(%line, "worker stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_supervisor(max_restarts: u32) -> Arc<Supervisor> {
        Supervisor::new(
            "definitely-not-a-real-executable".to_string(),
            Vec::new(),
            RestartPolicy {
                max_restarts,
                window: Duration::from_secs(60),
            },
            Duration::from_millis(100),
            Arc::new(CorrelationRouter::new(8)),
        )
    }

    #[tokio::test]
    async fn spawn_failure_reports_spawn_error_and_degrades() {
        let supervisor = test_supervisor(0);
        let err = supervisor.start().await.expect_err("spawn must fail");
        assert!(matches!(err, BridgeError::Spawn { .. }));
        assert_eq!(supervisor.state(), WorkerState::Degraded);
    }

    #[tokio::test]
    async fn writes_fail_fast_without_a_session() {
        let supervisor = test_supervisor(0);
        let err = supervisor
            .write(b"frame\n".to_vec())
            .await
            .expect_err("no session");
        assert!(matches!(err, BridgeError::WorkerUnavailable));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let supervisor = test_supervisor(0);
        supervisor.stop(true).await;
        supervisor.stop(false).await;
        assert_eq!(supervisor.state(), WorkerState::Terminated);

        // Terminated is final: neither start nor restart revive it.
        assert!(matches!(
            supervisor.start().await,
            Err(BridgeError::WorkerUnavailable)
        ));
        assert!(matches!(
            supervisor.restart().await,
            Err(BridgeError::WorkerUnavailable)
        ));
    }

    #[tokio::test]
    async fn restart_budget_is_a_rolling_window() {
        let supervisor = test_supervisor(2);
        assert!(supervisor.take_restart_token().await);
        assert!(supervisor.take_restart_token().await);
        assert!(!supervisor.take_restart_token().await);
    }

    #[tokio::test]
    async fn zero_budget_never_grants_a_token() {
        let supervisor = test_supervisor(0);
        assert!(!supervisor.take_restart_token().await);
    }
}
