use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use encoding_rs::Encoding;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::GaleError;
use crate::output::{now_us, Channel, FileOutputStore};
use crate::process::{CleanOutcome, ProcessRecord, ProcessStatus, StartSpec};

/// Grace window between the polite terminate signal and SIGKILL escalation.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on how long `stop` waits for the record to reach a terminal
/// state before reporting a control error.
const STOP_WAIT_BOUND: Duration = Duration::from_secs(12);

/// Retention sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct StopRequest {
    force: bool,
    reason: Option<String>,
}

struct SupervisorHandle {
    stop: CancellationToken,
    stop_request: Arc<std::sync::Mutex<Option<StopRequest>>>,
    status_rx: watch::Receiver<ProcessStatus>,
    task: JoinHandle<()>,
}

/// SIGKILLs the child's whole process group on drop while still armed.
///
/// Children are spawned as group leaders, so grandchildren share the pgid;
/// a lone SIGKILL to the leader would leave them running detached. This
/// covers supervision paths that unwind before the child is reaped.
struct GroupKillGuard {
    pgid: Option<u32>,
}

impl GroupKillGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// Call once the child has been reaped; the pgid may be recycled after
    /// that point and must not be signalled again.
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKillGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            signal_group(Some(pgid), libc::SIGKILL);
        }
    }
}

fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Stopped { force: bool, reason: Option<String> },
    WaitFailed(String),
}

/// Owns spawned children: registry, supervision, timeouts, stop/clean, and
/// the retention sweep. Output bytes flow through per-channel reader tasks
/// into the shared [`FileOutputStore`].
pub struct ProcessManager {
    store: Arc<FileOutputStore>,
    default_encoding: &'static Encoding,
    retention: Duration,
    registry: Mutex<HashMap<String, ProcessRecord>>,
    supervisors: Mutex<HashMap<String, SupervisorHandle>>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    id_seq: AtomicU64,
}

impl ProcessManager {
    pub fn new(store: Arc<FileOutputStore>, default_encoding: &str, retention_seconds: u64) -> Self {
        let default_encoding = Encoding::for_label(default_encoding.as_bytes()).unwrap_or_else(|| {
            tracing::warn!(label = default_encoding, "unknown default encoding label, using utf-8");
            encoding_rs::UTF_8
        });
        Self {
            store,
            default_encoding,
            retention: Duration::from_secs(retention_seconds),
            registry: Mutex::new(HashMap::new()),
            supervisors: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
            id_seq: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<FileOutputStore> {
        &self.store
    }

    /// Spawn a child and hand it to a supervisor task. Returns the process id
    /// as soon as the child is running; supervision continues in the
    /// background.
    pub async fn start(self: &Arc<Self>, spec: StartSpec) -> Result<String, GaleError> {
        if spec.argv.is_empty() {
            return Err(GaleError::InvalidArgument("argv must not be empty".into()));
        }
        if !spec.working_directory.is_absolute() {
            return Err(GaleError::InvalidArgument(format!(
                "working directory must be an absolute path: {}",
                spec.working_directory.display()
            )));
        }
        match tokio::fs::metadata(&spec.working_directory).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(GaleError::InvalidArgument(format!(
                    "working directory does not exist: {}",
                    spec.working_directory.display()
                )));
            }
        }
        let encoding = match spec.encoding.as_deref() {
            Some(label) => Encoding::for_label(label.as_bytes()).ok_or_else(|| {
                GaleError::InvalidArgument(format!("unknown encoding label: {label}"))
            })?,
            None => self.default_encoding,
        };

        let id = self.next_id();
        self.store.create(&id).await?;

        let mut labels = spec.labels.clone();
        labels.sort();
        labels.dedup();

        let mut record = ProcessRecord {
            id: id.clone(),
            argv: spec.argv.clone(),
            working_directory: spec.working_directory.clone(),
            description: spec.description.clone(),
            labels,
            encoding: encoding.name().to_ascii_lowercase(),
            timeout_seconds: spec.timeout_seconds,
            status: ProcessStatus::Running,
            started_at_us: now_us(),
            ended_at_us: None,
            exit_code: None,
            error_message: None,
        };

        // No shell: the program name and argument vector go straight to exec.
        let mut cmd = Command::new(&spec.argv[0]);
        cmd.args(&spec.argv[1..])
            .current_dir(&spec.working_directory)
            .envs(&spec.env_overlay)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                record.status = ProcessStatus::Error;
                record.ended_at_us = Some(now_us());
                record.error_message = Some(format!("spawn failed: {e}"));
                let _ = self.store.seal(&id).await;
                self.registry.lock().await.insert(id.clone(), record);
                let program = spec.argv[0].clone();
                return Err(match e.kind() {
                    std::io::ErrorKind::PermissionDenied => {
                        GaleError::PermissionDenied(format!("cannot spawn {program}: {e}"))
                    }
                    _ => GaleError::ExecutionFailed(format!("cannot spawn {program}: {e}")),
                });
            }
        };

        // Write stdin concurrently with the pipe readers, then close it so
        // the child sees EOF. Awaiting inline could deadlock on a full pipe.
        if let Some(bytes) = spec.stdin {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            tokio::spawn(async move {
                let _ = stdin.write_all(&bytes).await;
            });
        }

        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_task =
            spawn_channel_reader(self.store.clone(), id.clone(), Channel::Stdout, stdout_pipe, encoding);
        let stderr_task =
            spawn_channel_reader(self.store.clone(), id.clone(), Channel::Stderr, stderr_pipe, encoding);

        let timeout_seconds = spec.timeout_seconds;
        self.registry.lock().await.insert(id.clone(), record);

        let stop = CancellationToken::new();
        let stop_request: Arc<std::sync::Mutex<Option<StopRequest>>> =
            Arc::new(std::sync::Mutex::new(None));
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);

        let manager = self.clone();
        let sup_id = id.clone();
        let sup_stop = stop.clone();
        let sup_request = stop_request.clone();
        let task = tokio::spawn(async move {
            manager
                .supervise(
                    sup_id,
                    child,
                    timeout_seconds,
                    sup_stop,
                    sup_request,
                    status_tx,
                    stdout_task,
                    stderr_task,
                )
                .await;
        });

        self.supervisors.lock().await.insert(
            id.clone(),
            SupervisorHandle {
                stop,
                stop_request,
                status_rx,
                task,
            },
        );

        tracing::info!(id = %id, command = %spec.argv[0], "process started");
        Ok(id)
    }

    /// Race process exit against the timeout timer and the stop signal, then
    /// drain the readers and move the record to its terminal state. Readers
    /// are always joined before the transition so no output is silently lost.
    async fn supervise(
        &self,
        id: String,
        mut child: Child,
        timeout_seconds: Option<u64>,
        stop: CancellationToken,
        stop_request: Arc<std::sync::Mutex<Option<StopRequest>>>,
        status_tx: watch::Sender<ProcessStatus>,
        stdout_task: JoinHandle<Result<(), String>>,
        stderr_task: JoinHandle<Result<(), String>>,
    ) {
        let child_pid = child.id();
        let mut guard = GroupKillGuard::new(child_pid);

        let timeout_timer = async {
            match timeout_seconds {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            res = child.wait() => match res {
                Ok(status) => WaitOutcome::Exited(status),
                Err(e) => WaitOutcome::WaitFailed(e.to_string()),
            },
            () = timeout_timer => WaitOutcome::TimedOut,
            () = stop.cancelled() => {
                let request = stop_request
                    .lock()
                    .expect("stop request lock")
                    .take()
                    .unwrap_or(StopRequest { force: true, reason: None });
                WaitOutcome::Stopped { force: request.force, reason: request.reason }
            }
        };

        let (status, exit_code, mut error_message) = match outcome {
            WaitOutcome::Exited(exit) => exit_disposition(exit),
            WaitOutcome::TimedOut => {
                signal_group(child_pid, libc::SIGKILL);
                let _ = child.wait().await;
                (
                    ProcessStatus::Terminated,
                    None,
                    Some(format!("timeout after {}s", timeout_seconds.unwrap_or(0))),
                )
            }
            WaitOutcome::Stopped { force, reason } => {
                if force {
                    signal_group(child_pid, libc::SIGKILL);
                    let _ = child.wait().await;
                } else {
                    signal_group(child_pid, libc::SIGTERM);
                    let reaped = tokio::select! {
                        _ = child.wait() => true,
                        () = tokio::time::sleep(STOP_GRACE) => false,
                    };
                    if !reaped {
                        signal_group(child_pid, libc::SIGKILL);
                        let _ = child.wait().await;
                    }
                }
                (ProcessStatus::Terminated, None, reason)
            }
            WaitOutcome::WaitFailed(e) => {
                signal_group(child_pid, libc::SIGKILL);
                let _ = child.wait().await;
                (
                    ProcessStatus::Error,
                    None,
                    Some(format!("wait failed: {e}")),
                )
            }
        };
        guard.disarm();

        for reader in [stdout_task.await, stderr_task.await] {
            match reader {
                Ok(Ok(())) => {}
                Ok(Err(msg)) => {
                    if error_message.is_none() {
                        error_message = Some(msg);
                    }
                }
                Err(e) => {
                    if error_message.is_none() {
                        error_message = Some(format!("reader task failed: {e}"));
                    }
                }
            }
        }

        if let Err(e) = self.store.seal(&id).await {
            tracing::warn!(id = %id, "failed to seal output log: {e}");
        }

        {
            let mut registry = self.registry.lock().await;
            if let Some(record) = registry.get_mut(&id) {
                record.status = status;
                record.exit_code = exit_code;
                record.ended_at_us = Some(now_us());
                if record.error_message.is_none() {
                    record.error_message = error_message;
                }
            }
        }
        tracing::info!(id = %id, status = status.as_str(), "process finished");
        let _ = status_tx.send(status);
    }

    /// Request termination and wait until the record is terminal. Graceful
    /// stops send the polite signal first and escalate after the grace
    /// window; `force` skips straight to SIGKILL. Idempotent: stopping an
    /// already-terminal process returns its record unchanged.
    pub async fn stop(
        &self,
        id: &str,
        force: bool,
        reason: Option<String>,
    ) -> Result<ProcessRecord, GaleError> {
        {
            let registry = self.registry.lock().await;
            let record = registry
                .get(id)
                .ok_or_else(|| GaleError::ProcessNotFound(id.to_string()))?;
            if record.status.is_terminal() {
                return Ok(record.clone());
            }
        }

        let mut status_rx = {
            let supervisors = self.supervisors.lock().await;
            let Some(handle) = supervisors.get(id) else {
                return Err(GaleError::ProcessControl {
                    id: id.to_string(),
                    message: "no supervisor for running process".to_string(),
                });
            };
            *handle.stop_request.lock().expect("stop request lock") =
                Some(StopRequest { force, reason });
            handle.stop.cancel();
            handle.status_rx.clone()
        };

        let reached_terminal = tokio::time::timeout(STOP_WAIT_BOUND, async {
            while !status_rx.borrow_and_update().is_terminal() {
                if status_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if reached_terminal.is_err() {
            return Err(GaleError::ProcessControl {
                id: id.to_string(),
                message: "did not reach a terminal state in time".to_string(),
            });
        }

        let registry = self.registry.lock().await;
        registry
            .get(id)
            .cloned()
            .ok_or_else(|| GaleError::ProcessNotFound(id.to_string()))
    }

    /// Block until the process reaches a terminal state, then return the
    /// final record snapshot.
    pub async fn wait(&self, id: &str) -> Result<ProcessRecord, GaleError> {
        let rx = {
            let registry = self.registry.lock().await;
            let record = registry
                .get(id)
                .ok_or_else(|| GaleError::ProcessNotFound(id.to_string()))?;
            if record.status.is_terminal() {
                return Ok(record.clone());
            }
            None::<watch::Receiver<ProcessStatus>>
        };
        let mut rx = match rx {
            Some(rx) => rx,
            None => {
                let supervisors = self.supervisors.lock().await;
                match supervisors.get(id) {
                    Some(handle) => handle.status_rx.clone(),
                    // Supervisor finished between the two locks.
                    None => {
                        drop(supervisors);
                        let registry = self.registry.lock().await;
                        return registry
                            .get(id)
                            .cloned()
                            .ok_or_else(|| GaleError::ProcessNotFound(id.to_string()));
                    }
                }
            }
        };
        while !rx.borrow_and_update().is_terminal() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        let registry = self.registry.lock().await;
        registry
            .get(id)
            .cloned()
            .ok_or_else(|| GaleError::ProcessNotFound(id.to_string()))
    }

    /// Snapshot listing, filtered by status and label subset, ordered by
    /// start time ascending (stable).
    pub async fn list(
        &self,
        status: Option<ProcessStatus>,
        labels: &[String],
    ) -> Vec<ProcessRecord> {
        let registry = self.registry.lock().await;
        let mut records: Vec<ProcessRecord> = registry
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .filter(|r| r.has_labels(labels))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.started_at_us
                .cmp(&b.started_at_us)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    pub async fn detail(&self, id: &str) -> Result<ProcessRecord, GaleError> {
        let registry = self.registry.lock().await;
        registry
            .get(id)
            .cloned()
            .ok_or_else(|| GaleError::ProcessNotFound(id.to_string()))
    }

    pub async fn status_of(&self, id: &str) -> Result<ProcessStatus, GaleError> {
        self.detail(id).await.map(|r| r.status)
    }

    /// Remove terminal records and their logs. Per-id outcomes; a running
    /// process reports `InUse` and is left untouched.
    pub async fn clean(&self, ids: &[String]) -> BTreeMap<String, CleanOutcome> {
        let mut outcomes = BTreeMap::new();
        for id in ids {
            outcomes.insert(id.clone(), self.clean_one(id).await);
        }
        outcomes
    }

    async fn clean_one(&self, id: &str) -> CleanOutcome {
        {
            let mut registry = self.registry.lock().await;
            match registry.get(id) {
                None => return CleanOutcome::NotFound,
                Some(record) if !record.status.is_terminal() => return CleanOutcome::InUse,
                Some(_) => {
                    registry.remove(id);
                }
            }
        }
        // The record was terminal, so the supervisor is finishing or done;
        // join it before dropping the handle.
        if let Some(handle) = self.supervisors.lock().await.remove(id) {
            let _ = handle.task.await;
        }
        match self.store.clear(id).await {
            Ok(()) => CleanOutcome::Cleaned,
            Err(GaleError::ProcessNotFound(_)) => CleanOutcome::Cleaned,
            Err(e) => CleanOutcome::Failed(e.to_string()),
        }
    }

    /// Start the background sweep that evicts terminal records once
    /// `retention` has elapsed since `ended_at`. Running processes are never
    /// swept.
    pub fn spawn_retention_sweeper(self: &Arc<Self>) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL.min(manager.retention.max(Duration::from_secs(1))));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                manager.sweep_expired().await;
            }
        });
        // Replacing an existing sweeper is a caller bug; the old task keeps
        // running until shutdown, so just warn.
        if let Ok(mut slot) = self.sweeper.try_lock() {
            if slot.replace(task).is_some() {
                tracing::warn!("retention sweeper spawned twice");
            }
        }
    }

    async fn sweep_expired(&self) {
        let cutoff = now_us().saturating_sub(self.retention.as_micros() as i64);
        let expired: Vec<String> = {
            let registry = self.registry.lock().await;
            registry
                .values()
                .filter(|r| r.status.is_terminal())
                .filter(|r| r.ended_at_us.is_some_and(|t| t <= cutoff))
                .map(|r| r.id.clone())
                .collect()
        };
        for id in expired {
            tracing::debug!(id = %id, "retention sweep evicting process record");
            match self.clean_one(&id).await {
                CleanOutcome::Cleaned | CleanOutcome::NotFound => {}
                CleanOutcome::InUse => {}
                CleanOutcome::Failed(e) => {
                    tracing::warn!(id = %id, "retention sweep failed to clear logs: {e}");
                }
            }
        }
    }

    /// Cancel the sweeper, force-stop every running process with a bounded
    /// deadline, then shut the Output Store.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().await.take();
        if let Some(task) = sweeper {
            let _ = task.await;
        }

        let running: Vec<String> = {
            let registry = self.registry.lock().await;
            registry
                .values()
                .filter(|r| r.status == ProcessStatus::Running)
                .map(|r| r.id.clone())
                .collect()
        };
        for id in running {
            if let Err(e) = self.stop(&id, true, Some("server shutdown".to_string())).await {
                tracing::warn!(id = %id, "failed to stop process during shutdown: {e}");
            }
        }
        self.store.shutdown().await;
    }

    fn next_id(&self) -> String {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("p{:x}-{:x}", now_us() / 1000, seq)
    }
}

/// Map a reaped exit status onto the record's terminal fields.
fn exit_disposition(
    exit: std::process::ExitStatus,
) -> (ProcessStatus, Option<i32>, Option<String>) {
    match exit.code() {
        Some(0) => (ProcessStatus::Completed, Some(0), None),
        Some(code) => (ProcessStatus::Failed, Some(code), None),
        None => {
            use std::os::unix::process::ExitStatusExt;
            let signal = exit.signal().unwrap_or(0);
            (
                ProcessStatus::Failed,
                None,
                Some(format!("killed by signal {signal}")),
            )
        }
    }
}

/// Read byte lines from one child pipe, decode with a replacement policy,
/// strip terminators, and append to the store with a fresh timestamp. An
/// append failure is remembered for the supervisor but never stops the
/// drain, so the child cannot block on a full pipe.
fn spawn_channel_reader<R>(
    store: Arc<FileOutputStore>,
    id: String,
    channel: Channel,
    pipe: R,
    encoding: &'static Encoding,
) -> JoinHandle<Result<(), String>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut segments = BufReader::new(pipe).split(b'\n');
        let mut first_error: Option<String> = None;
        loop {
            match segments.next_segment().await {
                Ok(Some(mut bytes)) => {
                    if bytes.last() == Some(&b'\r') {
                        bytes.pop();
                    }
                    let (text, _, _) = encoding.decode(&bytes);
                    if first_error.is_none()
                        && let Err(e) = store.append(&id, channel, &[text.into_owned()]).await
                    {
                        tracing::warn!(id = %id, channel = channel.as_str(), "append failed: {e}");
                        first_error = Some(format!("{} append failed: {e}", channel.as_str()));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(format!("{} read failed: {e}", channel.as_str()));
                    }
                    break;
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(message) => Err(message),
        }
    })
}
