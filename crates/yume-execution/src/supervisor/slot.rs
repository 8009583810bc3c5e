use super::signal;
use super::{InterruptOutcome, ProcessEvent, ProcessEventSink, SubmitOutcome, SupervisorSettings};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use yume_core::{Result, YumeError};
use yume_interaction::{AgentLauncher, LaunchRequest, StreamParser};

const READ_CHUNK: usize = 64 * 1024;

/// Marker present while a spawn is in flight.
#[derive(Debug, Default)]
struct SpawnState {
    aborted: bool,
    /// Interrupts parked until the aborted spawn has been unwound.
    waiters: Vec<oneshot::Sender<()>>,
}

/// The live process, owned by the slot.
#[derive(Debug)]
struct ProcessHandle {
    pid: u32,
    generation: u64,
    started_at: Instant,
    input_open: bool,
    /// Flips to `true` once every message has been emitted and the child reaped.
    exited: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Idle,
    Spawning(SpawnState),
    Running(ProcessHandle),
    Draining(ProcessHandle),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Spawning(_) => "spawning",
            Phase::Running(_) => "running",
            Phase::Draining(_) => "draining",
        }
    }
}

struct SlotInner {
    session_id: String,
    launcher: Arc<dyn AgentLauncher>,
    sink: Arc<dyn ProcessEventSink>,
    settings: SupervisorSettings,
    /// Serializes `submit` calls in arrival order.
    queue: tokio::sync::Mutex<()>,
    phase: Mutex<Phase>,
    interrupt_epoch: AtomicU64,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

/// Owns the child-process lifecycle of one session.
///
/// Cloning is cheap; clones share the same slot.
#[derive(Clone)]
pub struct ProcessSlot {
    inner: Arc<SlotInner>,
}

impl ProcessSlot {
    pub fn new(
        session_id: impl Into<String>,
        launcher: Arc<dyn AgentLauncher>,
        sink: Arc<dyn ProcessEventSink>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                session_id: session_id.into(),
                launcher,
                sink,
                settings,
                queue: tokio::sync::Mutex::new(()),
                phase: Mutex::new(Phase::Idle),
                interrupt_epoch: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Runs `input` in a new process once every earlier submit has finished.
    ///
    /// A live process younger than the spawn grace window is given the rest of
    /// the window to exit on its own. Any process still alive after that is
    /// terminated before the replacement is started, so at most one process
    /// per slot exists at a time.
    ///
    /// # Errors
    ///
    /// Returns `YumeError::SessionClosed` after `teardown` and
    /// `YumeError::Spawn` when the process cannot be started. The slot is
    /// back to idle in both cases.
    pub async fn submit(&self, request: LaunchRequest, input: String) -> Result<SubmitOutcome> {
        self.submit_with(move || request, input).await
    }

    /// Like [`submit`](Self::submit), but builds the launch request only once
    /// the previous process is gone, so it sees the latest resume token.
    pub async fn submit_with<F>(&self, build: F, input: String) -> Result<SubmitOutcome>
    where
        F: FnOnce() -> LaunchRequest + Send,
    {
        let inner = &self.inner;
        self.ensure_open()?;
        let epoch = inner.interrupt_epoch.load(Ordering::SeqCst);

        let _queue = inner.queue.lock().await;
        self.ensure_open()?;
        if inner.interrupt_epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!(session_id = %inner.session_id, "Submit abandoned by interrupt");
            return Ok(SubmitOutcome::Abandoned);
        }

        self.wait_for_young_process().await;
        let Some((guard, previous)) = self.begin_spawn(epoch) else {
            tracing::debug!(session_id = %inner.session_id, "Submit abandoned by interrupt");
            return Ok(SubmitOutcome::Abandoned);
        };
        if let Some((pid, exited)) = previous {
            tracing::debug!(session_id = %inner.session_id, pid, "Replacing live process");
            self.terminate(pid, exited).await;
        }
        if guard.aborted() {
            return Ok(SubmitOutcome::Interrupted);
        }

        let request = build();
        let program = inner.launcher.program();
        match tokio::fs::metadata(&request.working_directory).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(YumeError::spawn(
                    program,
                    format!(
                        "working directory '{}' does not exist",
                        request.working_directory.display()
                    ),
                ));
            }
        }
        if guard.aborted() {
            return Ok(SubmitOutcome::Interrupted);
        }

        self.spawn_and_register(guard, &request, input).await
    }

    /// Stops whatever the slot is doing. Idempotent.
    ///
    /// A running process is terminated (group SIGTERM, then SIGKILL after the
    /// grace period) and the call returns once it has exited. A spawn in
    /// flight is aborted; the call returns once the aborted spawn has been
    /// unwound and no process is left. Submits still waiting in the queue are
    /// abandoned.
    pub async fn interrupt(&self) -> InterruptOutcome {
        let inner = &self.inner;
        inner.interrupt_epoch.fetch_add(1, Ordering::SeqCst);

        enum Action {
            Done(InterruptOutcome),
            Wait(oneshot::Receiver<()>),
            Kill(u64, u32, watch::Receiver<bool>),
        }

        let action = {
            let mut phase = self.lock_phase();
            let action = match &mut *phase {
                Phase::Idle => Action::Done(InterruptOutcome::Idle),
                Phase::Draining(_) => Action::Done(InterruptOutcome::AlreadyPending),
                Phase::Spawning(state) if state.aborted => {
                    Action::Done(InterruptOutcome::AlreadyPending)
                }
                Phase::Spawning(state) => {
                    let (tx, rx) = oneshot::channel();
                    state.aborted = true;
                    state.waiters.push(tx);
                    Action::Wait(rx)
                }
                Phase::Running(handle) => {
                    Action::Kill(handle.generation, handle.pid, handle.exited.clone())
                }
            };
            if matches!(action, Action::Kill(..))
                && let Phase::Running(handle) = std::mem::take(&mut *phase)
            {
                *phase = Phase::Draining(handle);
            }
            action
        };

        match action {
            Action::Done(outcome) => {
                tracing::debug!(session_id = %inner.session_id, ?outcome, "Interrupt");
                outcome
            }
            Action::Wait(rx) => {
                tracing::info!(session_id = %inner.session_id, "Interrupt during spawn, aborting");
                // Sender dropped also means the spawn has been unwound
                let _ = rx.await;
                InterruptOutcome::AbortedSpawn
            }
            Action::Kill(generation, pid, exited) => {
                tracing::info!(session_id = %inner.session_id, pid, generation, "Interrupting process");
                self.terminate(pid, exited).await;
                InterruptOutcome::Killed { generation }
            }
        }
    }

    /// Kills the current process, if any, keeping the slot usable.
    pub async fn clear(&self) {
        let outcome = self.interrupt().await;
        tracing::debug!(session_id = %self.inner.session_id, ?outcome, "Slot cleared");
    }

    /// Kills the current process and rejects every later submit.
    pub async fn teardown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let outcome = self.interrupt().await;
        tracing::debug!(session_id = %self.inner.session_id, ?outcome, "Slot torn down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// True while a process is spawning, running or draining.
    pub fn is_live(&self) -> bool {
        !matches!(*self.lock_phase(), Phase::Idle)
    }

    pub fn current_pid(&self) -> Option<u32> {
        match &*self.lock_phase() {
            Phase::Running(handle) | Phase::Draining(handle) => Some(handle.pid),
            _ => None,
        }
    }

    /// Whether the live process still has its stdin open.
    pub fn input_open(&self) -> bool {
        match &*self.lock_phase() {
            Phase::Running(handle) | Phase::Draining(handle) => handle.input_open,
            _ => false,
        }
    }

    pub fn phase_name(&self) -> &'static str {
        self.lock_phase().name()
    }

    // ============================================================================
    // Lifecycle steps
    // ============================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(YumeError::session_closed(self.inner.session_id.clone()))
        } else {
            Ok(())
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.inner
            .phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits out the grace window of a freshly started process.
    async fn wait_for_young_process(&self) {
        let pending = match &*self.lock_phase() {
            Phase::Running(handle) => {
                let age = handle.started_at.elapsed();
                (age < self.inner.settings.spawn_grace)
                    .then(|| (self.inner.settings.spawn_grace - age, handle.exited.clone()))
            }
            _ => None,
        };
        if let Some((remaining, mut exited)) = pending {
            tracing::debug!(
                session_id = %self.inner.session_id,
                remaining_ms = remaining.as_millis() as u64,
                "Deferring submit for young process"
            );
            wait_exited(&mut exited, remaining).await;
        }
    }

    /// Enters `Spawning` and hands back the process it replaces.
    ///
    /// Returns `None` when an interrupt has been issued since `epoch` was
    /// read. The check runs under the phase lock, and `interrupt` bumps the
    /// epoch before taking that lock, so an interrupt either cancels the
    /// submit here or finds the slot in `Spawning`.
    fn begin_spawn(&self, epoch: u64) -> Option<(SpawnGuard, Option<(u32, watch::Receiver<bool>)>)> {
        let mut phase = self.lock_phase();
        if self.inner.interrupt_epoch.load(Ordering::SeqCst) != epoch {
            return None;
        }
        let previous = match std::mem::replace(&mut *phase, Phase::Spawning(SpawnState::default())) {
            Phase::Running(handle) | Phase::Draining(handle) => Some((handle.pid, handle.exited)),
            Phase::Idle => None,
            Phase::Spawning(state) => {
                // Unreachable while the queue lock is held; keep the marker intact
                *phase = Phase::Spawning(state);
                None
            }
        };
        Some((
            SpawnGuard {
                inner: self.inner.clone(),
            },
            previous,
        ))
    }

    async fn spawn_and_register(
        &self,
        guard: SpawnGuard,
        request: &LaunchRequest,
        input: String,
    ) -> Result<SubmitOutcome> {
        let inner = &self.inner;
        let program = inner.launcher.program();

        let mut cmd = inner.launcher.command(request);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!(session_id = %inner.session_id, program = %program, error = %e, "Spawn failed");
            YumeError::spawn(program.clone(), e.to_string())
        })?;
        let pid = child.id().unwrap_or_default();
        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (exit_tx, exit_rx) = watch::channel(false);

        let registered = {
            let mut phase = self.lock_phase();
            match &*phase {
                Phase::Spawning(state) if state.aborted => false,
                _ => {
                    *phase = Phase::Running(ProcessHandle {
                        pid,
                        generation,
                        started_at: Instant::now(),
                        input_open: true,
                        exited: exit_rx,
                    });
                    true
                }
            }
        };

        if !registered {
            tracing::info!(session_id = %inner.session_id, pid, "Killing process spawned after interrupt");
            signal::kill_tree(pid).await;
            let _ = child.start_kill();
            if let Err(e) = child.wait().await {
                tracing::warn!(session_id = %inner.session_id, pid, error = %e, "Failed to reap aborted process");
            }
            drop(guard);
            return Ok(SubmitOutcome::Interrupted);
        }
        drop(guard);

        tracing::info!(
            session_id = %inner.session_id,
            pid,
            generation,
            resume = request.resume_token.is_some(),
            "Process spawned"
        );
        inner.sink.emit(ProcessEvent::Spawned { generation, pid });

        let stdin = child.stdin.take();
        match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => {
                tokio::spawn(drive(inner.clone(), generation, child, stdout, stderr, exit_tx));
            }
            _ => {
                // Piped stdio was requested, so this only happens on a broken runtime
                tracing::error!(session_id = %inner.session_id, pid, "Child has no output pipes");
                signal::kill_tree(pid).await;
                tokio::spawn(drive_without_output(inner.clone(), generation, child, exit_tx));
                return Err(YumeError::process("child process has no output pipes"));
            }
        }

        if let Some(mut stdin) = stdin {
            let written = async {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await
            }
            .await;
            if let Err(e) = written {
                // The exit path reports what went wrong with the process
                tracing::warn!(session_id = %inner.session_id, pid, error = %e, "Failed to write input");
            }
        }
        self.mark_input_closed(generation);

        Ok(SubmitOutcome::Started { generation, pid })
    }

    fn mark_input_closed(&self, generation: u64) {
        if let Phase::Running(handle) | Phase::Draining(handle) = &mut *self.lock_phase()
            && handle.generation == generation
        {
            handle.input_open = false;
        }
    }

    /// Group SIGTERM, grace period, then SIGKILL to the group and the pid.
    async fn terminate(&self, pid: u32, mut exited: watch::Receiver<bool>) {
        let settings = &self.inner.settings;
        if *exited.borrow() {
            return;
        }
        signal::terminate_group(pid).await;
        if wait_exited(&mut exited, settings.kill_grace).await {
            return;
        }

        tracing::warn!(session_id = %self.inner.session_id, pid, "Process ignored SIGTERM, killing");
        signal::kill_tree(pid).await;
        if !wait_exited(&mut exited, settings.post_kill_wait).await {
            tracing::warn!(session_id = %self.inner.session_id, pid, "Process still not reaped after SIGKILL");
        }
    }
}

impl SlotInner {
    /// Returns the slot to idle after `generation` exited.
    fn mark_exited(&self, generation: u64) -> ExitKind {
        let mut phase = self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let kind = match &*phase {
            Phase::Running(handle) if handle.generation == generation => ExitKind::Finished,
            Phase::Draining(handle) if handle.generation == generation => ExitKind::Interrupted,
            // A newer spawn took the slot over; leave its state alone
            _ => return ExitKind::Superseded,
        };
        *phase = Phase::Idle;
        kind
    }
}

/// Why a process left the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitKind {
    Finished,
    Interrupted,
    /// Replaced by a later submit.
    Superseded,
}

impl ExitKind {
    fn interrupted(self) -> bool {
        self == ExitKind::Interrupted
    }

    fn superseded(self) -> bool {
        self == ExitKind::Superseded
    }
}

/// Unwinds `Spawning` on every exit path of a spawn attempt.
///
/// If the phase is still `Spawning` when the guard drops, the spawn did not
/// register a process: the slot goes back to idle and parked interrupts fire.
struct SpawnGuard {
    inner: Arc<SlotInner>,
}

impl SpawnGuard {
    fn aborted(&self) -> bool {
        let phase = self.inner.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        matches!(&*phase, Phase::Spawning(state) if state.aborted)
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        let waiters = {
            let mut phase = self.inner.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let waiters = match &mut *phase {
                Phase::Spawning(state) => std::mem::take(&mut state.waiters),
                _ => return,
            };
            *phase = Phase::Idle;
            waiters
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

/// Reads one process to completion and reports its exit.
async fn drive(
    inner: Arc<SlotInner>,
    generation: u64,
    mut child: Child,
    mut stdout: ChildStdout,
    stderr: ChildStderr,
    exit_tx: watch::Sender<bool>,
) {
    let stderr_task = tokio::spawn(read_stderr(inner.clone(), generation, stderr));

    let mut parser = StreamParser::new(inner.settings.max_line_bytes);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for message in parser.feed(&buf[..n]) {
                    inner.sink.emit(ProcessEvent::Message {
                        generation,
                        message,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %inner.session_id, generation, error = %e, "stdout read failed");
                break;
            }
        }
    }
    for message in parser.finish() {
        inner.sink.emit(ProcessEvent::Message {
            generation,
            message,
        });
    }

    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(session_id = %inner.session_id, generation, error = %e, "wait failed");
            None
        }
    };
    if let Err(e) = stderr_task.await {
        tracing::warn!(session_id = %inner.session_id, generation, error = %e, "stderr reader failed");
    }

    finish(&inner, generation, code, exit_tx);
}

async fn drive_without_output(
    inner: Arc<SlotInner>,
    generation: u64,
    mut child: Child,
    exit_tx: watch::Sender<bool>,
) {
    let code = child.wait().await.ok().and_then(|status| status.code());
    finish(&inner, generation, code, exit_tx);
}

fn finish(inner: &SlotInner, generation: u64, code: Option<i32>, exit_tx: watch::Sender<bool>) {
    let kind = inner.mark_exited(generation);
    tracing::info!(
        session_id = %inner.session_id,
        generation,
        ?code,
        ?kind,
        "Process exited"
    );
    inner.sink.emit(ProcessEvent::Exited {
        generation,
        code,
        interrupted: kind.interrupted(),
        superseded: kind.superseded(),
    });
    exit_tx.send_replace(true);
}

async fn read_stderr(inner: Arc<SlotInner>, generation: u64, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                tracing::debug!(session_id = %inner.session_id, generation, line = %line, "stderr");
                inner.sink.emit(ProcessEvent::Stderr { generation, line });
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(session_id = %inner.session_id, generation, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

/// Waits until the process reports exit or `limit` passes.
async fn wait_exited(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    // A dropped sender means the drive task is gone, which only happens after exit
    matches!(
        tokio::time::timeout(limit, exited.wait_for(|done| *done)).await,
        Ok(_)
    )
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::process::Command;
    use tokio::sync::mpsc;

    struct SleepLauncher;

    #[async_trait]
    impl AgentLauncher for SleepLauncher {
        fn program(&self) -> String {
            "sh".to_string()
        }

        fn command(&self, request: &LaunchRequest) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("sleep 30").current_dir(&request.working_directory);
            cmd
        }

        async fn is_available(&self) -> Result<()> {
            Ok(())
        }
    }

    fn slot() -> (ProcessSlot, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = ProcessSlot::new(
            "unit",
            Arc::new(SleepLauncher),
            Arc::new(tx),
            SupervisorSettings::default(),
        );
        (slot, rx)
    }

    #[tokio::test]
    async fn test_process_spawned_after_abort_is_killed_not_registered() {
        let (slot, mut rx) = slot();
        let (guard, previous) = slot.begin_spawn(0).unwrap();
        assert!(previous.is_none());

        // An interrupt arrives between `spawn()` and registration
        let (tx, waiter) = oneshot::channel();
        if let Phase::Spawning(state) = &mut *slot.lock_phase() {
            state.aborted = true;
            state.waiters.push(tx);
        }

        let outcome = slot
            .spawn_and_register(guard, &LaunchRequest::new(std::env::temp_dir()), String::new())
            .await
            .unwrap();

        assert_eq!(outcome, SubmitOutcome::Interrupted);
        assert!(waiter.await.is_ok(), "Parked interrupt fires exactly once");
        assert_eq!(slot.phase_name(), "idle");
        assert!(rx.try_recv().is_err(), "Nothing was announced for the killed process");
    }

    #[tokio::test]
    async fn test_guard_drop_releases_every_waiter() {
        let (slot, _rx) = slot();
        let (guard, _) = slot.begin_spawn(0).unwrap();

        let mut waiters = Vec::new();
        if let Phase::Spawning(state) = &mut *slot.lock_phase() {
            state.aborted = true;
            for _ in 0..3 {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                waiters.push(rx);
            }
        }

        drop(guard);
        for waiter in waiters {
            assert!(waiter.await.is_ok());
        }
        assert_eq!(slot.phase_name(), "idle");
    }

    #[test]
    fn test_exit_of_superseded_generation_keeps_state() {
        let (slot, _rx) = slot();
        let (_guard, _) = slot.begin_spawn(0).unwrap();

        assert_eq!(slot.inner.mark_exited(7), ExitKind::Superseded);
        assert_eq!(slot.phase_name(), "spawning");
    }

    #[tokio::test]
    async fn test_interrupt_before_spawn_cancels_submit() {
        let (slot, _rx) = slot();
        let epoch = slot.inner.interrupt_epoch.load(Ordering::SeqCst);

        // The interrupt lands after the submit read the epoch but before it
        // entered `Spawning`, so it only sees an idle slot
        assert_eq!(slot.interrupt().await, InterruptOutcome::Idle);

        assert!(slot.begin_spawn(epoch).is_none());
        assert_eq!(slot.phase_name(), "idle");
    }
}
