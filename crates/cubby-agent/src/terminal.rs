//! PTY-backed terminal sessions, keyed by client-chosen session id.
//!
//! Each session owns one interactive shell behind a pseudo-terminal. Output
//! chunks and exit notifications are emitted on the agent's event channel
//! tagged with the session id; blocking PTY I/O runs on dedicated
//! `spawn_blocking` threads so the connection loop never stalls.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cubby_protocol::AgentEvent;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, PtySize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Default terminal geometry for new sessions.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// PTY read buffer size.
const READ_BUF_SIZE: usize = 8192;

/// Messages handled by a session's blocking writer thread.
enum PtyMsg {
    Input(String),
    Resize { cols: u16, rows: u16 },
}

/// One live terminal session.
struct TerminalSession {
    /// Distinguishes this process from a replacement spawned under the same
    /// id, so a stale exit watcher never evicts its successor.
    generation: u64,
    killer: Box<dyn ChildKiller + Send + Sync>,
    input: mpsc::UnboundedSender<PtyMsg>,
    alive: Arc<AtomicBool>,
}

/// Registry of PTY sessions for one agent connection.
///
/// The registry dies with its connection: [`TerminalRegistry::shutdown`]
/// kills every live process so no session outlives the upstream socket.
pub struct TerminalRegistry {
    root: PathBuf,
    shell: String,
    events: mpsc::UnboundedSender<AgentEvent>,
    sessions: Arc<Mutex<HashMap<String, TerminalSession>>>,
    generation: AtomicU64,
}

/// The interactive shell to spawn: `$SHELL` when set, `bash` otherwise.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())
}

impl TerminalRegistry {
    pub fn new(
        root: impl Into<PathBuf>,
        shell: impl Into<String>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            root: root.into(),
            shell: shell.into(),
            events,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    fn emit_data(&self, session_id: &str, data: &str) {
        let _ = self.events.send(AgentEvent::TerminalData {
            session_id: session_id.to_string(),
            data: data.to_string(),
        });
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Spawn a shell for `session_id`, terminating any process already
    /// registered under that id first.
    ///
    /// Spawn failures are reported in-band as a session-scoped error line;
    /// no registry entry is retained for a failed spawn.
    pub async fn create(&self, session_id: &str) {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(mut old) = sessions.remove(session_id) {
                info!(session_id, "replacing existing terminal session");
                old.alive.store(false, Ordering::SeqCst);
                let _ = old.killer.kill();
            }
        }

        match self.spawn_session(session_id).await {
            Ok(()) => {
                self.emit_data(
                    session_id,
                    &format!("\r\n\x1b[32m[agent] shell ready ({})\x1b[0m\r\n", self.shell),
                );
            }
            Err(e) => {
                warn!(session_id, error = %e, "failed to spawn shell");
                self.emit_data(
                    session_id,
                    &format!("\r\n\x1b[31m[agent] failed to spawn shell: {e}\x1b[0m\r\n"),
                );
            }
        }
    }

    async fn spawn_session(&self, session_id: &str) -> anyhow::Result<()> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.arg("-i");
        cmd.cwd(&self.root);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let mut child = pair.slave.spawn_command(cmd)?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair.master.try_clone_reader()?;
        let mut writer = pair.master.take_writer()?;
        let master = pair.master;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<PtyMsg>();

        // Register before the exit watcher can fire: a shell that dies
        // instantly must still find (and evict) its own entry.
        self.sessions.lock().await.insert(
            session_id.to_string(),
            TerminalSession {
                generation,
                killer,
                input: input_tx,
                alive: alive.clone(),
            },
        );

        // Writer thread: input and resize share the master handle.
        let alive_writer = alive.clone();
        let sid = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            while let Some(msg) = input_rx.blocking_recv() {
                match msg {
                    PtyMsg::Input(data) => {
                        let _ = writer.write_all(data.as_bytes());
                        let _ = writer.flush();
                    }
                    PtyMsg::Resize { cols, rows } => {
                        let result = master.resize(PtySize {
                            rows,
                            cols,
                            pixel_width: 0,
                            pixel_height: 0,
                        });
                        if let Err(e) = result {
                            // Resizing a dead PTY is an expected race.
                            if alive_writer.load(Ordering::SeqCst) {
                                warn!(session_id = %sid, error = %e, "pty resize failed");
                            }
                        }
                    }
                }
            }
        });

        // Reader thread: pump output chunks tagged with the session id.
        let events = self.events.clone();
        let sid = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        if events
                            .send(AgentEvent::TerminalData {
                                session_id: sid.clone(),
                                data: chunk,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        // Exit watcher: reap the child, evict the entry, notify the client.
        let events = self.events.clone();
        let sessions = self.sessions.clone();
        let alive_waiter = alive.clone();
        let sid = session_id.to_string();
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            match status {
                Ok(Ok(status)) => debug!(session_id = %sid, code = status.exit_code(), "shell exited"),
                Ok(Err(e)) => debug!(session_id = %sid, error = %e, "error reaping shell"),
                Err(e) => debug!(session_id = %sid, error = %e, "exit watcher task failed"),
            }
            alive_waiter.store(false, Ordering::SeqCst);

            let mut sessions = sessions.lock().await;
            if sessions
                .get(&sid)
                .is_some_and(|s| s.generation == generation)
            {
                sessions.remove(&sid);
            }
            drop(sessions);

            let _ = events.send(AgentEvent::TerminalExit { session_id: sid });
        });

        info!(session_id, shell = %self.shell, "terminal session spawned");
        Ok(())
    }

    /// Forward raw input to a session's PTY.
    ///
    /// Input for an unknown session is dropped: the client may legitimately
    /// have raced a kill, so no error goes back over the wire.
    pub async fn write(&self, session_id: &str, data: &str) {
        let sessions = self.sessions.lock().await;
        match sessions.get(session_id) {
            Some(session) => {
                let _ = session.input.send(PtyMsg::Input(data.to_string()));
            }
            None => warn!(session_id, "dropping input for unknown terminal session"),
        }
    }

    /// Apply new PTY dimensions. Resizes racing a process exit are swallowed.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(session_id) {
            let _ = session.input.send(PtyMsg::Resize { cols, rows });
        }
    }

    /// Terminate a session and remove its registry entry.
    pub async fn kill(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(mut session) = sessions.remove(session_id) {
            session.alive.store(false, Ordering::SeqCst);
            let _ = session.killer.kill();
            info!(session_id, "terminal session killed");
        }
    }

    /// Kill every live session and clear the registry. Called when the
    /// upstream connection goes away.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        for (_, mut session) in sessions.drain() {
            session.alive.store(false, Ordering::SeqCst);
            let _ = session.killer.kill();
        }
        if count > 0 {
            info!(count, "terminated all terminal sessions on disconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn registry() -> (
        TempDir,
        TerminalRegistry,
        mpsc::UnboundedReceiver<AgentEvent>,
    ) {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = TerminalRegistry::new(dir.path(), "sh", tx);
        (dir, registry, rx)
    }

    /// Collect `terminal:data` payloads for `session_id` until the
    /// concatenation contains `needle`.
    async fn wait_for_output(
        rx: &mut mpsc::UnboundedReceiver<AgentEvent>,
        session_id: &str,
        needle: &str,
    ) -> String {
        let mut collected = String::new();
        timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                if let AgentEvent::TerminalData {
                    session_id: sid,
                    data,
                } = event
                {
                    if sid == session_id {
                        collected.push_str(&data);
                        if collected.contains(needle) {
                            return;
                        }
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}; got {collected:?}"));
        collected
    }

    async fn wait_for_exit(rx: &mut mpsc::UnboundedReceiver<AgentEvent>, session_id: &str) {
        timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                if let AgentEvent::TerminalExit { session_id: sid } = event {
                    if sid == session_id {
                        return;
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for terminal:exit");
    }

    #[tokio::test]
    async fn create_write_read_back() {
        let (_dir, registry, mut rx) = registry();
        registry.create("t1").await;
        assert_eq!(registry.len().await, 1);

        registry.write("t1", "echo cubby-$((40+2))\n").await;
        let output = wait_for_output(&mut rx, "t1", "cubby-42").await;
        assert!(output.contains("cubby-42"));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let (_dir, registry, mut rx) = registry();
        registry.create("a").await;
        registry.create("b").await;
        assert_eq!(registry.len().await, 2);

        registry.write("a", "echo from-$((1))a\n").await;
        registry.write("b", "echo from-$((2))b\n").await;

        // Each marker must arrive tagged with its own session id.
        let out_a = wait_for_output(&mut rx, "a", "from-1a").await;
        assert!(!out_a.contains("from-2b"));
        wait_for_output(&mut rx, "b", "from-2b").await;

        registry.kill("a").await;
        assert_eq!(registry.len().await, 1);

        // "b" keeps working after "a" is gone.
        registry.write("b", "echo still-$((3))b\n").await;
        wait_for_output(&mut rx, "b", "still-3b").await;

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_create_replaces_old_process() {
        let (_dir, registry, mut rx) = registry();
        registry.create("a").await;
        registry.create("a").await;

        // Old process is killed; exactly one entry remains.
        wait_for_exit(&mut rx, "a").await;
        assert_eq!(registry.len().await, 1);

        // The surviving process is functional.
        registry.write("a", "echo survivor-$((7))\n").await;
        wait_for_output(&mut rx, "a", "survivor-7").await;

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn input_after_kill_is_dropped_without_error() {
        let (_dir, registry, mut rx) = registry();
        registry.create("t1").await;
        registry.kill("t1").await;
        assert!(registry.is_empty().await);

        registry.write("t1", "echo ghost\n").await;
        wait_for_exit(&mut rx, "t1").await;

        // Nothing fs:error-like comes out of the terminal path; the channel
        // only ever carried data and the exit notification.
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(
                event,
                AgentEvent::TerminalData { .. } | AgentEvent::TerminalExit { .. }
            ));
        }
    }

    #[tokio::test]
    async fn resize_dead_session_is_swallowed() {
        let (_dir, registry, _rx) = registry();
        registry.create("t1").await;
        registry.kill("t1").await;
        // Must not panic or surface anything.
        registry.resize("t1", 120, 40).await;
    }

    #[tokio::test]
    async fn shutdown_kills_every_session() {
        let (_dir, registry, mut rx) = registry();
        registry.create("a").await;
        registry.create("b").await;
        registry.shutdown().await;
        assert!(registry.is_empty().await);

        // Both processes get reaped.
        wait_for_exit(&mut rx, "a").await;
        wait_for_exit(&mut rx, "b").await;
    }

    #[tokio::test]
    async fn process_exit_evicts_registry_entry() {
        let (_dir, registry, mut rx) = registry();
        registry.create("t1").await;
        registry.write("t1", "exit\n").await;
        wait_for_exit(&mut rx, "t1").await;
        assert!(registry.is_empty().await);
    }
}
