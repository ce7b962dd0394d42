//! The process gateway: spawns children and streams their stdio.
//!
//! A single service loop owns every child process. Each child gets four
//! worker tasks: a stdin writer, one reader per output stream and an exit
//! waiter. Workers never touch gateway state; they post [`Internal`]
//! messages back onto the gateway's own request bus, so every mutation still
//! happens on the one consumer loop.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, info_span, trace, Instrument};

use self::messages::InternalMessage;
use crate::{
    bus::{self, Bus, Inbox},
    util::AbortOnDropHandle,
};

mod messages;

pub use messages::{Internal, ProcessEvent, ProcessId, ProcessRequest, StdioSource};

/// Read size for the stdout/stderr workers; chunk boundaries are whatever
/// the OS hands back.
const STDIO_CHUNK_SIZE: usize = 8192;

/// Handle to a running process gateway.
///
/// The service task is aborted when the handle is dropped. Sending
/// [`ProcessRequest::Kill`] shuts it down gracefully instead: every child is
/// destroyed and reported before the loop exits.
#[derive(Debug)]
pub struct ProcessGateway {
    bus: Bus<ProcessRequest>,
    _service_handle: AbortOnDropHandle<()>,
}

impl ProcessGateway {
    /// Spawns the service loop and returns a handle to it.
    pub fn spawn() -> Self {
        let (tx, rx) = bus::channel();
        let service = Service {
            rx,
            bus: tx.clone(),
            entries: HashMap::new(),
            next_id: 0,
        };
        let handle = tokio::spawn(
            async move { service.run().await }.instrument(info_span!("process.gateway")),
        );
        ProcessGateway {
            bus: tx,
            _service_handle: handle.into(),
        }
    }

    /// The gateway's request bus.
    pub fn bus(&self) -> Bus<ProcessRequest> {
        self.bus.clone()
    }
}

/// Per-child record. Only ever touched by the service loop.
///
/// The `Child` itself lives inside the exit waiter, the one place that can
/// both kill it and observe the exit status.
#[derive(Debug)]
struct ProcessEntry {
    response_bus: Bus<ProcessEvent>,
    /// Queue feeding the stdin writer.
    stdin_bus: Bus<Bytes>,
    /// Tells the exit waiter to destroy the child. Taken on the first close.
    stop: Option<oneshot::Sender<()>>,
    stdin_task: JoinHandle<()>,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    /// Joined on gateway shutdown; an individual close instead waits for
    /// the terminated message this task posts.
    exit_task: JoinHandle<()>,
}

struct Service {
    /// Request inbox. The service stops when all senders are gone.
    rx: Inbox<ProcessRequest>,
    /// Clone of the own request bus, handed to workers for their internal
    /// messages.
    bus: Bus<ProcessRequest>,
    entries: HashMap<ProcessId, ProcessEntry>,
    next_id: u64,
}

impl Service {
    async fn run(mut self) {
        debug!("gateway starting");
        loop {
            match self.rx.recv().await {
                Some(ProcessRequest::Kill) => {
                    debug!("kill requested");
                    break;
                }
                Some(msg) => self.handle_msg(msg),
                None => {
                    debug!("request bus dropped, shutting down");
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    fn handle_msg(&mut self, msg: ProcessRequest) {
        trace!("processing {msg:?}");
        match msg {
            ProcessRequest::Create {
                executable,
                args,
                response_bus,
            } => self.create(executable, args, response_bus),
            ProcessRequest::Write { id, data } => self.write(id, data),
            ProcessRequest::Close { id } => self.close(id),
            ProcessRequest::Internal(msg) => self.handle_internal(msg),
            ProcessRequest::Kill => unreachable!("handled in the run loop"),
        }
    }

    fn create(&mut self, executable: String, args: Vec<String>, response_bus: Bus<ProcessEvent>) {
        let spawned = Command::new(&executable)
            .args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                debug!("failed to spawn {executable}: {err}");
                response_bus.send(ProcessEvent::Error);
                return;
            }
        };
        // stdio was configured piped above, absence means the spawn is unusable
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            debug!("{executable} spawned without piped stdio");
            let _ = child.start_kill();
            response_bus.send(ProcessEvent::Error);
            return;
        };

        let id = ProcessId(self.next_id);
        self.next_id += 1;
        debug!("{id} spawned {executable}");

        let (stdin_bus, stdin_inbox) = bus::channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let stdin_task = tokio::spawn(
            stdin_writer(id, stdin, stdin_inbox, self.bus.clone())
                .instrument(info_span!("process.stdin", %id)),
        );
        let stdout_task = tokio::spawn(
            stdio_reader(id, StdioSource::Stdout, stdout, self.bus.clone())
                .instrument(info_span!("process.stdout", %id)),
        );
        let stderr_task = tokio::spawn(
            stdio_reader(id, StdioSource::Stderr, stderr, self.bus.clone())
                .instrument(info_span!("process.stderr", %id)),
        );
        let exit_task = tokio::spawn(
            exit_waiter(id, child, stop_rx, self.bus.clone())
                .instrument(info_span!("process.exit", %id)),
        );

        let entry = ProcessEntry {
            response_bus,
            stdin_bus,
            stop: Some(stop_tx),
            stdin_task,
            stdout_task,
            stderr_task,
            exit_task,
        };
        entry.response_bus.send(ProcessEvent::Created { id });
        self.entries.insert(id, entry);
    }

    fn write(&mut self, id: ProcessId, data: Bytes) {
        match self.entries.get(&id) {
            Some(entry) => entry.stdin_bus.send(data),
            None => debug!("{id} write to unknown process"),
        }
    }

    fn close(&mut self, id: ProcessId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            debug!("{id} close for unknown process");
            return;
        };
        debug!("{id} close requested");
        if let Some(stop) = entry.stop.take() {
            // the exit waiter destroys the child and posts the terminated
            // message that drives the actual cleanup
            let _ = stop.send(());
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg.into_inner() {
            InternalMessage::Read { id, source, data } => {
                if let Some(entry) = self.entries.get(&id) {
                    entry.response_bus.send(ProcessEvent::Read { id, source, data });
                }
            }
            InternalMessage::WriteQueueEmpty { id } => {
                if let Some(entry) = self.entries.get(&id) {
                    entry.response_bus.send(ProcessEvent::WriteQueueEmpty { id });
                }
            }
            InternalMessage::Terminated { id, exit_code } => self.on_terminated(id, exit_code),
        }
    }

    /// The single cleanup path; both requested and spontaneous exits land
    /// here.
    fn on_terminated(&mut self, id: ProcessId, exit_code: Option<i32>) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        debug!("{id} terminated with {exit_code:?}");
        entry.stdout_task.abort();
        entry.stderr_task.abort();
        entry.stdin_task.abort();
        match exit_code {
            Some(code) => entry
                .response_bus
                .send(ProcessEvent::Exited { id, exit_code: code }),
            None => entry.response_bus.send(ProcessEvent::ProcessError { id }),
        }
    }

    async fn shutdown(&mut self) {
        debug!("gateway stopping, {} processes left", self.entries.len());
        for (id, mut entry) in self.entries.drain() {
            if let Some(stop) = entry.stop.take() {
                let _ = stop.send(());
            }
            entry.stdout_task.abort();
            entry.stderr_task.abort();
            entry.stdin_task.abort();
            // the waiter destroys the child and reaps it; it has to be done
            // before the id is reported dead
            if let Err(err) = entry.exit_task.await {
                debug!("{id} exit waiter failed: {err}");
            }
            entry.response_bus.send(ProcessEvent::ProcessError { id });
        }
    }
}

/// Feeds queued buffers into the child's stdin, reporting each drained queue
/// cycle exactly once. The report for the initially empty queue doubles as
/// the stdin-ready signal.
async fn stdin_writer(
    id: ProcessId,
    mut stdin: ChildStdin,
    mut inbox: Inbox<Bytes>,
    gateway_bus: Bus<ProcessRequest>,
) {
    let mut notified_of_empty = false;
    loop {
        let data = match inbox.try_recv() {
            Some(data) => data,
            None => {
                if !notified_of_empty {
                    notified_of_empty = true;
                    trace!("{id} stdin queue empty");
                    gateway_bus.send(ProcessRequest::Internal(Internal::new(
                        InternalMessage::WriteQueueEmpty { id },
                    )));
                }
                match inbox.recv().await {
                    Some(data) => data,
                    // the entry is gone, nothing more will be queued
                    None => break,
                }
            }
        };
        notified_of_empty = false;
        if let Err(err) = stdin.write_all(&data).await {
            trace!("{id} stdin write failed: {err}");
            break;
        }
        if let Err(err) = stdin.flush().await {
            trace!("{id} stdin flush failed: {err}");
            break;
        }
        trace!("{id} stdin wrote {} bytes", data.len());
    }
}

/// Pumps one output stream of the child into the gateway. Reader failure is
/// not reported by itself; child death always reaches the caller through the
/// exit waiter.
async fn stdio_reader<R: AsyncRead + Unpin>(
    id: ProcessId,
    source: StdioSource,
    mut reader: R,
    gateway_bus: Bus<ProcessRequest>,
) {
    let mut buf = vec![0u8; STDIO_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                trace!("{id} {source:?} read {n} bytes");
                gateway_bus.send(ProcessRequest::Internal(Internal::new(
                    InternalMessage::Read {
                        id,
                        source,
                        data: Bytes::copy_from_slice(&buf[..n]),
                    },
                )));
            }
            Err(err) => {
                trace!("{id} {source:?} read failed: {err}");
                break;
            }
        }
    }
}

/// Owns the child: waits for it to exit, destroying it first if asked to,
/// and reports the observed status to the gateway.
async fn exit_waiter(
    id: ProcessId,
    mut child: Child,
    stop: oneshot::Receiver<()>,
    gateway_bus: Bus<ProcessRequest>,
) {
    let mut early = None;
    tokio::select! {
        res = child.wait() => early = Some(res),
        _ = stop => {}
    }
    let status = match early {
        Some(res) => res,
        None => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let exit_code = match status {
        Ok(status) => exit_code(&status),
        Err(err) => {
            debug!("{id} failed to observe exit: {err}");
            None
        }
    };
    gateway_bus.send(ProcessRequest::Internal(Internal::new(
        InternalMessage::Terminated { id, exit_code },
    )));
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    // mirror the shell convention for signal deaths
    status.code().or_else(|| status.signal().map(|sig| 128 + sig))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn next_event(inbox: &mut Inbox<ProcessEvent>) -> ProcessEvent {
        tokio::time::timeout(Duration::from_secs(10), inbox.recv())
            .await
            .expect("timed out waiting for event")
            .expect("response bus closed")
    }

    async fn create(
        bus: &Bus<ProcessRequest>,
        response_bus: &Bus<ProcessEvent>,
        inbox: &mut Inbox<ProcessEvent>,
        executable: &str,
        args: &[&str],
    ) -> ProcessId {
        bus.send(ProcessRequest::Create {
            executable: executable.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            response_bus: response_bus.clone(),
        });
        match next_event(inbox).await {
            ProcessEvent::Created { id } => id,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cat_echoes_stdin() {
        let gateway = ProcessGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        let id = create(&bus, &response_bus, &mut inbox, "cat", &[]).await;
        bus.send(ProcessRequest::Write {
            id,
            data: Bytes::from_static(b"hello\n"),
        });

        let mut output = Vec::new();
        while output.len() < 6 {
            match next_event(&mut inbox).await {
                ProcessEvent::Read {
                    id: rid,
                    source,
                    data,
                } => {
                    assert_eq!(rid, id);
                    assert_eq!(source, StdioSource::Stdout);
                    output.extend_from_slice(&data);
                }
                ProcessEvent::WriteQueueEmpty { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(output, b"hello\n");

        bus.send(ProcessRequest::Close { id });
        loop {
            match next_event(&mut inbox).await {
                ProcessEvent::Exited { id: eid, .. } | ProcessEvent::ProcessError { id: eid } => {
                    assert_eq!(eid, id);
                    break;
                }
                ProcessEvent::WriteQueueEmpty { .. } | ProcessEvent::Read { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spontaneous_exit_reports_the_code() {
        let gateway = ProcessGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        let id = create(&bus, &response_bus, &mut inbox, "false", &[]).await;
        loop {
            match next_event(&mut inbox).await {
                ProcessEvent::Exited { id: eid, exit_code } => {
                    assert_eq!(eid, id);
                    assert_eq!(exit_code, 1);
                    break;
                }
                ProcessEvent::WriteQueueEmpty { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_reported_separately() {
        let gateway = ProcessGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        let id = create(
            &bus,
            &response_bus,
            &mut inbox,
            "sh",
            &["-c", "echo oops >&2"],
        )
        .await;

        let mut output = Vec::new();
        while output.len() < 5 {
            match next_event(&mut inbox).await {
                ProcessEvent::Read {
                    id: rid,
                    source,
                    data,
                } => {
                    assert_eq!(rid, id);
                    assert_eq!(source, StdioSource::Stderr);
                    output.extend_from_slice(&data);
                }
                ProcessEvent::WriteQueueEmpty { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(output, b"oops\n");
    }

    #[tokio::test]
    async fn missing_executable_is_a_request_error() {
        let gateway = ProcessGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        bus.send(ProcessRequest::Create {
            executable: "definitely-not-an-executable-on-this-host".into(),
            args: vec![],
            response_bus: response_bus.clone(),
        });
        match next_event(&mut inbox).await {
            ProcessEvent::Error => {}
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_sweeps_every_process() {
        let gateway = ProcessGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        let a = create(&bus, &response_bus, &mut inbox, "cat", &[]).await;
        let b = create(&bus, &response_bus, &mut inbox, "cat", &[]).await;
        bus.send(ProcessRequest::Kill);

        let mut dead = std::collections::HashSet::new();
        while dead.len() < 2 {
            match next_event(&mut inbox).await {
                ProcessEvent::ProcessError { id } => assert!(dead.insert(id), "{id} swept twice"),
                ProcessEvent::WriteQueueEmpty { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(dead, [a, b].into_iter().collect());
    }
}
