//! Request and event taxonomy of the process gateway.

use bytes::Bytes;

use crate::bus::Bus;

/// Identifies one child process owned by a [`ProcessGateway`].
///
/// Ids increase monotonically and are never reused within a gateway's
/// lifetime.
///
/// [`ProcessGateway`]: super::ProcessGateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub struct ProcessId(pub(super) u64);

/// Which stdio stream of the child a read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioSource {
    /// The child's standard output.
    Stdout,
    /// The child's standard error.
    Stderr,
}

/// Requests accepted on the process gateway's bus.
#[derive(derive_more::Debug)]
pub enum ProcessRequest {
    /// Spawn `executable` with `args`, stdio fully piped.
    ///
    /// Answered with [`ProcessEvent::Created`] or [`ProcessEvent::Error`].
    Create {
        /// Program to run.
        executable: String,
        /// Arguments passed to the program.
        args: Vec<String>,
        /// Where replies and notifications for this child are posted.
        #[debug("_")]
        response_bus: Bus<ProcessEvent>,
    },
    /// Queue bytes for the child's stdin.
    Write {
        /// Process to write to.
        id: ProcessId,
        /// Bytes for stdin.
        data: Bytes,
    },
    /// Terminate the child.
    ///
    /// The exit status is still observed; the caller receives
    /// [`ProcessEvent::Exited`] (or [`ProcessEvent::ProcessError`] if no
    /// status was available) once the child is gone.
    Close {
        /// Process to terminate.
        id: ProcessId,
    },
    /// Stop the gateway. Every remaining child is destroyed and reported
    /// with [`ProcessEvent::ProcessError`].
    Kill,
    /// Posted by the gateway's own worker tasks, never by callers.
    Internal(Internal),
}

/// Worker-to-gateway message riding the public request bus.
///
/// Keeps all state mutation on the gateway's consumer loop without exposing
/// the internal message set: the payload is constructible only inside this
/// crate.
#[derive(Debug)]
pub struct Internal(pub(super) InternalMessage);

impl Internal {
    pub(super) fn new(msg: InternalMessage) -> Self {
        Internal(msg)
    }

    pub(super) fn into_inner(self) -> InternalMessage {
        self.0
    }
}

#[derive(Debug)]
pub(super) enum InternalMessage {
    /// A reader task pulled a chunk off stdout/stderr.
    Read {
        id: ProcessId,
        source: StdioSource,
        data: Bytes,
    },
    /// The stdin writer drained its queue.
    WriteQueueEmpty { id: ProcessId },
    /// The exit waiter observed the child terminating.
    Terminated {
        id: ProcessId,
        exit_code: Option<i32>,
    },
}

/// Replies and notifications posted on a caller's response bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The child is running and its workers are wired up.
    Created {
        /// Id of the new child.
        id: ProcessId,
    },
    /// The request could not start; no id was allocated.
    Error,
    /// A chunk arrived on stdout or stderr. Chunking is whatever the OS
    /// delivers, there is no line buffering.
    Read {
        /// Id of the child that produced output.
        id: ProcessId,
        /// Stream the chunk came from.
        source: StdioSource,
        /// The chunk.
        data: Bytes,
    },
    /// The stdin queue just drained.
    ///
    /// Emitted once per drain cycle; a freshly spawned child reports its
    /// (empty) queue once.
    WriteQueueEmpty {
        /// Id of the drained child.
        id: ProcessId,
    },
    /// The child terminated and its exit status was observed. Terminal for
    /// the id.
    Exited {
        /// Id of the terminated child.
        id: ProcessId,
        /// Exit code; on unix a signal death is reported as `128 + signal`.
        exit_code: i32,
    },
    /// The child is gone without an observable exit status, or the gateway
    /// shut down. Terminal for the id.
    ProcessError {
        /// Id of the dead child.
        id: ProcessId,
    },
}
