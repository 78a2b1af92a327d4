//! Protocol tasks and the scheduler that runs them.
//!
//! A task is one protocol exchange (start up, run a query, terminate). The
//! [`TaskScheduler`] runs queued tasks one at a time over a single
//! connection: it hands the running task the cumulative receive buffer,
//! collects the bytes the task wants sent, and tells the I/O layer what to
//! do next through [`Action`]s. Nothing in this module performs I/O.

mod buffer;
mod phase;
mod query;
mod scheduler;
mod startup;
mod terminate;

use std::collections::HashMap;
use std::fmt;

pub use buffer::CumulativeBuffer;
pub use phase::TaskPhase;
pub use query::QueryTask;
pub use scheduler::{Action, TaskScheduler};
pub use startup::StartupTask;
pub use terminate::TerminateTask;

use crate::error::{Error, Result};
use crate::handler::AsyncMessage;
use crate::protocol::backend::BackendKeyData;
use crate::protocol::types::TransactionStatus;
use crate::result::{DemandSignal, ResultDemux};

/// Identifies a task within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Backend process key used for query cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    /// Backend process ID
    pub pid: u32,
    /// Secret key
    pub secret: u32,
}

impl From<&BackendKeyData> for BackendKey {
    fn from(key: &BackendKeyData) -> Self {
        Self {
            pid: key.process_id(),
            secret: key.secret(),
        }
    }
}

/// Connection-level state learned from the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Key for cancel requests, once startup delivered it
    pub backend_key: Option<BackendKey>,
    /// Latest value of every reported server parameter
    pub server_params: HashMap<String, String>,
    /// Transaction status from the latest ReadyForQuery
    pub transaction_status: TransactionStatus,
}

/// How a task wants its first packets sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// Send whatever the start hook wrote, if anything.
    Send,
    /// Splice a TLS handshake into the transport before sending anything.
    UpgradeTls,
}

/// Result of a decode call.
#[derive(Debug)]
pub enum Decoded {
    /// The buffer holds no complete message the task can use yet.
    NeedMore,
    /// A row stream is full. Decoding resumes once the signal fires.
    Suspended(DemandSignal),
    /// Upgrade the transport to TLS, then send the packets written so far.
    UpgradeTls,
    /// The task is complete.
    Ended,
}

/// What the scheduler does after a task's error hook ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// End the task; the next task starts right away.
    EndTask,
    /// End the task and skip inbound bytes through the next ReadyForQuery.
    DrainUntilReady,
    /// End the task and close the connection.
    Disconnect,
}

/// Everything a task may touch while it runs.
pub struct TaskContext<'a> {
    /// Inbound bytes not yet consumed
    pub input: &'a mut CumulativeBuffer,
    /// Outbound bytes; flushed by the scheduler
    pub output: &'a mut Vec<u8>,
    /// Result demultiplexer, for tasks that declare results
    pub results: Option<&'a mut ResultDemux>,
    /// Connection state
    pub session: &'a mut Session,
    async_messages: &'a mut Vec<AsyncMessage>,
}

impl<'a> TaskContext<'a> {
    /// Assemble a context.
    pub fn new(
        input: &'a mut CumulativeBuffer,
        output: &'a mut Vec<u8>,
        results: Option<&'a mut ResultDemux>,
        session: &'a mut Session,
        async_messages: &'a mut Vec<AsyncMessage>,
    ) -> Self {
        Self {
            input,
            output,
            results,
            session,
            async_messages,
        }
    }

    /// Consume the next message if it is asynchronous.
    ///
    /// The message is queued for the async message handler; parameter
    /// changes are also recorded in the session.
    pub fn absorb_async(&mut self) -> Result<Option<&AsyncMessage>> {
        let Some(msg) = self.input.peek_message()? else {
            return Ok(None);
        };
        if !msg.is_async() {
            return Ok(None);
        }
        let frame_len = msg.frame_len();
        let Some(message) = AsyncMessage::parse(&msg)? else {
            return Ok(None);
        };
        self.input.advance(frame_len);

        if let AsyncMessage::ParameterChanged { name, value } = &message {
            self.session
                .server_params
                .insert(name.clone(), value.clone());
        }
        self.async_messages.push(message);
        Ok(self.async_messages.last())
    }

    /// The result demultiplexer; a protocol error if the task has none.
    pub fn results(&mut self) -> Result<&mut ResultDemux> {
        self.results
            .as_deref_mut()
            .ok_or_else(|| Error::Protocol("task has no result demultiplexer".into()))
    }
}

/// One protocol exchange run by a [`TaskScheduler`].
///
/// Hooks are only called by the scheduler, on the connection's execution
/// context, and only while the task is the current one.
pub trait Task: Send {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Number of results the task produces, if it produces any.
    ///
    /// Tasks returning `Some` get a [`ResultDemux`] in their context.
    fn declared_results(&self) -> Option<usize> {
        None
    }

    /// Write the initial packets into `cx.output`.
    fn start(&mut self, cx: &mut TaskContext<'_>) -> Result<Start>;

    /// Consume what the task can from `cx.input`.
    fn decode(&mut self, cx: &mut TaskContext<'_>) -> Result<Decoded>;

    /// The last flush completed. Return `true` if more packets were written.
    fn on_send_success(&mut self, cx: &mut TaskContext<'_>) -> Result<bool> {
        let _ = cx;
        Ok(false)
    }

    /// The task failed with `err`. Deliver it to whoever waits on the task.
    ///
    /// The scheduler latches `err` into the task's demultiplexer afterwards.
    fn on_error(&mut self, err: &Error, cx: &mut TaskContext<'_>) -> Recovery;

    /// The connection closed while the task was queued or running.
    fn on_channel_closed(&mut self, err: &Error) {
        let _ = err;
    }

    /// Whether the connection should close once this task's packets are sent.
    fn disconnect_after_send(&self) -> bool {
        false
    }
}
