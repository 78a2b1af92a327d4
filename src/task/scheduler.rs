//! Per-connection task scheduler.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{
    CumulativeBuffer, Decoded, Recovery, Session, Start, Task, TaskContext, TaskId, TaskPhase,
};
use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::error::{Error, Result};
use crate::handler::AsyncMessage;
use crate::protocol::backend::{ErrorResponse, msg_type};
use crate::protocol::codec::HEADER_LEN;
use crate::result::{DemandSignal, ResultDemux, Subscription};

/// Work the I/O layer must do for the scheduler.
#[derive(Debug)]
pub enum Action {
    /// Write the buffer, then call [`TaskScheduler::on_send_complete`]
    /// or [`TaskScheduler::on_send_error`].
    Write(PooledBuf),
    /// Run a TLS handshake, then call
    /// [`TaskScheduler::on_tls_handshake_complete`] or
    /// [`TaskScheduler::on_tls_handshake_failed`].
    StartTls,
    /// Wait for the signal, then call [`TaskScheduler::resume`].
    AwaitDemand(DemandSignal),
    /// Close the transport, then call [`TaskScheduler::on_channel_closed`].
    Disconnect,
}

struct TaskSlot {
    id: TaskId,
    phase: TaskPhase,
    task: Box<dyn Task>,
}

/// State a running task can reach through its [`TaskContext`].
struct TaskEnv {
    input: CumulativeBuffer,
    output: PooledBuf,
    demuxes: HashMap<TaskId, ResultDemux>,
    session: Session,
    async_messages: Vec<AsyncMessage>,
}

impl TaskEnv {
    fn context(&mut self, id: Option<TaskId>) -> TaskContext<'_> {
        let results = match id {
            Some(id) => self.demuxes.get_mut(&id),
            None => None,
        };
        TaskContext::new(
            &mut self.input,
            &mut self.output,
            results,
            &mut self.session,
            &mut self.async_messages,
        )
    }

    /// Drop the demultiplexer once nothing can observe it anymore.
    fn settle(&mut self, id: TaskId) {
        if self.demuxes.get(&id).is_some_and(ResultDemux::is_settled) {
            self.demuxes.remove(&id);
        }
    }

    fn finish_results(&mut self, id: TaskId, err: Option<Error>) {
        if let Some(demux) = self.demuxes.get_mut(&id) {
            if let Some(err) = err {
                demux.fail(err);
            }
            demux.end();
        }
        self.settle(id);
    }
}

/// Runs tasks one at a time, in submission order, over one connection.
///
/// The scheduler never performs I/O. Feed it events (`submit`,
/// `on_bytes_received`, `on_send_complete`, ...) and carry out the
/// [`Action`]s returned by [`poll_action`](Self::poll_action). All calls
/// must come from the connection's single execution context.
pub struct TaskScheduler {
    pool: Arc<BufferPool>,
    capacity: usize,
    queue: VecDeque<TaskSlot>,
    current: Option<TaskSlot>,
    env: TaskEnv,
    actions: VecDeque<Action>,
    next_id: u64,
    /// Task that wrote the buffer currently being sent
    write_owner: Option<TaskId>,
    write_in_flight: bool,
    tls_pending: bool,
    suspended: bool,
    draining: bool,
    disconnecting: bool,
    closed: bool,
}

impl TaskScheduler {
    /// Create a scheduler holding at most `capacity` queued tasks.
    pub fn new(capacity: usize, pool: Arc<BufferPool>) -> Self {
        let output = pool.acquire();
        Self {
            capacity,
            queue: VecDeque::new(),
            current: None,
            env: TaskEnv {
                input: CumulativeBuffer::new(Arc::clone(&pool)),
                output,
                demuxes: HashMap::new(),
                session: Session::default(),
                async_messages: Vec::new(),
            },
            pool,
            actions: VecDeque::new(),
            next_id: 0,
            write_owner: None,
            write_in_flight: false,
            tls_pending: false,
            suspended: false,
            draining: false,
            disconnecting: false,
            closed: false,
        }
    }

    /// Queue a task. It starts once every task before it has ended.
    ///
    /// Fails with [`Error::QueueOverflow`] when the queue is full and with
    /// [`Error::ConnectionClosed`] once the connection closed; the task is
    /// dropped without any hook being called.
    pub fn submit(&mut self, task: Box<dyn Task>) -> Result<TaskId> {
        if self.closed || self.disconnecting {
            return Err(Error::ConnectionClosed);
        }
        if self.queue.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "task queue full");
            return Err(Error::QueueOverflow(self.capacity));
        }

        let id = TaskId(self.next_id);
        self.next_id += 1;
        if let Some(declared) = task.declared_results() {
            self.env.demuxes.insert(id, ResultDemux::new(declared));
        }
        let mut phase = TaskPhase::default();
        phase.advance(TaskPhase::Submitted);
        tracing::trace!(%id, task = task.name(), "task submitted");
        self.queue.push_back(TaskSlot { id, phase, task });

        self.run();
        Ok(id)
    }

    /// Bytes arrived from the server.
    pub fn on_bytes_received(&mut self, bytes: &[u8]) {
        if self.closed {
            return;
        }
        self.env.input.extend(bytes);
        self.run();
    }

    /// The last [`Action::Write`] completed.
    pub fn on_send_complete(&mut self) {
        self.write_in_flight = false;
        let owner = self.write_owner.take();

        if let Some(slot) = self.current.as_mut()
            && Some(slot.id) == owner
        {
            let result = slot.task.on_send_success(&mut self.env.context(Some(slot.id)));
            match result {
                Ok(more) => tracing::trace!(id = %slot.id, more, "send complete"),
                Err(err) => {
                    self.fail_current(err);
                    self.run();
                    return;
                }
            }
            if slot.task.disconnect_after_send() {
                self.end_current();
                self.request_disconnect();
                return;
            }
        }
        self.run();
    }

    /// The last [`Action::Write`] failed.
    pub fn on_send_error(&mut self, err: Error) {
        self.write_in_flight = false;
        self.on_transport_error(err);
    }

    /// The TLS handshake requested by [`Action::StartTls`] completed.
    pub fn on_tls_handshake_complete(&mut self) {
        tracing::debug!("TLS handshake complete");
        self.tls_pending = false;
        self.run();
    }

    /// The TLS handshake requested by [`Action::StartTls`] failed.
    ///
    /// Packets queued for after the handshake are discarded unsent.
    pub fn on_tls_handshake_failed(&mut self, err: Error) {
        self.tls_pending = false;
        self.env.output.clear();
        self.fail_current(err);
        self.run();
    }

    /// Reading or writing the transport failed; the connection is gone.
    pub fn on_transport_error(&mut self, err: Error) {
        tracing::debug!(error = %err, "transport error");
        self.close_with(err);
    }

    /// The transport closed.
    ///
    /// The running task and every queued task are failed in submission
    /// order. Further submissions fail with [`Error::ConnectionClosed`].
    pub fn on_channel_closed(&mut self) {
        self.close_with(Error::ConnectionClosed);
    }

    /// The signal of the last [`Action::AwaitDemand`] fired.
    pub fn resume(&mut self) {
        self.suspended = false;
        self.run();
    }

    /// Subscribe to the next result of task `id`.
    pub fn request_next(&mut self, id: TaskId, sub: Subscription) {
        match self.env.demuxes.get_mut(&id) {
            Some(demux) => demux.request_next(sub),
            None => sub.deliver_error(Error::NoMoreResults),
        }
        self.env.settle(id);
    }

    /// No more subscriptions will arrive for task `id`.
    pub fn release_results(&mut self, id: TaskId) {
        if let Some(demux) = self.env.demuxes.get_mut(&id) {
            demux.release();
        }
        self.env.settle(id);
    }

    /// Next action for the I/O layer.
    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Take the asynchronous messages received so far.
    pub fn drain_async_messages(&mut self) -> Vec<AsyncMessage> {
        std::mem::take(&mut self.env.async_messages)
    }

    /// Connection state learned from the server.
    pub fn session(&self) -> &Session {
        &self.env.session
    }

    /// Phase of task `id`, or `None` once it ended.
    pub fn phase(&self, id: TaskId) -> Option<TaskPhase> {
        self.current
            .iter()
            .chain(self.queue.iter())
            .find(|slot| slot.id == id)
            .map(|slot| slot.phase)
    }

    /// Number of tasks waiting behind the running one.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether the connection closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn run(&mut self) {
        loop {
            if self.closed || self.disconnecting {
                return;
            }
            if self.draining {
                match self.env.input.skip_until_ready() {
                    Ok(true) => {
                        tracing::debug!("drained input up to ReadyForQuery");
                        self.draining = false;
                    }
                    Ok(false) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "cannot drain input");
                        self.request_disconnect();
                        return;
                    }
                }
            }

            if self.current.is_none() {
                if !self.start_next() {
                    self.absorb_idle();
                    break;
                }
                continue;
            }
            if self.tls_pending || self.suspended || self.env.input.is_empty() {
                break;
            }
            if !self.decode_current() {
                break;
            }
        }
        self.flush();
    }

    /// Start the next queued task. Returns `false` if there is none.
    fn start_next(&mut self) -> bool {
        let Some(mut slot) = self.queue.pop_front() else {
            return false;
        };
        slot.phase.advance(TaskPhase::Started);
        tracing::debug!(id = %slot.id, task = slot.task.name(), "task started");

        let result = slot.task.start(&mut self.env.context(Some(slot.id)));
        self.current = Some(slot);
        match result {
            Ok(Start::Send) => {}
            Ok(Start::UpgradeTls) => self.begin_tls(),
            Err(err) => self.fail_current(err),
        }
        true
    }

    /// Let the running task decode. Returns `true` if the task ended.
    fn decode_current(&mut self) -> bool {
        let Some(slot) = self.current.as_mut() else {
            return false;
        };
        let result = slot.task.decode(&mut self.env.context(Some(slot.id)));
        match result {
            Ok(Decoded::NeedMore) => false,
            Ok(Decoded::Suspended(signal)) => {
                tracing::trace!(id = %slot.id, "row stream full, suspending");
                self.suspended = true;
                self.actions.push_back(Action::AwaitDemand(signal));
                false
            }
            Ok(Decoded::UpgradeTls) => {
                self.begin_tls();
                false
            }
            Ok(Decoded::Ended) => {
                self.end_current();
                true
            }
            Err(err) => {
                self.fail_current(err);
                true
            }
        }
    }

    fn begin_tls(&mut self) {
        // Packets written so far go out encrypted, after the handshake.
        self.tls_pending = true;
        self.actions.push_back(Action::StartTls);
    }

    fn end_current(&mut self) {
        let Some(mut slot) = self.current.take() else {
            return;
        };
        slot.phase.advance(TaskPhase::Ended);
        self.env.finish_results(slot.id, None);
        self.env.input.release();
        tracing::debug!(id = %slot.id, task = slot.task.name(), "task ended");
    }

    fn fail_current(&mut self, err: Error) {
        let Some(mut slot) = self.current.take() else {
            return;
        };
        tracing::debug!(id = %slot.id, task = slot.task.name(), error = %err, "task failed");

        let recovery = slot
            .task
            .on_error(&err, &mut self.env.context(Some(slot.id)));
        slot.phase.advance(TaskPhase::Ended);
        self.env.finish_results(slot.id, Some(err));
        self.suspended = false;

        match recovery {
            Recovery::EndTask => {}
            Recovery::DrainUntilReady => self.draining = true,
            Recovery::Disconnect => self.request_disconnect(),
        }
        self.env.input.release();
    }

    fn request_disconnect(&mut self) {
        if !self.disconnecting {
            self.flush();
            self.disconnecting = true;
            self.actions.push_back(Action::Disconnect);
        }
    }

    /// Consume inbound messages that arrive while no task runs.
    fn absorb_idle(&mut self) {
        loop {
            let absorbed = self
                .env
                .context(None)
                .absorb_async()
                .map(|message| message.is_some());
            match absorbed {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "malformed message between tasks");
                    self.request_disconnect();
                    return;
                }
            }

            let input = &mut self.env.input;
            let message = match input.peek_message() {
                Ok(Some(msg)) => (msg.type_byte, msg.frame_len()),
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed message between tasks");
                    self.request_disconnect();
                    return;
                }
            };
            match message {
                (msg_type::ERROR_RESPONSE, frame_len) => {
                    match ErrorResponse::parse(&input.remaining()[HEADER_LEN..frame_len]) {
                        Ok(error) => {
                            tracing::warn!(error = %error.into_error(), "server error between tasks")
                        }
                        Err(err) => tracing::warn!(error = %err, "malformed server error"),
                    }
                    input.advance(frame_len);
                }
                (type_byte, _) => {
                    tracing::warn!(
                        message_type = %char::from(type_byte),
                        "unexpected message between tasks"
                    );
                    self.request_disconnect();
                    return;
                }
            }
        }
        self.env.input.release();
    }

    fn flush(&mut self) {
        if self.write_in_flight || self.tls_pending || self.closed || self.env.output.is_empty() {
            return;
        }
        let buf = std::mem::replace(&mut self.env.output, self.pool.acquire());
        tracing::trace!(len = buf.len(), "flushing");
        self.write_owner = self.current.as_ref().map(|slot| slot.id);
        self.write_in_flight = true;
        self.actions.push_back(Action::Write(buf));
    }

    fn close_with(&mut self, err: Error) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.actions.clear();
        self.env.input.reset();

        let failed = usize::from(self.current.is_some()) + self.queue.len();
        for mut slot in self.current.take().into_iter().chain(self.queue.drain(..)) {
            slot.task.on_channel_closed(&err);
            slot.phase.advance(TaskPhase::Ended);
            self.env.finish_results(slot.id, Some(err.clone()));
        }
        tracing::debug!(failed, error = %err, "connection closed");
    }
}
