//! Asynchronous PostgreSQL connection handle.

use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::handler::AsyncMessageHandler;
use crate::opts::Opts;
use crate::task::{QueryTask, Session, StartupTask, Task, TaskId, TaskScheduler, TerminateTask};

use super::cancel::CancelToken;
use super::connection::{Command, Connection};
use super::results::MultiResult;
use super::stream::Stream;

/// Handle to a PostgreSQL connection.
///
/// The connection itself runs on a spawned task that owns the transport.
/// Handles are cheap to clone; tasks submitted through any clone run in
/// submission order. The connection terminates once it is closed or every
/// handle and [`MultiResult`] is dropped.
#[derive(Clone)]
pub struct Conn {
    commands: mpsc::UnboundedSender<Command>,
    row_prefetch: usize,
    cancel: Option<CancelToken>,
}

impl Conn {
    /// Connect to a PostgreSQL server.
    pub async fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;

        let stream = if let Some(socket_path) = &opts.socket {
            Stream::unix(UnixStream::connect(socket_path).await?)
        } else {
            if opts.host.is_empty() {
                return Err(Error::InvalidUsage("host is empty".into()));
            }
            let addr = format!("{}:{}", opts.host, opts.port);
            let tcp = TcpStream::connect(&addr).await?;
            tcp.set_nodelay(true)?;
            Stream::tcp(tcp)
        };

        Self::connect_with_stream(stream, opts).await
    }

    /// Run the startup exchange over an existing stream.
    ///
    /// Must be called within a Tokio runtime; the connection task is spawned
    /// onto it.
    pub async fn connect_with_stream(stream: Stream, opts: Opts) -> Result<Self> {
        let tls_available = stream.supports_tls();
        let mut scheduler =
            TaskScheduler::new(opts.task_queue_capacity, std::sync::Arc::clone(&opts.buffer_pool));
        let (ready_tx, ready_rx) = oneshot::channel();
        scheduler.submit(Box::new(StartupTask::new(
            opts.clone(),
            tls_available,
            ready_tx,
        )))?;

        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(Connection::new(stream, opts.host.clone(), scheduler, receiver).run());
        ready_rx.await.unwrap_or(Err(Error::ConnectionClosed))?;

        let mut conn = Self {
            commands,
            row_prefetch: opts.row_prefetch,
            cancel: None,
        };
        let session = conn.session().await?;
        conn.cancel = session
            .backend_key
            .map(|key| CancelToken::new(&opts, key));
        tracing::debug!(
            pid = session.backend_key.map(|key| key.pid),
            "connected"
        );
        Ok(conn)
    }

    /// Queue a task. Returns once the scheduler accepted it.
    pub async fn submit(&self, task: Box<dyn Task>) -> Result<TaskId> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Submit { task, ack })?;
        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Run SQL with the simple query protocol.
    ///
    /// `sql` may hold several statements; each produces one result.
    pub async fn query(&self, sql: &str) -> Result<MultiResult> {
        let id = self.submit(Box::new(QueryTask::simple(sql))).await?;
        Ok(self.results(id))
    }

    /// Run one statement with text parameters (`None` binds NULL).
    pub async fn execute(&self, sql: &str, params: &[Option<&str>]) -> Result<MultiResult> {
        let params = params.iter().map(|p| p.map(str::to_string)).collect();
        let id = self
            .submit(Box::new(QueryTask::extended(sql, params)))
            .await?;
        Ok(self.results(id))
    }

    /// Handle to the results of task `id`.
    pub fn results(&self, id: TaskId) -> MultiResult {
        MultiResult::new(id, self.commands.clone(), self.row_prefetch)
    }

    /// Backend key, server parameters and transaction status.
    pub async fn session(&self) -> Result<Session> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Session(reply))?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Receive notices, notifications and parameter changes.
    ///
    /// Messages that arrive while no handler is installed are dropped.
    pub fn set_async_message_handler<H: AsyncMessageHandler + 'static>(
        &self,
        handler: H,
    ) -> Result<()> {
        self.send(Command::SetAsyncHandler(Some(Box::new(handler))))
    }

    /// Remove the async message handler.
    pub fn clear_async_message_handler(&self) -> Result<()> {
        self.send(Command::SetAsyncHandler(None))
    }

    /// Token that cancels the statement running on this connection.
    ///
    /// `None` if the server sent no backend key.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.cancel.clone()
    }

    /// Whether the connection task stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Close the connection gracefully.
    ///
    /// Tasks queued before this call still run. Returns once the connection
    /// task stopped.
    pub async fn close(self) -> Result<()> {
        match self.submit(Box::new(TerminateTask::new())).await {
            Ok(_) | Err(Error::ConnectionClosed) => {}
            Err(err) => return Err(err),
        }
        self.commands.closed().await;
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::ConnectionClosed)
    }
}
