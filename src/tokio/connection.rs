//! Connection actor.
//!
//! One actor task owns the transport and the [`TaskScheduler`] of a
//! connection. Handles talk to it over a command channel, so every scheduler
//! call happens on this task.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use super::stream::Stream;
use crate::error::{Error, Result};
use crate::handler::AsyncMessageHandler;
use crate::result::Subscription;
use crate::task::{Action, Session, Task, TaskId, TaskScheduler, TerminateTask};

const READ_CHUNK: usize = 8192;

type DemandFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Request from a connection handle.
pub(crate) enum Command {
    Submit {
        task: Box<dyn Task>,
        ack: oneshot::Sender<Result<TaskId>>,
    },
    Subscribe {
        id: TaskId,
        subscription: Subscription,
    },
    Release(TaskId),
    Session(oneshot::Sender<Session>),
    SetAsyncHandler(Option<Box<dyn AsyncMessageHandler>>),
}

pub(crate) struct Connection {
    stream: Option<Stream>,
    host: String,
    scheduler: TaskScheduler,
    commands: mpsc::UnboundedReceiver<Command>,
    handler: Option<Box<dyn AsyncMessageHandler>>,
    read_buf: Vec<u8>,
    /// All handles are gone; Terminate was queued.
    detached: bool,
}

impl Connection {
    pub(crate) fn new(
        stream: Stream,
        host: String,
        scheduler: TaskScheduler,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            stream: Some(stream),
            host,
            scheduler,
            commands,
            handler: None,
            read_buf: Vec::with_capacity(READ_CHUNK),
            detached: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut demand: Option<DemandFuture> = None;

        loop {
            self.perform_actions(&mut demand).await;
            self.dispatch_async_messages();
            if self.scheduler.is_closed() {
                break;
            }
            let Some(stream) = self.stream.as_mut() else {
                self.scheduler.on_channel_closed();
                break;
            };

            tokio::select! {
                biased;

                command = self.commands.recv(), if !self.detached => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("all handles dropped, terminating");
                        self.detached = true;
                        if self.scheduler.submit(Box::new(TerminateTask::new())).is_err() {
                            break;
                        }
                    }
                },
                () = wait_demand(&mut demand), if demand.is_some() => {
                    demand = None;
                    self.scheduler.resume();
                }
                read = stream.read_buf(&mut self.read_buf), if demand.is_none() => match read {
                    Ok(0) => {
                        tracing::debug!("server closed the connection");
                        self.scheduler.on_channel_closed();
                    }
                    Ok(_) => {
                        self.scheduler.on_bytes_received(&self.read_buf);
                        self.read_buf.clear();
                    }
                    Err(err) => self.scheduler.on_transport_error(err.into()),
                },
            }
        }

        self.dispatch_async_messages();
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        tracing::debug!("connection actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { task, ack } => {
                let _ = ack.send(self.scheduler.submit(task));
            }
            Command::Subscribe { id, subscription } => {
                self.scheduler.request_next(id, subscription);
            }
            Command::Release(id) => self.scheduler.release_results(id),
            Command::Session(reply) => {
                let _ = reply.send(self.scheduler.session().clone());
            }
            Command::SetAsyncHandler(handler) => self.handler = handler,
        }
    }

    async fn perform_actions(&mut self, demand: &mut Option<DemandFuture>) {
        while let Some(action) = self.scheduler.poll_action() {
            match action {
                Action::Write(buf) => match self.write(&buf).await {
                    Ok(()) => self.scheduler.on_send_complete(),
                    Err(err) => self.scheduler.on_send_error(err),
                },
                Action::StartTls => match self.upgrade_tls().await {
                    Ok(()) => self.scheduler.on_tls_handshake_complete(),
                    Err(err) => self.scheduler.on_tls_handshake_failed(err),
                },
                Action::AwaitDemand(signal) => *demand = Some(Box::pin(signal.ready())),
                Action::Disconnect => {
                    if let Some(mut stream) = self.stream.take() {
                        let _ = stream.shutdown().await;
                    }
                    self.scheduler.on_channel_closed();
                }
            }
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        stream.write_all(buf).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn upgrade_tls(&mut self) -> Result<()> {
        let stream = self.stream.take().ok_or(Error::ConnectionClosed)?;
        self.stream = Some(stream.upgrade_to_tls(&self.host).await?);
        Ok(())
    }

    fn dispatch_async_messages(&mut self) {
        for message in self.scheduler.drain_async_messages() {
            match self.handler.as_mut() {
                Some(handler) => handler.handle(&message),
                None => tracing::trace!(?message, "no async message handler installed"),
            }
        }
    }
}

async fn wait_demand(demand: &mut Option<DemandFuture>) {
    match demand.as_mut() {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}
