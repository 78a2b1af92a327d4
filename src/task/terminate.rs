//! Graceful close.

use super::{Decoded, Recovery, Start, Task, TaskContext};
use crate::error::{Error, Result};
use crate::protocol::frontend::write_terminate;

/// Sends Terminate; the connection closes once it is written.
#[derive(Debug, Default)]
pub struct TerminateTask;

impl TerminateTask {
    pub fn new() -> Self {
        Self
    }
}

impl Task for TerminateTask {
    fn name(&self) -> &'static str {
        "terminate"
    }

    fn start(&mut self, cx: &mut TaskContext<'_>) -> Result<Start> {
        write_terminate(cx.output);
        Ok(Start::Send)
    }

    fn decode(&mut self, cx: &mut TaskContext<'_>) -> Result<Decoded> {
        // Nothing is expected back; notices and notifications still arrive.
        while cx.absorb_async()?.is_some() {}
        Ok(Decoded::NeedMore)
    }

    fn on_error(&mut self, err: &Error, _cx: &mut TaskContext<'_>) -> Recovery {
        tracing::debug!(error = %err, "terminate failed");
        Recovery::Disconnect
    }

    fn disconnect_after_send(&self) -> bool {
        true
    }
}
