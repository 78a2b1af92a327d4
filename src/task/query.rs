//! Query tasks (simple and extended protocol).

use std::sync::Arc;

use super::{Decoded, Recovery, Start, Task, TaskContext};
use crate::error::{Error, ErrorFields, Result};
use crate::handler::AsyncMessage;
use crate::protocol::backend::{CommandComplete, ErrorResponse, ReadyForQuery, msg_type};
use crate::protocol::codec::HEADER_LEN;
use crate::protocol::frontend::{
    write_bind, write_describe_portal, write_execute, write_parse, write_query, write_sync,
};
use crate::result::{Row, RowDemand, RowMeta, UpdateOutcome};
use crate::statement::count_statements;

/// Query task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WaitingResponse,
    ProcessingRows,
    WaitingReady,
    Finished,
}

#[derive(Debug)]
enum Protocol {
    /// One Query message, possibly holding several statements
    Simple,
    /// Unnamed Parse/Bind/Describe/Execute/Sync with text parameters
    Extended(Vec<Option<String>>),
}

/// Runs SQL and feeds its results into the task's demultiplexer.
#[derive(Debug)]
pub struct QueryTask {
    sql: String,
    protocol: Protocol,
    declared: usize,
    state: State,
    meta: Option<Arc<RowMeta>>,
    warnings: Vec<ErrorFields>,
}

impl QueryTask {
    /// Run `sql` with the simple query protocol.
    ///
    /// The task declares one result per non-empty statement in `sql`.
    pub fn simple(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let declared = count_statements(&sql);
        Self::new(sql, Protocol::Simple, declared)
    }

    /// Run a single statement with text parameters (`None` binds NULL).
    ///
    /// The task declares exactly one result.
    pub fn extended(sql: impl Into<String>, params: Vec<Option<String>>) -> Self {
        Self::new(sql.into(), Protocol::Extended(params), 1)
    }

    fn new(sql: String, protocol: Protocol, declared: usize) -> Self {
        Self {
            sql,
            protocol,
            declared,
            state: State::Initial,
            meta: None,
            warnings: Vec::new(),
        }
    }

    fn handle_command_complete(
        &mut self,
        cx: &mut TaskContext<'_>,
        frame_len: usize,
    ) -> Result<bool> {
        // has_more depends on the message after this one.
        let Some(next) = cx.input.peek_type_after(frame_len)? else {
            return Ok(false);
        };
        let has_more = matches!(
            next,
            msg_type::ROW_DESCRIPTION | msg_type::COMMAND_COMPLETE
        );

        let payload = &cx.input.remaining()[HEADER_LEN..frame_len];
        let complete = CommandComplete::parse(payload)?;
        let outcome = UpdateOutcome::from_command_complete(
            &complete,
            std::mem::take(&mut self.warnings),
            has_more,
        );
        cx.input.advance(frame_len);

        let results = cx.results()?;
        if self.state == State::ProcessingRows {
            results.end_row_set(outcome);
            self.meta = None;
        } else {
            results.offer_update(outcome);
        }
        self.state = State::WaitingResponse;
        Ok(true)
    }
}

impl Task for QueryTask {
    fn name(&self) -> &'static str {
        match self.protocol {
            Protocol::Simple => "simple query",
            Protocol::Extended(_) => "extended query",
        }
    }

    fn declared_results(&self) -> Option<usize> {
        Some(self.declared)
    }

    fn start(&mut self, cx: &mut TaskContext<'_>) -> Result<Start> {
        match &self.protocol {
            Protocol::Simple => write_query(cx.output, &self.sql),
            Protocol::Extended(params) => {
                let params: Vec<Option<&[u8]>> = params
                    .iter()
                    .map(|p| p.as_deref().map(str::as_bytes))
                    .collect();
                write_parse(cx.output, &self.sql, params.len());
                write_bind(cx.output, &params);
                write_describe_portal(cx.output);
                write_execute(cx.output);
                write_sync(cx.output);
            }
        }
        self.state = State::WaitingResponse;
        Ok(Start::Send)
    }

    fn decode(&mut self, cx: &mut TaskContext<'_>) -> Result<Decoded> {
        loop {
            while let Some(message) = cx.absorb_async()? {
                if let AsyncMessage::Notice(fields) = message {
                    self.warnings.push(fields.clone());
                }
            }

            let Some((type_byte, frame_len)) = cx
                .input
                .peek_message()?
                .map(|msg| (msg.type_byte, msg.frame_len()))
            else {
                return Ok(Decoded::NeedMore);
            };

            match (self.state, type_byte) {
                (State::ProcessingRows, msg_type::DATA_ROW) => {
                    match cx.results()?.row_demand() {
                        RowDemand::Accept => {
                            let meta = self.meta.clone().ok_or_else(|| {
                                Error::Protocol("DataRow without RowDescription".into())
                            })?;
                            let row =
                                Row::decode(meta, &cx.input.remaining()[HEADER_LEN..frame_len])?;
                            cx.input.advance(frame_len);
                            cx.results()?.offer_row(row);
                        }
                        RowDemand::Suspend(signal) => return Ok(Decoded::Suspended(signal)),
                        RowDemand::Skip => cx.input.advance(frame_len),
                    }
                }
                (
                    State::WaitingResponse | State::ProcessingRows,
                    msg_type::COMMAND_COMPLETE,
                ) => {
                    if !self.handle_command_complete(cx, frame_len)? {
                        return Ok(Decoded::NeedMore);
                    }
                }
                (State::WaitingResponse, msg_type::ROW_DESCRIPTION) => {
                    let meta = Arc::new(RowMeta::parse(
                        &cx.input.remaining()[HEADER_LEN..frame_len],
                    )?);
                    cx.input.advance(frame_len);
                    cx.results()?.begin_row_set(Arc::clone(&meta));
                    self.meta = Some(meta);
                    self.state = State::ProcessingRows;
                }
                (
                    State::WaitingResponse,
                    msg_type::EMPTY_QUERY_RESPONSE
                    | msg_type::PARSE_COMPLETE
                    | msg_type::BIND_COMPLETE
                    | msg_type::NO_DATA,
                ) => cx.input.advance(frame_len),
                (_, msg_type::ERROR_RESPONSE) => {
                    let error = ErrorResponse::parse(&cx.input.remaining()[HEADER_LEN..frame_len])?;
                    cx.input.advance(frame_len);
                    tracing::debug!(
                        code = error.fields.code.as_deref().unwrap_or_default(),
                        "statement failed"
                    );
                    // The server skips the rest of the query and sends ReadyForQuery.
                    cx.results()?.report_access_error(error.into_error());
                    self.meta = None;
                    self.state = State::WaitingReady;
                }
                (
                    State::WaitingResponse | State::WaitingReady,
                    msg_type::READY_FOR_QUERY,
                ) => {
                    let ready = ReadyForQuery::parse(&cx.input.remaining()[HEADER_LEN..frame_len])?;
                    cx.input.advance(frame_len);
                    cx.session.transaction_status = ready.status;
                    self.state = State::Finished;
                    return Ok(Decoded::Ended);
                }
                (state, _) => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message '{}' in query state {:?}",
                        type_byte as char, state
                    )));
                }
            }
        }
    }

    fn on_error(&mut self, err: &Error, _cx: &mut TaskContext<'_>) -> Recovery {
        let sent = self.state != State::Initial;
        tracing::debug!(error = %err, sent, "query task failed");
        self.state = State::Finished;
        self.meta = None;
        if sent {
            Recovery::DrainUntilReady
        } else {
            Recovery::EndTask
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_results() {
        assert_eq!(
            QueryTask::simple("SELECT 1; SELECT 2; ").declared_results(),
            Some(2)
        );
        assert_eq!(
            QueryTask::extended("SELECT $1", vec![Some("1".into())]).declared_results(),
            Some(1)
        );
        assert_eq!(QueryTask::simple("").declared_results(), Some(0));
    }
}
