//! Result demultiplexer.
//!
//! The server produces the results of a task in statement order. The
//! application asks for "the next result" whenever it likes. `ResultDemux`
//! pairs the two sequences one-to-one without ever reordering results:
//!
//! - a result with a subscription waiting goes straight to it
//! - a result with nobody waiting is buffered until a subscription arrives
//! - a subscription of the wrong kind fails and the result stays for the next one
//! - a result beyond the declared count latches the too-many guard
//! - a server error latches and reaches every buffered, waiting and future subscription

use std::collections::VecDeque;
use std::sync::Arc;

use super::subscription::Demand;
use super::{
    DemandSignal, ResultKind, Row, RowDelivery, RowMeta, SingleSink, StreamSink, Subscription,
    UpdateOutcome,
};
use crate::error::Error;

/// A result produced before anyone subscribed to it.
#[derive(Debug)]
enum Buffered {
    Update(UpdateOutcome),
    RowSet(BufferedRowSet),
    /// The too-many-results guard, not yet reported to a subscription.
    TooMany,
    /// A server error that arrived behind the guard.
    Failed(Error),
}

#[derive(Debug)]
struct BufferedRowSet {
    meta: Arc<RowMeta>,
    rows: VecDeque<Row>,
    /// `None` while the server is still sending rows
    outcome: Option<UpdateOutcome>,
}

/// Results and subscriptions that have not found their partner yet.
///
/// `Buffered` and `Waiting` never hold items at the same time.
#[derive(Debug)]
enum Pending {
    Empty,
    Buffered(VecDeque<Buffered>),
    Waiting(VecDeque<Subscription>),
    /// Access error or connection failure; absorbs everything after it.
    Failed(Error),
}

/// Where the rows of the row set being decoded go.
#[derive(Debug)]
enum Current {
    /// No row set in progress.
    Idle,
    /// Rows go to a live stream.
    Streaming(StreamSink),
    /// The stream was cancelled; rows are skipped, the outcome is still delivered.
    Cancelled(StreamSink),
    /// Rows go to the newest buffered row set.
    Buffering,
    /// Rows are skipped and the outcome dropped.
    Discarding,
}

/// What to do with the next DataRow.
#[derive(Debug)]
pub enum RowDemand {
    /// Decode the row and pass it to [`ResultDemux::offer_row`].
    Accept,
    /// Leave the row in the receive buffer until the signal fires.
    Suspend(DemandSignal),
    /// Skip the row without decoding it.
    Skip,
}

/// Pairs the ordered results of one task with its subscriptions.
#[derive(Debug)]
pub struct ResultDemux {
    declared: usize,
    offered: usize,
    pending: Pending,
    current: Current,
    /// Set once a result beyond `declared` started
    guarded: bool,
    /// Set when the task ended
    ended: bool,
    /// Set when no further subscription can arrive
    released: bool,
}

impl ResultDemux {
    /// Create a demultiplexer for a task that declares at most `declared` results.
    pub fn new(declared: usize) -> Self {
        Self {
            declared,
            offered: 0,
            pending: Pending::Empty,
            current: Current::Idle,
            guarded: false,
            ended: false,
            released: false,
        }
    }

    /// Number of results the task declared.
    pub fn declared(&self) -> usize {
        self.declared
    }

    /// Number of results offered so far, excess results excluded.
    pub fn offered(&self) -> usize {
        self.offered
    }

    /// Whether the too-many-results guard is latched.
    pub fn is_guarded(&self) -> bool {
        self.guarded
    }

    /// Whether an error is latched.
    pub fn is_failed(&self) -> bool {
        matches!(self.pending, Pending::Failed(_))
    }

    /// Whether new results are absorbed instead of delivered.
    fn absorbing(&self) -> bool {
        self.guarded || self.ended || self.is_failed()
    }

    /// Account for a new result. Returns its index, or `None` if it must be dropped.
    fn admit(&mut self, kind: ResultKind) -> Option<usize> {
        if self.absorbing() {
            return None;
        }
        if self.offered >= self.declared {
            self.latch_too_many(kind);
            return None;
        }
        self.offered += 1;
        Some(self.offered - 1)
    }

    fn latch_too_many(&mut self, kind: ResultKind) {
        tracing::debug!(
            declared = self.declared,
            "{} beyond the declared result count, latching too-many guard",
            kind
        );
        self.guarded = true;
        let err = Error::TooManyResults {
            declared: self.declared,
        };
        match std::mem::replace(&mut self.pending, Pending::Empty) {
            Pending::Empty => {
                self.pending = Pending::Buffered(VecDeque::from([Buffered::TooMany]));
            }
            Pending::Buffered(mut queue) => {
                queue.push_back(Buffered::TooMany);
                self.pending = Pending::Buffered(queue);
            }
            Pending::Waiting(mut waiting) => {
                if let Some(first) = waiting.pop_front() {
                    first.deliver_error(err);
                }
                // No result will ever satisfy the rest.
                for sub in waiting {
                    sub.deliver_error(Error::NoMoreResults);
                }
            }
            failed @ Pending::Failed(_) => self.pending = failed,
        }
    }

    /// Pop the first waiting subscription of `kind`, failing mismatched ones on the way.
    fn take_waiting(&mut self, actual: ResultKind) -> Option<Subscription> {
        let Pending::Waiting(waiting) = &mut self.pending else {
            return None;
        };
        let mut found = None;
        while let Some(sub) = waiting.pop_front() {
            let expected = sub.kind();
            if expected == actual {
                found = Some(sub);
                break;
            }
            sub.deliver_error(Error::KindMismatch { expected, actual });
        }
        if waiting.is_empty() {
            self.pending = Pending::Empty;
        }
        found
    }

    fn take_waiting_stream(&mut self) -> Option<StreamSink> {
        match self.take_waiting(ResultKind::RowSet)? {
            Subscription::Stream(sink) => Some(sink),
            Subscription::Single(_) => None,
        }
    }

    fn take_waiting_single(&mut self) -> Option<SingleSink> {
        match self.take_waiting(ResultKind::Update)? {
            Subscription::Single(sink) => Some(sink),
            Subscription::Stream(_) => None,
        }
    }

    fn cancel_current(&mut self) {
        self.current = match std::mem::replace(&mut self.current, Current::Idle) {
            Current::Streaming(sink) => Current::Cancelled(sink),
            other => other,
        };
    }

    fn push_buffered(&mut self, item: Buffered) {
        match &mut self.pending {
            Pending::Buffered(queue) => queue.push_back(item),
            _ => self.pending = Pending::Buffered(VecDeque::from([item])),
        }
    }

    /// A RowDescription arrived: a row set begins.
    pub fn begin_row_set(&mut self, meta: Arc<RowMeta>) {
        if let Current::Streaming(sink) | Current::Cancelled(sink) =
            std::mem::replace(&mut self.current, Current::Idle)
        {
            sink.deliver_error(Error::Protocol("row set began inside another row set".into()));
        }

        if self.admit(ResultKind::RowSet).is_none() {
            self.current = Current::Discarding;
            return;
        }

        self.current = match self.take_waiting_stream() {
            Some(mut sink) => {
                sink.deliver_row_meta(meta, VecDeque::new());
                Current::Streaming(sink)
            }
            None if self.released => Current::Discarding,
            None => {
                self.push_buffered(Buffered::RowSet(BufferedRowSet {
                    meta,
                    rows: VecDeque::new(),
                    outcome: None,
                }));
                Current::Buffering
            }
        };
    }

    /// Whether the next DataRow should be decoded now.
    pub fn row_demand(&mut self) -> RowDemand {
        let demand = match &self.current {
            Current::Streaming(sink) => sink.demand(),
            Current::Buffering => return RowDemand::Accept,
            Current::Idle | Current::Cancelled(_) | Current::Discarding => return RowDemand::Skip,
        };
        match demand {
            Demand::Ready => RowDemand::Accept,
            Demand::Full(signal) => {
                tracing::trace!("row stream full, suspending decode");
                RowDemand::Suspend(signal)
            }
            Demand::Cancelled => {
                tracing::debug!("row stream cancelled, skipping remaining rows");
                self.cancel_current();
                RowDemand::Skip
            }
        }
    }

    /// Deliver a decoded row of the current row set.
    ///
    /// A row offered to a full stream fails the results instead of being lost.
    pub fn offer_row(&mut self, row: Row) {
        let delivery = match &self.current {
            Current::Streaming(sink) => sink.deliver_row(row),
            Current::Buffering => {
                if let Pending::Buffered(queue) = &mut self.pending
                    && let Some(Buffered::RowSet(set)) = queue.back_mut()
                {
                    set.rows.push_back(row);
                }
                return;
            }
            Current::Idle | Current::Cancelled(_) | Current::Discarding => return,
        };
        match delivery {
            RowDelivery::Delivered => {}
            RowDelivery::Cancelled => self.cancel_current(),
            RowDelivery::Full(_) => self.fail(Error::InvalidUsage(
                "row offered to a full row stream".into(),
            )),
        }
    }

    /// The CommandComplete of the current row set arrived.
    pub fn end_row_set(&mut self, mut outcome: UpdateOutcome) {
        outcome.result_index = self.offered.saturating_sub(1);
        match std::mem::replace(&mut self.current, Current::Idle) {
            Current::Streaming(sink) | Current::Cancelled(sink) => sink.deliver_terminal(outcome),
            Current::Buffering => {
                if let Pending::Buffered(queue) = &mut self.pending
                    && let Some(Buffered::RowSet(set)) = queue.back_mut()
                {
                    set.outcome = Some(outcome);
                }
            }
            Current::Idle | Current::Discarding => {}
        }
    }

    /// A statement without rows completed.
    pub fn offer_update(&mut self, mut outcome: UpdateOutcome) {
        let Some(index) = self.admit(ResultKind::Update) else {
            return;
        };
        outcome.result_index = index;
        match self.take_waiting_single() {
            Some(sink) => sink.deliver_outcome(outcome),
            None if self.released => {}
            None => self.push_buffered(Buffered::Update(outcome)),
        }
    }

    /// Ask for the next result.
    pub fn request_next(&mut self, sub: Subscription) {
        match &mut self.pending {
            Pending::Failed(err) => sub.deliver_error(err.clone()),
            Pending::Waiting(waiting) => waiting.push_back(sub),
            Pending::Empty => {
                if self.ended || self.guarded || self.released {
                    sub.deliver_error(Error::NoMoreResults);
                } else {
                    self.pending = Pending::Waiting(VecDeque::from([sub]));
                }
            }
            Pending::Buffered(queue) => {
                let Some(item) = queue.pop_front() else {
                    self.pending = Pending::Empty;
                    return self.request_next(sub);
                };
                let in_flight = queue.is_empty() && matches!(self.current, Current::Buffering);
                let rest_empty = queue.is_empty();
                match (item, sub) {
                    (Buffered::Update(outcome), Subscription::Single(sink)) => {
                        sink.deliver_outcome(outcome)
                    }
                    (Buffered::RowSet(set), Subscription::Stream(mut sink)) => {
                        sink.deliver_row_meta(set.meta, set.rows);
                        match set.outcome {
                            Some(outcome) => sink.deliver_terminal(outcome),
                            None if in_flight => self.current = Current::Streaming(sink),
                            None => sink.deliver_error(Error::Protocol(
                                "buffered row set never completed".into(),
                            )),
                        }
                    }
                    (Buffered::TooMany, sub) => sub.deliver_error(Error::TooManyResults {
                        declared: self.declared,
                    }),
                    (Buffered::Failed(err), sub) => {
                        sub.deliver_error(err.clone());
                        self.pending = Pending::Failed(err);
                        return;
                    }
                    (item, sub) => {
                        let actual = match &item {
                            Buffered::Update(_) => ResultKind::Update,
                            _ => ResultKind::RowSet,
                        };
                        let expected = sub.kind();
                        sub.deliver_error(Error::KindMismatch { expected, actual });
                        queue.push_front(item);
                        return;
                    }
                }
                if rest_empty {
                    self.pending = Pending::Empty;
                }
            }
        }
    }

    /// The server reported an error for this task.
    ///
    /// Every buffered result, waiting subscription and future subscription
    /// receives the error. Behind the too-many guard, the guard is reported
    /// first and the error reaches every subscription after it.
    pub fn report_access_error(&mut self, err: Error) {
        if !self.guarded {
            return self.fail(err);
        }
        tracing::debug!("server error behind too-many-results guard: {}", err);
        match &mut self.pending {
            Pending::Buffered(queue) => queue.push_back(Buffered::Failed(err)),
            Pending::Failed(_) => {}
            Pending::Empty | Pending::Waiting(_) => self.fail(err),
        }
    }

    /// Latch `err` unless an error is latched already.
    pub fn fail(&mut self, err: Error) {
        if self.is_failed() {
            return;
        }
        tracing::debug!("latching result error: {}", err);
        match std::mem::replace(&mut self.current, Current::Discarding) {
            Current::Streaming(sink) | Current::Cancelled(sink) => sink.deliver_error(err.clone()),
            Current::Idle => self.current = Current::Idle,
            Current::Buffering | Current::Discarding => {}
        }
        if let Pending::Waiting(waiting) =
            std::mem::replace(&mut self.pending, Pending::Failed(err.clone()))
        {
            for sub in waiting {
                sub.deliver_error(err.clone());
            }
        }
        if self.released {
            tracing::debug!("error for a released result set: {}", err);
        }
    }

    /// The task ended. Subscriptions still waiting get `NoMoreResults`.
    pub fn end(&mut self) {
        self.ended = true;
        match std::mem::replace(&mut self.current, Current::Idle) {
            Current::Streaming(sink) | Current::Cancelled(sink) => {
                sink.deliver_error(Error::Protocol("task ended inside a row set".into()))
            }
            Current::Buffering => {
                if let Pending::Buffered(queue) = &mut self.pending
                    && matches!(queue.back(), Some(Buffered::RowSet(set)) if set.outcome.is_none())
                {
                    queue.pop_back();
                    if queue.is_empty() {
                        self.pending = Pending::Empty;
                    }
                }
            }
            Current::Idle | Current::Discarding => {}
        }
        if let Pending::Waiting(_) = self.pending
            && let Pending::Waiting(waiting) = std::mem::replace(&mut self.pending, Pending::Empty)
        {
            for sub in waiting {
                sub.deliver_error(Error::NoMoreResults);
            }
        }
    }

    /// No subscription will arrive anymore. Buffered results are dropped.
    pub fn release(&mut self) {
        self.released = true;
        if let Pending::Buffered(_) = self.pending {
            self.pending = Pending::Empty;
            if matches!(self.current, Current::Buffering) {
                self.current = Current::Discarding;
            }
        }
    }

    /// Whether nothing observable is left, so the demultiplexer can be dropped.
    ///
    /// A dropped demultiplexer answers every request with `NoMoreResults`,
    /// which is what an ended, empty one would do.
    pub fn is_settled(&self) -> bool {
        self.ended && (self.released || matches!(self.pending, Pending::Empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::testing::{meta, outcome, row};
    use crate::result::{PendingOutcome, RowStream};

    fn single(demux: &mut ResultDemux) -> PendingOutcome {
        let (sub, pending) = Subscription::single();
        demux.request_next(sub);
        pending
    }

    fn stream(demux: &mut ResultDemux, prefetch: usize) -> RowStream {
        let (sub, stream) = Subscription::stream(prefetch);
        demux.request_next(sub);
        stream
    }

    fn offer_row_set(demux: &mut ResultDemux, values: &[&str]) {
        let m = meta(&["v"]);
        demux.begin_row_set(Arc::clone(&m));
        for value in values {
            assert!(matches!(demux.row_demand(), RowDemand::Accept | RowDemand::Skip));
            demux.offer_row(row(&m, &[value]));
        }
        demux.end_row_set(outcome("SELECT", values.len() as u64));
    }

    async fn values(stream: RowStream) -> Vec<String> {
        let (rows, _) = stream.collect().await.unwrap();
        rows.iter()
            .map(|r| r.get_str(0).unwrap().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_exact_count_then_no_more() {
        let mut demux = ResultDemux::new(2);
        let first = single(&mut demux);
        demux.offer_update(outcome("INSERT", 1));
        demux.offer_update(outcome("DELETE", 2));
        let second = single(&mut demux);
        demux.end();
        let third = single(&mut demux);
        assert_eq!(demux.declared(), 2);
        assert_eq!(demux.offered(), 2);

        assert_eq!(first.await.unwrap().result_index, 0);
        let second = second.await.unwrap();
        assert_eq!(second.command, "DELETE");
        assert_eq!(second.result_index, 1);
        assert!(matches!(third.await, Err(Error::NoMoreResults)));
        assert!(demux.is_settled());
    }

    #[tokio::test]
    async fn test_zero_declared_results() {
        let mut demux = ResultDemux::new(0);
        demux.end();
        assert!(matches!(
            single(&mut demux).await,
            Err(Error::NoMoreResults)
        ));
    }

    #[tokio::test]
    async fn test_row_past_demand_fails_stream() {
        let mut demux = ResultDemux::new(1);
        let s = stream(&mut demux, 1);
        let m = meta(&["v"]);
        demux.begin_row_set(Arc::clone(&m));
        demux.offer_row(row(&m, &["a"]));
        assert!(matches!(demux.row_demand(), RowDemand::Suspend(_)));
        demux.offer_row(row(&m, &["b"]));

        assert!(demux.is_failed());
        assert!(matches!(s.collect().await, Err(Error::InvalidUsage(_))));
    }

    #[tokio::test]
    async fn test_buffered_row_set_is_lossless() {
        let mut demux = ResultDemux::new(1);
        offer_row_set(&mut demux, &["a", "b", "c"]);
        demux.end();

        let s = stream(&mut demux, 1);
        assert_eq!(values(s).await, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_update_then_rows_before_any_subscription() {
        let mut demux = ResultDemux::new(2);
        demux.offer_update(outcome("UPDATE", 5));
        offer_row_set(&mut demux, &["1", "2", "3"]);
        demux.end();

        let update = single(&mut demux);
        let rows = stream(&mut demux, 8);
        assert_eq!(update.await.unwrap().rows_affected, Some(5));
        assert_eq!(values(rows).await, ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_kind_mismatch_keeps_result() {
        let mut demux = ResultDemux::new(1);
        let wrong = single(&mut demux);
        offer_row_set(&mut demux, &["x"]);

        assert!(matches!(
            wrong.await,
            Err(Error::KindMismatch {
                expected: ResultKind::Update,
                actual: ResultKind::RowSet,
            })
        ));
        let right = stream(&mut demux, 4);
        assert_eq!(values(right).await, ["x"]);
    }

    #[tokio::test]
    async fn test_kind_mismatch_on_buffered_result() {
        let mut demux = ResultDemux::new(1);
        demux.offer_update(outcome("UPDATE", 1));

        let wrong = stream(&mut demux, 4);
        assert!(matches!(
            wrong.outcome().await,
            Err(Error::KindMismatch { .. })
        ));
        assert_eq!(single(&mut demux).await.unwrap().rows_affected, Some(1));
    }

    #[tokio::test]
    async fn test_too_many_results_reported_once() {
        let mut demux = ResultDemux::new(1);
        let first = single(&mut demux);
        let second = single(&mut demux);
        let third = single(&mut demux);
        demux.offer_update(outcome("UPDATE", 1));
        demux.offer_update(outcome("UPDATE", 2));
        demux.offer_update(outcome("UPDATE", 3));
        demux.end();

        assert_eq!(first.await.unwrap().rows_affected, Some(1));
        assert!(matches!(
            second.await,
            Err(Error::TooManyResults { declared: 1 })
        ));
        assert!(matches!(third.await, Err(Error::NoMoreResults)));
        assert!(demux.is_guarded());
    }

    #[tokio::test]
    async fn test_too_many_results_buffered_behind_results() {
        let mut demux = ResultDemux::new(1);
        demux.offer_update(outcome("UPDATE", 1));
        offer_row_set(&mut demux, &["dropped"]);
        demux.end();

        assert!(single(&mut demux).await.is_ok());
        assert!(matches!(
            single(&mut demux).await,
            Err(Error::TooManyResults { .. })
        ));
        assert!(matches!(
            single(&mut demux).await,
            Err(Error::NoMoreResults)
        ));
    }

    #[tokio::test]
    async fn test_access_error_behind_too_many_guard() {
        let mut demux = ResultDemux::new(1);
        demux.offer_update(outcome("UPDATE", 1));
        demux.offer_update(outcome("UPDATE", 2));
        demux.report_access_error(Error::Server(crate::error::ErrorFields {
            code: Some("42601".into()),
            ..Default::default()
        }));
        demux.end();

        assert!(single(&mut demux).await.is_ok());
        assert!(matches!(
            single(&mut demux).await,
            Err(Error::TooManyResults { .. })
        ));
        assert_eq!(single(&mut demux).await.unwrap_err().sqlstate(), Some("42601"));
        assert_eq!(single(&mut demux).await.unwrap_err().sqlstate(), Some("42601"));
    }

    #[tokio::test]
    async fn test_access_error_after_guard_was_reported() {
        let mut demux = ResultDemux::new(0);
        let first = single(&mut demux);
        demux.offer_update(outcome("UPDATE", 1));
        demux.report_access_error(Error::Server(crate::error::ErrorFields {
            code: Some("42601".into()),
            ..Default::default()
        }));

        assert!(matches!(first.await, Err(Error::TooManyResults { .. })));
        assert_eq!(single(&mut demux).await.unwrap_err().sqlstate(), Some("42601"));
    }

    #[tokio::test]
    async fn test_access_error_replaces_buffered_results() {
        let mut demux = ResultDemux::new(3);
        demux.offer_update(outcome("INSERT", 1));
        offer_row_set(&mut demux, &["r"]);

        let err = Error::Server(crate::error::ErrorFields {
            code: Some("22012".into()),
            ..Default::default()
        });
        demux.report_access_error(err);
        demux.end();

        let rows = stream(&mut demux, 4);
        assert_eq!(rows.outcome().await.unwrap_err().sqlstate(), Some("22012"));
        let update = single(&mut demux);
        assert_eq!(update.await.unwrap_err().sqlstate(), Some("22012"));
        let late = single(&mut demux);
        assert_eq!(late.await.unwrap_err().sqlstate(), Some("22012"));
        assert!(!demux.is_settled());
    }

    #[tokio::test]
    async fn test_access_error_fails_waiting_subscriptions() {
        let mut demux = ResultDemux::new(2);
        let a = single(&mut demux);
        let b = stream(&mut demux, 4);
        demux.report_access_error(Error::Server(Default::default()));

        assert!(matches!(a.await, Err(Error::Server(_))));
        assert!(matches!(b.outcome().await, Err(Error::Server(_))));
    }

    #[tokio::test]
    async fn test_cancel_mid_rows_still_reaches_outcome() {
        let mut demux = ResultDemux::new(1);
        let mut s = stream(&mut demux, 16);
        let m = meta(&["v"]);
        demux.begin_row_set(Arc::clone(&m));

        let mut delivered = 0;
        for i in 0..5 {
            match demux.row_demand() {
                RowDemand::Accept => {
                    demux.offer_row(row(&m, &[&i.to_string()]));
                    delivered += 1;
                }
                RowDemand::Skip => {}
                RowDemand::Suspend(_) => panic!("unexpected suspend"),
            }
            if i == 1 {
                assert!(s.next().await.unwrap().is_ok());
                assert!(s.next().await.unwrap().is_ok());
                s.cancel();
            }
        }
        demux.end_row_set(outcome("SELECT", 5));
        demux.end();

        assert_eq!(delivered, 2);
        assert_eq!(s.outcome().await.unwrap().rows_affected, Some(5));
    }

    #[tokio::test]
    async fn test_subscription_attaches_to_row_set_in_flight() {
        let mut demux = ResultDemux::new(1);
        let m = meta(&["v"]);
        demux.begin_row_set(Arc::clone(&m));
        demux.offer_row(row(&m, &["early"]));

        let s = stream(&mut demux, 4);
        assert!(matches!(demux.row_demand(), RowDemand::Accept));
        demux.offer_row(row(&m, &["late"]));
        demux.end_row_set(outcome("SELECT", 2));

        assert_eq!(values(s).await, ["early", "late"]);
    }

    #[tokio::test]
    async fn test_full_stream_suspends() {
        let mut demux = ResultDemux::new(1);
        let mut s = stream(&mut demux, 1);
        let m = meta(&["v"]);
        demux.begin_row_set(Arc::clone(&m));
        assert!(matches!(demux.row_demand(), RowDemand::Accept));
        demux.offer_row(row(&m, &["1"]));

        let RowDemand::Suspend(signal) = demux.row_demand() else {
            panic!("expected suspend");
        };
        assert!(s.next().await.unwrap().is_ok());
        signal.ready().await;
        assert!(matches!(demux.row_demand(), RowDemand::Accept));
    }

    #[tokio::test]
    async fn test_channel_failure_after_release() {
        let mut demux = ResultDemux::new(2);
        demux.offer_update(outcome("INSERT", 1));
        demux.release();
        demux.fail(Error::ConnectionClosed);
        demux.end();
        assert!(demux.is_settled());
    }
}
