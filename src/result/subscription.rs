//! Subscription adapters.
//!
//! A subscription is split in two halves. The sink half is handed to the
//! connection and fed by [`ResultDemux`](super::ResultDemux); the consumer
//! half ([`PendingOutcome`] or [`RowStream`]) stays with the application.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use super::{ResultKind, Row, RowMeta, UpdateOutcome};
use crate::error::{Error, Result};

/// Sink half of a request for the next result of a task.
#[derive(Debug)]
pub enum Subscription {
    /// Expects an update outcome.
    Single(SingleSink),
    /// Expects a row set.
    Stream(StreamSink),
}

impl Subscription {
    /// Subscribe to the next result as a single update outcome.
    pub fn single() -> (Self, PendingOutcome) {
        let (tx, rx) = oneshot::channel();
        (
            Subscription::Single(SingleSink { tx }),
            PendingOutcome { rx },
        )
    }

    /// Subscribe to the next result as a row stream.
    ///
    /// `prefetch` bounds how many rows may wait in the stream before the
    /// connection stops decoding rows for it.
    pub fn stream(prefetch: usize) -> (Self, RowStream) {
        let (head_tx, head_rx) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::channel(prefetch.max(1));
        let (tail_tx, tail_rx) = oneshot::channel();
        let sink = StreamSink {
            head: Some(head_tx),
            rows: rows_tx,
            tail: tail_tx,
        };
        let stream = RowStream {
            head: Some(head_rx),
            meta: None,
            buffered: VecDeque::new(),
            rows: rows_rx,
            tail: Some(tail_rx),
            outcome: None,
            cancelled: false,
        };
        (Subscription::Stream(sink), stream)
    }

    /// Kind of result this subscription accepts.
    pub fn kind(&self) -> ResultKind {
        match self {
            Subscription::Single(_) => ResultKind::Update,
            Subscription::Stream(_) => ResultKind::RowSet,
        }
    }

    /// Fail the subscription.
    pub fn deliver_error(self, err: Error) {
        match self {
            Subscription::Single(sink) => sink.deliver_error(err),
            Subscription::Stream(sink) => sink.deliver_error(err),
        }
    }
}

/// Sink for a single update outcome.
#[derive(Debug)]
pub struct SingleSink {
    tx: oneshot::Sender<Result<UpdateOutcome>>,
}

impl SingleSink {
    /// Deliver the outcome.
    pub fn deliver_outcome(self, outcome: UpdateOutcome) {
        let _ = self.tx.send(Ok(outcome));
    }

    /// Fail the subscription.
    pub fn deliver_error(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }
}

/// Metadata plus the rows buffered before the stream was attached.
#[derive(Debug)]
struct StreamHead {
    meta: Arc<RowMeta>,
    buffered: VecDeque<Row>,
}

/// What a row stream can take right now.
#[derive(Debug)]
pub enum Demand {
    /// At least one more row fits.
    Ready,
    /// The stream is full; the signal fires once the consumer takes a row.
    Full(DemandSignal),
    /// The consumer cancelled the stream.
    Cancelled,
}

/// Result of [`StreamSink::deliver_row`].
#[derive(Debug)]
pub enum RowDelivery {
    /// The row is in the stream.
    Delivered,
    /// The stream had no room; the row is handed back.
    Full(Row),
    /// The consumer cancelled the stream.
    Cancelled,
}

/// Sink for a row set.
#[derive(Debug)]
pub struct StreamSink {
    head: Option<oneshot::Sender<Result<StreamHead>>>,
    rows: mpsc::Sender<Row>,
    tail: oneshot::Sender<Result<UpdateOutcome>>,
}

impl StreamSink {
    /// Deliver the row metadata along with rows that were buffered already.
    pub fn deliver_row_meta(&mut self, meta: Arc<RowMeta>, buffered: VecDeque<Row>) {
        if let Some(head) = self.head.take() {
            let _ = head.send(Ok(StreamHead { meta, buffered }));
        }
    }

    /// Current downstream demand.
    pub fn demand(&self) -> Demand {
        if self.rows.is_closed() {
            Demand::Cancelled
        } else if self.rows.capacity() > 0 {
            Demand::Ready
        } else {
            Demand::Full(DemandSignal {
                rows: self.rows.clone(),
            })
        }
    }

    /// Deliver one row.
    ///
    /// Call after [`demand`](Self::demand) reported `Ready`; otherwise the
    /// row may come back as [`RowDelivery::Full`].
    pub fn deliver_row(&self, row: Row) -> RowDelivery {
        match self.rows.try_send(row) {
            Ok(()) => RowDelivery::Delivered,
            Err(mpsc::error::TrySendError::Full(row)) => RowDelivery::Full(row),
            Err(mpsc::error::TrySendError::Closed(_)) => RowDelivery::Cancelled,
        }
    }

    /// Deliver the terminal outcome, ending the stream.
    pub fn deliver_terminal(self, outcome: UpdateOutcome) {
        let _ = self.tail.send(Ok(outcome));
    }

    /// Fail the stream. Rows already delivered stay readable.
    pub fn deliver_error(self, err: Error) {
        if let Some(head) = self.head {
            let _ = head.send(Err(err.clone()));
        }
        let _ = self.tail.send(Err(err));
    }
}

/// Fires when a full row stream has room again or was cancelled.
#[derive(Debug)]
pub struct DemandSignal {
    rows: mpsc::Sender<Row>,
}

impl DemandSignal {
    /// Wait until the stream can take a row.
    pub async fn ready(self) {
        // The permit is returned on drop; we only need to know it exists.
        let _ = self.rows.reserve().await;
    }
}

/// Pending single update outcome.
///
/// Resolves to [`Error::ConnectionClosed`] if the connection goes away
/// before the result is delivered.
#[derive(Debug)]
pub struct PendingOutcome {
    rx: oneshot::Receiver<Result<UpdateOutcome>>,
}

impl Future for PendingOutcome {
    type Output = Result<UpdateOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::ConnectionClosed)))
    }
}

/// Pull-based stream over the rows of one row set.
///
/// Dropping the stream, or calling [`cancel`](Self::cancel), stops row
/// delivery for this result only; the connection skips the remaining rows.
#[derive(Debug)]
pub struct RowStream {
    head: Option<oneshot::Receiver<Result<StreamHead>>>,
    meta: Option<Arc<RowMeta>>,
    buffered: VecDeque<Row>,
    rows: mpsc::Receiver<Row>,
    tail: Option<oneshot::Receiver<Result<UpdateOutcome>>>,
    outcome: Option<UpdateOutcome>,
    cancelled: bool,
}

impl RowStream {
    async fn head(&mut self) -> Result<()> {
        if let Some(head) = self.head.take() {
            let head = head.await.unwrap_or(Err(Error::ConnectionClosed))?;
            self.meta = Some(head.meta);
            self.buffered = head.buffered;
        }
        Ok(())
    }

    async fn tail(&mut self) -> Result<()> {
        if let Some(tail) = self.tail.take() {
            let outcome = tail.await.unwrap_or(Err(Error::ConnectionClosed))?;
            self.outcome = Some(outcome);
        }
        Ok(())
    }

    /// Column metadata; waits for the row set to begin.
    pub async fn metadata(&mut self) -> Result<Arc<RowMeta>> {
        self.head().await?;
        self.meta
            .clone()
            .ok_or_else(|| Error::Protocol("row stream has no metadata".into()))
    }

    /// Next row, `None` once the row set is complete.
    ///
    /// A failure of the statement is yielded once, after the rows that
    /// arrived before it.
    pub async fn next(&mut self) -> Option<Result<Row>> {
        if self.cancelled || self.outcome.is_some() {
            return None;
        }
        if self.tail.is_none() {
            return None;
        }
        if let Err(err) = self.head().await {
            self.tail = None;
            return Some(Err(err));
        }
        if let Some(row) = self.buffered.pop_front() {
            return Some(Ok(row));
        }
        match self.rows.recv().await {
            Some(row) => Some(Ok(row)),
            None => self.tail().await.err().map(Err),
        }
    }

    /// Stop receiving rows. The terminal outcome is still available.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.buffered.clear();
        self.rows.close();
        while self.rows.try_recv().is_ok() {}
    }

    /// Terminal outcome of the row set, discarding rows not yet read.
    pub async fn outcome(mut self) -> Result<UpdateOutcome> {
        self.head().await?;
        self.cancel();
        self.tail().await?;
        self.outcome
            .take()
            .ok_or_else(|| Error::Protocol("row stream has no outcome".into()))
    }

    /// Read every remaining row, then the terminal outcome.
    pub async fn collect(mut self) -> Result<(Vec<Row>, UpdateOutcome)> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        let outcome = self.outcome().await?;
        Ok((rows, outcome))
    }
}
