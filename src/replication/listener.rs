// ABOUTME: Replication listener driving the decoder from a replication stream
// ABOUTME: Push mode calls a commit handler; pull mode yields acknowledgeable transactions

use super::decoder::{TransactionBuffer, TransactionDecoder};
use super::lsn::Lsn;
use super::protocol::PgOutputMessage;
use super::stream::{ReplicationConnector, ReplicationStream, StreamEvent};
use crate::error::{Error, Result};
use crate::types::TableOperation;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receives each committed transaction.
///
/// `Ok(true)` acknowledges the transaction. `Ok(false)` or an error stops the
/// listener without acknowledging, so the transaction is redelivered later.
#[async_trait]
pub trait CommitHandler: Send {
    async fn on_commit(&mut self, buffer: TransactionBuffer) -> Result<bool>;
}

#[async_trait]
impl<F, Fut> CommitHandler for F
where
    F: FnMut(TransactionBuffer) -> Fut + Send,
    Fut: Future<Output = Result<bool>> + Send,
{
    async fn on_commit(&mut self, buffer: TransactionBuffer) -> Result<bool> {
        (self)(buffer).await
    }
}

type PendingAck = (TransactionBuffer, oneshot::Sender<bool>);

/// A transaction yielded by [`TransactionIterator`].
///
/// Dropping it without calling [`Transaction::ack`] counts as not processed.
#[derive(Debug)]
pub struct Transaction {
    pub buffer: TransactionBuffer,
    ack: Option<oneshot::Sender<bool>>,
}

impl Transaction {
    pub fn transaction_id(&self) -> String {
        self.buffer.transaction_id()
    }

    pub fn operations(&self) -> &[TableOperation] {
        &self.buffer.operations
    }

    /// Report the outcome; only the first call has an effect
    pub fn ack(&mut self, processed: bool) {
        if let Some(sender) = self.ack.take() {
            // The listener may already be gone after cancellation
            let _ = sender.send(processed);
        }
    }
}

/// Pull-based view of a running listener
pub struct TransactionIterator {
    receiver: mpsc::Receiver<PendingAck>,
    task: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

impl TransactionIterator {
    /// Next committed transaction.
    ///
    /// `None` after cancellation or when the stream ended cleanly. A decode or
    /// stream failure is returned once, then iteration ends.
    pub async fn next(&mut self) -> Option<Result<Transaction>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            received = self.receiver.recv() => received,
        };
        match received {
            Some((buffer, ack)) => Some(Ok(Transaction {
                buffer,
                ack: Some(ack),
            })),
            None => match self.task.take()?.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(Err(e)),
                Err(e) => Some(Err(Error::listener(format!("Replication task failed: {}", e)))),
            },
        }
    }

    /// Cancel and wait for the decode task to finish
    pub async fn stop(mut self) -> Result<()> {
        self.cancel.cancel();
        self.receiver.close();
        match self.task.take() {
            Some(task) => join_task(task).await,
            None => Ok(()),
        }
    }
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

/// Clears the running flag when the decode task exits
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Decodes one slot and hands every committed transaction to a consumer
pub struct ReplicationListener {
    connector: Arc<dyn ReplicationConnector>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<RunningTask>>,
}

impl ReplicationListener {
    pub fn new(connector: Arc<dyn ReplicationConnector>) -> Self {
        Self {
            connector,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start decoding in the background, calling `handler` on every commit
    pub async fn start<H>(&self, publication: &str, slot: &str, handler: H) -> Result<()>
    where
        H: CommitHandler + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = self.spawn(publication, slot, handler, cancel.clone()).await?;
        *self.task.lock().await = Some(RunningTask { cancel, handle });
        Ok(())
    }

    /// Cancel the background task started by [`start`](Self::start) and wait for it
    pub async fn stop(&self) -> Result<()> {
        let task = self.task.lock().await.take();
        match task {
            Some(RunningTask { cancel, handle }) => {
                cancel.cancel();
                join_task(handle).await
            }
            None => Ok(()),
        }
    }

    /// Wait for the background task to end on its own
    pub async fn join(&self) -> Result<()> {
        let task = self.task.lock().await.take();
        match task {
            Some(RunningTask { handle, .. }) => join_task(handle).await,
            None => Ok(()),
        }
    }

    /// Start decoding and return a pull-based iterator over transactions.
    ///
    /// The decoder waits for each transaction's acknowledgment before it
    /// reads further. Cancelling `cancel` ends the iteration.
    pub async fn start_iteration(
        &self,
        publication: &str,
        slot: &str,
        cancel: CancellationToken,
    ) -> Result<TransactionIterator> {
        let (sender, receiver) = mpsc::channel::<PendingAck>(1);
        let handler = move |buffer: TransactionBuffer| {
            let sender = sender.clone();
            async move {
                let (ack_tx, ack_rx) = oneshot::channel();
                if sender.send((buffer, ack_tx)).await.is_err() {
                    return Ok(false);
                }
                Ok(ack_rx.await.unwrap_or(false))
            }
        };
        let task = self.spawn(publication, slot, handler, cancel.clone()).await?;
        Ok(TransactionIterator {
            receiver,
            task: Some(task),
            cancel,
        })
    }

    async fn spawn<H>(
        &self,
        publication: &str,
        slot: &str,
        handler: H,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<()>>>
    where
        H: CommitHandler + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::listener(format!(
                "Listener for slot '{}' is already running",
                slot
            )));
        }
        let guard = RunningGuard(self.running.clone());

        let stream = self.connector.open(publication, slot).await?;
        tracing::info!(publication, slot, "Replication listener started");

        let slot = slot.to_string();
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let result = run_decode_loop(stream, handler, cancel).await;
            match &result {
                Ok(()) => tracing::info!(slot = %slot, "Replication listener stopped"),
                Err(e) => tracing::error!(slot = %slot, "Replication listener failed: {}", e),
            }
            result
        }))
    }
}

async fn join_task(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .await
        .map_err(|e| Error::listener(format!("Replication task failed: {}", e)))?
}

async fn run_decode_loop<H: CommitHandler>(
    mut stream: Box<dyn ReplicationStream>,
    mut handler: H,
    cancel: CancellationToken,
) -> Result<()> {
    let mut decoder = TransactionDecoder::new();

    let result = loop {
        // Cancellation only interrupts the wait for the next event
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            event = stream.next_event() => event,
        };
        let event = match event {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::info!("Replication stream ended");
                break Ok(());
            }
            Err(e) => break Err(e),
        };
        match handle_event(stream.as_mut(), &mut decoder, &mut handler, event).await {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = stream.close().await {
        tracing::warn!("Failed to close replication stream: {}", e);
    }
    result
}

/// Returns false when the listener must stop
async fn handle_event<H: CommitHandler>(
    stream: &mut dyn ReplicationStream,
    decoder: &mut TransactionDecoder,
    handler: &mut H,
    event: StreamEvent,
) -> Result<bool> {
    match event {
        StreamEvent::XLogData { lsn, data } => {
            let message = PgOutputMessage::parse(data)?;
            tracing::trace!(lsn = %lsn, message = message.tag(), "Decoded message");
            let Some(buffer) = decoder.decode(message)? else {
                return Ok(true);
            };
            deliver_commit(stream, handler, buffer).await
        }
        StreamEvent::Keepalive {
            wal_end,
            reply_requested,
        } => {
            if reply_requested && decoder.is_idle() {
                stream.acknowledge(wal_end).await?;
            }
            Ok(true)
        }
    }
}

async fn deliver_commit<H: CommitHandler>(
    stream: &mut dyn ReplicationStream,
    handler: &mut H,
    buffer: TransactionBuffer,
) -> Result<bool> {
    let end_lsn: Lsn = buffer.commit_end_lsn;
    let transaction_id = buffer.transaction_id();
    let operations = buffer.operations.len();

    if !handler.on_commit(buffer).await? {
        tracing::warn!(
            transaction_id = %transaction_id,
            "Transaction was not processed; stopping listener"
        );
        return Ok(false);
    }

    stream.acknowledge(end_lsn).await?;
    tracing::debug!(
        transaction_id = %transaction_id,
        operations,
        "Acknowledged transaction"
    );
    Ok(true)
}
