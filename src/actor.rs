//! Async driver for a [`Partition`].
//!
//! One tokio task owns the partition and interprets a single inbound queue.
//! Client commands and storage completions arrive on that queue; storage
//! writes and reads run as spawned tasks that post their completion back.
//! A single `sleep_until` is armed for the partition's next wakeup, and a
//! metrics interval logs [`PartitionStatus`].
//!
//! ```text
//!  PartitionHandle ──Command──▶ ┌──────────────┐ ──spawn──▶ BlobStore
//!                               │ actor loop   │
//!  store tasks ──Completion───▶ │  Partition   │ ◀─completion─┘
//!                               └──────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::PartitionConfig;
use crate::error::{Error, Result};
use crate::partition::recovery;
use crate::partition::{
    Cookie, Effect, GroupOutcome, GroupRegistration, IoId, Partition, PartitionState,
    PartitionStatus, PendingRequest, QuotaDecision, ReadOutcome, ReadRequest, Reply,
    SplitRequest, WriteOutcome, WriteRequest,
};
use crate::rate_limiter::{QuotaGrant, RateLimiter, Unlimited};
use crate::store::{BlobStore, Entry, WriteBatch};

const QUEUE_CAPACITY: usize = 1024;

enum Command {
    Write(WriteRequest, oneshot::Sender<WriteOutcome>),
    Read(ReadRequest, oneshot::Sender<Result<ReadOutcome>>),
    Group(PendingRequest, oneshot::Sender<GroupOutcome>),
    MaxSeqNos(Vec<String>, oneshot::Sender<Vec<(String, Option<u64>)>>),
    OffsetForTimestamp(u64, oneshot::Sender<u64>),
    Status(oneshot::Sender<PartitionStatus>),
    Reserve {
        reservation: u64,
        bytes: u64,
        reply: oneshot::Sender<QuotaDecision>,
    },
    Release(u64, oneshot::Sender<bool>),
    ForceCompaction(oneshot::Sender<()>),
    SetLevelCeilings(Vec<u64>, oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<()>),
}

enum Message {
    Command(Command),
    WriteDone { id: IoId, result: Result<()> },
    ReadDone { id: IoId, result: Result<Vec<Entry>> },
}

enum Waiter {
    Write(oneshot::Sender<WriteOutcome>),
    Read(oneshot::Sender<Result<ReadOutcome>>),
    Group(oneshot::Sender<GroupOutcome>),
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

/// Cloneable handle to a running partition.
#[derive(Clone)]
pub struct PartitionHandle {
    tx: mpsc::Sender<Message>,
}

impl PartitionHandle {
    /// Recovers the partition from `store` and starts its driver.
    pub async fn open(config: PartitionConfig, store: Arc<dyn BlobStore>) -> Result<Self> {
        Self::open_with_limiter(config, store, Arc::new(Unlimited)).await
    }

    /// Like [`PartitionHandle::open`], with storage writes gated by `limiter`.
    pub async fn open_with_limiter(
        config: PartitionConfig,
        store: Arc<dyn BlobStore>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Result<Self> {
        let partition_id = config.partition_id;
        let metrics_interval = config.metrics_interval;
        let mut partition = Partition::new(config, now())?;

        let snapshot = recovery::load(store.as_ref(), partition_id).await?;
        let recovered = recovery::rebuild(partition.config(), snapshot)?;
        partition.recover(recovered, now())?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let actor = Actor {
            partition,
            store,
            limiter,
            rx,
            tx: tx.downgrade(),
            waiters: HashMap::new(),
            next_cookie: 0,
            closing: None,
        };
        tokio::spawn(actor.run(metrics_interval));
        Ok(Self { tx })
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Command(command(reply)))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub async fn write(&self, request: WriteRequest) -> Result<WriteOutcome> {
        self.request(|reply| Command::Write(request, reply)).await
    }

    pub async fn read(&self, request: ReadRequest) -> Result<ReadOutcome> {
        self.request(|reply| Command::Read(request, reply)).await?
    }

    pub async fn register_group(&self, registration: GroupRegistration) -> Result<GroupOutcome> {
        self.request(|reply| Command::Group(PendingRequest::RegisterGroup(registration), reply))
            .await
    }

    pub async fn deregister_group(&self, source_id: impl Into<String>) -> Result<GroupOutcome> {
        let request = PendingRequest::DeregisterGroup {
            source_id: source_id.into(),
        };
        self.request(|reply| Command::Group(request, reply)).await
    }

    pub async fn split_group(&self, split: SplitRequest) -> Result<GroupOutcome> {
        self.request(|reply| Command::Group(PendingRequest::SplitGroup(split), reply))
            .await
    }

    pub async fn max_seq_nos(&self, source_ids: Vec<String>) -> Result<Vec<(String, Option<u64>)>> {
        self.request(|reply| Command::MaxSeqNos(source_ids, reply))
            .await
    }

    pub async fn offset_for_timestamp(&self, timestamp_ms: u64) -> Result<u64> {
        self.request(|reply| Command::OffsetForTimestamp(timestamp_ms, reply))
            .await
    }

    pub async fn status(&self) -> Result<PartitionStatus> {
        self.request(Command::Status).await
    }

    pub async fn reserve_bytes(&self, reservation: u64, bytes: u64) -> Result<QuotaDecision> {
        self.request(|reply| Command::Reserve {
            reservation,
            bytes,
            reply,
        })
        .await
    }

    pub async fn release_reservation(&self, reservation: u64) -> Result<bool> {
        self.request(|reply| Command::Release(reservation, reply))
            .await
    }

    pub async fn force_compaction(&self) -> Result<()> {
        self.request(Command::ForceCompaction).await
    }

    pub async fn set_level_ceilings(&self, ceilings: Vec<u64>) -> Result<()> {
        self.request(|reply| Command::SetLevelCeilings(ceilings, reply))
            .await?
    }

    /// Stops the driver once the in-flight write batch settled. Records not
    /// yet flushed are dropped, as on a crash.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

struct Actor {
    partition: Partition,
    store: Arc<dyn BlobStore>,
    limiter: Arc<dyn RateLimiter>,
    rx: mpsc::Receiver<Message>,
    tx: mpsc::WeakSender<Message>,
    waiters: HashMap<Cookie, Waiter>,
    next_cookie: Cookie,
    closing: Option<oneshot::Sender<()>>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self, metrics_interval: std::time::Duration) {
        let partition_id = self.partition.config().partition_id;
        let mut metrics = tokio::time::interval(metrics_interval);
        metrics.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.dispatch();

        loop {
            let wakeup = self.partition.next_wakeup().map(Instant::from_std);
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = sleep_until(wakeup) => self.partition.on_tick(now()),
                _ = metrics.tick() => self.partition.status().log(),
            }
            self.dispatch();

            if self.closing.is_some() && self.partition.state() != PartitionState::Flushing {
                break;
            }
        }

        if let Some(done) = self.closing.take() {
            let _ = done.send(());
        }
        tracing::info!(partition = partition_id, "Partition driver stopped");
    }

    fn handle(&mut self, message: Message) {
        let now = now();
        match message {
            Message::WriteDone { id, result } => self.partition.on_write_complete(id, result, now),
            Message::ReadDone { id, result } => self.partition.on_read_complete(id, result, now),
            // Commands arriving after shutdown are dropped; callers see `Closed`.
            Message::Command(_) if self.closing.is_some() => {}
            Message::Command(command) => self.command(command, now),
        }
    }

    fn cookie(&mut self) -> Cookie {
        self.next_cookie += 1;
        self.next_cookie
    }

    fn command(&mut self, command: Command, now: std::time::Instant) {
        match command {
            Command::Write(request, reply) => {
                let cookie = self.cookie();
                self.waiters.insert(cookie, Waiter::Write(reply));
                self.partition.write(cookie, request, now);
            }
            Command::Read(request, reply) => {
                let cookie = self.cookie();
                self.waiters.insert(cookie, Waiter::Read(reply));
                self.partition.read(cookie, request, now);
            }
            Command::Group(request, reply) => {
                let cookie = self.cookie();
                self.waiters.insert(cookie, Waiter::Group(reply));
                self.partition.submit(cookie, request, now);
            }
            Command::MaxSeqNos(source_ids, reply) => {
                let _ = reply.send(self.partition.max_seq_nos(&source_ids));
            }
            Command::OffsetForTimestamp(timestamp_ms, reply) => {
                let _ = reply.send(self.partition.offset_for_timestamp(timestamp_ms));
            }
            Command::Status(reply) => {
                let _ = reply.send(self.partition.status());
            }
            Command::Reserve {
                reservation,
                bytes,
                reply,
            } => {
                let _ = reply.send(self.partition.reserve_bytes(reservation, bytes, now));
            }
            Command::Release(reservation, reply) => {
                let _ = reply.send(self.partition.release_reservation(reservation));
            }
            Command::ForceCompaction(reply) => {
                self.partition.force_compaction(now);
                let _ = reply.send(());
            }
            Command::SetLevelCeilings(ceilings, reply) => {
                let _ = reply.send(self.partition.set_level_ceilings(ceilings));
            }
            Command::Shutdown(reply) => {
                tracing::info!(
                    partition = self.partition.config().partition_id,
                    "Shutting down partition driver"
                );
                self.closing = Some(reply);
            }
        }
    }

    fn dispatch(&mut self) {
        for effect in self.partition.take_effects() {
            match effect {
                Effect::Write { id, batch } => self.spawn_write(id, batch),
                Effect::Read { id, keys } => self.spawn_read(id, keys),
                Effect::Reply { cookie, reply } => self.answer(cookie, reply),
            }
        }
    }

    fn answer(&mut self, cookie: Cookie, reply: Reply) {
        let delivered = match (self.waiters.remove(&cookie), reply) {
            (Some(Waiter::Write(tx)), Reply::Write(outcome)) => tx.send(outcome).is_ok(),
            (Some(Waiter::Read(tx)), Reply::Read(outcome)) => tx.send(outcome).is_ok(),
            (Some(Waiter::Group(tx)), Reply::Group(outcome)) => tx.send(outcome).is_ok(),
            (None, _) => {
                tracing::warn!(cookie, "Reply for unknown request");
                return;
            }
            (Some(_), reply) => {
                tracing::warn!(cookie, ?reply, "Reply does not match its request");
                return;
            }
        };
        if !delivered {
            tracing::debug!(cookie, "Requester went away before the reply");
        }
    }

    fn spawn_write(&self, id: IoId, batch: WriteBatch) {
        let tx = match self.tx.upgrade() {
            Some(tx) => tx,
            None => return,
        };
        let store = self.store.clone();
        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            let bytes = batch.size() as u64;
            while let QuotaGrant::Denied(delay) = limiter.request_quota(bytes).await {
                tokio::time::sleep(delay).await;
            }
            let result = store.write(batch).await;
            let _ = tx.send(Message::WriteDone { id, result }).await;
        });
    }

    fn spawn_read(&self, id: IoId, keys: Vec<Vec<u8>>) {
        let tx = match self.tx.upgrade() {
            Some(tx) => tx,
            None => return,
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            let result = store.read(keys).await;
            let _ = tx.send(Message::ReadDone { id, result }).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AckPolicy, CompactionConfig};
    use crate::rate_limiter::TokenBucketLimiter;
    use crate::store::{LogStore, MemoryStore};
    use std::time::Duration;

    fn memory() -> Arc<dyn BlobStore> {
        Arc::new(MemoryStore::new())
    }

    async fn data(handle: &PartitionHandle, offset: u64) -> Result<Vec<String>> {
        match handle.read(ReadRequest::new(offset)).await? {
            ReadOutcome::Data(records) => Ok(records
                .into_iter()
                .map(|r| String::from_utf8_lossy(&r.data).into_owned())
                .collect()),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_at_end_waits_for_deadline() -> Result<()> {
        let handle = PartitionHandle::open(PartitionConfig::new(0), memory()).await?;

        let started = Instant::now();
        let outcome = handle
            .read(ReadRequest::new(0).timeout(Duration::from_millis(100)))
            .await?;
        assert_eq!(outcome, ReadOutcome::Empty);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_read_sees_later_write() -> Result<()> {
        let handle = PartitionHandle::open(PartitionConfig::new(0), memory()).await?;

        let reader = handle.clone();
        let read = tokio::spawn(async move {
            reader
                .read(ReadRequest::new(0).timeout(Duration::from_secs(5)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            handle.write(WriteRequest::new("p", 1, "late")).await?,
            WriteOutcome::Accepted { offset: 0 }
        );

        match read.await.map_err(|e| Error::InvalidState(e.to_string()))?? {
            ReadOutcome::Data(records) => assert_eq!(records[0].data, b"late".to_vec()),
            other => panic!("expected data, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_write_acknowledged_after_flush_age() -> Result<()> {
        let config = PartitionConfig::new(0).flush_max_age(Duration::from_millis(50));
        let handle = PartitionHandle::open(config, memory()).await?;

        let started = Instant::now();
        let outcome = handle.write(WriteRequest::new("p", 1, "x")).await?;
        assert_eq!(outcome, WriteOutcome::Accepted { offset: 0 });
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(handle.status().await?.head_offset, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_producers() -> Result<()> {
        let config = PartitionConfig::new(0)
            .ack_policy(AckPolicy::Admitted)
            .flush_size_threshold(256);
        let handle = PartitionHandle::open(config, memory()).await?;

        let mut tasks = Vec::new();
        for producer in 0..4 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let mut offsets = Vec::new();
                for seq_no in 1..=25 {
                    let source_id = format!("producer-{}", producer);
                    match handle.write(WriteRequest::new(source_id, seq_no, "payload")).await? {
                        WriteOutcome::Accepted { offset } => offsets.push(offset),
                        other => panic!("unexpected {:?}", other),
                    }
                }
                Ok::<_, Error>(offsets)
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            let offsets = task.await.map_err(|e| Error::InvalidState(e.to_string()))??;
            assert!(offsets.windows(2).all(|w| w[0] < w[1]));
            all.extend(offsets);
        }
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<u64>>());
        Ok(())
    }

    #[tokio::test]
    async fn test_log_store_survives_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = || {
            PartitionConfig::new(1)
                .flush_size_threshold(1)
                .compaction(CompactionConfig::default().level_ceilings(vec![200, 1 << 20]))
        };

        let store: Arc<dyn BlobStore> = Arc::new(LogStore::open(dir.path())?);
        let handle = PartitionHandle::open(config(), store).await?;
        for seq_no in 1..=5 {
            let outcome = handle
                .write(WriteRequest::new("p", seq_no, format!("record-{}", seq_no)))
                .await?;
            assert_eq!(outcome, WriteOutcome::Accepted { offset: seq_no - 1 });
        }
        handle
            .register_group(GroupRegistration::new("group", 10))
            .await?;
        let before = handle.status().await?;
        handle.shutdown().await?;
        assert!(matches!(handle.status().await, Err(Error::Closed)));

        let store: Arc<dyn BlobStore> = Arc::new(LogStore::open(dir.path())?);
        let handle = PartitionHandle::open(config(), store).await?;
        let after = handle.status().await?;
        assert_eq!(after.head_offset, 5);
        assert_eq!(after.start_offset, before.start_offset);
        assert_eq!(
            data(&handle, 0).await?,
            (1..=5).map(|i| format!("record-{}", i)).collect::<Vec<_>>()
        );
        assert_eq!(
            handle.write(WriteRequest::new("p", 5, "again")).await?,
            WriteOutcome::Duplicate {
                offset: 4,
                max_seq_no: 5
            }
        );
        assert_eq!(
            handle.max_seq_nos(vec!["group".into()]).await?,
            vec![("group".to_string(), Some(10))]
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_pass_through_rate_limiter() -> Result<()> {
        let limiter = Arc::new(TokenBucketLimiter::new(1000, 100));
        let config = PartitionConfig::new(0).flush_size_threshold(1);
        let handle = PartitionHandle::open_with_limiter(config, memory(), limiter).await?;

        let started = Instant::now();
        for seq_no in 1..=3 {
            handle
                .write(WriteRequest::new("p", seq_no, vec![7u8; 200]))
                .await?;
        }
        // Each batch exceeds the bucket and has to wait for it to refill.
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(handle.status().await?.head_offset, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_admin_operations() -> Result<()> {
        let handle = PartitionHandle::open(PartitionConfig::new(0), memory()).await?;
        assert!(handle.set_level_ceilings(vec![1]).await.is_err());
        handle
            .set_level_ceilings(vec![1 << 10, 2 << 10, 3 << 10, 4 << 10])
            .await?;
        handle.force_compaction().await?;
        assert_eq!(handle.reserve_bytes(1, 10).await?, QuotaDecision::Admitted);
        assert!(!handle.release_reservation(1).await?);
        assert_eq!(handle.offset_for_timestamp(0).await?, 0);
        assert_eq!(
            handle.deregister_group("nobody").await?,
            GroupOutcome::Rejected(crate::partition::RejectReason::UnknownGroup)
        );
        Ok(())
    }
}
