//! Background audit writer
//!
//! Takes audit records off the request path:
//! - records travel over an unbounded channel, nothing is overwritten
//! - a dedicated thread writes them in order, retrying with backoff
//! - records that exhaust their retries are kept as dead letters and counted
//! - [`AuditWriter::flush`] blocks until everything queued before it is done,
//!   and fails if anything was dead-lettered since the previous flush
//!
//! On shutdown the dead letters get one more round of retries. Whatever is
//! still unwritten is appended as JSON lines to the spill file when one is
//! configured, and can be replayed later with [`AuditWriter::read_spill`].

use super::AuditRecord;
use crate::core::error::{Result, RuleError};
use crate::core::store::RuleStore;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry behaviour for failed writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first failure
    pub max_retries: u32,
    /// Sleep before retry `n` is `backoff * n`
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Counters exposed for alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriterStats {
    /// Records fully written
    pub written: u64,
    /// Individual failed attempts, including ones later retried successfully
    pub failed_attempts: u64,
    /// Records that exhausted their retries
    pub dead_lettered: u64,
}

enum Message {
    Record(Box<AuditRecord>),
    Flush(Sender<()>),
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    failed_attempts: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Asynchronous audit writer backed by a worker thread
pub struct AuditWriter {
    sender: Option<Sender<Message>>,
    worker: Option<JoinHandle<()>>,
    store: Arc<dyn RuleStore>,
    policy: RetryPolicy,
    spill_path: Option<PathBuf>,
    counters: Arc<Counters>,
    /// Dead-letter count already reported through `flush`
    reported_dead: AtomicU64,
    dead_letters: Arc<Mutex<Vec<AuditRecord>>>,
}

impl AuditWriter {
    /// Spawn the worker thread writing into `store`
    pub fn start(store: Arc<dyn RuleStore>, policy: RetryPolicy) -> Self {
        let (sender, receiver) = channel::unbounded();
        let counters = Arc::new(Counters::default());
        let dead_letters = Arc::new(Mutex::new(Vec::new()));

        let worker = {
            let store = Arc::clone(&store);
            let counters = Arc::clone(&counters);
            let dead_letters = Arc::clone(&dead_letters);
            thread::Builder::new()
                .name("audit-writer".to_string())
                .spawn(move || run(receiver, store, policy, counters, dead_letters))
        };

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "failed to spawn audit writer thread");
                None
            }
        };

        AuditWriter {
            sender: worker.as_ref().map(|_| sender),
            worker,
            store,
            policy,
            spill_path: None,
            counters,
            reported_dead: AtomicU64::new(0),
            dead_letters,
        }
    }

    /// Append records still unwritten at shutdown to `path` as JSON lines
    pub fn with_spill_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.spill_path = Some(path.into());
        self
    }

    pub fn spill_path(&self) -> Option<&Path> {
        self.spill_path.as_deref()
    }

    /// Queue a record without waiting for it to be written
    pub fn submit(&self, record: AuditRecord) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(RuleError::AuditWriterClosed)?;
        sender
            .send(Message::Record(Box::new(record)))
            .map_err(|_| RuleError::AuditWriterClosed)
    }

    /// Block until every record submitted so far has been handled.
    ///
    /// Returns [`RuleError::AuditDeadLettered`] when records exhausted their
    /// retries since the previous flush. They stay available through
    /// [`take_dead_letters`](Self::take_dead_letters).
    pub fn flush(&self) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(RuleError::AuditWriterClosed)?;
        let (ack_tx, ack_rx) = channel::bounded(1);
        sender
            .send(Message::Flush(ack_tx))
            .map_err(|_| RuleError::AuditWriterClosed)?;
        ack_rx.recv().map_err(|_| RuleError::AuditWriterClosed)?;

        let total = self.counters.dead_lettered.load(Ordering::SeqCst);
        let reported = self.reported_dead.swap(total, Ordering::SeqCst);
        if total > reported {
            return Err(RuleError::AuditDeadLettered(total - reported));
        }
        Ok(())
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            written: self.counters.written.load(Ordering::SeqCst),
            failed_attempts: self.counters.failed_attempts.load(Ordering::SeqCst),
            dead_lettered: self.counters.dead_lettered.load(Ordering::SeqCst),
        }
    }

    /// Drain the records that could not be written, for replay
    pub fn take_dead_letters(&self) -> Vec<AuditRecord> {
        std::mem::take(&mut *self.dead_letters.lock())
    }

    /// Stop accepting records, finish the queue and join the worker.
    ///
    /// Dead letters are retried once more; the rest go to the spill file, or
    /// stay in the dead-letter list when there is none or spilling fails.
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("audit writer thread panicked");
            }
        }

        let pending = self.take_dead_letters();
        if pending.is_empty() {
            return;
        }

        let retried = pending.len();
        let unwritten: Vec<AuditRecord> = pending
            .into_iter()
            .filter(|record| {
                let written =
                    write_with_retry(self.store.as_ref(), record, self.policy, &self.counters);
                if written {
                    self.counters.written.fetch_add(1, Ordering::SeqCst);
                }
                !written
            })
            .collect();

        if unwritten.is_empty() {
            info!(count = retried, "dead-lettered audit records written at shutdown");
            return;
        }

        error!(count = unwritten.len(), "audit records still unwritten at shutdown");
        match &self.spill_path {
            Some(path) => match spill(path, &unwritten) {
                Ok(()) => warn!(
                    count = unwritten.len(),
                    path = %path.display(),
                    "unwritten audit records spilled"
                ),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to spill audit records");
                    self.dead_letters.lock().extend(unwritten);
                }
            },
            None => self.dead_letters.lock().extend(unwritten),
        }
    }

    /// Read back records spilled at shutdown, oldest first
    pub fn read_spill(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>> {
        let file = File::open(path)?;
        BufReader::new(file)
            .lines()
            .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
            .map(|line| -> Result<AuditRecord> { Ok(serde_json::from_str(&line?)?) })
            .collect()
    }
}

impl Drop for AuditWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spill(path: &Path, records: &[AuditRecord]) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut out = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(())
}

fn run(
    receiver: Receiver<Message>,
    store: Arc<dyn RuleStore>,
    policy: RetryPolicy,
    counters: Arc<Counters>,
    dead_letters: Arc<Mutex<Vec<AuditRecord>>>,
) {
    for message in receiver.iter() {
        match message {
            Message::Record(record) => {
                if write_with_retry(store.as_ref(), &record, policy, &counters) {
                    counters.written.fetch_add(1, Ordering::SeqCst);
                } else {
                    counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
                    dead_letters.lock().push(*record);
                }
            }
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("audit writer queue closed");
}

fn write_with_retry(
    store: &dyn RuleStore,
    record: &AuditRecord,
    policy: RetryPolicy,
    counters: &Counters,
) -> bool {
    let mut attempt = 0;
    loop {
        match record.write_to(store) {
            Ok(()) => return true,
            Err(e) => {
                counters.failed_attempts.fetch_add(1, Ordering::SeqCst);
                if attempt >= policy.max_retries {
                    error!(
                        rule_id = record.entry.rule_id,
                        action = %record.entry.action,
                        error = %e,
                        "audit write failed, retries exhausted"
                    );
                    return false;
                }
                attempt += 1;
                warn!(attempt, error = %e, "audit write failed, retrying");
                thread::sleep(policy.backoff * attempt);
            }
        }
    }
}
