use std::collections::VecDeque;
use std::time::Duration;

use cloudbench_core::prelude::{IterationResult, ResultBatch};
use parking_lot::{Condvar, Mutex};

/// The result of waiting for the next batch.
#[derive(Debug)]
pub enum SinkPoll {
    Batch(ResultBatch),
    /// Nothing arrived within the timeout.
    Empty,
    /// The sink has been flushed and every batch has been taken.
    Closed,
}

#[derive(Debug, Default)]
struct Queue {
    batches: VecDeque<ResultBatch>,
    closed: bool,
}

/// Collects results pushed by the workers and hands them to the consumer in batches.
///
/// Each batch is sorted by timestamp. Batches are queued in the order they fill up, which says
/// nothing about the order of results across batches.
#[derive(Debug)]
pub struct ResultSink {
    batch_size: usize,
    buffer: Mutex<Vec<IterationResult>>,
    queue: Mutex<Queue>,
    available: Condvar,
}

impl ResultSink {
    /// A batch size of 0 is treated as 1.
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            buffer: Mutex::new(Vec::with_capacity(batch_size)),
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn push(&self, result: IterationResult) {
        let full = {
            let mut buffer = self.buffer.lock();
            buffer.push(result);
            (buffer.len() >= self.batch_size)
                .then(|| std::mem::replace(&mut *buffer, Vec::with_capacity(self.batch_size)))
        };

        if let Some(results) = full {
            self.enqueue(ResultBatch::from_unsorted(results));
        }
    }

    fn enqueue(&self, batch: ResultBatch) {
        let mut queue = self.queue.lock();
        if queue.closed {
            log::warn!(
                "Received {} results after the result sink was flushed",
                batch.len()
            );
        }
        queue.batches.push_back(batch);
        self.available.notify_one();
    }

    /// Queue the partially filled batch, if any, and close the sink.
    ///
    /// Only the first call has any effect. Returns `true` for that call.
    pub fn flush(&self) -> bool {
        let mut buffer = self.buffer.lock();
        let mut queue = self.queue.lock();
        if queue.closed {
            return false;
        }

        let remaining = std::mem::take(&mut *buffer);
        if !remaining.is_empty() {
            queue.batches.push_back(ResultBatch::from_unsorted(remaining));
        }
        queue.closed = true;
        self.available.notify_all();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    /// Wait up to `timeout` for the next batch.
    pub fn next_batch(&self, timeout: Duration) -> SinkPoll {
        let mut queue = self.queue.lock();
        if queue.batches.is_empty() && !queue.closed {
            self.available.wait_for(&mut queue, timeout);
        }

        match queue.batches.pop_front() {
            Some(batch) => SinkPoll::Batch(batch),
            None if queue.closed => SinkPoll::Closed,
            None => SinkPoll::Empty,
        }
    }

    /// Take every batch that is ready, without waiting.
    pub fn drain(&self) -> Vec<ResultBatch> {
        self.queue.lock().batches.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cloudbench_core::prelude::Output;
    use pretty_assertions::assert_eq;

    use super::*;

    fn result(index: u64, timestamp: f64) -> IterationResult {
        IterationResult {
            index,
            timestamp,
            duration: 0.0,
            idle_duration: 0.0,
            error: None,
            atomic_actions: Vec::new(),
            output: Output::default(),
        }
    }

    #[test]
    fn batches_are_sorted_by_timestamp() {
        let sink = ResultSink::new(3);
        sink.push(result(0, 3.0));
        sink.push(result(1, 1.0));
        assert!(sink.drain().is_empty());

        sink.push(result(2, 2.0));
        let batches = sink.drain();
        assert_eq!(1, batches.len());
        assert_eq!(
            vec![1, 2, 0],
            batches[0].iter().map(|r| r.index).collect::<Vec<_>>()
        );
    }

    #[test]
    fn flush_queues_partial_batch_once() {
        let sink = ResultSink::new(10);
        sink.push(result(0, 1.0));

        assert!(sink.flush());
        assert!(!sink.flush());
        assert!(sink.is_closed());

        let batches = sink.drain();
        assert_eq!(1, batches.len());
        assert_eq!(1, batches[0].len());
    }

    #[test]
    fn zero_batch_size_is_one() {
        let sink = ResultSink::new(0);
        assert_eq!(1, sink.batch_size());

        sink.push(result(0, 1.0));
        assert_eq!(1, sink.drain().len());
    }

    #[test]
    fn next_batch_reports_empty_then_closed() {
        let sink = ResultSink::new(1);
        assert!(matches!(
            sink.next_batch(Duration::from_millis(1)),
            SinkPoll::Empty
        ));

        sink.push(result(0, 1.0));
        sink.flush();
        assert!(matches!(
            sink.next_batch(Duration::from_millis(1)),
            SinkPoll::Batch(_)
        ));
        assert!(matches!(
            sink.next_batch(Duration::from_millis(1)),
            SinkPoll::Closed
        ));
    }

    #[test]
    fn concurrent_pushes_are_not_lost() {
        let sink = Arc::new(ResultSink::new(7));

        let handles = (0..8u64)
            .map(|t| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        sink.push(result(t * 1000 + i, i as f64));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        sink.flush();

        let batches = sink.drain();
        assert_eq!(2000, batches.iter().map(|b| b.len()).sum::<usize>());
        assert!(batches.iter().all(|b| b
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp)));
    }
}
