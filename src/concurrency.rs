//! Bounded worker pool
//!
//! Each worker thread owns one job channel and one message channel. Jobs are
//! handed out round-robin to workers below their in-flight cap; surplus jobs
//! wait in a FIFO queue until [`WorkerPool::pump`] finds a free worker. A
//! worker reports progress while it runs and a final message when done, all
//! over its own channel, so per-job ordering is preserved.
//!
//! A panicking handler does not take its worker down: the panic is caught and
//! reported as [`WorkerMessage::Failed`], which frees the slot like `Done`.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Message coming back from a worker
#[derive(Debug)]
pub enum WorkerMessage<M> {
    /// Intermediate report; the job is still running
    Progress(M),
    /// The job finished; frees one in-flight slot
    Done(M),
    /// The handler panicked; frees one in-flight slot
    Failed(String),
}

/// Progress callback handed to the job handler
pub type Report<'a, M> = &'a dyn Fn(M);

struct WorkerChannel<J, M> {
    job_sender: Sender<J>,
    message_receiver: Receiver<WorkerMessage<M>>,
    in_flight: usize,
    /// Cleared once the worker's channels disconnect
    alive: bool,
    _worker: JoinHandle<()>,
}

pub struct WorkerPool<J, M> {
    channels: Vec<WorkerChannel<J, M>>,
    queued: VecDeque<J>,
    current_channel: usize,
    max_in_flight: usize,
    published: u64,
}

impl<J: Send + 'static, M: Send + 'static> WorkerPool<J, M> {
    /// Spawn `workers` threads running `handler` for every job
    pub fn new<F>(name: &str, workers: usize, max_in_flight: usize, handler: F) -> std::io::Result<Self>
    where
        F: Fn(J, Report<M>) -> M + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let mut channels = Vec::with_capacity(workers);

        for index in 0..workers.max(1) {
            let (job_tx, job_rx) = channel::<J>();
            let (message_tx, message_rx) = channel::<WorkerMessage<M>>();
            let handler = Arc::clone(&handler);

            let worker = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        let report = |message: M| {
                            let _ = message_tx.send(WorkerMessage::Progress(message));
                        };
                        let message = match panic::catch_unwind(AssertUnwindSafe(|| handler(job, &report))) {
                            Ok(result) => WorkerMessage::Done(result),
                            Err(payload) => WorkerMessage::Failed(panic_message(payload.as_ref())),
                        };
                        if message_tx.send(message).is_err() {
                            break;
                        }
                    }
                })?;

            channels.push(WorkerChannel {
                job_sender: job_tx,
                message_receiver: message_rx,
                in_flight: 0,
                alive: true,
                _worker: worker,
            });
        }

        log::debug!(
            "Started worker pool '{}' with {} workers ({} jobs each)",
            name,
            channels.len(),
            max_in_flight
        );

        Ok(Self {
            channels,
            queued: VecDeque::new(),
            current_channel: 0,
            max_in_flight: max_in_flight.max(1),
            published: 0,
        })
    }

    fn try_send(&mut self, job: J, channel_idx: usize) -> Result<(), J> {
        match self.channels[channel_idx].job_sender.send(job) {
            Ok(()) => {
                self.channels[channel_idx].in_flight += 1;
                Ok(())
            }
            Err(err) => {
                let channel = &mut self.channels[channel_idx];
                channel.alive = false;
                channel.in_flight = 0;
                Err(err.0)
            }
        }
    }

    /// Next live worker below its in-flight cap, round-robin from the last used one
    fn find_available_channel(&self) -> Option<usize> {
        let count = self.channels.len();
        (0..count)
            .map(|offset| (self.current_channel + offset) % count)
            .find(|&idx| {
                let channel = &self.channels[idx];
                channel.alive && channel.in_flight < self.max_in_flight
            })
    }

    /// Hand a job to a free worker, or queue it
    ///
    /// Returns true if the job was dispatched immediately.
    pub fn publish(&mut self, job: J) -> bool {
        self.published += 1;
        let Some(channel_idx) = self.find_available_channel() else {
            self.queued.push_back(job);
            return false;
        };

        match self.try_send(job, channel_idx) {
            Ok(()) => {
                self.current_channel = (channel_idx + 1) % self.channels.len();
                true
            }
            Err(job) => {
                log::warn!("Worker {} disconnected, queueing job", channel_idx);
                self.queued.push_back(job);
                false
            }
        }
    }

    /// Dispatch queued jobs while workers have room
    pub fn pump(&mut self) {
        while !self.queued.is_empty() {
            let Some(channel_idx) = self.find_available_channel() else {
                break;
            };
            let Some(job) = self.queued.pop_front() else {
                break;
            };
            match self.try_send(job, channel_idx) {
                Ok(()) => self.current_channel = (channel_idx + 1) % self.channels.len(),
                Err(job) => {
                    log::warn!("Worker {} disconnected, skipping it", channel_idx);
                    self.queued.push_front(job);
                }
            }
        }
    }

    /// Collect every message available right now, then refill workers
    pub fn drain(&mut self) -> Vec<WorkerMessage<M>> {
        let mut messages = Vec::new();
        for channel in &mut self.channels {
            loop {
                match channel.message_receiver.try_recv() {
                    Ok(message) => {
                        match &message {
                            WorkerMessage::Progress(_) => {}
                            WorkerMessage::Done(_) => channel.in_flight = channel.in_flight.saturating_sub(1),
                            WorkerMessage::Failed(reason) => {
                                log::error!("Job failed: {}", reason);
                                channel.in_flight = channel.in_flight.saturating_sub(1);
                            }
                        }
                        messages.push(message);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if channel.alive {
                            log::error!("Worker thread exited unexpectedly");
                        }
                        channel.alive = false;
                        channel.in_flight = 0;
                        break;
                    }
                }
            }
        }
        self.pump();
        messages
    }

    /// Like [`WorkerPool::drain`], but waits up to `timeout` for the first message
    pub fn drain_wait(&mut self, timeout: Duration) -> Vec<WorkerMessage<M>> {
        let deadline = Instant::now() + timeout;
        loop {
            let messages = self.drain();
            if !messages.is_empty() || self.is_idle() || Instant::now() >= deadline {
                return messages;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn in_flight(&self) -> usize {
        self.channels.iter().map(|channel| channel.in_flight).sum()
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.in_flight() == 0
    }

    /// Jobs ever handed to [`WorkerPool::publish`]
    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn workers(&self) -> usize {
        self.channels.len()
    }

    /// Workers whose thread is still running
    pub fn live_workers(&self) -> usize {
        self.channels.iter().filter(|channel| channel.alive).count()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_done(pool: &mut WorkerPool<u32, u32>, expected: usize) -> Vec<u32> {
        let mut done = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while done.len() < expected && Instant::now() < deadline {
            for message in pool.drain_wait(Duration::from_millis(50)) {
                if let WorkerMessage::Done(value) = message {
                    done.push(value);
                }
            }
        }
        done
    }

    #[test]
    fn test_jobs_complete() {
        let mut pool = WorkerPool::new("test", 2, 1, |job: u32, _report: Report<u32>| job * 2).unwrap();

        for job in 0..10 {
            pool.publish(job);
        }
        let mut done = collect_done(&mut pool, 10);
        done.sort_unstable();

        assert_eq!(done, (0..10).map(|j| j * 2).collect::<Vec<_>>());
        assert!(pool.is_idle());
        assert_eq!(pool.published(), 10);
    }

    #[test]
    fn test_surplus_jobs_are_queued() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate = std::sync::Mutex::new(gate_rx);
        let mut pool = WorkerPool::new("gated", 1, 1, move |job: u32, _report: Report<u32>| {
            let _ = gate.lock().map(|rx| rx.recv());
            job
        })
        .unwrap();

        assert!(pool.publish(1));
        assert!(!pool.publish(2));
        assert!(!pool.publish(3));
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.queued(), 2);

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        let done = collect_done(&mut pool, 3);
        // Single worker keeps FIFO order
        assert_eq!(done, vec![1, 2, 3]);
    }

    #[test]
    fn test_progress_precedes_done() {
        let mut pool = WorkerPool::new("progress", 1, 1, |job: u32, report: Report<u32>| {
            report(job + 100);
            report(job + 200);
            job
        })
        .unwrap();

        pool.publish(7);
        let mut messages = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !messages.iter().any(|m| matches!(m, WorkerMessage::Done(_))) && Instant::now() < deadline {
            messages.extend(pool.drain_wait(Duration::from_millis(50)));
        }

        let values: Vec<(bool, u32)> = messages
            .into_iter()
            .map(|m| match m {
                WorkerMessage::Progress(v) => (false, v),
                WorkerMessage::Done(v) => (true, v),
                WorkerMessage::Failed(reason) => panic!("unexpected failure: {}", reason),
            })
            .collect();
        assert_eq!(values, vec![(false, 107), (false, 207), (true, 7)]);
    }

    #[test]
    fn test_panicking_job_frees_its_slot() {
        let mut pool = WorkerPool::new("panicky", 1, 1, |job: u32, _report: Report<u32>| {
            if job == 13 {
                panic!("unlucky job");
            }
            job
        })
        .unwrap();

        pool.publish(13);
        pool.publish(1);
        pool.publish(2);

        let mut done = Vec::new();
        let mut failures = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while done.len() + failures.len() < 3 && Instant::now() < deadline {
            for message in pool.drain_wait(Duration::from_millis(50)) {
                match message {
                    WorkerMessage::Done(value) => done.push(value),
                    WorkerMessage::Failed(reason) => failures.push(reason),
                    WorkerMessage::Progress(_) => {}
                }
            }
        }

        assert_eq!(failures, vec!["unlucky job".to_string()]);
        assert_eq!(done, vec![1, 2]);
        assert!(pool.is_idle());
        assert_eq!(pool.live_workers(), 1);
    }

    #[test]
    fn test_dead_worker_is_skipped() {
        let mut pool = WorkerPool::new("dead", 2, 1, |job: u32, _report: Report<u32>| job).unwrap();
        // Simulate a worker whose thread is gone
        pool.channels[0].alive = false;
        pool.current_channel = 0;

        for job in 0..4 {
            pool.publish(job);
        }
        let mut done = collect_done(&mut pool, 4);
        done.sort_unstable();

        assert_eq!(done, vec![0, 1, 2, 3]);
        assert_eq!(pool.live_workers(), 1);
        assert!(pool.is_idle());
    }
}
