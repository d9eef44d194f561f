//! Bounded worker thread pool.
//!
//! Runs protocol logic off the reactor thread. Workers must never touch
//! connection objects; results travel back through the response
//! dispatcher. Dropping the pool closes the job channel and joins every
//! worker.

use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `threads` named workers sharing one job channel.
    pub fn new(name: &str, threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }

        debug!(threads, "thread pool ready");
        Ok(ThreadPool {
            sender: Some(sender),
            workers,
        })
    }

    /// Submit a job. Silently dropped if the pool is already shut down.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets each worker finish its queue and exit.
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        debug!("thread pool stopped");
    }
}

fn worker_loop(receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = match receiver.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => break,
        };
        match job {
            Ok(job) => job(),
            Err(_) => break, // channel closed, pool shutting down
        }
    }
}
