//! Dedicated handler pool
//!
//! All handler continuations and payload conversions run on this runtime,
//! never on the transport runtime or inside backend tasks. A handler that
//! waited on a backend completion from a transport thread could deadlock
//! the listener; the separate pool removes that coupling.

use std::future::Future;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tonic::Status;

pub struct WorkerPool {
  runtime: Option<Runtime>,
}

impl WorkerPool {
  pub fn new(threads: usize) -> std::io::Result<Self> {
    let runtime = Builder::new_multi_thread()
      .worker_threads(threads.max(1))
      .thread_name("hoard-worker")
      .enable_all()
      .build()?;
    Ok(Self {
      runtime: Some(runtime),
    })
  }

  fn handle(&self) -> &Runtime {
    self.runtime.as_ref().expect("worker pool is running")
  }

  /// Detach a task onto the pool.
  pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    self.handle().spawn(future)
  }

  /// Run a handler body on the pool and wait for its outcome. Dropping
  /// the returned future (client cancellation) leaves the task running to
  /// completion; its result is discarded.
  pub async fn run<F, T>(&self, future: F) -> Result<T, Status>
  where
    F: Future<Output = Result<T, Status>> + Send + 'static,
    T: Send + 'static,
  {
    match self.spawn(future).await {
      Ok(result) => result,
      Err(join) => Err(Status::internal(format!("handler task failed: {}", join))),
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    if let Some(runtime) = self.runtime.take() {
      runtime.shutdown_background();
    }
  }
}
