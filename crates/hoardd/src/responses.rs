//! Streaming response plumbing shared by the handlers

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Response, Status};

use crate::error::ProxyError;

/// Items buffered per server-streaming response before backpressure
pub const STREAM_BUFFER: usize = 64;

/// An outbound server-streaming channel and its response.
pub fn stream_channel<T: Send + 'static>(
) -> (mpsc::Sender<Result<T, Status>>, Response<ReceiverStream<Result<T, Status>>>) {
  let (tx, rx) = mpsc::channel(STREAM_BUFFER);
  (tx, Response::new(ReceiverStream::new(rx)))
}

/// Report a streaming failure once; completion is just dropping the sender.
pub async fn fail_stream<T>(tx: &mpsc::Sender<Result<T, Status>>, err: ProxyError) {
  let _ = tx.send(Err(Status::from(err))).await;
}

/// Forward a converted item; a closed receiver means the client cancelled.
pub async fn send_item<T>(tx: &mpsc::Sender<Result<T, Status>>, item: T) -> bool {
  tx.send(Ok(item)).await.is_ok()
}

/// Parse the request's `grpc-timeout` header into a deadline.
pub fn request_deadline<T>(request: &tonic::Request<T>) -> Option<Duration> {
  let raw = request.metadata().get("grpc-timeout")?.to_str().ok()?;
  if raw.len() < 2 {
    return None;
  }
  let (digits, unit) = raw.split_at(raw.len() - 1);
  let value: u64 = digits.parse().ok()?;
  match unit {
    "H" => Some(Duration::from_secs(value * 3600)),
    "M" => Some(Duration::from_secs(value * 60)),
    "S" => Some(Duration::from_secs(value)),
    "m" => Some(Duration::from_millis(value)),
    "u" => Some(Duration::from_micros(value)),
    "n" => Some(Duration::from_nanos(value)),
    _ => None,
  }
}
