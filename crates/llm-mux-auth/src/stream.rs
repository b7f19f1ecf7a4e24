//! Streaming executor pipeline.
//!
//! One wrapper owns all stream accounting: the upstream channel goes in, a
//! forward channel comes out, and exactly one terminal outcome is reported.
//! Client cancellation is not a provider fault and reports `Cancelled`,
//! which the manager does not feed into stats or usage.

use tokio::sync::mpsc;

use crate::errors::GatewayError;
use crate::executor::{RequestContext, StreamChunk};
use crate::usage::TokenUsage;

const FORWARD_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub enum StreamOutcome {
    Success { usage: Option<TokenUsage> },
    Failure {
        error: GatewayError,
        usage: Option<TokenUsage>,
    },
    Cancelled,
}

/// Wrap `upstream` into a forward channel, reporting the terminal outcome to
/// `on_complete` exactly once.
///
/// - Clean close with no error chunk: `Success`.
/// - First error chunk: `Failure`, reported immediately; later chunks are
///   still forwarded but never re-reported.
/// - Context cancelled or client receiver dropped before any error:
///   `Cancelled`. Dropping our upstream receiver tells the adapter to stop,
///   so no task outlives the stream.
pub fn forward_stream<F>(
    ctx: &RequestContext,
    mut upstream: mpsc::Receiver<StreamChunk>,
    on_complete: F,
) -> mpsc::Receiver<StreamChunk>
where
    F: FnOnce(StreamOutcome) + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FORWARD_BUFFER);
    let cancel = ctx.cancel.clone();

    tokio::spawn(async move {
        let mut on_complete = Some(on_complete);
        let mut usage: Option<TokenUsage> = None;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    report(&mut on_complete, StreamOutcome::Cancelled);
                    break;
                }
                chunk = upstream.recv() => chunk,
            };

            let Some(chunk) = chunk else {
                // Upstream closed cleanly; success unless an error chunk
                // already reported.
                report(&mut on_complete, StreamOutcome::Success { usage });
                break;
            };

            if let Some(chunk_usage) = chunk.usage {
                match usage.as_mut() {
                    Some(total) => total.merge(&chunk_usage),
                    None => usage = Some(chunk_usage),
                }
            }
            if let Some(err) = chunk.err.clone() {
                let usage = usage;
                report(&mut on_complete, StreamOutcome::Failure { error: err, usage });
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    report(&mut on_complete, StreamOutcome::Cancelled);
                    break;
                }
                sent = tx.send(chunk) => {
                    if sent.is_err() {
                        // Client receiver dropped: same as cancellation.
                        report(&mut on_complete, StreamOutcome::Cancelled);
                        break;
                    }
                }
            }
        }
        // `tx` drops here: the forward channel closes exactly once.
    });

    rx
}

fn report<F>(slot: &mut Option<F>, outcome: StreamOutcome)
where
    F: FnOnce(StreamOutcome) + Send + 'static,
{
    if let Some(f) = slot.take() {
        f(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    fn collector() -> (
        Arc<Mutex<Vec<StreamOutcome>>>,
        impl FnOnce(StreamOutcome) + Send + 'static,
    ) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        (outcomes, move |outcome| {
            sink.lock().unwrap().push(outcome);
        })
    }

    #[tokio::test]
    async fn clean_close_reports_success_once() {
        let ctx = RequestContext::new("t1");
        let (tx, upstream) = mpsc::channel(8);
        let (outcomes, on_complete) = collector();
        let mut rx = forward_stream(&ctx, upstream, on_complete);

        tx.send(StreamChunk::data(Bytes::from_static(b"a")))
            .await
            .unwrap();
        tx.send(StreamChunk::data(Bytes::from_static(b"b")))
            .await
            .unwrap();
        drop(tx);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none(), "forward channel closes");

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], StreamOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn one_error_chunk_reports_exactly_one_failure() {
        let ctx = RequestContext::new("t1");
        let (tx, upstream) = mpsc::channel(8);
        let (outcomes, on_complete) = collector();
        let mut rx = forward_stream(&ctx, upstream, on_complete);

        tx.send(StreamChunk::data(Bytes::from_static(b"a")))
            .await
            .unwrap();
        tx.send(StreamChunk::error(GatewayError::from_status(500, "boom")))
            .await
            .unwrap();
        tx.send(StreamChunk::error(GatewayError::from_status(500, "boom2")))
            .await
            .unwrap();
        drop(tx);

        let mut forwarded = 0;
        while rx.recv().await.is_some() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 3, "error chunks are forwarded too");

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1, "only the first error is recorded");
        assert!(matches!(outcomes[0], StreamOutcome::Failure { .. }));
    }

    #[tokio::test]
    async fn cancellation_reports_cancelled_and_stops_quickly() {
        let ctx = RequestContext::new("t1");
        let (tx, upstream) = mpsc::channel(8);
        let (outcomes, on_complete) = collector();
        let mut rx = forward_stream(&ctx, upstream, on_complete);

        tx.send(StreamChunk::data(Bytes::from_static(b"a")))
            .await
            .unwrap();
        tx.send(StreamChunk::data(Bytes::from_static(b"b")))
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());

        ctx.cancel.cancel();

        // The pipeline drops its upstream receiver promptly.
        let closed = tokio::time::timeout(Duration::from_millis(500), tx.closed()).await;
        assert!(closed.is_ok(), "upstream must be released within 500ms");

        tokio::time::sleep(Duration::from_millis(10)).await;
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], StreamOutcome::Cancelled));
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_cancellation() {
        let ctx = RequestContext::new("t1");
        let (tx, upstream) = mpsc::channel(8);
        let (outcomes, on_complete) = collector();
        let rx = forward_stream(&ctx, upstream, on_complete);
        drop(rx);

        // Fill past the forward buffer so the pipeline hits the closed
        // channel.
        for _ in 0..(FORWARD_BUFFER + 2) {
            if tx
                .send(StreamChunk::data(Bytes::from_static(b"x")))
                .await
                .is_err()
            {
                break;
            }
        }

        let closed = tokio::time::timeout(Duration::from_millis(500), tx.closed()).await;
        assert!(closed.is_ok());

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], StreamOutcome::Cancelled));
    }

    #[tokio::test]
    async fn usage_from_final_chunk_reaches_the_outcome() {
        let ctx = RequestContext::new("t1");
        let (tx, upstream) = mpsc::channel(8);
        let (outcomes, on_complete) = collector();
        let mut rx = forward_stream(&ctx, upstream, on_complete);

        let mut final_chunk = StreamChunk::data(Bytes::from_static(b"done"));
        final_chunk.usage = Some(TokenUsage {
            input: 10,
            output: 5,
            total: 15,
            ..Default::default()
        });
        tx.send(final_chunk).await.unwrap();
        drop(tx);

        while rx.recv().await.is_some() {}

        let outcomes = outcomes.lock().unwrap();
        match &outcomes[0] {
            StreamOutcome::Success { usage: Some(usage) } => {
                assert_eq!(usage.total, 15);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
