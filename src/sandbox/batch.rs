//! Batch orchestration: one script, many payloads.
//!
//! Items are started in input order, at most `concurrency` at a time, each
//! with its own per-run timeout. An optional total deadline bounds the
//! whole batch: when it passes, in-flight runs are cancelled and reported
//! as timed out, items not yet started are reported as not started, and
//! finished items keep their outcome. The result is always index-aligned
//! with the input.

use std::time::Instant;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{BatchOutcome, RunError, RunOutcome, Sandbox};

impl Sandbox {
    /// Runs the script once per payload and returns one outcome per input,
    /// in input order.
    pub async fn run_many(&self, payloads: Vec<Value>) -> BatchOutcome {
        let span = info_span!("batch", batch_id = %Uuid::new_v4(), items = payloads.len());
        self.run_batch(payloads).instrument(span).await
    }

    async fn run_batch(&self, payloads: Vec<Value>) -> BatchOutcome {
        let total = payloads.len();
        if total == 0 {
            return BatchOutcome::new(Vec::new());
        }

        let started = Instant::now();
        let limit = self.options.concurrency.max(1);
        let deadline = CancellationToken::new();
        let token = &deadline;

        let mut runs = futures::stream::iter(payloads.into_iter().enumerate())
            .map(|(index, payload)| async move {
                if token.is_cancelled() {
                    debug!(index, "Batch deadline passed, item not started");
                    return (index, RunOutcome::failure(Vec::new(), RunError::not_started()));
                }
                let outcome = self
                    .run(payload, Some(token))
                    .instrument(info_span!("item", index))
                    .await;
                (index, outcome)
            })
            .buffer_unordered(limit);

        let expiry = async {
            match self.options.total_timeout {
                Some(total_timeout) => tokio::time::sleep(total_timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        let mut slots: Vec<Option<RunOutcome>> = vec![None; total];
        loop {
            tokio::select! {
                next = runs.next() => match next {
                    Some((index, outcome)) => slots[index] = Some(outcome),
                    None => break,
                },
                _ = &mut expiry, if !token.is_cancelled() => {
                    let done = slots.iter().filter(|s| s.is_some()).count();
                    warn!("Batch deadline exceeded with {done}/{total} items finished, cancelling the rest");
                    token.cancel();
                }
            }
        }
        drop(runs);

        let outcomes: Vec<RunOutcome> = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    RunOutcome::failure(Vec::new(), RunError::internal("batch item produced no outcome"))
                })
            })
            .collect();
        let batch = BatchOutcome::new(outcomes);

        info!(
            "Batch finished: {}/{total} succeeded in {}ms",
            batch.succeeded(),
            started.elapsed().as_millis()
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::backend::{JsBackend, NativeBackend};
    use crate::config::SandboxOptions;
    use crate::error::ScriptError;
    use crate::sandbox::{Bindings, ErrorKind, ExecutionContext, LogLevel, LogRecord, Sandbox};

    /// Sleeps `payload.ms` milliseconds, then returns `payload.id`.
    fn sleeper() -> NativeBackend {
        NativeBackend::new().register("sleep", |ctx: ExecutionContext| async move {
            let ms = ctx.payload()["ms"].as_u64().unwrap_or(0);
            ctx.logs().log(vec![ctx.payload()["id"].clone()]);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, ScriptError>(ctx.payload()["id"].clone())
        })
    }

    fn sandbox(backend: NativeBackend, options: SandboxOptions) -> Sandbox {
        Sandbox::new("sleep", Bindings::new(), options, Arc::new(backend)).unwrap()
    }

    fn item(id: u64, ms: u64) -> serde_json::Value {
        json!({"id": id, "ms": ms})
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let outcome = sandbox(sleeper(), SandboxOptions::default()).run_many(vec![]).await;
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn test_results_index_aligned() {
        let options = SandboxOptions::default().with_concurrency(3);
        // Later items finish first.
        let payloads = vec![item(0, 90), item(1, 50), item(2, 10)];
        let outcome = sandbox(sleeper(), options).run_many(payloads).await;

        assert_eq!(outcome.len(), 3);
        for (index, run) in outcome.iter().enumerate() {
            assert_eq!(run.result(), Some(&json!(index)));
            assert_eq!(run.logs(), &[LogRecord::new(LogLevel::Log, vec![json!(index)])]);
        }
        assert_eq!(outcome.succeeded(), 3);
    }

    #[tokio::test]
    async fn test_concurrency_cap_respected() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let backend = NativeBackend::new().register("sleep", move |_ctx: ExecutionContext| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ScriptError>(json!(null))
            }
        });

        let options = SandboxOptions::default().with_concurrency(2);
        let outcome = sandbox(backend, options)
            .run_many((0..6).map(|i| item(i, 0)).collect())
            .await;

        assert_eq!(outcome.succeeded(), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sequential_by_default() {
        let started = std::time::Instant::now();
        let outcome = sandbox(sleeper(), SandboxOptions::default())
            .run_many(vec![item(0, 40), item(1, 40), item(2, 40)])
            .await;
        assert_eq!(outcome.succeeded(), 3);
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_per_item_timeout_does_not_affect_others() {
        let options = SandboxOptions::default()
            .with_timeout(100u64)
            .unwrap()
            .with_concurrency(3);
        let outcome = sandbox(sleeper(), options)
            .run_many(vec![item(0, 10), item(1, 1000), item(2, 10)])
            .await;

        assert_eq!(outcome[0].result(), Some(&json!(0)));
        assert!(outcome[1].error().unwrap().is_timeout());
        assert_eq!(outcome[1].logs(), &[LogRecord::new(LogLevel::Log, vec![json!(1)])]);
        assert_eq!(outcome[2].result(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_total_deadline_keeps_finished_and_marks_rest() {
        // Sequential, 100ms per item, 250ms total: items 0 and 1 finish,
        // item 2 is cut mid-flight, items 3 and 4 never start.
        let options = SandboxOptions::default()
            .with_timeout("1s")
            .unwrap()
            .with_total_timeout("250ms")
            .unwrap();
        let payloads = (0..5).map(|i| item(i, 100)).collect();

        let started = std::time::Instant::now();
        let outcome = sandbox(sleeper(), options).run_many(payloads).await;
        let elapsed = started.elapsed();

        assert_eq!(outcome.len(), 5);
        assert_eq!(outcome[0].result(), Some(&json!(0)));
        assert_eq!(outcome[1].result(), Some(&json!(1)));

        let cut = outcome[2].error().unwrap();
        assert!(cut.is_timeout());
        assert!(cut.message.contains("batch deadline"));

        for index in 3..5 {
            let err = outcome[index].error().unwrap();
            assert_eq!(err.kind, ErrorKind::NotStarted);
            assert!(outcome[index].logs().is_empty());
        }
        assert!(elapsed < Duration::from_millis(450), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_total_deadline_not_reached() {
        let options = SandboxOptions::default()
            .with_concurrency(2)
            .with_total_timeout("2s")
            .unwrap();
        let outcome = sandbox(sleeper(), options)
            .run_many(vec![item(0, 10), item(1, 10)])
            .await;
        assert_eq!(outcome.succeeded(), 2);
    }

    #[tokio::test]
    async fn test_compile_error_for_every_item() {
        let sandbox = Sandbox::new(
            "return (;",
            Bindings::new(),
            SandboxOptions::default(),
            Arc::new(JsBackend::default()),
        )
        .unwrap();
        let outcome = sandbox.run_many(vec![json!({}), json!({})]).await;
        assert_eq!(outcome.len(), 2);
        for run in &outcome {
            assert_eq!(run.error().unwrap().kind, ErrorKind::Compile);
        }
    }

    #[tokio::test]
    async fn test_js_batch_isolation() {
        let sandbox = Sandbox::new(
            "payload.seen = true; console.log(payload.n); return payload;",
            Bindings::new().data("limit", json!(10)),
            SandboxOptions::default().with_concurrency(4),
            Arc::new(JsBackend::default()),
        )
        .unwrap();
        let payloads = (0..4).map(|n| json!({"n": n})).collect();
        let outcome = sandbox.run_many(payloads).await;

        for (n, run) in outcome.iter().enumerate() {
            assert_eq!(run.result(), Some(&json!({"n": n, "seen": true})));
            assert_eq!(run.logs().len(), 1);
            assert_eq!(run.logs()[0].data, vec![json!(n)]);
        }
    }
}
