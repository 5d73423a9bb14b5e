//! Handler invocation and the per-subscription worker.

use super::Dispatched;
use crate::ports::inbound::{HandlerError, MessageHandler};
use eventbus_telemetry::{metric_inc, HANDLER_FAILURES};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// How one handler call ended.
#[derive(Debug)]
pub(crate) enum Invocation<T> {
    Completed(T),
    Failed(String),
    Panicked(String),
    TimedOut(Duration),
}

impl<T> Invocation<T> {
    pub(crate) fn cause(&self) -> &'static str {
        match self {
            Invocation::Completed(_) => "ok",
            Invocation::Failed(_) => "error",
            Invocation::Panicked(_) => "panic",
            Invocation::TimedOut(_) => "timeout",
        }
    }
}

/// Run a handler future, catching panics and enforcing `limit`.
pub(crate) async fn invoke<F, T>(call: F, limit: Option<Duration>) -> Invocation<T>
where
    F: Future<Output = Result<T, HandlerError>>,
{
    let guarded = AssertUnwindSafe(call).catch_unwind();
    let outcome = match limit {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => return Invocation::TimedOut(limit),
        },
        None => guarded.await,
    };
    match outcome {
        Ok(Ok(value)) => Invocation::Completed(value),
        Ok(Err(e)) => Invocation::Failed(e.to_string()),
        Err(payload) => Invocation::Panicked(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Start the worker for one subscription. Deliveries are handled one at a
/// time in arrival order; the worker stops once its sender is dropped and the
/// backlog is drained.
pub(crate) fn spawn_subscription_worker(
    runtime: &Handle,
    id: u64,
    handler: Arc<dyn MessageHandler>,
    limit: Option<Duration>,
) -> mpsc::UnboundedSender<Dispatched> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Dispatched>();
    runtime.spawn(async move {
        while let Some(Dispatched {
            message, settle, ..
        }) = rx.recv().await
        {
            let routing_key = message.routing_key().unwrap_or_default().to_string();
            let outcome = invoke(handler.handle(message), limit).await;
            match &outcome {
                Invocation::Completed(()) => {}
                Invocation::Failed(reason) => {
                    warn!(subscription = id, routing_key = %routing_key, error = %reason, "Subscription handler failed");
                }
                Invocation::Panicked(reason) => {
                    error!(subscription = id, routing_key = %routing_key, panic = %reason, "Subscription handler panicked");
                }
                Invocation::TimedOut(limit) => {
                    warn!(subscription = id, routing_key = %routing_key, ?limit, "Subscription handler timed out");
                }
            }
            let handled = matches!(outcome, Invocation::Completed(()));
            if !handled {
                metric_inc!(HANDLER_FAILURES, &["subscription", outcome.cause()]);
            }
            if let Some(settle) = settle {
                settle.finish(handled);
            }
        }
        debug!(subscription = id, "Subscription worker stopped");
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invoke_completed() {
        let outcome = invoke(async { Ok::<_, HandlerError>(7) }, None).await;
        assert!(matches!(outcome, Invocation::Completed(7)));
    }

    #[tokio::test]
    async fn test_invoke_reports_error_text() {
        let outcome = invoke(async { Err::<(), HandlerError>("bad input".into()) }, None).await;
        match outcome {
            Invocation::Failed(reason) => assert_eq!(reason, "bad input"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_catches_panics() {
        let outcome = invoke(
            async {
                if true {
                    panic!("boom");
                }
                Ok::<(), HandlerError>(())
            },
            None,
        )
        .await;
        match outcome {
            Invocation::Panicked(reason) => assert_eq!(reason, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_formatted_panic() {
        let code = 42;
        let outcome = invoke(
            async move {
                if code > 0 {
                    panic!("code {code}");
                }
                Ok::<(), HandlerError>(())
            },
            None,
        )
        .await;
        assert!(matches!(outcome, Invocation::Panicked(ref r) if r == "code 42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_times_out() {
        let outcome = invoke(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), HandlerError>(())
            },
            Some(Duration::from_secs(1)),
        )
        .await;
        assert!(matches!(outcome, Invocation::TimedOut(limit) if limit == Duration::from_secs(1)));
        assert_eq!(outcome.cause(), "timeout");
    }
}
