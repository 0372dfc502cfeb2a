use futures_util::FutureExt;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, SentryFutureExt, TransactionContext};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Runs `callback` inside a Sentry transaction named after the job kind.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let hub = Arc::new(Hub::new_from_top(Hub::current()));
    let tx_ctx = TransactionContext::new(transaction_name, "summary_queue.execute");
    let tx = sentry_core::start_transaction(tx_ctx);
    hub.configure_scope(|scope| scope.set_span(Some(tx.clone().into())));

    let result = callback().bind_hub(hub).await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

/// Awaits `future`, turning a panic into `Err` with the panic message.
pub(crate) async fn catch_panic<T>(future: impl Future<Output = T>) -> Result<T, String> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|e| try_to_extract_panic_info(&*e))
}

/// Invokes a synchronous callback, swallowing any panic it raises.
pub(crate) fn call_ignoring_panics(callback: impl FnOnce()) {
    let _ = std::panic::catch_unwind(AssertUnwindSafe(callback));
}

/// Try to figure out what's in the box, and print it if we can.
///
/// The actual error type we will get from `panic::catch_unwind` is really poorly documented.
/// However, the `panic::set_hook` functions deal with a `PanicHookInfo` type, and its payload is
/// documented as "commonly but not always `&'static str` or `String`". So we try both of those,
/// and give up if we didn't get either.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> String {
    if let Some(x) = info.downcast_ref::<&'static str>() {
        format!("job panicked: {x}")
    } else if let Some(x) = info.downcast_ref::<String>() {
        format!("job panicked: {x}")
    } else {
        "job panicked".to_string()
    }
}
