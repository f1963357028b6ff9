use crate::{Result, RpcError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub(super) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased processing function.
///
/// Takes the request payload and produces the response payload. Wrapped in
/// `Arc` so each delivery can move a cheap clone onto its own task.
pub(super) type BoxedHandler = Arc<dyn Fn(Bytes) -> BoxFuture<Result<Bytes>> + Send + Sync>;

/// Wrap a raw bytes-in, bytes-out processing function.
pub(super) fn wrap_handler<F, Fut>(handler: F) -> BoxedHandler
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    Arc::new(move |payload: Bytes| Box::pin(handler(payload)) as BoxFuture<Result<Bytes>>)
}

/// Wrap a typed processing function speaking JSON on both sides.
///
/// A payload that does not decode as `Req` is a processing failure.
pub(super) fn wrap_json_handler<F, Fut, Req, Resp>(handler: F) -> BoxedHandler
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    // ---
    let handler = Arc::new(handler);

    Arc::new(move |payload: Bytes| {
        let handler = handler.clone();
        Box::pin(async move {
            let req: Req = serde_json::from_slice(&payload)
                .map_err(|e| RpcError::Processing(format!("undecodable request: {e}")))?;

            let resp = handler(req).await?;
            Ok::<_, RpcError>(Bytes::from(serde_json::to_vec(&resp)?))
        }) as BoxFuture<Result<Bytes>>
    })
}
