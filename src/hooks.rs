use std::sync::Arc;

use futures_core::future::BoxFuture;

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// Runs before a request is executed, in registration order. May mutate
/// the request or wait for admission; returning an error aborts the
/// call before any attempt is made.
pub trait BeforeRequestHook: Send + Sync {
    fn enter<'a>(&'a self, request: &'a mut Request) -> BoxFuture<'a, Result<(), Error>>;
}

/// Runs after a call completes, success or failure, in registration
/// order. Exactly one of `response`/`error` is `Some` when the call ran
/// to a conclusion.
pub trait AfterResponseHook: Send + Sync {
    fn exit(&self, response: Option<&Response>, error: Option<&Error>);
}

/// A before-hook is either a plain synchronous closure or a stateful
/// callback such as an admission gate.
#[derive(Clone)]
pub enum BeforeHook {
    Func(Arc<dyn Fn(&mut Request) -> Result<(), Error> + Send + Sync>),
    Callback(Arc<dyn BeforeRequestHook>),
}

impl BeforeHook {
    pub fn func<F>(hook: F) -> Self
    where
        F: Fn(&mut Request) -> Result<(), Error> + Send + Sync + 'static,
    {
        Self::Func(Arc::new(hook))
    }

    pub fn callback(hook: Arc<dyn BeforeRequestHook>) -> Self {
        Self::Callback(hook)
    }

    pub(crate) async fn enter(&self, request: &mut Request) -> Result<(), Error> {
        match self {
            Self::Func(hook) => hook(request),
            Self::Callback(hook) => hook.enter(request).await,
        }
    }
}

/// An after-hook mirrors [`BeforeHook`]: a closure observing the
/// outcome, or the exit side of a stateful callback.
#[derive(Clone)]
pub enum AfterHook {
    Func(Arc<dyn Fn(Option<&Response>, Option<&Error>) + Send + Sync>),
    Callback(Arc<dyn AfterResponseHook>),
}

impl AfterHook {
    pub fn func<F>(hook: F) -> Self
    where
        F: Fn(Option<&Response>, Option<&Error>) + Send + Sync + 'static,
    {
        Self::Func(Arc::new(hook))
    }

    pub fn callback(hook: Arc<dyn AfterResponseHook>) -> Self {
        Self::Callback(hook)
    }

    pub(crate) fn exit(&self, response: Option<&Response>, error: Option<&Error>) {
        match self {
            Self::Func(hook) => hook(response, error),
            Self::Callback(hook) => hook.exit(response, error),
        }
    }
}
