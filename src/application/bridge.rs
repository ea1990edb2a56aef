//! Turns callback-style completions into a single awaitable result.
//!
//! The broker client fires its callbacks on its own I/O thread. Nothing derived from a
//! callback runs there: the resuming logic is redispatched onto the execution context
//! of the suspended caller, so slow caller code can never starve the client.

use crate::domain::ResumeError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, trace};

const DEFAULT_DISPATCHER_THREADS: usize = 2;

static DEFAULT_DISPATCHER: OnceLock<Result<Runtime, String>> = OnceLock::new();

/// The shared runtime used when a suspension happens outside of any tokio runtime and
/// no dispatcher was configured.
fn default_dispatcher() -> Result<Handle, ResumeError> {
    DEFAULT_DISPATCHER
        .get_or_init(|| {
            Builder::new_multi_thread()
                .worker_threads(DEFAULT_DISPATCHER_THREADS)
                .thread_name("kkafka-dispatcher")
                .enable_all()
                .build()
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map(|runtime| runtime.handle().clone())
        .map_err(|e| ResumeError::NoDispatcher(e.clone()))
}

/// Decides where suspended calls resume.
///
/// With an explicit dispatcher every resumption runs there. Otherwise the runtime of
/// the caller at the moment it suspends is used, and outside any runtime a shared
/// default runtime with two `kkafka-dispatcher` threads.
#[derive(Debug, Clone, Default)]
pub struct SuspensionBridge {
    dispatcher: Option<Handle>,
}

impl SuspensionBridge {
    pub fn new(dispatcher: Handle) -> Self {
        Self {
            dispatcher: Some(dispatcher),
        }
    }

    pub fn dispatcher(&self) -> Result<Handle, ResumeError> {
        if let Some(handle) = &self.dispatcher {
            return Ok(handle.clone());
        }
        match Handle::try_current() {
            Ok(handle) => Ok(handle),
            Err(_) => default_dispatcher(),
        }
    }

    /// Hands a [`Completion`] to `register` and waits until it is resolved.
    ///
    /// `register` is expected to pass the completion to a callback that fires exactly
    /// once. A completion dropped without being resolved fails the call with
    /// [`ResumeError::Dropped`]. There is no timeout or cancellation here: dropping the
    /// returned future leaves the underlying broker call outstanding.
    pub async fn suspend<T, E, F>(&self, register: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<ResumeError> + Send + 'static,
        F: FnOnce(Completion<T, E>),
    {
        let dispatcher = self.dispatcher().map_err(E::from)?;
        let (sender, receiver) = oneshot::channel();

        register(Completion { sender, dispatcher });

        receiver
            .await
            .unwrap_or_else(|_| Err(E::from(ResumeError::Dropped)))
    }
}

/// The pending side of one suspended call. Consumed when resolved, so it resolves at
/// most once.
pub struct Completion<T, E> {
    sender: oneshot::Sender<Result<T, E>>,
    dispatcher: Handle,
}

impl<T, E> Completion<T, E>
where
    T: Send + 'static,
    E: From<ResumeError> + Send + 'static,
{
    /// Runs `resume` on the caller's execution context and delivers its outcome.
    ///
    /// A panic inside `resume` becomes [`ResumeError::Panicked`] for the suspended
    /// caller and never unwinds into the thread that invoked this method.
    pub fn resume_with<F>(self, resume: F)
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let Completion { sender, dispatcher } = self;
        trace!("redispatching completion onto the caller's execution context");

        dispatcher.spawn(async move {
            let result = panic::catch_unwind(AssertUnwindSafe(resume)).unwrap_or_else(|payload| {
                Err(E::from(ResumeError::Panicked(panic_message(payload.as_ref()))))
            });

            if sender.send(result).is_err() {
                debug!("suspended caller went away before its completion was delivered");
            }
        });
    }

    pub fn resume(self, result: Result<T, E>) {
        self.resume_with(move || result)
    }

    /// Resolves from the `(value, error)` pair of a two-argument callback. An error wins
    /// over a value; neither is reported as [`ResumeError::Empty`].
    pub fn complete(self, value: Option<T>, error: Option<E>) {
        self.resume_with(move || match (value, error) {
            (_, Some(error)) => Err(error),
            (Some(value), None) => Ok(value),
            (None, None) => Err(E::from(ResumeError::Empty)),
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
