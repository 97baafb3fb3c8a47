//! Panic containment around handler invocations.
//!
//! A handler may panic while it is being called, while its future is polled,
//! or while that future is dropped. All of these happen inside a guarded scope; a panic there becomes an
//! [`Error::Panic`] carrying the message and a backtrace instead of tearing
//! down the task.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;

use crate::error::{BoxError, Error};

thread_local! {
    static GUARDED: Cell<usize> = const { Cell::new(0) };
    static LAST_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install the process-wide hook that records traces of contained panics.
///
/// Panics outside a guarded scope go to the previously installed hook.
pub(crate) fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARDED.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            let location = info
                .location()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown location".to_string());
            let trace = format!("panicked at {location}\n{}", Backtrace::force_capture());
            LAST_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
        }));
    });
}

fn guarded<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    GUARDED.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    GUARDED.with(|depth| depth.set(depth.get() - 1));
    result
}

fn payload_to_string(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn panic_error(payload: Box<dyn Any + Send>) -> Error {
    let trace = LAST_TRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_default();
    Error::Panic {
        message: payload_to_string(payload.as_ref()),
        trace,
    }
}

enum State {
    Running(BoxFuture<'static, Result<(), BoxError>>),
    Failed(Error),
    Finished,
}

/// Handler future whose panics surface as errors.
pub(crate) struct Contained {
    state: State,
}

impl Contained {
    /// Call `handler` with `arg` inside a guarded scope.
    pub(crate) fn invoke<A>(
        handler: &(dyn Fn(A) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync),
        arg: A,
    ) -> Self {
        install_panic_hook();
        let state = match guarded(|| handler(arg)) {
            Ok(fut) => State::Running(fut),
            Err(payload) => State::Failed(panic_error(payload)),
        };
        Self { state }
    }
}

impl Future for Contained {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Running(mut fut) => match guarded(|| fut.as_mut().poll(cx)) {
                Ok(Poll::Pending) => {
                    self.state = State::Running(fut);
                    Poll::Pending
                }
                Ok(Poll::Ready(result)) => match guarded(move || drop(fut)) {
                    Ok(()) => Poll::Ready(result.map_err(Error::Handler)),
                    Err(payload) => Poll::Ready(Err(panic_error(payload))),
                },
                Err(payload) => {
                    let err = panic_error(payload);
                    // Dropping a future that panicked mid-poll may panic again.
                    let _ = guarded(move || drop(fut));
                    Poll::Ready(Err(err))
                }
            },
            State::Failed(err) => Poll::Ready(Err(err)),
            State::Finished => Poll::Pending,
        }
    }
}

impl Drop for Contained {
    fn drop(&mut self) {
        // Cancelled mid-run; the handler future is dropped guarded as well.
        if let State::Running(fut) = std::mem::replace(&mut self.state, State::Finished) {
            let _ = guarded(move || drop(fut));
        }
    }
}
