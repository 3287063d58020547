//! The cooperative operation runtime.
//!
//! An [`Operation`] is a shared handle to a deferred computation. Bodies are
//! plain `async` blocks producing `Result<R>`; they are stepped explicitly
//! by [`Operation::resume`], either from socket callbacks or from a waker
//! installed when one operation awaits another. There is no reactor and no
//! thread pool: the simulator event queue is the only driver of progress,
//! and between suspension points a body runs to completion atomically.
//!
//! A handle clone observes the same completion. External termination via
//! [`Operation::terminate`] freezes the result, cancels the suspended body,
//! and fires completion callbacks, so every awaiter observes resolution.

use std::cell::RefCell;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::error::{Error, Result};
use crate::sim::{Simulator, Time};

type Body<R> = Pin<Box<dyn Future<Output = Result<R>>>>;

/// Completion callback. Invoked exactly once with the operation's result or
/// captured failure. Inspect the provided references rather than calling
/// back into the operation.
type Completion<R> = Box<dyn FnOnce(Option<&R>, Option<&Error>)>;

struct Shared<R> {
    done: bool,
    result: Option<R>,
    failure: Option<Error>,
    completions: Vec<Completion<R>>,
    wakers: Vec<Waker>,
    body: Option<Body<R>>,
    polling: bool,
    repoll: bool,
}

impl<R> Shared<R> {
    fn empty() -> Self {
        Shared {
            done: false,
            result: None,
            failure: None,
            completions: Vec::new(),
            wakers: Vec::new(),
            body: None,
            polling: false,
            repoll: false,
        }
    }
}

/// Handle to a deferred, possibly shared computation.
pub struct Operation<R: 'static> {
    shared: Rc<RefCell<Shared<R>>>,
}

impl<R> Clone for Operation<R> {
    fn clone(&self) -> Self {
        Operation {
            shared: self.shared.clone(),
        }
    }
}

impl<R: 'static> Operation<R> {
    fn from_shared(shared: Shared<R>) -> Self {
        Operation {
            shared: Rc::new(RefCell::new(shared)),
        }
    }

    /// Enter a coroutine body. The body runs eagerly up to its first
    /// suspension point before this returns.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<R>> + 'static,
    {
        let mut shared = Shared::empty();
        shared.body = Some(Box::pin(future));
        let op = Self::from_shared(shared);
        op.resume();
        op
    }

    /// A manual-termination placeholder: never progresses on its own, and
    /// resolves only through [`Operation::terminate`].
    pub fn pending() -> Self {
        Self::from_shared(Shared::empty())
    }

    /// A pre-suspended body that resolves to `value` on its first resume.
    pub fn placeholder(value: R) -> Self {
        Self::spawn(async move {
            yield_now().await;
            Ok(value)
        })
    }

    /// An already-resolved operation.
    pub fn completed(value: R) -> Self {
        let mut shared = Shared::empty();
        shared.done = true;
        shared.result = Some(value);
        Self::from_shared(shared)
    }

    /// An already-failed operation.
    pub fn failed(error: Error) -> Self {
        let mut shared = Shared::empty();
        shared.done = true;
        shared.failure = Some(error);
        Self::from_shared(shared)
    }

    /// A body that re-evaluates `condition` on every wake and resolves to
    /// `provider()` once it holds. The condition is checked eagerly, so an
    /// immediately-true condition resolves before this returns.
    pub fn poll_with<C, P>(mut condition: C, provider: P) -> Self
    where
        C: FnMut() -> bool + 'static,
        P: FnOnce() -> R + 'static,
    {
        Self::spawn(async move {
            while !condition() {
                yield_now().await;
            }
            Ok(provider())
        })
    }

    /// A placeholder that the simulator terminates with `timeout_value`
    /// after `delay`, unless resolved earlier.
    pub fn with_timeout(sim: &Simulator, placeholder: R, timeout_value: R, delay: Time) -> Self {
        let op = Self::placeholder(placeholder);
        let timed = op.clone();
        sim.schedule(delay, move || timed.terminate(timeout_value));
        op
    }

    /// True once the operation has resolved.
    #[inline]
    pub fn done(&self) -> bool {
        self.shared.borrow().done
    }

    /// Step the body once. Returns `done()`.
    ///
    /// A wake arriving while the body is mid-poll is coalesced into one
    /// follow-up poll rather than recursing.
    pub fn resume(&self) -> bool {
        loop {
            let mut body = {
                let mut s = self.shared.borrow_mut();
                if s.done {
                    return true;
                }
                if s.polling {
                    s.repoll = true;
                    return false;
                }
                match s.body.take() {
                    Some(body) => {
                        s.polling = true;
                        body
                    }
                    // Manual-termination placeholder: nothing to step.
                    None => return false,
                }
            };

            let waker = waker_for(&self.shared);
            let mut cx = Context::from_waker(&waker);
            let polled = body.as_mut().poll(&mut cx);

            let mut s = self.shared.borrow_mut();
            s.polling = false;
            match polled {
                Poll::Ready(output) => {
                    if s.done {
                        // Terminated while polling; the late return loses.
                        return true;
                    }
                    match output {
                        Ok(value) => s.result = Some(value),
                        Err(error) => s.failure = Some(error),
                    }
                    s.done = true;
                    drop(s);
                    drop(body);
                    finish(&self.shared);
                    return true;
                }
                Poll::Pending => {
                    if s.done {
                        // Terminated while polling; drop the body here.
                        return true;
                    }
                    s.body = Some(body);
                    if !std::mem::take(&mut s.repoll) {
                        return false;
                    }
                }
            }
        }
    }

    /// Externally force the resolution to `value`. Idempotent; the
    /// suspended body is cancelled so no dangling suspension remains, and
    /// completion callbacks fire as for a normal resolution.
    pub fn terminate(&self, value: R) {
        let body = {
            let mut s = self.shared.borrow_mut();
            if s.done {
                return;
            }
            s.done = true;
            s.result = Some(value);
            s.body.take()
        };
        drop(body);
        finish(&self.shared);
    }

    /// As [`terminate`](Self::terminate), but resolving to a failure.
    pub fn terminate_err(&self, error: Error) {
        let body = {
            let mut s = self.shared.borrow_mut();
            if s.done {
                return;
            }
            s.done = true;
            s.failure = Some(error);
            s.body.take()
        };
        drop(body);
        finish(&self.shared);
    }

    /// Register a completion callback. If the operation is already done the
    /// callback is invoked synchronously; otherwise callbacks fire in
    /// registration order at resolution.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Option<&R>, Option<&Error>) + 'static,
    {
        let already_done = {
            let mut s = self.shared.borrow_mut();
            if !s.done {
                s.completions.push(Box::new(f));
                return;
            }
            true
        };
        debug_assert!(already_done);
        let s = self.shared.borrow();
        f(s.result.as_ref(), s.failure.as_ref());
    }

    /// The resolved value, or the captured failure. The failure is consumed
    /// by the first reader; later readers observe [`Error::Aborted`].
    pub fn result(&self) -> Result<R>
    where
        R: Clone,
    {
        let mut s = self.shared.borrow_mut();
        if !s.done {
            return Err(Error::Protocol("operation is not complete".into()));
        }
        if let Some(error) = s.failure.take() {
            return Err(error);
        }
        s.result.clone().ok_or(Error::Aborted)
    }

    /// Chain a transform over the resolved value.
    pub fn then<U, F>(&self, f: F) -> Operation<U>
    where
        R: Clone,
        U: 'static,
        F: FnOnce(R) -> U + 'static,
    {
        let source = self.clone();
        Operation::spawn(async move { Ok(f(source.await?)) })
    }
}

/// Fire completion callbacks and wakers after resolution.
///
/// Result and failure are lent to the callbacks and restored afterwards;
/// callbacks registered by other callbacks are drained in turn.
fn finish<R>(shared: &Rc<RefCell<Shared<R>>>) {
    loop {
        let (completions, wakers, result, failure) = {
            let mut s = shared.borrow_mut();
            if s.completions.is_empty() && s.wakers.is_empty() {
                return;
            }
            (
                std::mem::take(&mut s.completions),
                std::mem::take(&mut s.wakers),
                s.result.take(),
                s.failure.take(),
            )
        };
        for completion in completions {
            completion(result.as_ref(), failure.as_ref());
        }
        {
            let mut s = shared.borrow_mut();
            if s.result.is_none() {
                s.result = result;
            }
            if s.failure.is_none() {
                s.failure = failure;
            }
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<R: Clone + 'static> Future for Operation<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut s = self.shared.borrow_mut();
        if s.done {
            if let Some(error) = s.failure.take() {
                return Poll::Ready(Err(error));
            }
            return Poll::Ready(s.result.clone().ok_or(Error::Aborted));
        }
        s.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

impl<R> PartialEq for Operation<R> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<R> Eq for Operation<R> {}

impl<R> PartialOrd for Operation<R> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<R> Ord for Operation<R> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (Rc::as_ptr(&self.shared) as usize).cmp(&(Rc::as_ptr(&other.shared) as usize))
    }
}

impl<R> Hash for Operation<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.shared) as usize).hash(state);
    }
}

impl<R> std::fmt::Debug for Operation<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("handle", &Rc::as_ptr(&self.shared))
            .field("done", &self.shared.borrow().done)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Waker plumbing
// ---------------------------------------------------------------------------
//
// A waker re-enters `resume` on the operation whose body registered it.
// The runtime is single-threaded, so the waker is built from a raw vtable
// over an `Rc` rather than the `Send + Sync` `Arc` route.

fn waker_for<R: 'static>(shared: &Rc<RefCell<Shared<R>>>) -> Waker {
    let data = Rc::into_raw(shared.clone()) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(data, vtable::<R>())) }
}

fn vtable<R: 'static>() -> &'static RawWakerVTable {
    struct VTable<R>(PhantomData<R>);
    impl<R: 'static> VTable<R> {
        const TABLE: RawWakerVTable = RawWakerVTable::new(
            clone_raw::<R>,
            wake_raw::<R>,
            wake_by_ref_raw::<R>,
            drop_raw::<R>,
        );
    }
    &VTable::<R>::TABLE
}

unsafe fn clone_raw<R: 'static>(data: *const ()) -> RawWaker {
    let rc = Rc::from_raw(data as *const RefCell<Shared<R>>);
    let cloned = rc.clone();
    std::mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), vtable::<R>())
}

unsafe fn wake_raw<R: 'static>(data: *const ()) {
    let rc = Rc::from_raw(data as *const RefCell<Shared<R>>);
    Operation { shared: rc }.resume();
}

unsafe fn wake_by_ref_raw<R: 'static>(data: *const ()) {
    let rc = Rc::from_raw(data as *const RefCell<Shared<R>>);
    let op = Operation { shared: rc.clone() };
    std::mem::forget(rc);
    op.resume();
}

unsafe fn drop_raw<R: 'static>(data: *const ()) {
    drop(Rc::from_raw(data as *const RefCell<Shared<R>>));
}

// ---------------------------------------------------------------------------
// Await adapters
// ---------------------------------------------------------------------------

/// Suspend exactly once. Progress requires an explicit `resume` on the
/// enclosing operation; no waker is registered.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            Poll::Pending
        }
    }
}

/// Conditional suspension: ready immediately when `ready` is true,
/// otherwise behaves like [`yield_now`].
pub fn suspend_unless(ready: bool) -> SuspendUnless {
    SuspendUnless { ready }
}

pub struct SuspendUnless {
    ready: bool,
}

impl Future for SuspendUnless {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.ready {
            Poll::Ready(())
        } else {
            self.ready = true;
            Poll::Pending
        }
    }
}
