//! Ordered, failure-isolated observer registries.
//!
//! Subscribers are held weakly: the subscribing side owns the `Arc` and the
//! registry drops the entry lazily once that `Arc` is gone. A subscriber that
//! returns an error or panics is logged and skipped; the remaining
//! subscribers still run.
//!
//! An *overridable* registry returns the first answer other than
//! [`Verdict::Proceed`], which lets game rules veto ([`Verdict::Cancel`]) or
//! rewrite ([`Verdict::Replace`]) an action before it is committed. Later
//! subscribers are still called; their verdicts are discarded.

use futures::future::BoxFuture;
use futures::FutureExt;
use log::error;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

pub type HookError = Box<dyn std::error::Error + Send + Sync>;
pub type HookResult<T> = Result<Verdict<T>, HookError>;

/// A subscriber's answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<T> {
    /// No opinion; carry on with the default.
    Proceed,
    /// Abort the action entirely.
    Cancel,
    /// Carry on with this value in place of the default.
    Replace(T),
}

pub type Handler<A, T> = Arc<dyn Fn(&A) -> HookResult<T> + Send + Sync>;
pub type AsyncHandler<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, HookResult<T>> + Send + Sync>;

pub fn handler<A, T, F>(f: F) -> Handler<A, T>
where
    F: Fn(&A) -> HookResult<T> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps a plain callback that never has an opinion.
pub fn notify<A, F>(f: F) -> Handler<A, ()>
where
    A: 'static,
    F: Fn(&A) + Send + Sync + 'static,
{
    Arc::new(move |args: &A| {
        f(args);
        Ok(Verdict::Proceed)
    })
}

pub fn async_handler<A, T, F, Fut>(f: F) -> AsyncHandler<A, T>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookResult<T>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// Storage shared by both registry flavours.
struct Subscribers<F: ?Sized> {
    entries: Vec<Weak<F>>,
    overridable: bool,
}

impl<F: ?Sized> Subscribers<F> {
    fn new(overridable: bool) -> Self {
        Self {
            entries: Vec::new(),
            overridable,
        }
    }

    fn subscribe(&mut self, handler: &Arc<F>) {
        self.entries.push(Arc::downgrade(handler));
    }

    fn unsubscribe(&mut self, handler: &Arc<F>) -> bool {
        let mut removed = false;
        self.entries.retain(|entry| match entry.upgrade() {
            None => false,
            Some(live) if !removed && Arc::ptr_eq(&live, handler) => {
                removed = true;
                false
            }
            Some(_) => true,
        });
        removed
    }

    /// Prunes dead entries and returns the live ones in attach order.
    fn live(&mut self) -> Vec<Arc<F>> {
        let mut live = Vec::with_capacity(self.entries.len());
        self.entries.retain(|entry| match entry.upgrade() {
            Some(handler) => {
                live.push(handler);
                true
            }
            None => false,
        });
        live
    }

    fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}

/// Synchronous registry.
pub struct Event<A, T = ()> {
    subscribers: Subscribers<dyn Fn(&A) -> HookResult<T> + Send + Sync>,
}

impl<A, T> Event<A, T> {
    pub fn new() -> Self {
        Self {
            subscribers: Subscribers::new(false),
        }
    }

    pub fn overridable() -> Self {
        Self {
            subscribers: Subscribers::new(true),
        }
    }

    pub fn is_overridable(&self) -> bool {
        self.subscribers.overridable
    }

    pub fn subscribe(&mut self, handler: &Handler<A, T>) {
        self.subscribers.subscribe(handler);
    }

    pub fn unsubscribe(&mut self, handler: &Handler<A, T>) -> bool {
        self.subscribers.unsubscribe(handler)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn call(&mut self, args: &A) -> Verdict<T> {
        let overridable = self.subscribers.overridable;
        let mut result = Verdict::Proceed;
        for handler in self.subscribers.live() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
                Ok(Ok(Verdict::Proceed)) => {}
                Ok(Ok(verdict)) => {
                    if overridable && matches!(result, Verdict::Proceed) {
                        result = verdict;
                    }
                }
                Ok(Err(e)) => error!("Ignoring error in event hook: {}", e),
                Err(_) => error!("Ignoring panic in event hook"),
            }
        }
        result
    }
}

impl<A, T> Default for Event<A, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry whose subscribers may suspend. Subscribers still run strictly
/// one after another; there is no concurrent fan-out.
pub struct AsyncEvent<A, T = ()> {
    subscribers: Subscribers<dyn Fn(A) -> BoxFuture<'static, HookResult<T>> + Send + Sync>,
}

impl<A, T> AsyncEvent<A, T>
where
    A: Clone + Send,
    T: Send,
{
    pub fn new() -> Self {
        Self {
            subscribers: Subscribers::new(false),
        }
    }

    pub fn overridable() -> Self {
        Self {
            subscribers: Subscribers::new(true),
        }
    }

    pub fn is_overridable(&self) -> bool {
        self.subscribers.overridable
    }

    pub fn subscribe(&mut self, handler: &AsyncHandler<A, T>) {
        self.subscribers.subscribe(handler);
    }

    pub fn unsubscribe(&mut self, handler: &AsyncHandler<A, T>) -> bool {
        self.subscribers.unsubscribe(handler)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn call(&mut self, args: A) -> Verdict<T> {
        let overridable = self.subscribers.overridable;
        let mut result = Verdict::Proceed;
        for handler in self.subscribers.live() {
            let args = args.clone();
            let outcome = AssertUnwindSafe(async move { handler(args).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(Verdict::Proceed)) => {}
                Ok(Ok(verdict)) => {
                    if overridable && matches!(result, Verdict::Proceed) {
                        result = verdict;
                    }
                }
                Ok(Err(e)) => error!("Ignoring error in async event hook: {}", e),
                Err(_) => error!("Ignoring panic in async event hook"),
            }
        }
        result
    }
}

impl<A, T> Default for AsyncEvent<A, T>
where
    A: Clone + Send,
    T: Send,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Handler<u32, u32> {
        let log = Arc::clone(log);
        handler(move |_: &u32| {
            log.lock().unwrap().push(name);
            Ok(Verdict::Proceed)
        })
    }

    #[test]
    fn test_plain_event_calls_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&log, "a");
        let b = recorder(&log, "b");
        let c = recorder(&log, "c");

        let mut event = Event::new();
        event.subscribe(&a);
        event.subscribe(&b);
        event.subscribe(&c);

        assert_eq!(event.call(&1), Verdict::Proceed);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_plain_event_ignores_answers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let replacing: Handler<u32, u32> = handler(|_| Ok(Verdict::Replace(5)));
        let counting: Handler<u32, u32> = handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Verdict::Proceed)
        });

        let mut event = Event::new();
        event.subscribe(&replacing);
        event.subscribe(&counting);

        assert_eq!(event.call(&0), Verdict::Proceed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_first_override_wins_and_later_hooks_still_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = recorder(&log, "first");
        let second_log = Arc::clone(&log);
        let second: Handler<u32, u32> = handler(move |value| {
            second_log.lock().unwrap().push("second");
            Ok(Verdict::Replace(value * 10))
        });
        let third = recorder(&log, "third");

        let mut event = Event::overridable();
        event.subscribe(&first);
        event.subscribe(&second);
        event.subscribe(&third);

        assert_eq!(event.call(&4), Verdict::Replace(40));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_later_verdicts_are_discarded() {
        let cancel: Handler<u32, u32> = handler(|_| Ok(Verdict::Cancel));
        let replace: Handler<u32, u32> = handler(|value| Ok(Verdict::Replace(*value)));

        let mut event = Event::overridable();
        event.subscribe(&cancel);
        event.subscribe(&replace);
        assert_eq!(event.call(&7), Verdict::Cancel);
    }

    #[test]
    fn test_cancel_is_distinct_from_proceed() {
        let cancel: Handler<u32, u32> = handler(|_| Ok(Verdict::Cancel));
        let mut event = Event::overridable();
        assert_eq!(event.call(&0), Verdict::Proceed);

        event.subscribe(&cancel);
        assert_eq!(event.call(&0), Verdict::Cancel);
    }

    #[test]
    fn test_failing_subscribers_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let erroring: Handler<u32, u32> = handler(|_| Err("boom".into()));
        let panicking: Handler<u32, u32> = handler(|_| panic!("hook exploded"));
        let last = recorder(&log, "last");

        let mut event = Event::overridable();
        event.subscribe(&erroring);
        event.subscribe(&panicking);
        event.subscribe(&last);

        assert_eq!(event.call(&0), Verdict::Proceed);
        assert_eq!(*log.lock().unwrap(), vec!["last"]);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let keep = recorder(&log, "keep");
        let gone = recorder(&log, "gone");

        let mut event = Event::new();
        event.subscribe(&gone);
        event.subscribe(&keep);
        assert_eq!(event.len(), 2);

        drop(gone);
        assert_eq!(event.len(), 1);
        event.call(&0);
        assert_eq!(*log.lock().unwrap(), vec!["keep"]);
        assert_eq!(event.subscribers.entries.len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&log, "a");
        let b = recorder(&log, "b");

        let mut event = Event::new();
        event.subscribe(&a);
        event.subscribe(&b);

        assert!(event.unsubscribe(&a));
        assert!(!event.unsubscribe(&a));
        event.call(&0);
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_notify_helper() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let hook = notify(move |value: &usize| {
            counter.fetch_add(*value, Ordering::SeqCst);
        });

        let mut event: Event<usize> = Event::new();
        event.subscribe(&hook);
        event.call(&3);
        event.call(&4);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_async_event_runs_sequentially() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow_log = Arc::clone(&log);
        let slow: AsyncHandler<u32, u32> = async_handler(move |_| {
            let log = Arc::clone(&slow_log);
            async move {
                log.lock().unwrap().push("slow:start");
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push("slow:end");
                Ok(Verdict::Proceed)
            }
        });
        let fast_log = Arc::clone(&log);
        let fast: AsyncHandler<u32, u32> = async_handler(move |value| {
            let log = Arc::clone(&fast_log);
            async move {
                log.lock().unwrap().push("fast");
                Ok(Verdict::Replace(value + 1))
            }
        });

        let mut event = AsyncEvent::overridable();
        event.subscribe(&slow);
        event.subscribe(&fast);

        assert_eq!(event.call(1).await, Verdict::Replace(2));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["slow:start", "slow:end", "fast"]
        );
    }

    #[tokio::test]
    async fn test_async_event_isolates_panics() {
        let panicking: AsyncHandler<u32, u32> =
            async_handler(|_| async { panic!("async hook exploded") });
        let cancel: AsyncHandler<u32, u32> = async_handler(|_| async { Ok(Verdict::Cancel) });

        let mut event = AsyncEvent::overridable();
        event.subscribe(&panicking);
        event.subscribe(&cancel);

        assert_eq!(event.call(0).await, Verdict::Cancel);
    }
}
