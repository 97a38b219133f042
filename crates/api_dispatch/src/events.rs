//! Topic-keyed fan-out of payloads to asynchronous handlers.
//!
//! ```text
//! publish ──► intake queue ──► dispatch loop ──┬─► [queue for H1] ──► worker ──► H1(event)
//!                                              ├─► [queue for H2] ──► worker ──► H2(event)
//!                                              └─► ...
//! ```
//!
//! Every subscription owns an unbounded FIFO queue drained by its own worker
//! task. A handler therefore sees the events of its topic in publish order,
//! handlers of the same topic run concurrently with each other, and a slow or
//! failing handler never holds up publishing or any other handler.
//!
//! Handler errors and panics are reported through
//! [`EventHandlerFailed`](crate::internal_event::EventHandlerFailed) and never
//! reach the publisher.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use snafu::Snafu;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::Error;
use crate::internal_event::{EventDropped, EventHandlerFailed, EventPublished, emit};

#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[snafu(display("event bus has been stopped"))]
    Closed,

    #[snafu(display("event bus must be started from within a Tokio runtime"))]
    NoRuntime,
}

/// A published payload and the topic it was published under.
#[derive(Debug)]
pub struct Event<P> {
    topic: String,
    payload: P,
}

impl<P> Event<P> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }
}

type BoxedHandler<P> =
    Arc<dyn Fn(Arc<Event<P>>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;
type Queue<P> = mpsc::UnboundedSender<Arc<Event<P>>>;

struct Subscription<P> {
    id: usize,
    handler: BoxedHandler<P>,
    queue: Option<Queue<P>>,
}

/// Handlers per topic, in registration order. Registration is additive.
struct HandlerRegistry<P> {
    topics: HashMap<String, Vec<Subscription<P>>>,
}

impl<P> HandlerRegistry<P> {
    fn subscriptions_mut(&mut self) -> impl Iterator<Item = (&String, &mut Subscription<P>)> {
        self.topics
            .iter_mut()
            .flat_map(|(topic, subs)| subs.iter_mut().map(move |sub| (topic, sub)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

struct Inner<P> {
    registry: Mutex<HandlerRegistry<P>>,
    intake: Mutex<Option<Queue<P>>>,
    state: Mutex<State>,
    runtime: Mutex<Option<Handle>>,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<JoinSet<()>>,
    next_id: AtomicUsize,
}

pub struct EventBus<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for EventBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> fmt::Debug for EventBus<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("state", &*lock(&self.inner.state))
            .field("topics", &lock(&self.inner.registry).topics.len())
            .finish_non_exhaustive()
    }
}

impl<P: Send + Sync + 'static> Default for EventBus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Send + Sync + 'static> EventBus<P> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(HandlerRegistry {
                    topics: HashMap::new(),
                }),
                intake: Mutex::new(None),
                state: Mutex::new(State::Idle),
                runtime: Mutex::new(None),
                dispatch_loop: Mutex::new(None),
                workers: Mutex::new(JoinSet::new()),
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Registers `handler` for every future event published under `topic`.
    /// Returns an identifier used when reporting the handler's failures.
    pub fn subscribe<F, Fut, E>(&self, topic: impl Into<String>, handler: F) -> usize
    where
        F: Fn(Arc<Event<P>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Error> + 'static,
    {
        let handler: BoxedHandler<P> = Arc::new(move |event| {
            let fut = handler(event);
            Box::pin(async move { fut.await.map_err(Into::into) })
        });
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        info!(
            target: "api_dispatch::events",
            topic = %topic,
            handler = id,
            "Registered event handler."
        );

        // Held until registered so a concurrent `start` cannot miss this handler.
        let state = lock(&self.inner.state);
        let runtime = lock(&self.inner.runtime).clone();
        let queue = match (*state, runtime) {
            (State::Running, Some(runtime)) => {
                Some(self.spawn_worker(&runtime, topic.clone(), id, Arc::clone(&handler)))
            }
            _ => None,
        };
        lock(&self.inner.registry)
            .topics
            .entry(topic)
            .or_default()
            .push(Subscription { id, handler, queue });
        drop(state);
        id
    }

    /// Registers a synchronous handler.
    pub fn subscribe_fn<F, E>(&self, topic: impl Into<String>, handler: F) -> usize
    where
        F: Fn(&Event<P>) -> Result<(), E> + Send + Sync + 'static,
        E: Into<Error> + Send + 'static,
    {
        self.subscribe(topic, move |event: Arc<Event<P>>| {
            let result = handler(&event);
            async move { result }
        })
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        lock(&self.inner.registry)
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.inner.state) == State::Running
    }

    /// Starts the dispatch loop. Must be called from within a Tokio runtime.
    ///
    /// Starting a running bus is a no-op; a stopped bus cannot be restarted.
    pub fn start(&self) -> Result<(), BusError> {
        let runtime = Handle::try_current().map_err(|_| BusError::NoRuntime)?;

        let mut state = lock(&self.inner.state);
        match *state {
            State::Running => return Ok(()),
            State::Stopped => return Err(BusError::Closed),
            State::Idle => {}
        }

        let topics: Vec<String> = {
            let mut registry = lock(&self.inner.registry);
            for (topic, sub) in registry.subscriptions_mut() {
                sub.queue = Some(self.spawn_worker(
                    &runtime,
                    topic.clone(),
                    sub.id,
                    Arc::clone(&sub.handler),
                ));
            }
            registry.topics.keys().cloned().collect()
        };

        let (intake, receiver) = mpsc::unbounded_channel();
        *lock(&self.inner.intake) = Some(intake);
        let routing = dispatch_loop(Arc::downgrade(&self.inner), receiver);
        *lock(&self.inner.dispatch_loop) = Some(runtime.spawn(routing));
        *lock(&self.inner.runtime) = Some(runtime);
        *state = State::Running;

        info!(target: "api_dispatch::events", topics = ?topics, "Listening for events.");
        Ok(())
    }

    /// Enqueues an event without waiting for any handler.
    ///
    /// Returns `false`, dropping the event, if the bus is not running.
    pub fn publish(&self, topic: impl Into<String>, payload: P) -> bool {
        let topic = topic.into();
        let intake = lock(&self.inner.intake);
        let Some(queue) = intake.as_ref() else {
            emit(EventDropped {
                topic: &topic,
                reason: "bus not running",
            });
            return false;
        };

        emit(EventPublished { topic: &topic });
        queue.send(Arc::new(Event { topic, payload })).is_ok()
    }

    /// Stops accepting events and waits until every queued event has been
    /// handled and every in-flight handler has returned.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.state), State::Stopped);

        if previous == State::Running {
            info!(target: "api_dispatch::events", "Stopping event bus; draining queued events.");

            // Closing the intake lets the dispatch loop route its backlog and exit.
            drop(lock(&self.inner.intake).take());
            let dispatch_loop = lock(&self.inner.dispatch_loop).take();
            if let Some(handle) = dispatch_loop {
                if let Err(error) = handle.await {
                    error!(target: "api_dispatch::events", %error, "Event dispatch loop failed.");
                }
            }

            // Workers exit once their queue is closed and empty.
            for (_, sub) in lock(&self.inner.registry).subscriptions_mut() {
                sub.queue = None;
            }
        }

        let mut workers = std::mem::take(&mut *lock(&self.inner.workers));
        while let Some(outcome) = workers.join_next().await {
            if let Err(error) = outcome {
                error!(target: "api_dispatch::events", %error, "Event handler worker failed.");
            }
        }

        if previous == State::Running {
            info!(target: "api_dispatch::events", "Event bus stopped.");
        }
    }

    fn spawn_worker(
        &self,
        runtime: &Handle,
        topic: String,
        id: usize,
        handler: BoxedHandler<P>,
    ) -> Queue<P> {
        let (queue, mut events) = mpsc::unbounded_channel::<Arc<Event<P>>>();
        lock(&self.inner.workers).spawn_on(
            async move {
                while let Some(event) = events.recv().await {
                    let handler = Arc::clone(&handler);
                    let outcome = AssertUnwindSafe(async move { handler(event).await })
                        .catch_unwind()
                        .await;
                    let error = match outcome {
                        Ok(Ok(())) => continue,
                        Ok(Err(error)) => error,
                        Err(panic) => panic_error(panic),
                    };
                    emit(EventHandlerFailed {
                        topic: &topic,
                        handler: id,
                        error: &*error,
                    });
                }
            },
            runtime,
        );
        queue
    }
}

async fn dispatch_loop<P>(
    inner: Weak<Inner<P>>,
    mut receiver: mpsc::UnboundedReceiver<Arc<Event<P>>>,
) {
    while let Some(event) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let registry = lock(&inner.registry);
        let queues: Vec<&Queue<P>> = registry
            .topics
            .get(event.topic())
            .into_iter()
            .flatten()
            .filter_map(|sub| sub.queue.as_ref())
            .collect();

        if queues.is_empty() {
            emit(EventDropped {
                topic: event.topic(),
                reason: "no handlers",
            });
            continue;
        }
        for queue in queues {
            let _ = queue.send(Arc::clone(&event));
        }
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    format!("handler panicked: {message}").into()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
