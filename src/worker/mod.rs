//! Worker substrate
//!
//! A [`WorkerCore`] owns one handler and drives it from two inputs: events from
//! the process-wide bus and commands from its private queue. Commands are
//! processed one at a time in FIFO order. When no command arrives for a whole
//! idle window the handler's maintenance hook runs.
//!
//! ```text
//!   EventBus ──on_event──► handler ──enqueue──► CommandQueue
//!                                                   │
//!                  on_command ◄─────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Processing,
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is shutting down")]
    ShuttingDown,

    #[error("worker task failed: {0}")]
    Join(String),
}

/// Behaviour plugged into a [`WorkerCore`].
#[async_trait::async_trait]
pub trait WorkerHandler: Send + 'static {
    type Command: fmt::Debug + Send + 'static;

    fn name(&self) -> &str;

    /// React to a bus event. Must not block; long work goes through `queue`.
    fn on_event(&mut self, event: &Event, queue: &CommandQueue<Self::Command>);

    /// Process one command. `Ok(false)` means the command was not recognised.
    async fn on_command(
        &mut self,
        command: Self::Command,
        queue: &CommandQueue<Self::Command>,
    ) -> anyhow::Result<bool>;

    /// Called after a full idle window without commands.
    async fn on_idle_timeout(&mut self) {}
}

enum Envelope<C> {
    Command(C),
    Terminate(String),
}

/// Producer side of a worker's command queue.
pub struct CommandQueue<C> {
    tx: mpsc::UnboundedSender<Envelope<C>>,
    terminating: Arc<AtomicBool>,
}

impl<C> Clone for CommandQueue<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            terminating: self.terminating.clone(),
        }
    }
}

impl<C> CommandQueue<C> {
    /// Queue a command without waiting.
    pub fn enqueue(&self, command: C) -> Result<(), WorkerError> {
        if self.terminating.load(Ordering::Acquire) {
            return Err(WorkerError::ShuttingDown);
        }
        self.tx
            .send(Envelope::Command(command))
            .map_err(|_| WorkerError::ShuttingDown)
    }

    /// Ask the worker to stop once the commands queued so far are processed.
    pub fn terminate(&self, reason: impl Into<String>) {
        if self.terminating.swap(true, Ordering::AcqRel) {
            return;
        }
        // The loop may already be gone
        let _ = self.tx.send(Envelope::Terminate(reason.into()));
    }
}

pub struct WorkerCore<H: WorkerHandler> {
    handler: H,
    queue: CommandQueue<H::Command>,
    commands: mpsc::UnboundedReceiver<Envelope<H::Command>>,
    events: Option<broadcast::Receiver<Event>>,
    idle_timeout: Option<Duration>,
    state: watch::Sender<WorkerState>,
}

impl<H: WorkerHandler> WorkerCore<H> {
    /// `idle_timeout` of `None` disables the idle hook.
    pub fn new(handler: H, idle_timeout: Option<Duration>) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            handler,
            queue: CommandQueue {
                tx,
                terminating: Arc::new(AtomicBool::new(false)),
            },
            commands,
            events: None,
            idle_timeout,
            state,
        }
    }

    /// Receive events published on `bus` from now on.
    pub fn subscribe(mut self, bus: &EventBus) -> Self {
        self.events = Some(bus.subscribe());
        self
    }

    pub fn queue(&self) -> CommandQueue<H::Command> {
        self.queue.clone()
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Spawn the loop on the current runtime.
    pub fn start(self) -> WorkerHandle<H> {
        let queue = self.queue();
        let state = self.state();
        let join = tokio::spawn(self.run());
        WorkerHandle { queue, state, join }
    }

    /// Run until terminated, then hand the handler back.
    pub async fn run(self) -> H {
        let WorkerCore {
            mut handler,
            queue,
            mut commands,
            mut events,
            idle_timeout,
            state,
        } = self;
        let name = handler.name().to_string();
        let rearm = || idle_timeout.map(|window| Instant::now() + window);
        let mut idle_deadline = rearm();

        info!(worker = %name, "Worker started");

        loop {
            tokio::select! {
                biased;

                envelope = commands.recv() => match envelope {
                    Some(Envelope::Command(command)) => {
                        state.send_replace(WorkerState::Processing);
                        debug!(worker = %name, ?command, "Processing command");

                        match handler.on_command(command, &queue).await {
                            Ok(true) => {}
                            Ok(false) => warn!(worker = %name, "Command not handled"),
                            Err(e) => error!(worker = %name, error = %e, "Command failed"),
                        }

                        state.send_replace(WorkerState::Idle);
                        idle_deadline = rearm();
                    }
                    Some(Envelope::Terminate(reason)) => {
                        info!(worker = %name, %reason, "Worker terminating");
                        break;
                    }
                    None => break,
                },

                event = next_event(&mut events) => match event {
                    Some(event) => handler.on_event(&event, &queue),
                    None => {
                        debug!(worker = %name, "Event bus closed");
                        events = None;
                    }
                },

                _ = idle_elapsed(idle_deadline) => {
                    debug!(worker = %name, "Idle timeout");
                    handler.on_idle_timeout().await;
                    idle_deadline = rearm();
                }
            }
        }

        state.send_replace(WorkerState::ShuttingDown);
        queue.terminating.store(true, Ordering::Release);
        commands.close();
        info!(worker = %name, "Worker stopped");
        handler
    }
}

/// Handle to a spawned worker.
pub struct WorkerHandle<H: WorkerHandler> {
    queue: CommandQueue<H::Command>,
    state: watch::Receiver<WorkerState>,
    join: JoinHandle<H>,
}

impl<H: WorkerHandler> WorkerHandle<H> {
    pub fn queue(&self) -> CommandQueue<H::Command> {
        self.queue.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn terminate(&self, reason: impl Into<String>) {
        self.queue.terminate(reason);
    }

    /// Wait for the loop to exit.
    pub async fn join(self) -> Result<H, WorkerError> {
        self.join.await.map_err(|e| WorkerError::Join(e.to_string()))
    }
}

async fn next_event(events: &mut Option<broadcast::Receiver<Event>>) -> Option<Event> {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Worker fell behind the event bus");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn idle_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum Cmd {
        Record(u32),
        Fail,
        Unknown,
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<u32>,
        idle_calls: usize,
    }

    #[async_trait::async_trait]
    impl WorkerHandler for Recorder {
        type Command = Cmd;

        fn name(&self) -> &str {
            "recorder"
        }

        fn on_event(&mut self, event: &Event, queue: &CommandQueue<Cmd>) {
            if *event == Event::NodeUnconfigured {
                queue.enqueue(Cmd::Record(99)).unwrap();
            }
        }

        async fn on_command(&mut self, command: Cmd, _queue: &CommandQueue<Cmd>) -> anyhow::Result<bool> {
            match command {
                Cmd::Record(n) => {
                    self.seen.push(n);
                    Ok(true)
                }
                Cmd::Fail => anyhow::bail!("boom"),
                Cmd::Unknown => Ok(false),
            }
        }

        async fn on_idle_timeout(&mut self) {
            self.idle_calls += 1;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_processed_fifo() {
        let core = WorkerCore::new(Recorder::default(), None);
        let queue = core.queue();
        for n in 1..=5 {
            queue.enqueue(Cmd::Record(n)).unwrap();
        }
        queue.terminate("done");

        let handler = core.run().await;
        assert_eq!(handler.seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(handler.idle_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_command_does_not_stop_loop() {
        let core = WorkerCore::new(Recorder::default(), None);
        let queue = core.queue();
        queue.enqueue(Cmd::Fail).unwrap();
        queue.enqueue(Cmd::Unknown).unwrap();
        queue.enqueue(Cmd::Record(7)).unwrap();
        queue.terminate("done");

        let handler = core.run().await;
        assert_eq!(handler.seen, vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_rejected_after_terminate() {
        let core = WorkerCore::new(Recorder::default(), None);
        let queue = core.queue();
        queue.terminate("shutdown");

        assert!(matches!(
            queue.enqueue(Cmd::Record(1)),
            Err(WorkerError::ShuttingDown)
        ));

        let state = core.state();
        let handler = core.run().await;
        assert!(handler.seen.is_empty());
        assert_eq!(*state.borrow(), WorkerState::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_idle_call_per_window() {
        let handle = WorkerCore::new(Recorder::default(), Some(Duration::from_secs(1))).start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.terminate("done");

        let handler = handle.join().await.unwrap();
        assert_eq!(handler.idle_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_resets_idle_window() {
        let handle = WorkerCore::new(Recorder::default(), Some(Duration::from_secs(1))).start();
        let queue = handle.queue();

        tokio::time::sleep(Duration::from_millis(600)).await;
        queue.enqueue(Cmd::Record(1)).unwrap();
        // Window now ends at 1.6s
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(handle.state(), WorkerState::Idle);
        handle.terminate("done");

        let handler = handle.join().await.unwrap();
        assert_eq!(handler.seen, vec![1]);
        assert_eq!(handler.idle_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_become_commands() {
        let bus = EventBus::default();
        let handle = WorkerCore::new(Recorder::default(), None)
            .subscribe(&bus)
            .start();

        bus.publish(Event::NodeUnconfigured);
        bus.publish(Event::ServiceArchived {
            org: "acme".to_string(),
            url: "gps".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.terminate("done");

        let handler = handle.join().await.unwrap();
        assert_eq!(handler.seen, vec![99]);
    }
}
