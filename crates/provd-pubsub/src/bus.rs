use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use provd_types::Event;

/// Bus errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PubsubError {
    #[error("not running")]
    NotRunning,
}

type SubId = u64;

enum Cmd {
    Publish(Event),
    Subscribe(oneshot::Sender<SubId>),
    /// New subscriber seeded with the parent's unread buffer.
    Clone(SubId, oneshot::Sender<SubId>),
    /// Ask for the front unread event. The dispatcher does not drop
    /// the event until the matching `Ack` arrives, so a cancelled
    /// receive never loses an event.
    Recv(SubId, oneshot::Sender<Event>),
    Ack(SubId),
    Unsubscribe(SubId),
    Close(oneshot::Sender<()>),
}

struct SubState {
    buf: VecDeque<Event>,
    waiter: Option<oneshot::Sender<Event>>,
}

impl SubState {
    fn new() -> Self {
        Self {
            buf: VecDeque::new(),
            waiter: None,
        }
    }
}

/// Handle to the event bus. Cheap to clone; all clones publish into
/// the same dispatcher.
#[derive(Clone)]
pub struct Bus {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl Bus {
    /// Start a new bus and its dispatcher task.
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(cmd_rx));
        Self { cmd_tx }
    }

    /// Publish an event to all live subscribers, in order.
    pub fn publish(&self, event: Event) -> Result<(), PubsubError> {
        self.cmd_tx
            .send(Cmd::Publish(event))
            .map_err(|_| PubsubError::NotRunning)
    }

    /// Register a new subscriber. It observes events published after
    /// this call.
    pub async fn subscribe(&self) -> Result<Subscriber, PubsubError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Subscribe(tx))
            .map_err(|_| PubsubError::NotRunning)?;
        let id = rx.await.map_err(|_| PubsubError::NotRunning)?;
        Ok(Subscriber {
            id,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Shut the bus down. Cascades to all subscribers; publishes after
    /// this returns fail with [`PubsubError::NotRunning`].
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription on the bus. Dropped subscribers are unregistered.
pub struct Subscriber {
    id: SubId,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl Subscriber {
    /// Receive the next event in publish order. Returns `None` once
    /// the bus has shut down and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Cmd::Recv(self.id, tx)).ok()?;
        match rx.await {
            Ok(event) => {
                // Event observed; let the dispatcher drop it. Commands
                // from this handle are FIFO, so the ack lands before
                // any subsequent recv.
                let _ = self.cmd_tx.send(Cmd::Ack(self.id));
                Some(event)
            }
            Err(_) => None,
        }
    }

    /// Fork a new subscriber that first replays this subscriber's
    /// currently-unread events, then tracks future events on its own.
    pub async fn clone_subscriber(&self) -> Result<Subscriber, PubsubError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Clone(self.id, tx))
            .map_err(|_| PubsubError::NotRunning)?;
        let id = rx.await.map_err(|_| PubsubError::NotRunning)?;
        Ok(Subscriber {
            id,
            cmd_tx: self.cmd_tx.clone(),
        })
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Cmd::Unsubscribe(self.id));
    }
}

async fn dispatch(mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
    let mut subs: HashMap<SubId, SubState> = HashMap::new();
    let mut next_id: SubId = 0;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Cmd::Publish(event) => {
                for state in subs.values_mut() {
                    state.buf.push_back(event.clone());
                    wake(state);
                }
            }
            Cmd::Subscribe(reply) => {
                let id = next_id;
                next_id += 1;
                subs.insert(id, SubState::new());
                let _ = reply.send(id);
            }
            Cmd::Clone(parent, reply) => {
                let buf = subs
                    .get(&parent)
                    .map(|s| s.buf.clone())
                    .unwrap_or_default();
                let id = next_id;
                next_id += 1;
                subs.insert(
                    id,
                    SubState {
                        buf,
                        waiter: None,
                    },
                );
                let _ = reply.send(id);
            }
            Cmd::Recv(id, reply) => {
                if let Some(state) = subs.get_mut(&id) {
                    state.waiter = Some(reply);
                    wake(state);
                }
            }
            Cmd::Ack(id) => {
                if let Some(state) = subs.get_mut(&id) {
                    state.buf.pop_front();
                }
            }
            Cmd::Unsubscribe(id) => {
                subs.remove(&id);
            }
            Cmd::Close(reply) => {
                debug!(subscribers = subs.len(), "bus shutting down");
                subs.clear();
                let _ = reply.send(());
                break;
            }
        }
    }
    // Receiver drops here; later publishes fail with NotRunning.
}

/// Offer the front unread event to a parked waiter, without dropping
/// it from the buffer until the subscriber acks.
fn wake(state: &mut SubState) {
    if state.waiter.is_none() || state.buf.is_empty() {
        return;
    }
    let front = state.buf.front().cloned().expect("checked non-empty");
    if let Some(waiter) = state.waiter.take() {
        if waiter.send(front).is_err() {
            // Receive side was cancelled; keep the event for the next
            // recv call.
        }
    }
}
