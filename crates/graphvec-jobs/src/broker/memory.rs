//! In-memory broker with AMQP-like delivery semantics.
//!
//! Deliveries respect the channel prefetch, unacknowledged messages return to
//! the head of their queue when a channel closes or the connection is severed,
//! and every ack, nack and publish is recorded for inspection.

use super::{Broker, BrokerChannel, BrokerSession, ConnectionEvent, Delivery, DeliveryStream, QueueTopology};
use crate::error::{JobError, JobResult};
use crate::job::Job;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    session: u64,
    queue: String,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Session {
    events: mpsc::UnboundedSender<ConnectionEvent>,
    prefetch: u16,
    open: bool,
}

#[derive(Debug)]
struct Subscription {
    session: u64,
    consumer_tag: String,
    queue: String,
    deliveries: mpsc::UnboundedSender<JobResult<Delivery>>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<Message>>,
    declared: Vec<QueueTopology>,
    published: Vec<(String, Vec<u8>)>,
    acked: Vec<Vec<u8>>,
    nacked: Vec<(Vec<u8>, bool)>,
    unacked: HashMap<u64, Unacked>,
    sessions: HashMap<u64, Session>,
    subscriptions: Vec<Subscription>,
    next_session: u64,
    next_tag: u64,
    connect_attempts: u32,
    refuse_connects: u32,
    fail_publishes: u32,
    last_prefetch: Option<u16>,
}

impl State {
    fn ensure_open(&self, session: u64) -> JobResult<()> {
        match self.sessions.get(&session) {
            Some(s) if s.open => Ok(()),
            _ => Err(JobError::Disconnected("channel is closed".to_string())),
        }
    }

    fn in_flight(&self, session: u64) -> usize {
        self.unacked.values().filter(|u| u.session == session).count()
    }

    fn dispatch(&mut self) {
        let mut dead = Vec::new();

        for index in 0..self.subscriptions.len() {
            let session_id = self.subscriptions[index].session;
            let queue = self.subscriptions[index].queue.clone();

            let prefetch = match self.sessions.get(&session_id) {
                Some(session) if session.open => usize::from(session.prefetch),
                _ => continue,
            };

            loop {
                if prefetch > 0 && self.in_flight(session_id) >= prefetch {
                    break;
                }
                let Some(message) = self.queues.get_mut(&queue).and_then(VecDeque::pop_front) else {
                    break;
                };

                self.next_tag += 1;
                let tag = self.next_tag;
                let delivery = Delivery {
                    tag,
                    payload: message.payload.clone(),
                    redelivered: message.redelivered,
                };

                if self.subscriptions[index].deliveries.send(Ok(delivery)).is_err() {
                    self.queues.entry(queue.clone()).or_default().push_front(message);
                    dead.push(index);
                    break;
                }

                self.unacked.insert(
                    tag,
                    Unacked {
                        session: session_id,
                        queue: queue.clone(),
                        payload: message.payload,
                    },
                );
            }
        }

        for index in dead.into_iter().rev() {
            self.subscriptions.remove(index);
        }
    }

    /// Closes a session, returning its unacknowledged messages to their queues.
    fn close_session(&mut self, session: u64) {
        if let Some(s) = self.sessions.get_mut(&session) {
            s.open = false;
        }
        self.subscriptions.retain(|sub| sub.session != session);

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(u) = self.unacked.remove(&tag) {
                self.queues.entry(u.queue).or_default().push_front(Message {
                    payload: u.payload,
                    redelivered: true,
                });
            }
        }
    }
}

/// In-memory broker. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a raw message as an external producer would.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut state = self.state.lock();
        state.queues.entry(queue.to_string()).or_default().push_back(Message {
            payload: payload.into(),
            redelivered: false,
        });
        state.dispatch();
    }

    /// Enqueues a job as an external producer would.
    pub fn enqueue_job(&self, queue: &str, job: &Job) -> JobResult<()> {
        self.enqueue(queue, job.encode()?);
        Ok(())
    }

    /// Drops the connection of every open session, as a network failure would.
    pub fn sever(&self) {
        let mut state = self.state.lock();
        let open: Vec<u64> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.open)
            .map(|(id, _)| *id)
            .collect();

        for id in open {
            if let Some(session) = state.sessions.get(&id) {
                let _ = session.events.send(ConnectionEvent::Disconnected {
                    reason: "connection reset by peer".to_string(),
                });
            }
            state.close_session(id);
        }
    }

    /// Ends every subscription from the server side, as deleting the queue
    /// would. Sessions stay open.
    pub fn cancel_consumers(&self) {
        self.state.lock().subscriptions.clear();
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_connects(&self, count: u32) {
        self.state.lock().refuse_connects = count;
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_publishes(&self, count: u32) {
        self.state.lock().fail_publishes = count;
    }

    /// Total connection attempts, including refused ones.
    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Messages published through a channel to `queue`, in order.
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Payloads of acknowledged deliveries, in ack order.
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.state.lock().acked.clone()
    }

    /// Payloads of rejected deliveries with their requeue flag.
    pub fn nacked(&self) -> Vec<(Vec<u8>, bool)> {
        self.state.lock().nacked.clone()
    }

    /// Messages waiting in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries awaiting ack or nack.
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Every queue declaration received, in order.
    pub fn declared(&self) -> Vec<QueueTopology> {
        self.state.lock().declared.clone()
    }

    /// The most recently applied prefetch.
    pub fn prefetch(&self) -> Option<u16> {
        self.state.lock().last_prefetch
    }

    /// Active subscriptions.
    pub fn consumer_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Sessions that have not been closed or severed.
    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.values().filter(|s| s.open).count()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> JobResult<BrokerSession> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(JobError::Disconnected("connection refused".to_string()));
        }

        state.next_session += 1;
        let id = state.next_session;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            Session {
                events: events_tx,
                prefetch: 0,
                open: true,
            },
        );

        Ok(BrokerSession {
            channel: Arc::new(MemoryChannel {
                broker: self.clone(),
                session: id,
            }),
            events: events_rx,
        })
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    session: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, topology: &QueueTopology) -> JobResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.session)?;
        state.declared.push(topology.clone());
        state.queues.entry(topology.name.clone()).or_default();
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> JobResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.session)?;
        if let Some(session) = state.sessions.get_mut(&self.session) {
            session.prefetch = prefetch;
        }
        state.last_prefetch = Some(prefetch);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> JobResult<DeliveryStream> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.session)?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscriptions.push(Subscription {
            session: self.session,
            consumer_tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            deliveries: tx,
        });
        state.dispatch();

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, tag: u64) -> JobResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.session)?;

        match state.unacked.remove(&tag) {
            Some(u) if u.session == self.session => {
                state.acked.push(u.payload);
                state.dispatch();
                Ok(())
            }
            Some(u) => {
                state.unacked.insert(tag, u);
                Err(JobError::broker(format!("delivery tag {tag} belongs to another channel")))
            }
            None => Err(JobError::broker(format!("unknown delivery tag {tag}"))),
        }
    }

    async fn nack(&self, tag: u64, requeue: bool) -> JobResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.session)?;

        let Some(u) = state.unacked.remove(&tag) else {
            return Err(JobError::broker(format!("unknown delivery tag {tag}")));
        };

        state.nacked.push((u.payload.clone(), requeue));
        if requeue {
            state.queues.entry(u.queue).or_default().push_front(Message {
                payload: u.payload,
                redelivered: true,
            });
        }
        state.dispatch();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> JobResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.session)?;

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(JobError::broker("publish rejected"));
        }

        state.published.push((queue.to_string(), payload.to_vec()));
        state.queues.entry(queue.to_string()).or_default().push_back(Message {
            payload: payload.to_vec(),
            redelivered: false,
        });
        state.dispatch();
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> JobResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.session)?;
        state
            .subscriptions
            .retain(|sub| !(sub.session == self.session && sub.consumer_tag == consumer_tag));
        Ok(())
    }

    async fn close(&self) -> JobResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.session)?;
        state.close_session(self.session);
        Ok(())
    }
}
