// CCLAB: Reproducible Congestion-Control Experiments on Emulated Network Paths
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Shared, ordered sink for live progress events.
//!
//! Every producer (flow supervisors, their output drains, the link schedule and the orchestrator
//! itself) owns a cheap clone of an [`EventSink`]. A single [`EventLogger`] task consumes all
//! events in the order they were queued and writes them through the `log` facade at target
//! `cclab::events`.

use std::{fmt::Display, time::Duration, time::SystemTime};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};

use cclab_utils::other::clock_time;

/// Capacity of the event channel.
pub const EVENT_BUFFER: usize = 4096;

/// Maximum time a producer waits for space in a full sink before the event is dropped.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(50);

/// Log target used for all live progress events.
pub const EVENT_TARGET: &str = "cclab::events";

/// Process side of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Endpoint {
    /// Receiver-side process
    Server,
    /// Sender-side process
    Client,
}

/// Output stream of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Origin of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Orchestrator,
    Link,
    Flow(usize),
    Output(usize, Endpoint, Stream),
}

impl Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::Orchestrator => write!(f, "orchestrator"),
            EventSource::Link => write!(f, "link"),
            EventSource::Flow(id) => write!(f, "flow_{id}"),
            EventSource::Output(id, endpoint, stream) => write!(f, "{endpoint}_{id}_{stream}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Wall-clock time at which the event was produced
    pub time: SystemTime,
    pub source: EventSource,
    pub message: String,
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.source, self.message)
    }
}

/// Producer side of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    /// Create a new sink together with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an event. Waits at most [`SEND_TIMEOUT`] for space; the event is dropped if the
    /// sink stays full or is already closed.
    pub async fn emit(&self, source: EventSource, message: impl Into<String>) {
        let event = Event {
            time: SystemTime::now(),
            source,
            message: message.into(),
        };
        match timeout(SEND_TIMEOUT, self.tx.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::trace!("event sink closed, dropping `{}`", e.0),
            Err(_) => log::warn!("event sink is full, dropping an event from {source}"),
        }
    }
}

/// The single consumer of an [`EventSink`].
pub struct EventLogger {
    close: oneshot::Sender<()>,
    task: JoinHandle<Vec<Event>>,
}

impl EventLogger {
    /// Spawn the logger task. If `keep_history` is set, all consumed events are returned by
    /// [`EventLogger::finish`].
    pub fn spawn(mut rx: mpsc::Receiver<Event>, keep_history: bool) -> Self {
        let (close, mut close_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut history = Vec::new();
            let mut consume = |event: Event| {
                log::info!(target: EVENT_TARGET, "{} {event}", clock_time(event.time));
                if keep_history {
                    history.push(event);
                }
            };
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Some(event) => consume(event),
                        None => break,
                    },
                    _ = &mut close_rx => {
                        // refuse new events, but drain everything that is already queued
                        rx.close();
                        while let Some(event) = rx.recv().await {
                            consume(event);
                        }
                        break;
                    }
                }
            }
            history
        });
        Self { close, task }
    }

    /// Stop the logger after all queued events are written, and return the recorded history.
    pub async fn finish(self) -> Vec<Event> {
        let _ = self.close.send(());
        match self.task.await {
            Ok(history) => history,
            Err(e) => {
                log::error!("[events] logger task failed: {e}");
                Vec::new()
            }
        }
    }
}
