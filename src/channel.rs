//! One-to-many delivery of incremental results.
//!
//! A [`ResultSender`] publishes a sequence of `RESULT` messages followed by one `DONE` to a
//! named channel of a [`ChannelHub`]. Every [`ResultListener`] subscribed to that name at
//! the time a message is published receives it. There is no replay: a listener created after
//! some messages went out only sees what comes next.

use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::error::CacheError;

/// Wire message: `{"type": "RESULT", "payload": ...}` or `{"type": "DONE", "payload"?: ...}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
  Result(Value),
  Done(Option<Value>),
}

impl Message {
  pub const RESULT: &'static str = "RESULT";
  pub const DONE: &'static str = "DONE";

  pub fn to_json(&self) -> Value {
    match self {
      Message::Result(payload) => json!({"type": Self::RESULT, "payload": payload}),
      Message::Done(Some(payload)) => json!({"type": Self::DONE, "payload": payload}),
      Message::Done(None) => json!({"type": Self::DONE}),
    }
  }

  /// Decode a wire message. An unknown `type` means sender and listener disagree on the
  /// protocol and is an error.
  pub fn from_json(value: &Value) -> Result<Self, CacheError> {
    let kind = value
      .get("type")
      .and_then(Value::as_str)
      .ok_or_else(|| CacheError::Protocol(value.get("type").cloned().unwrap_or_default().to_string()))?;
    let payload = value.get("payload").cloned();
    match kind {
      Self::RESULT => Ok(Message::Result(payload.unwrap_or_default())),
      Self::DONE => Ok(Message::Done(payload)),
      other => Err(CacheError::Protocol(other.to_string())),
    }
  }

  pub fn decode(raw: &str) -> Result<Self, CacheError> {
    let value: Value = serde_json::from_str(raw)
      .map_err(|e| CacheError::Protocol(format!("undecodable message: {}", e)))?;
    Self::from_json(&value)
  }

  pub fn is_done(&self) -> bool {
    matches!(self, Message::Done(_))
  }
}

/// Registry of live subscribers by channel name.
#[derive(Default)]
pub struct ChannelHub {
  channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
}

impl ChannelHub {
  pub fn new() -> Self {
    Self::default()
  }

  fn subscribe(&self, name: &str) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .channels
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .entry(name.to_string())
      .or_default()
      .push(tx);
    rx
  }

  /// Deliver `message` to every live subscriber of `name`. Returns how many received it.
  pub fn publish(&self, name: &str, message: Message) -> usize {
    let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
    let Some(subscribers) = channels.get_mut(name) else {
      return 0;
    };
    subscribers.retain(|tx| tx.send(message.clone()).is_ok());
    let delivered = subscribers.len();
    if subscribers.is_empty() {
      channels.remove(name);
    }
    delivered
  }

  /// Decode a raw wire message and publish it.
  pub fn publish_raw(&self, name: &str, raw: &Value) -> Result<usize, CacheError> {
    let message = Message::from_json(raw).inspect_err(|err| {
      tracing::error!(channel = name, error = %err, "rejected result channel message");
    })?;
    Ok(self.publish(name, message))
  }

  /// Subscribers of `name` that have not finished yet.
  pub fn subscriber_count(&self, name: &str) -> usize {
    let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
    match channels.get_mut(name) {
      Some(subscribers) => {
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
      }
      None => 0,
    }
  }
}

/// Publishing end of a named channel.
pub struct ResultSender<'a> {
  hub: &'a ChannelHub,
  name: String,
}

impl<'a> ResultSender<'a> {
  pub fn new(hub: &'a ChannelHub, name: impl Into<String>) -> Self {
    Self {
      hub,
      name: name.into(),
    }
  }

  /// Publish every item of `results` as `RESULT`, then `DONE`. Returns the number of items.
  pub async fn send<S>(self, results: S) -> usize
  where
    S: Stream<Item = Value>,
  {
    let mut results = std::pin::pin!(results);
    let mut sent = 0;
    while let Some(payload) = results.next().await {
      let delivered = self.hub.publish(&self.name, Message::Result(payload));
      tracing::trace!(channel = %self.name, delivered, "published result");
      sent += 1;
    }
    self.hub.publish(&self.name, Message::Done(None));
    tracing::debug!(channel = %self.name, results = sent, "channel done");
    sent
  }
}

/// Receiving end of a named channel, consumed as a [`Stream`] of `RESULT` payloads.
///
/// Messages published while nobody polls are buffered. The stream ends at `DONE`.
pub struct ResultListener {
  rx: Option<mpsc::UnboundedReceiver<Message>>,
  done_payload: Option<Value>,
}

impl ResultListener {
  /// Subscribe to `name`. Without a hub there is nothing that could ever publish, so the
  /// listener is done from the start.
  pub fn new(hub: Option<&ChannelHub>, name: &str) -> Self {
    Self {
      rx: hub.map(|hub| hub.subscribe(name)),
      done_payload: None,
    }
  }

  pub fn is_done(&self) -> bool {
    self.rx.is_none()
  }

  /// Payload carried by the `DONE` message, if any.
  pub fn done_payload(&self) -> Option<&Value> {
    self.done_payload.as_ref()
  }
}

impl Stream for ResultListener {
  type Item = Value;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let Some(rx) = self.rx.as_mut() else {
      return Poll::Ready(None);
    };
    match rx.poll_recv(cx) {
      Poll::Ready(Some(Message::Result(payload))) => Poll::Ready(Some(payload)),
      Poll::Ready(Some(Message::Done(payload))) => {
        self.done_payload = payload;
        self.rx = None;
        Poll::Ready(None)
      }
      Poll::Ready(None) => {
        self.rx = None;
        Poll::Ready(None)
      }
      Poll::Pending => Poll::Pending,
    }
  }
}
