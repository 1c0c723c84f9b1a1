//! Chat over the `chat` channel.
//!
//! Flood control is the sender's job: a local send within the rate-limit
//! window, an empty message, or one sent while disconnected is dropped
//! without error. Over-long messages are truncated before they leave.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use property_bag::{Listeners, Subscription};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::envelope::CHAT;
use crate::identity::{Metadata, PeerIdentity};
use crate::lock;
use crate::network::Endpoint;

/// Wire payload of the `chat` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
    pub date: DateTime<Utc>,
}

/// One line of local history: who said what, and when.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine<M> {
    pub author: PeerIdentity<M>,
    pub message: String,
    pub date: DateTime<Utc>,
}

struct ChatState<M> {
    last_sent: Option<Instant>,
    history: VecDeque<ChatLine<M>>,
    capacity: usize,
}

impl<M> ChatState<M> {
    fn push(&mut self, line: ChatLine<M>) {
        if self.capacity == 0 {
            return;
        }
        while self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(line);
    }
}

pub struct Chat<M: Metadata> {
    endpoint: Endpoint<M>,
    state: Arc<Mutex<ChatState<M>>>,
    lines: Listeners<ChatLine<M>>,
    _incoming: Subscription,
}

impl<M: Metadata> Chat<M> {
    pub fn new(endpoint: Endpoint<M>) -> Self {
        let state = Arc::new(Mutex::new(ChatState {
            last_sent: None,
            history: VecDeque::new(),
            capacity: endpoint.config().chat_history,
        }));
        let lines = Listeners::new();

        let incoming = {
            let state = state.clone();
            let lines = lines.clone();
            endpoint
                .channel::<ChatMessage>(CHAT)
                .on(move |msg, author| {
                    let line = ChatLine {
                        author: author.clone(),
                        message: msg.message,
                        date: msg.date,
                    };
                    lock(&state).push(line.clone());
                    lines.emit(&line);
                })
        };

        Self {
            endpoint,
            state,
            lines,
            _incoming: incoming,
        }
    }

    /// Send `text` to everyone. Returns whether it was actually sent.
    pub fn send(&self, text: &str) -> bool {
        let config = self.endpoint.config();
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        let now = Instant::now();
        let limited = lock(&self.state)
            .last_sent
            .is_some_and(|last| now.duration_since(last) < config.chat_rate_limit());
        if limited {
            debug!("chat message dropped by rate limit");
            return false;
        }

        let message: String = text.chars().take(config.chat_max_len).collect();
        let payload = ChatMessage {
            message,
            date: Utc::now(),
        };
        if let Err(e) = self.endpoint.send(CHAT, &payload) {
            debug!("chat message not sent: {}", e);
            return false;
        }

        let line = ChatLine {
            author: self.endpoint.local_identity(),
            message: payload.message,
            date: payload.date,
        };
        {
            let mut state = lock(&self.state);
            state.last_sent = Some(now);
            state.push(line.clone());
        }
        self.lines.emit(&line);
        true
    }

    /// Local and received lines, oldest first.
    pub fn history(&self) -> Vec<ChatLine<M>> {
        lock(&self.state).history.iter().cloned().collect()
    }

    /// Called for every line added to history, local or remote.
    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChatLine<M>) + Send + Sync + 'static,
    {
        self.lines.subscribe(callback)
    }
}
