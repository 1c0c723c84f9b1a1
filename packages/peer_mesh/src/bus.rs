//! Named-channel registry shared by one network object.
//!
//! Every inbound envelope is dispatched through here after the network layer
//! has resolved its origin to a full identity. Channels with no listeners
//! drop their traffic silently.

use std::collections::HashMap;
use std::sync::Mutex;

use property_bag::{Listeners, Subscription};
use serde_json::Value;

use crate::identity::{Metadata, PeerIdentity};
use crate::lock;

/// One message handed to channel listeners.
#[derive(Debug, Clone)]
pub struct Delivery<M> {
    pub data: Value,
    pub origin: PeerIdentity<M>,
}

pub struct ChannelBus<M> {
    channels: Mutex<HashMap<String, Listeners<Delivery<M>>>>,
}

impl<M> Default for ChannelBus<M> {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl<M: Metadata> ChannelBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener on `channel`. Several listeners per channel are
    /// allowed; each is called once per delivery in registration order.
    pub fn on<F>(&self, channel: &str, callback: F) -> Subscription
    where
        F: Fn(&Value, &PeerIdentity<M>) + Send + Sync + 'static,
    {
        let listeners = lock(&self.channels)
            .entry(channel.to_string())
            .or_default()
            .clone();
        listeners.subscribe(move |delivery: &Delivery<M>| callback(&delivery.data, &delivery.origin))
    }

    /// Invoke every listener of `channel`. Returns false when nobody is
    /// listening.
    pub fn dispatch(&self, channel: &str, data: Value, origin: PeerIdentity<M>) -> bool {
        let listeners = match lock(&self.channels).get(channel) {
            Some(listeners) if !listeners.is_empty() => listeners.clone(),
            _ => {
                tracing::trace!(channel, origin = %origin.uuid, "no listener for channel, dropping");
                return false;
            }
        };
        listeners.emit(&Delivery { data, origin });
        true
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        lock(&self.channels)
            .get(channel)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}
