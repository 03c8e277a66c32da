//! Per-connection bookkeeping.
//!
//! Holds the subscription maps, client-advertised channels and parameter
//! subscriptions of a single connection. The subscription map and its inverse
//! are kept mutually consistent here; a connection holds at most one
//! subscription per channel.

use std::collections::{HashMap, HashSet};

use crate::protocol_types::{ChannelId, ClientChannel, ClientChannelId, SubscriptionId};

#[derive(Debug, Default)]
pub(crate) struct ClientState {
    subscriptions: HashMap<SubscriptionId, ChannelId>,
    subscriptions_by_channel: HashMap<ChannelId, SubscriptionId>,
    advertisements: HashMap<ClientChannelId, ClientChannel>,
    subscribed_params: HashSet<String>,
}

impl ClientState {
    pub(crate) fn has_subscription_id(&self, sub_id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&sub_id)
    }

    pub(crate) fn subscription_for_channel(&self, chan_id: ChannelId) -> Option<SubscriptionId> {
        self.subscriptions_by_channel.get(&chan_id).copied()
    }

    /// Records a subscription. Returns false if this connection already
    /// subscribes to the channel; the existing subscription stays active.
    pub(crate) fn add_subscription(&mut self, sub_id: SubscriptionId, chan_id: ChannelId) -> bool {
        if self.subscriptions_by_channel.contains_key(&chan_id) {
            return false;
        }
        self.subscriptions.insert(sub_id, chan_id);
        self.subscriptions_by_channel.insert(chan_id, sub_id);
        true
    }

    /// Removes a subscription by the client-chosen id, returning the channel
    /// it pointed at, or None if the id was not active.
    pub(crate) fn remove_subscription(&mut self, sub_id: SubscriptionId) -> Option<ChannelId> {
        let chan_id = self.subscriptions.remove(&sub_id)?;
        self.subscriptions_by_channel.remove(&chan_id);
        Some(chan_id)
    }

    /// Clears any subscription on a channel the server is removing. No
    /// unsubscribe bookkeeping happens; removal is server driven.
    pub(crate) fn remove_channel(&mut self, chan_id: ChannelId) {
        if let Some(sub_id) = self.subscriptions_by_channel.remove(&chan_id) {
            self.subscriptions.remove(&sub_id);
        }
    }

    pub(crate) fn subscribed_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.subscriptions_by_channel.keys().copied()
    }

    /// Records a client-advertised channel. Returns false on a duplicate id.
    pub(crate) fn add_client_channel(&mut self, channel: ClientChannel) -> bool {
        if self.advertisements.contains_key(&channel.id) {
            return false;
        }
        self.advertisements.insert(channel.id, channel);
        true
    }

    pub(crate) fn remove_client_channel(&mut self, chan_id: ClientChannelId) -> bool {
        self.advertisements.remove(&chan_id).is_some()
    }

    pub(crate) fn has_client_channel(&self, chan_id: ClientChannelId) -> bool {
        self.advertisements.contains_key(&chan_id)
    }

    pub(crate) fn subscribe_params(&mut self, names: impl IntoIterator<Item = String>) {
        self.subscribed_params.extend(names);
    }

    pub(crate) fn unsubscribe_params<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            self.subscribed_params.remove(name);
        }
    }

    pub(crate) fn is_subscribed_to_param(&self, name: &str) -> bool {
        self.subscribed_params.contains(name)
    }

    pub(crate) fn subscribed_params(&self) -> &HashSet<String> {
        &self.subscribed_params
    }
}
