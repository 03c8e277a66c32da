//! Callbacks the broker invokes on the embedding application.

use async_trait::async_trait;

use crate::protocol_types::{ChannelId, ClientChannel, ClientChannelId, Parameter, ServiceId};
use crate::FoxgloveServer;

/// Hooks for subscription edges, client publishes, service requests and
/// parameter access. All methods have no-op defaults, so an implementation
/// only overrides what it cares about. Callbacks triggered by one connection
/// never block another connection's processing; they serialize only within
/// the connection that triggered them.
#[async_trait]
pub trait ServerListener: Send + Sync {
    /// Called when the first client subscribes to `channel_id`.
    async fn on_subscribe(&self, _server: &FoxgloveServer, _channel_id: ChannelId) {}

    /// Called when the last subscribed client unsubscribes from `channel_id`,
    /// including by disconnecting.
    async fn on_unsubscribe(&self, _server: &FoxgloveServer, _channel_id: ChannelId) {}

    /// Called when a client advertises a channel to publish on.
    async fn on_client_advertise(&self, _server: &FoxgloveServer, _channel: &ClientChannel) {}

    /// Called when a client withdraws one of its advertised channels.
    async fn on_client_unadvertise(&self, _server: &FoxgloveServer, _channel_id: ClientChannelId) {}

    /// Called for each message a client publishes on an advertised channel.
    async fn on_client_message(
        &self,
        _server: &FoxgloveServer,
        _channel_id: ClientChannelId,
        _payload: &[u8],
    ) {
    }

    /// Called when a client invokes a service. The returned bytes are framed
    /// into the call response; an error is reported to the caller as a
    /// `status` error and no response frame is sent.
    async fn on_service_request(
        &self,
        _server: &FoxgloveServer,
        service_id: ServiceId,
        _call_id: u32,
        _encoding: &str,
        _payload: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!(
            "Service {} has no registered handler",
            service_id
        ))
    }

    /// Called when a client requests parameter values. An empty `param_names`
    /// means all parameters.
    async fn on_get_parameters(
        &self,
        _server: &FoxgloveServer,
        _param_names: Vec<String>,
        _request_id: Option<&str>,
    ) -> Vec<Parameter> {
        Vec::new()
    }

    /// Called when a client sets parameters. The returned parameters are
    /// echoed to the requesting connection (if the request carried an id) and
    /// broadcast to all parameter subscribers.
    async fn on_set_parameters(
        &self,
        _server: &FoxgloveServer,
        _params: Vec<Parameter>,
        _request_id: Option<&str>,
    ) -> Vec<Parameter> {
        Vec::new()
    }

    /// Called with the parameter names whose aggregate subscription count
    /// crossed zero: `subscribe` is true when the first client subscribed,
    /// false when the last one went away.
    async fn on_parameters_subscribe(
        &self,
        _server: &FoxgloveServer,
        _param_names: Vec<String>,
        _subscribe: bool,
    ) {
    }
}
