use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde_json::json;

use foxglove_server::{
    Capability, ChannelId, ChannelSpec, ClientChannel, ClientChannelId, FoxgloveServer,
    ServerListener, ServerOptions, ServiceId, ServiceSpec,
};

struct Listener;

#[async_trait]
impl ServerListener for Listener {
    async fn on_subscribe(&self, _server: &FoxgloveServer, channel_id: ChannelId) {
        println!("First client subscribed to {}", channel_id);
    }

    async fn on_unsubscribe(&self, _server: &FoxgloveServer, channel_id: ChannelId) {
        println!("Last client unsubscribed from {}", channel_id);
    }

    async fn on_client_advertise(&self, _server: &FoxgloveServer, channel: &ClientChannel) {
        println!(
            "Client advertise: {}",
            serde_json::to_string(channel).unwrap_or_default()
        );
    }

    async fn on_client_unadvertise(&self, _server: &FoxgloveServer, channel_id: ClientChannelId) {
        println!("Client unadvertise: {}", channel_id);
    }

    async fn on_client_message(
        &self,
        _server: &FoxgloveServer,
        channel_id: ClientChannelId,
        payload: &[u8],
    ) {
        println!(
            "Client message on channel {}: {}",
            channel_id,
            String::from_utf8_lossy(payload)
        );
    }

    async fn on_service_request(
        &self,
        _server: &FoxgloveServer,
        service_id: ServiceId,
        _call_id: u32,
        encoding: &str,
        payload: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        if encoding != "json" {
            return Ok(json!({"success": false, "error": format!("Invalid encoding {}", encoding)})
                .to_string()
                .into_bytes());
        }
        let request: serde_json::Value = serde_json::from_slice(payload)?;
        let Some(data) = request.get("data") else {
            return Ok(json!({"success": false, "error": "Missing key 'data'"})
                .to_string()
                .into_bytes());
        };
        println!("Service request on service {}: {}", service_id, request);
        Ok(
            json!({"success": true, "message": format!("Received boolean: {}", data)})
                .to_string()
                .into_bytes(),
        )
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let server = FoxgloveServer::new(
        "example server",
        ServerOptions {
            capabilities: vec![Capability::ClientPublish, Capability::Services],
            supported_encodings: Some(vec!["json".to_owned()]),
            ..Default::default()
        },
    );
    server.set_listener(Arc::new(Listener)).await;
    server.start(([127, 0, 0, 1], 8765)).await?;

    let chan_id = server
        .add_channel(
            ChannelSpec::new(
                "example_msg",
                "json",
                "ExampleMsg",
                json!({
                    "type": "object",
                    "properties": {
                        "msg": {"type": "string"},
                        "count": {"type": "number"},
                    },
                })
                .to_string(),
            )
            .with_schema_encoding("jsonschema"),
        )
        .await?;

    server
        .add_service(ServiceSpec {
            name: "set_bool".to_owned(),
            service_type: "set_bool".to_owned(),
            request_schema: Some(
                json!({
                    "type": "object",
                    "properties": {"data": {"type": "boolean"}},
                })
                .to_string(),
            ),
            response_schema: Some(
                json!({
                    "type": "object",
                    "properties": {
                        "success": {"type": "boolean"},
                        "message": {"type": "string"},
                    },
                })
                .to_string(),
            ),
            ..Default::default()
        })
        .await?;

    let mut count = 0u64;
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        count += 1;
        let payload = json!({"msg": "Hello!", "count": count}).to_string();
        server
            .send_message(chan_id, now_ns(), payload.as_bytes())
            .await?;
    }
}
