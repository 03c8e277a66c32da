use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use foxglove_server::{
    Capability, FoxgloveServer, Parameter, ParameterValue, ServerListener, ServerOptions,
};

/// Parameters whose name starts with this prefix cannot be changed by clients.
const READ_ONLY_PREFIX: &str = "read_only";

struct ParamStore {
    params: Mutex<HashMap<String, Parameter>>,
}

impl ParamStore {
    fn new(initial: Vec<Parameter>) -> Arc<Self> {
        Arc::new(Self {
            params: Mutex::new(
                initial
                    .into_iter()
                    .map(|param| (param.name.clone(), param))
                    .collect(),
            ),
        })
    }
}

#[async_trait]
impl ServerListener for ParamStore {
    async fn on_get_parameters(
        &self,
        _server: &FoxgloveServer,
        param_names: Vec<String>,
        _request_id: Option<&str>,
    ) -> Vec<Parameter> {
        let params = self.params.lock().await;
        params
            .values()
            .filter(|param| param_names.is_empty() || param_names.contains(&param.name))
            .cloned()
            .collect()
    }

    async fn on_set_parameters(
        &self,
        _server: &FoxgloveServer,
        updates: Vec<Parameter>,
        _request_id: Option<&str>,
    ) -> Vec<Parameter> {
        let mut params = self.params.lock().await;
        for update in &updates {
            if !update.name.starts_with(READ_ONLY_PREFIX) {
                params.insert(update.name.clone(), update.clone());
            }
        }
        updates
            .iter()
            .filter_map(|update| params.get(&update.name).cloned())
            .collect()
    }

    async fn on_parameters_subscribe(
        &self,
        _server: &FoxgloveServer,
        param_names: Vec<String>,
        subscribe: bool,
    ) {
        println!(
            "{} {:?}",
            if subscribe { "Subscribed:" } else { "Unsubscribed:" },
            param_names
        );
    }
}

fn param(name: &str, value: ParameterValue) -> Parameter {
    Parameter {
        name: name.to_owned(),
        value: Some(value),
        parameter_type: None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let store = ParamStore::new(vec![
        param("int_param", ParameterValue::Integer(0)),
        param("str_param", ParameterValue::String("asdf".to_owned())),
        param("bool_param", ParameterValue::Bool(true)),
        param(
            "int_array_param",
            ParameterValue::Array(vec![
                ParameterValue::Integer(1),
                ParameterValue::Integer(2),
                ParameterValue::Integer(3),
            ]),
        ),
        param(
            "read_only_str_param",
            ParameterValue::String("can't change me".to_owned()),
        ),
    ]);

    let server = FoxgloveServer::new(
        "example param server",
        ServerOptions {
            capabilities: vec![Capability::Parameters, Capability::ParametersSubscribe],
            ..Default::default()
        },
    );
    server.set_listener(store.clone()).await;
    server.start(([127, 0, 0, 1], 8765)).await?;

    let mut counter = 0i64;
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(3)).await;
        counter += 1;
        let updated = param("int_param", ParameterValue::Integer(counter));
        store
            .params
            .lock()
            .await
            .insert(updated.name.clone(), updated.clone());
        server.update_parameters(vec![updated]).await?;
    }
}
