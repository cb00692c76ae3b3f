//! subnet-engine - Engine API node
//!
//! Serves the node's methods on the configured listen endpoints and keeps a
//! connection open to every configured peer. With an application peer the
//! node acts as the engine: model methods are relayed to that peer instead
//! of being served from local models.

use engine_client::{BackoffConfig, Client, ConnectionConfig, Relay};
use engine_core::{CallContext, Endpoint, HandlerError, Handlers, Identity};
use engine_protocol::Compartment;
use engine_server::{Config, Server, ServerConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Pause between streamed tokens of the mock model.
const TOKEN_DELAY: Duration = Duration::from_millis(100);

/// Where the application compartment listens when nothing is configured.
const DEFAULT_APP_SOCKET: &str = "/tmp/app.sock";

/// Stand-in language model that streams a fixed sentence.
#[derive(Debug)]
struct MockModel {
    name: String,
}

impl MockModel {
    fn new(name: &str) -> Self {
        tracing::info!("Loading model {}...", name);
        Self {
            name: name.to_string(),
        }
    }

    fn tokens(&self) -> Vec<String> {
        ["This ", "is ", "a ", "generated ", "response ", "from "]
            .iter()
            .map(|t| t.to_string())
            .chain(std::iter::once(self.name.clone()))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct GenerateParams {
    #[serde(default = "default_model")]
    model: String,
    #[serde(default)]
    prompt: String,
}

fn default_model() -> String {
    "gpt2".to_string()
}

/// Application error code for an unknown model name.
const MODEL_NOT_FOUND: i32 = 1001;

/// Methods an engine node forwards to its application peer.
const RELAYED_METHODS: &[&str] = &["models", "generate"];

/// Methods every node answers itself.
fn base_handlers() -> Handlers {
    let mut handlers = Handlers::new();
    handlers.register_fn("ping", |_: Value, _ctx| async move {
        Ok::<_, HandlerError>(json!({"pong": true}))
    });
    handlers
}

/// Handlers of an engine node relaying model calls to `upstream`.
fn relay_handlers(upstream: &Client) -> Handlers {
    let mut handlers = base_handlers();
    Relay::register_all(&mut handlers, upstream, RELAYED_METHODS);
    handlers
}

/// The identity announced when dialing `peer`.
///
/// A node dialing the compartment it presents itself as is relaying for its
/// own callers, so it announces the compartment it accepts on its listen
/// side.
fn upstream_identity(config: &Config, peer: &Endpoint) -> Identity {
    let identity = config.identity();
    match config.listen.first() {
        Some(listen) if peer.peer == identity.compartment => Identity {
            compartment: listen.peer,
            ..identity
        },
        _ => identity,
    }
}

fn node_handlers(models: Arc<HashMap<String, MockModel>>) -> Handlers {
    let mut handlers = base_handlers();
    let listed = models.clone();
    handlers
        .register_fn("models", move |_: Value, _ctx| {
            let mut names: Vec<String> = listed.keys().cloned().collect();
            names.sort();
            async move { Ok::<_, HandlerError>(json!({ "models": names })) }
        })
        .register_fn("generate", move |params: GenerateParams, ctx: CallContext| {
            let tokens = models.get(&params.model).map(MockModel::tokens);
            async move {
                let tokens = tokens.ok_or_else(|| {
                    HandlerError::application(
                        MODEL_NOT_FOUND,
                        format!("model '{}' is not loaded", params.model),
                    )
                })?;
                tracing::debug!(
                    "[{}] Generating with {} for prompt of {} chars",
                    ctx.session_id(),
                    params.model,
                    params.prompt.len()
                );

                let mut text = String::new();
                for token in &tokens {
                    tokio::time::sleep(TOKEN_DELAY).await;
                    ctx.partial(&json!({ "token": token })).await?;
                    text.push_str(token);
                }
                Ok::<_, HandlerError>(json!({ "model": params.model, "text": text }))
            }
        });
    handlers
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if ENGINE_CONFIG is set, then env overrides)
    let mut config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("ENGINE_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("ENGINE_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("{}; using default configuration", e);
            Config::default()
        }
    };

    if config.listen.is_empty() && config.peers.is_empty() {
        config.listen.push(Endpoint::unix(
            "app",
            DEFAULT_APP_SOCKET,
            Compartment::Network,
        ));
    }

    tracing::info!("Starting subnet-engine node");
    tracing::info!("  Compartment: {}", config.node.compartment);
    tracing::info!("  Capabilities: {:?}", config.node.capabilities);
    tracing::info!("  Wire formats: {:?}", config.node.wire_formats);
    tracing::info!(
        "  Heartbeat: {}ms (pong {}ms, {} missed)",
        config.rpc.heartbeat_interval_ms,
        config.rpc.pong_timeout_ms,
        config.rpc.missed_heartbeats
    );

    let backoff = BackoffConfig::new(config.backoff.base(), config.backoff.cap())
        .with_jitter(config.backoff.jitter);
    let peers: Vec<(Endpoint, Client)> = config
        .peers
        .iter()
        .map(|endpoint| {
            tracing::info!(
                "  Peer: {} at {} ({})",
                endpoint.name,
                endpoint.addr,
                endpoint.peer
            );
            let connection =
                ConnectionConfig::new(endpoint.clone(), upstream_identity(&config, endpoint))
                    .with_rpc(config.rpc.to_rpc_config())
                    .with_backoff(backoff);
            (endpoint.clone(), Client::with_handlers(connection, base_handlers()))
        })
        .collect();

    let upstream = peers
        .iter()
        .find(|(endpoint, _)| endpoint.peer == Compartment::Application);
    let handlers = match upstream {
        Some((endpoint, client)) => {
            tracing::info!("Relaying {:?} to {}", RELAYED_METHODS, endpoint.name);
            relay_handlers(client)
        }
        None => {
            let models: HashMap<String, MockModel> = ["gpt2", "llama3"]
                .into_iter()
                .map(|name| (name.to_string(), MockModel::new(name)))
                .collect();
            tracing::info!("Models loaded.");
            node_handlers(Arc::new(models))
        }
    };

    let server = if config.listen.is_empty() {
        None
    } else {
        let server = Server::new(ServerConfig::from_config(&config), handlers);
        let listeners = server.bind().await?;
        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve(listeners).await });
        Some((server, task))
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    for (_, peer) in &peers {
        peer.close().await;
    }
    if let Some((server, task)) = server {
        server.shutdown();
        match task.await {
            Ok(Err(e)) => tracing::error!("Server error: {}", e),
            Err(e) => tracing::error!("Server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    tracing::info!("Node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::CallError;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_mock_model_sentence() {
        let model = MockModel::new("gpt2");
        assert_eq!(
            model.tokens().concat(),
            "This is a generated response from gpt2"
        );
    }

    #[test]
    fn test_generate_params_defaults() {
        let params: GenerateParams = serde_json::from_value(json!({})).unwrap();
        assert_eq!(params.model, "gpt2");
        assert!(params.prompt.is_empty());
    }

    #[test]
    fn test_node_handlers_registered() {
        let handlers = node_handlers(Arc::new(HashMap::new()));
        assert_eq!(handlers.methods(), vec!["generate", "models", "ping"]);
    }

    fn engine_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.listen.push(Endpoint::unix(
            "engine",
            dir.path().join("engine.sock"),
            Compartment::Network,
        ));
        config.peers.push(Endpoint::unix(
            "app",
            dir.path().join("app.sock"),
            Compartment::Application,
        ));
        config
    }

    #[test]
    fn test_upstream_identity_speaks_for_callers() {
        let dir = TempDir::new().unwrap();
        let mut config = engine_config(&dir);
        let app = config.peers[0].clone();
        assert_eq!(
            upstream_identity(&config, &app).compartment,
            Compartment::Network
        );

        // Dialing some other compartment uses the node's own identity.
        let consensus = Endpoint::unix("chain", "/tmp/chain.sock", Compartment::Consensus);
        assert_eq!(
            upstream_identity(&config, &consensus).compartment,
            Compartment::Application
        );

        config.listen.clear();
        assert_eq!(
            upstream_identity(&config, &app).compartment,
            Compartment::Application
        );
    }

    async fn serve(config: ServerConfig, handlers: Handlers) -> Server {
        let server = Server::new(config, handlers);
        let listeners = server.bind().await.unwrap();
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listeners).await }
        });
        server
    }

    fn dial(endpoint: Endpoint, identity: Identity) -> Client {
        let connection = ConnectionConfig::new(endpoint, identity).with_backoff(BackoffConfig::new(
            Duration::from_millis(20),
            Duration::from_millis(100),
        ));
        Client::connect(connection)
    }

    async fn app_node(path: &Path) -> Server {
        let models: HashMap<String, MockModel> = [("gpt2".to_string(), MockModel::new("gpt2"))]
            .into_iter()
            .collect();
        let config = ServerConfig::new(Identity::new(Compartment::Application))
            .with_endpoint(Endpoint::unix("app", path, Compartment::Network));
        serve(config, node_handlers(Arc::new(models))).await
    }

    #[tokio::test]
    async fn test_relay_handlers_registered() {
        let dir = TempDir::new().unwrap();
        let upstream = dial(
            Endpoint::unix("app", dir.path().join("app.sock"), Compartment::Application),
            Identity::new(Compartment::Network),
        );
        let handlers = relay_handlers(&upstream);
        assert_eq!(handlers.methods(), vec!["generate", "models", "ping"]);
    }

    #[tokio::test]
    async fn test_engine_relays_generation_from_network_to_app() {
        let dir = TempDir::new().unwrap();
        let config = engine_config(&dir);
        let _app = app_node(&dir.path().join("app.sock")).await;

        let app_peer = config.peers[0].clone();
        let upstream = dial(app_peer.clone(), upstream_identity(&config, &app_peer));
        let _engine = serve(ServerConfig::from_config(&config), relay_handlers(&upstream)).await;

        let network = dial(
            Endpoint::unix("engine", dir.path().join("engine.sock"), Compartment::Application),
            Identity::new(Compartment::Network),
        );

        let call = network
            .call_streaming("generate", json!({"model": "gpt2", "prompt": "hi"}), None)
            .await
            .unwrap();
        let (chunks, done) = call.collect().await.unwrap();
        assert_eq!(chunks.len(), 7);
        assert_eq!(chunks[0], json!({"token": "This "}));
        assert_eq!(
            done,
            json!({"model": "gpt2", "text": "This is a generated response from gpt2"})
        );

        let models = network.call("models", json!({})).await.unwrap();
        assert_eq!(models, json!({"models": ["gpt2"]}));

        let err = network
            .call("generate", json!({"model": "llama3"}))
            .await
            .unwrap_err();
        assert!(
            matches!(err, CallError::Remote { code: MODEL_NOT_FOUND, .. }),
            "{:?}",
            err
        );
    }
}
