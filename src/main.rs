//! segwire - demo account server
//!
//! Serves a schema over TCP, one session per connection. Without a schema
//! file the built-in account schema is served with toy handlers.

use segwire_protocol::{FieldArray, Value};
use segwire_schema::Schema;
use segwire_session::{CallContext, Config, HandlerRegistry, HandlerResult, Reply, Server};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const ACCOUNT_SCHEMA: &str = include_str!("../schemas/account.yaml");

static NEXT_USER_ID: AtomicU64 = AtomicU64::new(1);

async fn sign_up(ctx: CallContext) -> HandlerResult {
    let terms = ctx
        .confirm("confirm_terms", FieldArray::new(vec![Value::Int(2)]))
        .await?;
    if terms.required.first().and_then(Value::as_bool) != Some(true) {
        return Err(ctx.error("email_taken", "terms were not accepted"));
    }

    let user_id = NEXT_USER_ID.fetch_add(1, Ordering::Relaxed);
    tracing::info!(
        user_id,
        email = ?ctx.param("email"),
        "signed up"
    );
    Ok(Reply::new(FieldArray::new(vec![Value::Int(user_id)])).with_state("normal"))
}

async fn log_in(ctx: CallContext) -> HandlerResult {
    match ctx.param("password").and_then(Value::as_str) {
        Some("password") => {
            Ok(Reply::new(FieldArray::new(vec![Value::Int(1)])).with_state("normal"))
        }
        _ => Err(ctx.error("bad_credentials", "invalid email or password")),
    }
}

async fn log_out(_ctx: CallContext) -> HandlerResult {
    Ok(Reply::empty().with_state("awaiting_login"))
}

async fn echo(ctx: CallContext) -> HandlerResult {
    Ok(Reply::new(ctx.params))
}

async fn rename(ctx: CallContext) -> HandlerResult {
    tracing::info!(
        user = ?ctx.entity_id,
        display_name = ?ctx.param("display_name"),
        "renamed"
    );
    Ok(Reply::empty())
}

fn demo_handlers(schema: &Schema) -> Result<HandlerRegistry, Box<dyn std::error::Error>> {
    let mut handlers = HandlerRegistry::new();
    handlers.register_named(schema, "sign_up", sign_up)?;
    handlers.register_named(schema, "log_in", log_in)?;
    handlers.register_named(schema, "log_out", log_out)?;
    handlers.register_named(schema, "echo", echo)?;
    handlers.register_named(schema, "user.rename", rename)?;
    Ok(handlers)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if SEGWIRE_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    let (schema, handlers) = match &config.schema {
        Some(path) => {
            let schema = Schema::from_file(path)?;
            tracing::info!("  Schema: {}", path.display());
            (schema, HandlerRegistry::new())
        }
        None => {
            let schema = Schema::from_yaml(ACCOUNT_SCHEMA)?;
            let handlers = demo_handlers(&schema)?;
            tracing::info!("  Schema: built-in account service");
            (schema, handlers)
        }
    };

    tracing::info!("Starting segwire server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Confirmation timeout: {:?}",
        config.session.confirmation_timeout()
    );

    let server = Arc::new(Server::new(config, Arc::new(schema), handlers));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let stats = server.stats();
    tracing::info!(
        "Server stopped ({} connections, {} session errors)",
        stats.connections_total.load(Ordering::Relaxed),
        stats.errors_total.load(Ordering::Relaxed)
    );
    Ok(())
}
