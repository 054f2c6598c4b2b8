//! Backend commands: `init`, `disconnect`.

use std::sync::Arc;

use hookwatch_client::disconnect::DEFAULT_DISCONNECT_RETRIES;
use hookwatch_client::{
    AuthSession, Credentials, DisconnectCoordinator, HttpApi, InitializationGate,
};

use crate::config::Config;

fn api(config: &Config) -> anyhow::Result<Arc<HttpApi>> {
    Ok(Arc::new(
        HttpApi::new(&config.base_url)?.with_request_timeout(config.request_timeout),
    ))
}

pub async fn init(config: &Config) -> anyhow::Result<()> {
    let token = config.require_token()?;
    let gate = InitializationGate::new(api(config)?, AuthSession::new(Credentials::bearer(token)));

    match gate.initialize().await {
        Ok(()) => {
            println!("  User initialized ({}).", config.base_url);
            Ok(())
        }
        Err(e) => {
            let attempts = gate.state().attempts;
            anyhow::bail!("initialization failed after {attempts} attempt(s): {e}")
        }
    }
}

pub async fn disconnect(config: &Config, connection_id: &str) -> anyhow::Result<()> {
    let token = config.require_token()?;
    let coordinator = DisconnectCoordinator::new(api(config)?).with_reason("cli");

    let outcome = coordinator
        .disconnect_with_retry(connection_id, Some(token), DEFAULT_DISCONNECT_RETRIES)
        .await?;
    if outcome.already_disconnected {
        println!("  Connection {connection_id} was already gone.");
    } else {
        println!("  Disconnected {connection_id}.");
    }
    Ok(())
}
