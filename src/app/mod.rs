use crate::client::{ClientEvent, QsysClient};
use crate::config::Config;
use crate::security::Vault;
use crate::subscription::GROUP_COUNT;
use serde_json::Value;
use std::future::Future;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout, Duration};

const SEND_READY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "vault-set" {
            return handle_vault_set(&config);
        }
        if command == "vault-get" {
            return handle_vault_get(&config);
        }
        if command == "vault-list" {
            return handle_vault_list(&config);
        }
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "send" {
            return handle_send(&config).await;
        }
        return Err(format!("unknown command: {command}").into());
    }

    let client = start_client(&config)?;
    let events = client.subscribe();
    follow_events(&client, events, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("shutdown: ctrl-c");
        }
    })
    .await?;

    client.shutdown(false).await;
    Ok(())
}

// Subscribes every change group once the engine reports active. Requests
// issued before the socket is live would be dropped.
async fn follow_events<F>(
    client: &QsysClient,
    mut events: broadcast::Receiver<ClientEvent>,
    stop: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()>,
{
    tokio::pin!(stop);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::Ready) => {
                    tracing::info!("core ready");
                    for index in 0..GROUP_COUNT {
                        client.enable_auto_poll(index)?;
                    }
                }
                Ok(ClientEvent::Change(change)) => tracing::info!(change = %change, "change"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event consumer lagging");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = &mut stop => return Ok(()),
        }
    }
}

fn start_client(config: &Config) -> Result<QsysClient, Box<dyn std::error::Error>> {
    let vault = Vault::new(config.vault.path.as_deref())?;
    let endpoint = config.endpoint(&vault)?;
    Ok(QsysClient::start(endpoint))
}

async fn handle_send(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::env::args().nth(2).ok_or("missing json command")?;
    let message: Value = serde_json::from_str(&raw)?;

    let client = start_client(config)?;
    let mut events = client.subscribe();
    let ready = timeout(SEND_READY_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Ready) => return true,
                Ok(ClientEvent::Change(_)) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    if !ready {
        client.shutdown(true).await;
        return Err("core did not report active in time".into());
    }

    client.send_command(message);
    client.shutdown(false).await;
    println!("Sent command");
    Ok(())
}

fn handle_vault_set(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or("missing key")?;
    let value = args.next().ok_or("missing value")?;

    let mut vault = Vault::new(config.vault.path.as_deref())?;
    vault.store(&key, &value)?;

    println!("Stored vault key: {}", key);
    Ok(())
}

fn handle_vault_get(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or("missing key")?;

    let vault = Vault::new(config.vault.path.as_deref())?;
    let value = vault.retrieve(&key)?;

    println!("{}", value);
    Ok(())
}

fn handle_vault_list(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let vault = Vault::new(config.vault.path.as_deref())?;
    for key in vault.list_keys() {
        println!("{}", key);
    }
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
