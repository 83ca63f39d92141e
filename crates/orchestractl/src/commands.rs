//! Command handlers: map each subcommand onto one kernel API call

use crate::client::KernelClient;
use crate::output::parse_value;
use crate::{Commands, ConfigAction, KernelBackupAction, ScheduleAction, ServicesAction};
use anyhow::Result;
use orchestra_common::Envelope;
use serde_json::{json, Map, Value};

type Reply = Result<Envelope<Value>>;

/// Query pairs for the options that are set
fn query(pairs: &[(&'static str, Option<String>)]) -> Vec<(&'static str, String)> {
    pairs
        .iter()
        .filter_map(|(k, v)| v.clone().map(|v| (*k, v)))
        .collect()
}

/// `None` when no filter was given, so the kernel targets every service
fn service_filter(services: Vec<String>) -> Value {
    if services.is_empty() {
        Value::Null
    } else {
        json!(services)
    }
}

pub async fn run(client: &KernelClient, command: Commands) -> Reply {
    match command {
        Commands::Services { action } => services(client, action).await,
        Commands::Health { check, timeout_ms } => {
            if check {
                let q = query(&[("timeoutMs", timeout_ms.map(|t| t.to_string()))]);
                client
                    .request(reqwest::Method::POST, &["v1", "health", "check"], &q, None)
                    .await
            } else {
                client.get(&["v1", "health"], &[]).await
            }
        }
        Commands::Diagnostics => client.get(&["v1", "diagnostics"], &[]).await,
        Commands::History {
            service,
            hours,
            limit,
        } => {
            let q = query(&[
                ("serviceId", service),
                ("hours", hours.map(|h| h.to_string())),
                ("limit", limit.map(|l| l.to_string())),
            ]);
            client.get(&["v1", "health", "history"], &q).await
        }
        Commands::Uptime { id, hours } => {
            let q = query(&[("hours", hours.map(|h| h.to_string()))]);
            client.get(&["v1", "health", "uptime", &id], &q).await
        }
        Commands::Nav {
            user,
            capabilities,
            tenant,
        } => {
            let capabilities = (!capabilities.is_empty()).then(|| capabilities.join(","));
            let q = query(&[
                ("userId", user),
                ("capabilities", capabilities),
                ("tenant", tenant),
            ]);
            client.get(&["v1", "nav"], &q).await
        }
        Commands::ShellHealth => client.get(&["v1", "shell", "health"], &[]).await,
        Commands::Config { action } => config(client, action).await,
        Commands::Backup { services } => {
            let body = json!({ "serviceIds": service_filter(services) });
            client.post(&["v1", "backup", "trigger"], Some(body)).await
        }
        Commands::Restore {
            backup_id,
            services,
        } => {
            let body = json!({
                "backupId": backup_id,
                "serviceIds": service_filter(services),
            });
            client.post(&["v1", "restore", "trigger"], Some(body)).await
        }
        Commands::KernelBackup { action } => kernel_backup(client, action).await,
        Commands::Schedule { action } => schedule(client, action).await,
        Commands::Audit {
            entity_type,
            entity_id,
            event,
            limit,
        } => {
            let q = query(&[
                ("entityType", entity_type),
                ("entityId", entity_id),
                ("eventType", event),
                ("limit", limit.map(|l| l.to_string())),
            ]);
            client.get(&["v1", "audit"], &q).await
        }
    }
}

async fn services(client: &KernelClient, action: ServicesAction) -> Reply {
    match action {
        ServicesAction::List => client.get(&["v1", "services"], &[]).await,
        ServicesAction::Get { id } => client.get(&["v1", "services", &id], &[]).await,
        ServicesAction::Register {
            id,
            endpoint,
            health_check,
            description,
            version,
            tags,
        } => {
            let mut body = Map::new();
            body.insert("id".into(), json!(id));
            body.insert("endpoint".into(), json!(endpoint));
            if let Some(path) = health_check {
                body.insert("healthCheck".into(), json!(path));
            }
            if let Some(description) = description {
                body.insert("description".into(), json!(description));
            }
            if let Some(version) = version {
                body.insert("version".into(), json!(version));
            }
            if !tags.is_empty() {
                body.insert("tags".into(), json!(tags));
            }
            client
                .post(&["v1", "services"], Some(Value::Object(body)))
                .await
        }
        ServicesAction::Unregister { id } => client.delete(&["v1", "services", &id]).await,
    }
}

async fn config(client: &KernelClient, action: ConfigAction) -> Reply {
    match action {
        ConfigAction::List { prefix } => {
            client
                .get(&["v1", "config"], &query(&[("prefix", prefix)]))
                .await
        }
        ConfigAction::Get { key } => client.get(&["v1", "config", &key], &[]).await,
        ConfigAction::Set {
            key,
            value,
            description,
        } => {
            let body = json!({ "value": parse_value(&value), "description": description });
            client.put(&["v1", "config", &key], body).await
        }
        ConfigAction::Delete { key } => client.delete(&["v1", "config", &key]).await,
        ConfigAction::History { key, limit } => {
            let q = query(&[("limit", limit.map(|l| l.to_string()))]);
            client.get(&["v1", "config", &key, "history"], &q).await
        }
    }
}

async fn kernel_backup(client: &KernelClient, action: KernelBackupAction) -> Reply {
    match action {
        KernelBackupAction::Create => client.post(&["v1", "backup", "kernel"], None).await,
        KernelBackupAction::List => client.get(&["v1", "backup", "kernel"], &[]).await,
        KernelBackupAction::Get { id } => client.get(&["v1", "backup", "kernel", &id], &[]).await,
        KernelBackupAction::Verify { id } => {
            client
                .post(&["v1", "backup", "kernel", &id, "verify"], None)
                .await
        }
        KernelBackupAction::Restore { id } => {
            client
                .post(&["v1", "backup", "kernel", &id, "restore"], None)
                .await
        }
        KernelBackupAction::Delete { id } => {
            client.delete(&["v1", "backup", "kernel", &id]).await
        }
    }
}

async fn schedule(client: &KernelClient, action: ScheduleAction) -> Reply {
    let toggle = |enabled: bool| json!({ "enabled": enabled });
    match action {
        ScheduleAction::List => client.get(&["v1", "backup", "schedules"], &[]).await,
        ScheduleAction::Create {
            name,
            cron,
            backup_type,
            retention_days,
            disabled,
        } => {
            let mut body = json!({
                "name": name,
                "cronExpression": cron,
                "backupType": backup_type,
                "enabled": !disabled,
            });
            if let Some(days) = retention_days {
                body["retentionDays"] = json!(days);
            }
            client
                .post(&["v1", "backup", "schedules"], Some(body))
                .await
        }
        ScheduleAction::Enable { id } => {
            client
                .request(
                    reqwest::Method::PATCH,
                    &["v1", "backup", "schedules", &id],
                    &[],
                    Some(toggle(true)),
                )
                .await
        }
        ScheduleAction::Disable { id } => {
            client
                .request(
                    reqwest::Method::PATCH,
                    &["v1", "backup", "schedules", &id],
                    &[],
                    Some(toggle(false)),
                )
                .await
        }
        ScheduleAction::Delete { id } => {
            client.delete(&["v1", "backup", "schedules", &id]).await
        }
    }
}
