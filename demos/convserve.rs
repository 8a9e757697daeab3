// Copyright 2020 Joyent, Inc.

use std::env;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::prelude::*;
use futures::future::BoxFuture;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::TcpListener;
use tokio::time;

use conversation_rpc::config::ServerConfig;
use conversation_rpc::error::ServiceResult;
use conversation_rpc::factory::{FnServiceFactory, Service};
use conversation_rpc::messenger::ServiceMessenger;
use conversation_rpc::progress::ProgressMode;
use conversation_rpc::server::{self, ConversationServer};

#[derive(Serialize, Deserialize)]
struct YesPayload {
    value: Value,
    count: u32,
}

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: i64,
    iso8601: DateTime<Utc>,
}

impl DatePayload {
    fn new() -> DatePayload {
        let now = Utc::now();
        DatePayload {
            timestamp: now.timestamp_millis(),
            iso8601: now,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SlowPayload {
    echo: Value,
    delay: Option<u64>,
}

/// Echoes every message until the client ends the conversation.
struct Echo {
    log: Logger,
}

impl Service for Echo {
    fn run(self: Box<Self>, messenger: ServiceMessenger) -> BoxFuture<'static, ServiceResult> {
        Box::pin(async move {
            loop {
                let msg: Value = messenger.receive().await?;
                debug!(self.log, "handling echo request");
                messenger.send(&msg)?;
            }
        })
    }
}

struct Date;

impl Service for Date {
    fn run(self: Box<Self>, messenger: ServiceMessenger) -> BoxFuture<'static, ServiceResult> {
        Box::pin(async move {
            let _: Value = messenger.receive().await?;
            messenger.send(&DatePayload::new())?;
            Ok(())
        })
    }
}

/// Sends `value` back `count` times, reporting progress along the way.
struct Yes;

impl Service for Yes {
    fn run(self: Box<Self>, messenger: ServiceMessenger) -> BoxFuture<'static, ServiceResult> {
        Box::pin(async move {
            let payload: YesPayload = messenger.receive().await?;
            for i in 0..payload.count {
                if messenger.is_cancelled() {
                    return Err("cancelled by client".into());
                }
                messenger.progress(&json!({ "sent": i, "of": payload.count }))?;
                messenger.send(&payload.value)?;
            }
            Ok(())
        })
    }
}

/// Waits `delay` ms before answering. Kept alive by automatic progress.
struct Slow;

impl Service for Slow {
    fn run(self: Box<Self>, messenger: ServiceMessenger) -> BoxFuture<'static, ServiceResult> {
        Box::pin(async move {
            let payload: SlowPayload = messenger.receive().await?;
            let delay = Duration::from_millis(payload.delay.unwrap_or(0));
            tokio::select! {
                _ = time::sleep(delay) => (),
                _ = messenger.cancelled() => return Err("interrupted".into()),
            }
            messenger.send(&json!({ "value": payload.echo }))?;
            Ok(())
        })
    }
}

fn register_services(server: &ConversationServer, log: &Logger) -> conversation_rpc::Result<()> {
    let echo_log = log.new(o!("service" => "echo"));
    server.add_service_type(
        FnServiceFactory::new("echo", move || {
            Ok(Box::new(Echo {
                log: echo_log.clone(),
            }) as Box<dyn Service>)
        })
        .with_client_timeout(Duration::from_secs(60)),
    )?;
    server.add_service_type(FnServiceFactory::new("date", || {
        Ok(Box::new(Date) as Box<dyn Service>)
    }))?;
    server.add_service_type(FnServiceFactory::new("yes", || {
        Ok(Box::new(Yes) as Box<dyn Service>)
    }))?;
    server.add_service_type(
        FnServiceFactory::new("slow", || Ok(Box::new(Slow) as Box<dyn Service>))
            .with_client_timeout(Duration::from_secs(5))
            .with_progress_mode(ProgressMode::Automatic {
                cadence: Duration::from_secs(1),
            }),
    )?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2030".to_string());
    let addr = addr.parse::<SocketAddr>().expect("invalid listen address");

    let config = match env::args().nth(2) {
        Some(path) => {
            let contents = std::fs::read_to_string(&path).expect("failed to read config");
            ServerConfig::from_json_str(&contents).expect("invalid config")
        }
        None => ServerConfig::default(),
    };
    let server = ConversationServer::new(config, Some(&root_log));
    register_services(&server, &root_log).expect("failed to register services");

    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!(root_log, "listening for conversations"; "address" => addr,
        "services" => ?server.service_type_ids());

    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                let process_log = root_log.clone();
                let server = server.clone();
                tokio::spawn(async move {
                    server::make_task(socket, server, Some(&process_log)).await;
                });
            }
            Err(e) => error!(root_log, "failed to accept socket"; "err" => %e),
        }
    }
}
