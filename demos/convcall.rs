// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;

use conversation_rpc::client;
use conversation_rpc::config::ClientConfig;
use conversation_rpc::envelope::EnvelopeKind;

static APP: &'static str = "convcall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for holding a service conversation")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("service")
                .help("Service type to open a conversation with")
                .long("service")
                .short("s")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded messages to send, one per occurrence")
                .long("args")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .required(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Receive timeout in milliseconds (Default: the service's)")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("replies")
                .help("Close the conversation after this many replies instead of waiting for the service to end it")
                .long("replies")
                .short("r")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("abandon")
                .help("Cancel the conversation right after sending")
                .long("abandon-immediately")
                .short("a")
                .takes_value(false),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let service = String::from(matches.value_of("service").unwrap_or_else(|| {
        eprintln!("Failed to parse service argument as String");
        process::exit(1)
    }));
    let args: Vec<Value> = matches
        .values_of("args")
        .map(|values| {
            values
                .map(|v| {
                    serde_json::from_str(v).unwrap_or_else(|e| {
                        eprintln!("Failed to parse args as JSON: {}", e);
                        process::exit(1)
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let mut config = ClientConfig::default();
    if matches.is_present("timeout") {
        let timeout = value_t!(matches, "timeout", u64).unwrap_or_else(|e| e.exit());
        config = config.receive_timeout(Duration::from_millis(timeout));
    }

    let client = client::connect(&addr, config, None)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to connect to server: {}", e);
            process::exit(1)
        });

    let mut conversation = client
        .start_conversation(&service)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            process::exit(1)
        });
    if conversation.server_work_queue_size_at_startup() > 0 {
        eprintln!(
            "queued behind {} other conversations",
            conversation.server_work_queue_size_at_startup() - 1
        );
    }
    conversation.set_progress_listener(|progress| eprintln!("progress: {}", progress));

    for arg in &args {
        if let Err(e) = conversation.send(arg) {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    }
    if matches.is_present("abandon") {
        conversation.cancel();
        return;
    }

    let replies = if matches.is_present("replies") {
        Some(value_t!(matches, "replies", usize).unwrap_or_else(|e| e.exit()))
    } else {
        None
    };
    let mut received = 0;
    loop {
        if replies == Some(received) {
            conversation.close();
            break;
        }
        match conversation.receive_envelope().await {
            Ok(envelope) if envelope.kind() == EnvelopeKind::Data => {
                println!("{}", envelope.payload());
                received += 1;
            }
            Ok(_) => break,
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1)
            }
        }
    }
}
