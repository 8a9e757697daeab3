// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use slog::{debug, info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_test::block_on;
use tokio_util::codec::Framed;

use conversation_rpc::client;
use conversation_rpc::config::{ClientConfig, ServerConfig};
use conversation_rpc::error::{ConversationError, ServiceResult};
use conversation_rpc::factory::{FnServiceFactory, Service};
use conversation_rpc::messenger::ServiceMessenger;
use conversation_rpc::protocol::{
    ConversationCodec, ConversationStart, Frame, OpenFrame, OpenRequest, OpenedFrame,
};
use conversation_rpc::server::{self, ConversationServer};

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

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

struct EchoOnce;

impl Service for EchoOnce {
    fn run(self: Box<Self>, messenger: ServiceMessenger) -> BoxFuture<'static, ServiceResult> {
        Box::pin(async move {
            let msg: Value = messenger.receive().await?;
            messenger.send(&msg)?;
            Ok(())
        })
    }
}

/// Answers the first message, rejects the second.
struct Picky;

impl Service for Picky {
    fn run(self: Box<Self>, messenger: ServiceMessenger) -> BoxFuture<'static, ServiceResult> {
        Box::pin(async move {
            let _: Value = messenger.receive().await?;
            messenger.send(&"OK1")?;
            let _: Value = messenger.receive().await?;
            Err("Don't like you!".into())
        })
    }
}

/// Waits for interruption and counts it.
struct Idle {
    interrupted: Arc<AtomicUsize>,
}

impl Service for Idle {
    fn run(self: Box<Self>, messenger: ServiceMessenger) -> BoxFuture<'static, ServiceResult> {
        Box::pin(async move {
            messenger.cancelled().await;
            self.interrupted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

struct TestServer {
    addr: SocketAddr,
    server: ConversationServer,
    interrupted: Arc<AtomicUsize>,
}

#[tokio::main]
async fn run_server(ready: mpsc::Sender<TestServer>) {
    let root_log = test_logger();
    let server = ConversationServer::new(ServerConfig::default(), Some(&root_log));
    let interrupted = Arc::new(AtomicUsize::new(0));

    let echo_log = root_log.new(o!("service" => "echo"));
    server
        .add_service_type(
            FnServiceFactory::new("echo", move || {
                Ok(Box::new(Echo {
                    log: echo_log.clone(),
                }) as Box<dyn Service>)
            })
            .with_client_timeout(Duration::from_secs(10)),
        )
        .expect("failed to register echo");
    server
        .add_service_type(FnServiceFactory::new("echo-once", || {
            Ok(Box::new(EchoOnce) as Box<dyn Service>)
        }))
        .expect("failed to register echo-once");
    server
        .add_service_type(FnServiceFactory::new("picky", || {
            Ok(Box::new(Picky) as Box<dyn Service>)
        }))
        .expect("failed to register picky");
    let counter = Arc::clone(&interrupted);
    server
        .add_service_type(
            FnServiceFactory::new("idle", move || {
                Ok(Box::new(Idle {
                    interrupted: Arc::clone(&counter),
                }) as Box<dyn Service>)
            })
            .with_interrupt_on_client_exception(true),
        )
        .expect("failed to register idle");

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("no local address");
    info!(root_log, "listening for conversations"; "address" => %addr);
    ready
        .send(TestServer {
            addr,
            server: server.clone(),
            interrupted,
        })
        .expect("test went away");

    while let Ok((stream, _)) = listener.accept().await {
        let process_log = root_log.clone();
        let server = server.clone();
        tokio::spawn(async move {
            server::make_task(stream, server, Some(&process_log)).await;
        });
    }
}

fn start_test_server() -> TestServer {
    let (ready_tx, ready_rx) = mpsc::channel();
    let _h_server = thread::spawn(move || run_server(ready_tx));
    ready_rx.recv().expect("server failed to start")
}

fn start_server() -> SocketAddr {
    start_test_server().addr
}

/// Polls `condition` for up to two seconds.
async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Answers the first open on the first connection, then hangs up.
async fn one_shot_server(listener: TcpListener) {
    let (socket, _) = listener.accept().await.expect("accept failed");
    let mut framed = Framed::new(socket, ConversationCodec::default());
    if let Some(Ok(Frame::Open(open))) = framed.next().await {
        let start = ConversationStart {
            conversation_id: open.request.conversation_id.expect("client picks the id"),
            client_timeout_millis: 10_000,
            work_queue_size_at_startup: 0,
        };
        framed
            .send(Frame::Opened(OpenedFrame {
                request_id: open.request_id,
                start,
            }))
            .await
            .expect("failed to answer open");
    }
}

#[test]
fn large_payloads() {
    let addr = start_server();
    block_on(async {
        let client = client::connect(&addr, ClientConfig::default(), None)
            .await
            .expect("failed to connect");

        for i in 1..50 {
            let data_size = i * 1000;
            let args = vec!["a".repeat(data_size)];
            let result: Vec<String> = client.call("echo-once", &args).await.unwrap();
            assert_eq!(result.len(), 1);
            assert_eq!(result[0].len(), data_size);
        }
    });
}

#[test]
fn interleaved_conversations_share_one_connection() {
    let addr = start_server();
    block_on(async {
        let client = client::connect(&addr, ClientConfig::default(), Some(&test_logger()))
            .await
            .expect("failed to connect");

        let mut conversations = Vec::new();
        for _ in 0..3 {
            conversations.push(client.start_conversation("echo").await.unwrap());
        }
        assert_eq!(client.open_conversations(), 3);

        for round in 0..5 {
            for (n, conversation) in conversations.iter().enumerate() {
                conversation.send(&format!("{}-{}", n, round)).unwrap();
            }
            for (n, conversation) in conversations.iter_mut().enumerate() {
                let reply: String = conversation.receive().await.unwrap();
                assert_eq!(reply, format!("{}-{}", n, round));
            }
        }

        for conversation in &conversations {
            conversation.close();
        }
        assert_eq!(client.open_conversations(), 0);
    });
}

#[test]
fn open_failures_cross_the_wire() {
    let addr = start_server();
    block_on(async {
        let client = client::connect(&addr, ClientConfig::default(), None)
            .await
            .expect("failed to connect");

        match client.start_conversation("no-such-service").await {
            Err(ConversationError::UnknownServiceType(id)) => assert_eq!(id, "no-such-service"),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("opened a conversation with an unknown service"),
        }
        assert_eq!(client.open_conversations(), 0);

        // The connection is still usable.
        let echoed: String = client.call("echo-once", &"still here").await.unwrap();
        assert_eq!(echoed, "still here");
    });
}

#[test]
fn service_exception_reaches_client() {
    let addr = start_server();
    block_on(async {
        let client = client::connect(&addr, ClientConfig::default(), None)
            .await
            .expect("failed to connect");

        let mut conversation = client.start_conversation("picky").await.unwrap();
        conversation.send(&"first").unwrap();
        let reply: String = conversation.receive().await.unwrap();
        assert_eq!(reply, "OK1");

        conversation.send(&"second").unwrap();
        match conversation.receive::<Value>().await {
            Err(ConversationError::ServiceExecution { description, .. }) => {
                assert_eq!(description, "Don't like you!")
            }
            other => panic!("expected a service failure, got {:?}", other),
        }
        assert!(conversation.is_closed());
        assert!(matches!(
            conversation.send(&"third"),
            Err(ConversationError::ServiceExecution { .. })
        ));
    });
}

#[test]
fn dropped_connection_cancels_its_conversations() {
    let test_server = start_test_server();
    block_on(async {
        let socket = TcpStream::connect(&test_server.addr)
            .await
            .expect("failed to connect");
        let mut framed = Framed::new(socket, ConversationCodec::default());
        framed
            .send(Frame::Open(OpenFrame {
                request_id: 1,
                request: OpenRequest::new("idle"),
            }))
            .await
            .unwrap();
        let id = match framed.next().await {
            Some(Ok(Frame::Opened(opened))) => {
                assert_eq!(opened.request_id, 1);
                opened.start.conversation_id
            }
            other => panic!("expected an opened frame, got {:?}", other),
        };
        assert!(test_server.server.has_conversation(&id));

        drop(framed);

        let server = test_server.server.clone();
        assert!(eventually(|| !server.has_conversation(&id)).await);
        let interrupted = Arc::clone(&test_server.interrupted);
        assert!(eventually(|| interrupted.load(Ordering::SeqCst) == 1).await);
    });
}

#[test]
fn lost_server_fails_open_conversations() {
    block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(one_shot_server(listener));

        let client = client::connect(&addr, ClientConfig::default(), None)
            .await
            .expect("failed to connect");
        let mut conversation = client.start_conversation("echo").await.unwrap();

        let received = time::timeout(Duration::from_secs(2), conversation.receive::<Value>())
            .await
            .expect("receive did not notice the lost connection");
        assert!(matches!(received, Err(ConversationError::Transport(_))));
        assert!(matches!(
            conversation.send(&"anyone there?"),
            Err(ConversationError::Transport(_))
        ));
        assert_eq!(client.open_conversations(), 0);

        let reopened = time::timeout(Duration::from_secs(2), client.start_conversation("echo"))
            .await
            .expect("open after the connection closed did not return");
        assert!(matches!(reopened, Err(ConversationError::Transport(_))));
        assert_eq!(client.open_conversations(), 0);
    });
}

#[test]
fn open_after_server_hung_up() {
    block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let client = client::connect(&addr, ClientConfig::default(), None)
            .await
            .expect("failed to connect");
        time::sleep(Duration::from_millis(200)).await;

        let opened = time::timeout(Duration::from_secs(2), client.start_conversation("echo"))
            .await
            .expect("open after the connection closed did not return");
        assert!(matches!(opened, Err(ConversationError::Transport(_))));
        assert_eq!(client.open_conversations(), 0);
    });
}
