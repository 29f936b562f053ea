//! Test support: a scripted in-process server speaking just enough of
//! the wire protocol to drive the client end to end.

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

pub(crate) const DEFAULT_INFO: &str =
    r#"{"server_id":"test","max_payload":1048576,"proto":1,"headers":true}"#;

pub(crate) struct TestServer {
    listener: TcpListener,
}

pub(crate) struct ServerConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

/// A command the scripted server read from the client
#[derive(Debug)]
pub(crate) enum ServerSeen {
    Connect(String),
    Ping,
    Pong,
    Sub {
        subject: String,
        queue: Option<String>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max: Option<u64>,
    },
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Vec<u8>,
    },
}

impl TestServer {
    pub(crate) async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub(crate) fn url(&self) -> String {
        format!("nats://{}", self.listener.local_addr().unwrap())
    }

    /// Accept a connection and run the handshake with [`DEFAULT_INFO`]
    pub(crate) async fn accept(&self) -> ServerConn {
        self.accept_with_info(DEFAULT_INFO).await
    }

    pub(crate) async fn accept_with_info(&self, info: &str) -> ServerConn {
        let mut conn = self.accept_raw().await;
        conn.send(format!("INFO {info}\r\n").as_bytes()).await;

        let connect = conn.read_command().await;
        assert!(matches!(connect, ServerSeen::Connect(_)), "{connect:?}");
        let ping = conn.read_command().await;
        assert!(matches!(ping, ServerSeen::Ping), "{ping:?}");
        conn.send(b"PONG\r\n").await;

        conn
    }

    /// Accept a connection without speaking any protocol
    pub(crate) async fn accept_raw(&self) -> ServerConn {
        let (stream, _addr) = self.listener.accept().await.unwrap();
        ServerConn {
            stream,
            buf: Vec::new(),
        }
    }
}

impl ServerConn {
    pub(crate) async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn fill(&mut self) {
        let mut chunk = [0; 4096];
        let n = self.stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed the connection");
        self.buf.extend_from_slice(&chunk[..n]);
    }

    async fn read_line(&mut self) -> String {
        loop {
            if let Some(i) = self
                .buf
                .windows(2)
                .position(|window| window == b"\r\n")
            {
                let line = self.buf.drain(..i + 2).take(i).collect::<Vec<_>>();
                return String::from_utf8(line).unwrap();
            }
            self.fill().await;
        }
    }

    async fn read_exact_bytes(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            self.fill().await;
        }
        self.buf.drain(..n).collect()
    }

    pub(crate) async fn read_command(&mut self) -> ServerSeen {
        let line = self.read_line().await;
        let mut parts = line.split_ascii_whitespace();
        let verb = parts.next().unwrap_or_default().to_ascii_uppercase();

        match verb.as_str() {
            "CONNECT" => ServerSeen::Connect(line["CONNECT ".len()..].to_owned()),
            "PING" => ServerSeen::Ping,
            "PONG" => ServerSeen::Pong,
            "SUB" => {
                let args = parts.collect::<Vec<_>>();
                match args.as_slice() {
                    [subject, sid] => ServerSeen::Sub {
                        subject: (*subject).to_owned(),
                        queue: None,
                        sid: sid.parse().unwrap(),
                    },
                    [subject, queue, sid] => ServerSeen::Sub {
                        subject: (*subject).to_owned(),
                        queue: Some((*queue).to_owned()),
                        sid: sid.parse().unwrap(),
                    },
                    _ => panic!("malformed SUB: {line}"),
                }
            }
            "UNSUB" => {
                let args = parts.collect::<Vec<_>>();
                match args.as_slice() {
                    [sid] => ServerSeen::Unsub {
                        sid: sid.parse().unwrap(),
                        max: None,
                    },
                    [sid, max] => ServerSeen::Unsub {
                        sid: sid.parse().unwrap(),
                        max: Some(max.parse().unwrap()),
                    },
                    _ => panic!("malformed UNSUB: {line}"),
                }
            }
            "PUB" => {
                let args = parts.collect::<Vec<_>>();
                let (subject, reply, len) = match args.as_slice() {
                    [subject, len] => ((*subject).to_owned(), None, len.parse().unwrap()),
                    [subject, reply, len] => (
                        (*subject).to_owned(),
                        Some((*reply).to_owned()),
                        len.parse().unwrap(),
                    ),
                    _ => panic!("malformed PUB: {line}"),
                };
                let mut payload = self.read_exact_bytes(len + 2).await;
                payload.truncate(len);
                ServerSeen::Pub {
                    subject,
                    reply,
                    payload,
                }
            }
            "HPUB" => {
                let args = parts.collect::<Vec<_>>();
                let (subject, reply, total) = match args.as_slice() {
                    [subject, _hlen, tlen] => ((*subject).to_owned(), None, tlen.parse().unwrap()),
                    [subject, reply, _hlen, tlen] => (
                        (*subject).to_owned(),
                        Some((*reply).to_owned()),
                        tlen.parse().unwrap(),
                    ),
                    _ => panic!("malformed HPUB: {line}"),
                };
                let mut payload = self.read_exact_bytes(total + 2).await;
                payload.truncate(total);
                ServerSeen::Pub {
                    subject,
                    reply,
                    payload,
                }
            }
            _ => panic!("unexpected client command: {line}"),
        }
    }

    /// Read commands until a PING shows up, answering it with PONG
    pub(crate) async fn answer_ping(&mut self) {
        loop {
            if matches!(self.read_command().await, ServerSeen::Ping) {
                self.send(b"PONG\r\n").await;
                return;
            }
        }
    }
}

mod scenarios {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use bytes::Bytes;
    use cantaloupe_proto::Subject;
    use claims::assert_matches;

    use crate::client::{
        Client, ClientError, ConnectError, PublishError, ResponseError,
    };
    use crate::subscription::NextMessageError;

    use super::{ServerSeen, TestServer};

    #[tokio::test]
    async fn connect_and_flush() {
        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;
            // The flush PING
            conn.answer_ping().await;
            conn
        });

        let client = Client::builder().connect(&url).await.unwrap();
        client.flush(Duration::from_secs(1)).await.unwrap();

        drop(server_task.await.unwrap());
        drop(client);
    }

    #[tokio::test]
    async fn no_servers_available() {
        // Nothing is listening on a freshly bound and dropped port
        let port = {
            let server = TestServer::bind().await;
            server
                .url()
                .rsplit(':')
                .next()
                .unwrap()
                .parse::<u16>()
                .unwrap()
        };

        let err = Client::builder()
            .connect(&format!("nats://127.0.0.1:{port}"))
            .await
            .unwrap_err();
        assert_matches!(err, ConnectError::NoServersAvailable(_));
    }

    #[tokio::test]
    async fn oversized_publish_is_rejected_locally() {
        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;
            // The accepted publish, then the flush PING
            loop {
                match conn.read_command().await {
                    ServerSeen::Pub { payload, .. } => {
                        assert_eq!(payload.len(), 1024 * 1024);
                    }
                    ServerSeen::Ping => {
                        conn.send(b"PONG\r\n").await;
                        break;
                    }
                    other => panic!("unexpected command {other:?}"),
                }
            }
            conn
        });

        let client = Client::builder().connect(&url).await.unwrap();

        let err = client
            .publish(Subject::from_static("big"))
            .payload(Bytes::from(vec![0; 2 * 1024 * 1024]))
            .await
            .unwrap_err();
        assert_matches!(err, PublishError::MaxPayload { .. });

        client
            .publish(Subject::from_static("big"))
            .payload(Bytes::from(vec![0; 1024 * 1024]))
            .await
            .unwrap();
        client.flush(Duration::from_secs(1)).await.unwrap();

        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn sync_subscription_delivers_in_order() {
        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;
            let ServerSeen::Sub { subject, sid, .. } = conn.read_command().await else {
                panic!("expected SUB");
            };
            assert_eq!(subject, "foo");

            for payload in ["a", "b", "c"] {
                conn.send(
                    format!("MSG foo {sid} {}\r\n{payload}\r\n", payload.len()).as_bytes(),
                )
                .await;
            }
            conn
        });

        let client = Client::builder().connect(&url).await.unwrap();
        let mut subscription = client
            .subscribe(Subject::from_static("foo"), None)
            .await
            .unwrap();

        for expected in ["a", "b", "c"] {
            let message = subscription
                .next_message(Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(message.base.payload, expected.as_bytes());
        }

        let err = subscription
            .next_message(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_matches!(err, NextMessageError::TimedOut);

        assert_eq!(subscription.stats().delivered(), 3);
        assert_eq!(subscription.stats().dropped(), 0);
        assert_eq!(subscription.stats().pending_msgs(), 0);

        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn slow_consumer_drops_and_reports_once() {
        let server = TestServer::bind().await;
        let url = server.url();

        let slow_consumer_reports = Arc::new(AtomicUsize::new(0));

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;
            let ServerSeen::Sub { sid, .. } = conn.read_command().await else {
                panic!("expected SUB");
            };

            for payload in ["1", "2", "3"] {
                conn.send(format!("MSG foo {sid} 1\r\n{payload}\r\n").as_bytes())
                    .await;
            }
            conn
        });

        let client = Client::builder()
            .max_pending_msgs(2)
            .on_error({
                let slow_consumer_reports = Arc::clone(&slow_consumer_reports);
                move |err| {
                    if matches!(err, ClientError::SlowConsumer { .. }) {
                        slow_consumer_reports.fetch_add(1, Ordering::AcqRel);
                    }
                }
            })
            .connect(&url)
            .await
            .unwrap();
        let mut subscription = client
            .subscribe(Subject::from_static("foo"), None)
            .await
            .unwrap();

        // Wait for the connection to route all three messages
        for _ in 0..100 {
            if subscription.stats().dropped() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(subscription.stats().dropped(), 1);
        assert_eq!(subscription.stats().pending_msgs(), 2);

        let first = subscription
            .next_message(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.base.payload, Bytes::from_static(b"1"));
        let second = subscription
            .next_message(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.base.payload, Bytes::from_static(b"2"));

        // The burst was coalesced into one report
        for _ in 0..100 {
            if slow_consumer_reports.load(Ordering::Acquire) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(slow_consumer_reports.load(Ordering::Acquire), 1);

        assert_eq!(subscription.stats().delivered(), 2);

        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn request_translates_no_responders() {
        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;

            // The lazily created request inbox subscription
            let ServerSeen::Sub { subject, sid, .. } = conn.read_command().await else {
                panic!("expected SUB");
            };
            assert!(subject.starts_with("_INBOX."));
            assert!(subject.ends_with(".*"));

            let ServerSeen::Pub { subject, reply, .. } = conn.read_command().await else {
                panic!("expected PUB");
            };
            assert_eq!(subject, "svc.add");
            let reply = reply.unwrap();

            // No subscribers: report 503 to the reply subject
            conn.send(
                format!("HMSG {reply} {sid} 16 16\r\nNATS/1.0 503\r\n\r\n\r\n").as_bytes(),
            )
            .await;
            conn
        });

        let client = Client::builder().connect(&url).await.unwrap();

        let started = tokio::time::Instant::now();
        let response = client
            .request(Subject::from_static("svc.add"))
            .payload(Bytes::from_static(b"2 3"))
            .await
            .unwrap();
        let err = response.await.unwrap_err();
        assert_matches!(err, ResponseError::NoResponders);
        // Well before the default 5 second request timeout
        assert!(started.elapsed() < Duration::from_secs(1));

        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn handler_task_serializes_and_completes() {
        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;
            let ServerSeen::Sub { sid, .. } = conn.read_command().await else {
                panic!("expected SUB");
            };
            for payload in ["a", "b", "c"] {
                conn.send(format!("MSG foo {sid} 1\r\n{payload}\r\n").as_bytes())
                    .await;
            }
            conn
        });

        let client = Client::builder().connect(&url).await.unwrap();
        let subscription = client
            .subscribe(Subject::from_static("foo"), None)
            .await
            .unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicUsize::new(0));
        let delivery = subscription.spawn_handler(
            {
                let seen = Arc::clone(&seen);
                move |message| {
                    seen.lock().unwrap().push(message.base.payload.clone());
                }
            },
            {
                let completed = Arc::clone(&completed);
                move || {
                    completed.fetch_add(1, Ordering::AcqRel);
                }
            },
        );

        for _ in 0..100 {
            if seen.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            [
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );

        // Closing the client ends the delivery task, firing the
        // completion callback after the final message
        client.close().await;
        delivery.await.unwrap();
        assert_eq!(completed.load(Ordering::Acquire), 1);

        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn subscription_stream_terminates_after_close() {
        use futures_util::StreamExt as _;

        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;
            let ServerSeen::Sub { sid, .. } = conn.read_command().await else {
                panic!("expected SUB");
            };
            conn.send(format!("MSG foo {sid} 2\r\nhi\r\n").as_bytes())
                .await;

            let ServerSeen::Unsub { sid: unsub_sid, max } = conn.read_command().await else {
                panic!("expected UNSUB");
            };
            assert_eq!(unsub_sid, sid);
            assert_eq!(max, None);
            conn
        });

        let client = Client::builder().connect(&url).await.unwrap();
        let mut subscription = client
            .subscribe(Subject::from_static("foo"), None)
            .await
            .unwrap();

        let message = subscription.next().await.unwrap().unwrap();
        assert_eq!(message.base.payload, Bytes::from_static(b"hi"));

        subscription.close().await.unwrap();
        // The server confirms the unsubscribe; the stream ends once the
        // connection drops its sending half
        drop(server_task.await.unwrap());
        assert_eq!(subscription.next().await, None);
    }

    #[tokio::test]
    async fn reconnect_replays_subscriptions() {
        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;
            let ServerSeen::Sub { subject, sid, .. } = conn.read_command().await else {
                panic!("expected SUB");
            };
            assert_eq!(subject, "bar");

            // Cut the connection
            drop(conn);

            // The client comes back and replays the subscription
            let mut conn = server.accept().await;
            let ServerSeen::Sub {
                subject,
                sid: replayed_sid,
                ..
            } = conn.read_command().await
            else {
                panic!("expected replayed SUB");
            };
            assert_eq!(subject, "bar");
            assert_eq!(replayed_sid, sid);

            conn.send(format!("MSG bar {sid} 5\r\nafter\r\n").as_bytes())
                .await;
            conn
        });

        let client = Client::builder()
            .max_reconnect(Some(3))
            .reconnect_wait(Duration::from_millis(20))
            .reconnect_jitter(Duration::ZERO)
            .connect(&url)
            .await
            .unwrap();
        let mut subscription = client
            .subscribe(Subject::from_static("bar"), None)
            .await
            .unwrap();

        let message = subscription
            .next_message(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(message.base.payload, Bytes::from_static(b"after"));

        // Delivered exactly once
        let err = subscription
            .next_message(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_matches!(err, NextMessageError::TimedOut);

        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn drain_winds_the_client_down() {
        use crate::client::ClientStatus;

        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;
            assert_matches!(conn.read_command().await, ServerSeen::Sub { .. });
            let ServerSeen::Pub { payload, .. } = conn.read_command().await else {
                panic!("expected PUB");
            };
            assert_eq!(payload, b"tail");
            assert_matches!(
                conn.read_command().await,
                ServerSeen::Unsub { max: None, .. }
            );
            conn
        });

        let client = Client::builder().connect(&url).await.unwrap();
        let _subscription = client
            .subscribe(Subject::from_static("foo"), None)
            .await
            .unwrap();
        client
            .publish(Subject::from_static("bar"))
            .payload(Bytes::from_static(b"tail"))
            .await
            .unwrap();

        client.drain(Duration::from_secs(1)).await.unwrap();

        for _ in 0..100 {
            if client.status() == ClientStatus::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.status(), ClientStatus::Closed);

        // The connection is gone: further publishes fail
        let err = client
            .publish(Subject::from_static("bar"))
            .payload(Bytes::new())
            .await
            .unwrap_err();
        assert_matches!(err, PublishError::Closed(_));

        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn auto_unsubscribe_replays_residual_cap() {
        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;
            let ServerSeen::Sub { sid, .. } = conn.read_command().await else {
                panic!("expected SUB");
            };
            let ServerSeen::Unsub { max, .. } = conn.read_command().await else {
                panic!("expected UNSUB");
            };
            assert_eq!(max, Some(5));

            // Deliver two of the five, then cut the connection
            conn.send(format!("MSG baz {sid} 1\r\na\r\nMSG baz {sid} 1\r\nb\r\n").as_bytes())
                .await;
            // Let the deliveries reach the client before cutting
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(conn);

            let mut conn = server.accept().await;
            let ServerSeen::Sub { subject, .. } = conn.read_command().await else {
                panic!("expected replayed SUB");
            };
            assert_eq!(subject, "baz");
            let ServerSeen::Unsub { max, .. } = conn.read_command().await else {
                panic!("expected replayed UNSUB");
            };
            // 5 asked, 2 routed: 3 remain
            assert_eq!(max, Some(3));
            conn
        });

        let client = Client::builder()
            .reconnect_wait(Duration::from_millis(20))
            .reconnect_jitter(Duration::ZERO)
            .connect(&url)
            .await
            .unwrap();
        let mut subscription = client
            .subscribe(Subject::from_static("baz"), None)
            .await
            .unwrap();
        subscription
            .close_after(std::num::NonZeroU64::new(5).unwrap())
            .await
            .unwrap();

        let first = subscription
            .next_message(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.base.payload, Bytes::from_static(b"a"));
        let second = subscription
            .next_message(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(second.base.payload, Bytes::from_static(b"b"));

        drop(server_task.await.unwrap());
    }
}
