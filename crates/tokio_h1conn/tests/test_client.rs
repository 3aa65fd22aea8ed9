//! クライアントエンジンの結合テスト
//!
//! スクリプト化した TCP サーバーを相手に、エンジンのライフサイクル
//! (キープアライブ、パイプライン、ストリームボディ、中断、
//! プロトコル切り替え、タイムアウト) を検証する。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use tokio_h1conn::{
    AbortHandle, Client, ClientOptions, Error, Handler, Origin, Request, RequestBody, Resumer,
    ResponseHead, UpgradedStream,
};

enum TestEvent {
    Connect,
    Informational(u16),
    BodySent,
    Headers(ResponseHead),
    Data(Vec<u8>),
    Complete(Vec<(String, String)>),
    Error(String),
    Upgrade(u16, UpgradedStream),
}

struct TestHandler {
    tx: mpsc::UnboundedSender<TestEvent>,
    pause_on_headers: bool,
    abort_slot: Option<Arc<Mutex<Option<AbortHandle>>>>,
    resumer_slot: Option<Arc<Mutex<Option<Resumer>>>>,
    complete_log: Option<(Arc<Mutex<Vec<&'static str>>>, &'static str)>,
}

impl TestHandler {
    fn new(tx: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            tx,
            pause_on_headers: false,
            abort_slot: None,
            resumer_slot: None,
            complete_log: None,
        }
    }
}

impl Handler for TestHandler {
    fn on_connect(&mut self, abort: AbortHandle) {
        if let Some(slot) = &self.abort_slot {
            *slot.lock().unwrap() = Some(abort);
        }
        let _ = self.tx.send(TestEvent::Connect);
    }

    fn on_informational(&mut self, head: &ResponseHead) {
        let _ = self.tx.send(TestEvent::Informational(head.status_code));
    }

    fn on_body_sent(&mut self) {
        let _ = self.tx.send(TestEvent::BodySent);
    }

    fn on_headers(&mut self, head: ResponseHead, resumer: Resumer) -> bool {
        if let Some(slot) = &self.resumer_slot {
            *slot.lock().unwrap() = Some(resumer);
        }
        let _ = self.tx.send(TestEvent::Headers(head));
        !self.pause_on_headers
    }

    fn on_data(&mut self, data: &[u8]) -> bool {
        let _ = self.tx.send(TestEvent::Data(data.to_vec()));
        true
    }

    fn on_complete(&mut self, trailers: Vec<(String, String)>) {
        if let Some((log, label)) = &self.complete_log {
            log.lock().unwrap().push(label);
        }
        let _ = self.tx.send(TestEvent::Complete(trailers));
    }

    fn on_error(&mut self, error: Error) {
        let _ = self.tx.send(TestEvent::Error(error.to_string()));
    }

    fn on_upgrade(&mut self, head: ResponseHead, stream: UpgradedStream) {
        let _ = self.tx.send(TestEvent::Upgrade(head.status_code, stream));
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> TestEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// 終端イベント (Complete / Error / Upgrade) までのイベントを集める
async fn collect_terminal(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> Vec<TestEvent> {
    let mut events = Vec::new();
    loop {
        let event = recv(rx).await;
        let terminal = matches!(
            event,
            TestEvent::Complete(_) | TestEvent::Error(_) | TestEvent::Upgrade(..)
        );
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn status_of(events: &[TestEvent]) -> Option<u16> {
    events.iter().find_map(|e| match e {
        TestEvent::Headers(head) => Some(head.status_code),
        _ => None,
    })
}

fn body_of(events: &[TestEvent]) -> Vec<u8> {
    let mut body = Vec::new();
    for event in events {
        if let TestEvent::Data(data) = event {
            body.extend_from_slice(data);
        }
    }
    body
}

fn is_complete(events: &[TestEvent]) -> bool {
    matches!(events.last(), Some(TestEvent::Complete(_)))
}

fn error_of(events: &[TestEvent]) -> Option<&str> {
    events.iter().find_map(|e| match e {
        TestEvent::Error(message) => Some(message.as_str()),
        _ => None,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// リクエストヘッドを 1 つ読み取る。後続のバイトは buf に残す
async fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> String {
    loop {
        if let Some(pos) = find(buf, b"\r\n\r\n") {
            let head: Vec<u8> = buf.drain(..pos + 4).collect();
            return String::from_utf8(head).unwrap();
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed while reading a request");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// 終端チャンクまでのリクエストボディを読み取る
async fn read_chunked_body(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Vec<u8> {
    loop {
        if buf.ends_with(b"0\r\n\r\n") {
            return std::mem::take(buf);
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed while reading a chunked body");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn listen() -> (TcpListener, Origin) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Origin::http("127.0.0.1", port))
}

#[tokio::test]
async fn get_with_content_length_body() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = read_request(&mut stream, &mut buf).await;
        assert!(head.starts_with("GET /hello HTTP/1.1\r\n"));
        assert!(head.contains("Host: 127.0.0.1"));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
    });

    let client = Client::new(origin, ClientOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/hello"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );

    let events = collect_terminal(&mut rx).await;
    assert!(matches!(events.first(), Some(TestEvent::Connect)));
    assert_eq!(status_of(&events), Some(200));
    assert_eq!(body_of(&events), b"hello");
    assert!(is_complete(&events));
    assert_eq!(client.unfinished_len(), 0);
}

#[tokio::test]
async fn keep_alive_reuses_the_socket() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        // 2 リクエストとも同じ接続で処理する。クライアントが再接続したら
        // 2 つ目の read_request が失敗してテストごと落ちる
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        for body in [&b"one"[..], &b"two"[..]] {
            let _ = read_request(&mut stream, &mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
        }
    });

    let client = Client::new(origin, ClientOptions::default());
    for expected in [&b"one"[..], &b"two"[..]] {
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.dispatch(
            Request::new("GET", "/"),
            RequestBody::Empty,
            Box::new(TestHandler::new(tx)),
        );
        let events = collect_terminal(&mut rx).await;
        assert_eq!(body_of(&events), expected);
        assert!(is_complete(&events));
    }
}

#[tokio::test]
async fn pipelined_requests_complete_in_order() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        // 3 リクエストとも同じ接続で届く。クライアントが 2 本目を開いたら
        // read_request が失敗してテストごと落ちる
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        // 3 つのリクエストヘッドを読み切ってからまとめて応答する
        let _ = read_request(&mut stream, &mut buf).await;
        let _ = read_request(&mut stream, &mut buf).await;
        let _ = read_request(&mut stream, &mut buf).await;
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na\
                  HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb\
                  HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nc",
            )
            .await
            .unwrap();
    });

    let options = ClientOptions {
        pipelining: 3,
        ..ClientOptions::default()
    };
    let client = Client::new(origin, options);
    let log = Arc::new(Mutex::new(Vec::new()));

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let mut handler1 = TestHandler::new(tx1);
    handler1.complete_log = Some((log.clone(), "first"));
    let more = client.dispatch(Request::new("GET", "/1"), RequestBody::Empty, Box::new(handler1));
    assert!(more, "depth-3 pipeline should accept more requests");

    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let mut handler2 = TestHandler::new(tx2);
    handler2.complete_log = Some((log.clone(), "second"));
    client.dispatch(Request::new("GET", "/2"), RequestBody::Empty, Box::new(handler2));

    let (tx3, mut rx3) = mpsc::unbounded_channel();
    let mut handler3 = TestHandler::new(tx3);
    handler3.complete_log = Some((log.clone(), "third"));
    let more = client.dispatch(Request::new("GET", "/3"), RequestBody::Empty, Box::new(handler3));
    assert!(!more, "pipeline is full at depth 3");

    let events1 = collect_terminal(&mut rx1).await;
    let events2 = collect_terminal(&mut rx2).await;
    let events3 = collect_terminal(&mut rx3).await;
    assert_eq!(body_of(&events1), b"a");
    assert_eq!(body_of(&events2), b"b");
    assert_eq!(body_of(&events3), b"c");
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn channel_body_is_sent_chunked() {
    let (listener, origin) = listen().await;
    let (head_tx, head_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = read_request(&mut stream, &mut buf).await;
        let body = read_chunked_body(&mut stream, &mut buf).await;
        head_tx.send((head, body)).unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let client = Client::new(origin, ClientOptions::default());
    let (body_tx, body_rx) = mpsc::channel(4);
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("POST", "/upload"),
        RequestBody::Channel(body_rx),
        Box::new(TestHandler::new(tx)),
    );

    body_tx.send(b"hello".to_vec()).await.unwrap();
    body_tx.send(b"world".to_vec()).await.unwrap();
    drop(body_tx);

    let events = collect_terminal(&mut rx).await;
    assert!(is_complete(&events));
    assert!(events.iter().any(|e| matches!(e, TestEvent::BodySent)));

    let (head, body) = head_rx.await.unwrap();
    assert!(head.contains("Transfer-Encoding: chunked"));
    assert_eq!(body, b"5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n");
}

#[tokio::test]
async fn empty_channel_body_falls_back_to_content_length_zero() {
    let (listener, origin) = listen().await;
    let (head_tx, head_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = read_request(&mut stream, &mut buf).await;
        head_tx.send(head).unwrap();
        stream
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
    });

    let client = Client::new(origin, ClientOptions::default());
    let (body_tx, body_rx) = mpsc::channel::<Vec<u8>>(1);
    // 送信側を先に閉じる: チャンクが 1 つも来ない空ストリーム
    drop(body_tx);
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("POST", "/empty"),
        RequestBody::Channel(body_rx),
        Box::new(TestHandler::new(tx)),
    );

    let events = collect_terminal(&mut rx).await;
    assert_eq!(status_of(&events), Some(204));
    assert!(is_complete(&events));

    let head = head_rx.await.unwrap();
    assert!(head.contains("Content-Length: 0"));
    assert!(!head.contains("Transfer-Encoding"));
}

#[tokio::test]
async fn declared_length_mismatch_fails_in_strict_mode() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let client = Client::new(origin, ClientOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("POST", "/").content_length(5),
        RequestBody::Buffer(b"abc".to_vec()),
        Box::new(TestHandler::new(tx)),
    );

    let events = collect_terminal(&mut rx).await;
    let message = error_of(&events).expect("the request should fail");
    assert!(message.contains("content-length mismatch"), "{message}");
}

#[tokio::test]
async fn declared_length_mismatch_is_corrected_in_relaxed_mode() {
    let (listener, origin) = listen().await;
    let (head_tx, head_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = read_request(&mut stream, &mut buf).await;
        let mut body = std::mem::take(&mut buf);
        while body.len() < 3 {
            let mut chunk = [0u8; 16];
            let n = stream.read(&mut chunk).await.unwrap();
            body.extend_from_slice(&chunk[..n]);
        }
        head_tx.send((head, body)).unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let options = ClientOptions {
        strict_content_length: false,
        ..ClientOptions::default()
    };
    let client = Client::new(origin, options);
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("POST", "/").content_length(5),
        RequestBody::Buffer(b"abc".to_vec()),
        Box::new(TestHandler::new(tx)),
    );

    let events = collect_terminal(&mut rx).await;
    assert!(is_complete(&events));

    let (head, body) = head_rx.await.unwrap();
    // 宣言長 5 ではなく実際の長さで送られる
    assert!(head.contains("Content-Length: 3"));
    assert_eq!(body, b"abc");
}

#[tokio::test]
async fn abort_of_a_written_request_destroys_the_socket() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        // 応答せずに保持する
        let mut chunk = [0u8; 16];
        let _ = stream.read(&mut chunk).await;
    });

    let client = Client::new(origin, ClientOptions::default());
    let abort_slot = Arc::new(Mutex::new(None));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handler = TestHandler::new(tx);
    handler.abort_slot = Some(abort_slot.clone());
    client.dispatch(Request::new("GET", "/slow"), RequestBody::Empty, Box::new(handler));

    // 書き込み完了 (on_connect) を待ってから中断する
    assert!(matches!(recv(&mut rx).await, TestEvent::Connect));
    let abort = abort_slot.lock().unwrap().take().unwrap();
    abort.abort();

    let events = collect_terminal(&mut rx).await;
    let message = error_of(&events).expect("the request should be aborted");
    assert!(message.contains("aborted"), "{message}");
    assert_eq!(client.unfinished_len(), 0);
}

#[tokio::test]
async fn close_waits_for_accepted_requests() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let client = Client::new(origin, ClientOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );

    client.close().await;

    // close() は受理済みのリクエストの完了を待つ
    let events = collect_terminal(&mut rx).await;
    assert!(is_complete(&events));
    assert_eq!(body_of(&events), b"ok");

    // クローズ後の投入は受理されない
    let (tx, mut rx) = mpsc::unbounded_channel();
    let accepted = client.dispatch(
        Request::new("GET", "/"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );
    assert!(!accepted);
    let events = collect_terminal(&mut rx).await;
    assert!(error_of(&events).unwrap().contains("closed"));
}

#[tokio::test]
async fn destroy_fails_unfinished_requests() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        let mut chunk = [0u8; 16];
        let _ = stream.read(&mut chunk).await;
    });

    let client = Client::new(origin, ClientOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );
    assert!(matches!(recv(&mut rx).await, TestEvent::Connect));

    client.destroy().await;
    let events = collect_terminal(&mut rx).await;
    assert!(error_of(&events).unwrap().contains("destroyed"));
    assert_eq!(client.unfinished_len(), 0);
}

#[tokio::test]
async fn upgrade_hands_over_the_socket_with_prelude() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = read_request(&mut stream, &mut buf).await;
        assert!(head.contains("Upgrade: echo"));
        // 101 と同時に切り替え後プロトコルの先頭バイトを送る
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Connection: upgrade\r\nUpgrade: echo\r\n\r\nhello",
            )
            .await
            .unwrap();
        let mut chunk = [0u8; 3];
        stream.read_exact(&mut chunk).await.unwrap();
        assert_eq!(&chunk, b"abc");
        stream.write_all(b"xyz").await.unwrap();
    });

    let client = Client::new(origin, ClientOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/ws")
            .header("Connection", "upgrade")
            .header("Upgrade", "echo"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );

    let events = collect_terminal(&mut rx).await;
    let Some(TestEvent::Upgrade(status, mut stream)) = events.into_iter().last() else {
        panic!("expected an upgrade event");
    };
    assert_eq!(status, 101);
    assert_eq!(stream.prelude_len(), 5);

    let mut prelude = [0u8; 5];
    stream.read_exact(&mut prelude).await.unwrap();
    assert_eq!(&prelude, b"hello");
    stream.write_all(b"abc").await.unwrap();
    let mut reply = [0u8; 3];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"xyz");
}

#[tokio::test]
async fn head_response_has_no_body_and_resets_the_socket() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = read_request(&mut stream, &mut buf).await;
        assert!(head.starts_with("HEAD "));
        // HEAD には Content-Length だけ返してボディは送らない
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n")
            .await
            .unwrap();
        drop(stream);

        // HEAD の後はソケットが閉じられるため、次のリクエストは新しい接続で来る
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let client = Client::new(origin, ClientOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("HEAD", "/file"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );
    let events = collect_terminal(&mut rx).await;
    assert!(is_complete(&events));
    assert!(body_of(&events).is_empty());

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );
    let events = collect_terminal(&mut rx).await;
    assert_eq!(body_of(&events), b"ok");
}

#[tokio::test]
async fn informational_responses_are_delivered_before_the_final_head() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        stream
            .write_all(
                b"HTTP/1.1 103 Early Hints\r\nLink: </style.css>\r\n\r\n\
                  HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();
    });

    let client = Client::new(origin, ClientOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );

    let events = collect_terminal(&mut rx).await;
    assert!(
        events
            .iter()
            .any(|e| matches!(e, TestEvent::Informational(103)))
    );
    assert_eq!(status_of(&events), Some(200));
    assert!(is_complete(&events));
}

#[tokio::test]
async fn pending_requests_survive_a_server_close() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        // 1 本目: Connection: close で応答して切る
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 1\r\n\r\na")
            .await
            .unwrap();
        drop(stream);

        // 2 本目: 再接続してきた残りのリクエストを処理する
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb")
            .await
            .unwrap();
    });

    let client = Client::new(origin, ClientOptions::default());
    let (tx1, mut rx1) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/1"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx1)),
    );
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/2"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx2)),
    );

    let events1 = collect_terminal(&mut rx1).await;
    assert_eq!(body_of(&events1), b"a");
    assert!(is_complete(&events1));

    // 2 つ目は新しい接続で成功する
    let events2 = collect_terminal(&mut rx2).await;
    assert_eq!(body_of(&events2), b"b");
    assert!(is_complete(&events2));
}

#[tokio::test]
async fn paused_consumer_receives_no_body_until_resumed() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndata")
            .await
            .unwrap();
    });

    let client = Client::new(origin, ClientOptions::default());
    let resumer_slot = Arc::new(Mutex::new(None));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handler = TestHandler::new(tx);
    handler.pause_on_headers = true;
    handler.resumer_slot = Some(resumer_slot.clone());
    client.dispatch(Request::new("GET", "/"), RequestBody::Empty, Box::new(handler));

    loop {
        match recv(&mut rx).await {
            TestEvent::Headers(head) => {
                assert_eq!(head.status_code, 200);
                break;
            }
            TestEvent::Connect | TestEvent::BodySent => {}
            _ => panic!("unexpected event before the final head"),
        }
    }

    // 一時停止中はボディが配送されない
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "body arrived while paused");

    let resumer = resumer_slot.lock().unwrap().take().unwrap();
    resumer.resume();

    let events = collect_terminal(&mut rx).await;
    assert_eq!(body_of(&events), b"data");
    assert!(is_complete(&events));
}

#[tokio::test]
async fn drained_resolves_when_the_pipeline_has_room() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let client = Client::new(origin, ClientOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let accepted = client.dispatch(
        Request::new("GET", "/"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );
    // 深度 1 のパイプラインは投入直後に満杯になる
    assert!(!accepted);

    timeout(Duration::from_secs(5), client.drained())
        .await
        .expect("drained should resolve after the response completes");
    assert_eq!(client.unfinished_len(), 0);

    let events = collect_terminal(&mut rx).await;
    assert!(is_complete(&events));
}

#[tokio::test]
async fn headers_timeout_fails_a_silent_server() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        // 応答しない
        let mut chunk = [0u8; 16];
        let _ = stream.read(&mut chunk).await;
    });

    let options = ClientOptions {
        headers_timeout: Duration::from_millis(100),
        ..ClientOptions::default()
    };
    let client = Client::new(origin, options);
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );

    let events = collect_terminal(&mut rx).await;
    let message = error_of(&events).expect("the request should time out");
    assert!(message.contains("headers timeout"), "{message}");
}

#[tokio::test]
async fn stalled_request_write_times_out() {
    let (listener, origin) = listen().await;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        // ヘッドだけ読み、ボディは受け取らずに接続を保持する。
        // クライアント側の書き込みはやがて TCP バッファで停滞する
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        let _ = done_rx.await;
        drop(stream);
    });

    let options = ClientOptions {
        headers_timeout: Duration::from_millis(300),
        ..ClientOptions::default()
    };
    let client = Client::new(origin, options);
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("POST", "/upload"),
        RequestBody::Buffer(vec![0u8; 64 * 1024 * 1024]),
        Box::new(TestHandler::new(tx)),
    );

    // 書き込みが進まなくてもイベントループは止まらず、タイムアウトが届く
    let events = collect_terminal(&mut rx).await;
    let message = error_of(&events).expect("the stalled request should time out");
    assert!(message.contains("headers timeout"), "{message}");
    assert_eq!(client.unfinished_len(), 0);
    let _ = done_tx.send(());
}

#[tokio::test]
async fn destroy_interrupts_a_stalled_write() {
    let (listener, origin) = listen().await;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        let _ = done_rx.await;
        drop(stream);
    });

    let client = Client::new(origin, ClientOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("POST", "/upload"),
        RequestBody::Buffer(vec![0u8; 64 * 1024 * 1024]),
        Box::new(TestHandler::new(tx)),
    );

    // 書き込みが停滞している間も操作チャネルは処理される
    tokio::time::sleep(Duration::from_millis(100)).await;
    timeout(Duration::from_secs(5), client.destroy())
        .await
        .expect("destroy should not hang on a stalled write");

    let events = collect_terminal(&mut rx).await;
    assert!(error_of(&events).unwrap().contains("destroyed"));
    let _ = done_tx.send(());
}

#[tokio::test]
async fn idle_keep_alive_closes_once_and_reconnects() {
    let (listener, origin) = listen().await;
    let (eof_tx, eof_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        // 1 本目: 応答後、アイドルタイムアウトによるクローズを 1 回だけ観測する
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na")
            .await
            .unwrap();
        let mut chunk = [0u8; 16];
        let n = stream.read(&mut chunk).await.unwrap();
        assert_eq!(n, 0, "the client should close the idle connection");
        eof_tx.send(()).unwrap();

        // 2 本目: アイドルクローズ後の投入は新しい接続で透過的に処理される
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb")
            .await
            .unwrap();
    });

    let options = ClientOptions {
        keep_alive_timeout: Duration::from_millis(200),
        ..ClientOptions::default()
    };
    let client = Client::new(origin, options);

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/1"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );
    let events = collect_terminal(&mut rx).await;
    assert_eq!(body_of(&events), b"a");
    assert!(is_complete(&events));

    // アイドルタイムアウトでソケットが閉じられるまで待つ
    timeout(Duration::from_secs(5), eof_rx)
        .await
        .expect("the idle socket should be closed")
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/2"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );
    let events = collect_terminal(&mut rx).await;
    assert!(error_of(&events).is_none());
    assert_eq!(body_of(&events), b"b");
    assert!(is_complete(&events));
}

#[tokio::test]
async fn stalled_response_body_hits_the_body_timeout() {
    let (listener, origin) = listen().await;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        // ボディの途中までしか送らずに保持する
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
            .await
            .unwrap();
        let _ = done_rx.await;
        drop(stream);
    });

    let options = ClientOptions {
        body_timeout: Duration::from_millis(150),
        ..ClientOptions::default()
    };
    let client = Client::new(origin, options);
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/slow"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );

    let events = collect_terminal(&mut rx).await;
    assert_eq!(status_of(&events), Some(200));
    assert_eq!(body_of(&events), b"abc");
    let message = error_of(&events).expect("the stalled body should time out");
    assert!(message.contains("body timeout"), "{message}");
    let _ = done_tx.send(());
}

#[tokio::test]
async fn mid_flight_reset_fails_running_and_resubmits_pending() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        // 1 本目: パイプラインされた 2 リクエストを読んでから応答せずに切る
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        let _ = read_request(&mut stream, &mut buf).await;
        drop(stream);

        // 2 本目: 再投入された 3 つ目のリクエストを処理する
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = read_request(&mut stream, &mut buf).await;
        assert!(head.starts_with("GET /3 "));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nc")
            .await
            .unwrap();
    });

    let options = ClientOptions {
        pipelining: 2,
        ..ClientOptions::default()
    };
    let client = Client::new(origin, options);

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/1"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx1)),
    );
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/2"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx2)),
    );
    // 深度 2 なので 3 つ目は未書き込みのまま待つ
    let (tx3, mut rx3) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/3"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx3)),
    );

    // 書き込み済みの 2 つは失敗する
    let events1 = collect_terminal(&mut rx1).await;
    assert!(error_of(&events1).unwrap().contains("socket error"));
    let events2 = collect_terminal(&mut rx2).await;
    assert!(error_of(&events2).unwrap().contains("socket error"));

    // 未書き込みの 3 つ目は新しい接続で成功し、エラーは観測されない
    let events3 = collect_terminal(&mut rx3).await;
    assert!(error_of(&events3).is_none());
    assert_eq!(body_of(&events3), b"c");
    assert!(is_complete(&events3));
}

#[tokio::test]
async fn oversized_response_headers_destroy_the_socket() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _ = read_request(&mut stream, &mut buf).await;
        // 個々の行は短いが合計でヘッダー部の上限を超える
        let mut response = b"HTTP/1.1 200 OK\r\n".to_vec();
        for i in 0..64 {
            response.extend_from_slice(format!("X-Filler-{}: padding\r\n", i).as_bytes());
        }
        response.extend_from_slice(b"Content-Length: 0\r\n\r\n");
        stream.write_all(&response).await.unwrap();

        // エンジン側がソケットを破棄したことを確認する
        let mut chunk = [0u8; 16];
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        assert_eq!(n, 0, "the client should close the connection");
    });

    let options = ClientOptions {
        limits: tokio_h1conn::DecoderLimits {
            max_headers_size: 256,
            ..tokio_h1conn::DecoderLimits::default()
        },
        ..ClientOptions::default()
    };
    let client = Client::new(origin, options);
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.dispatch(
        Request::new("GET", "/"),
        RequestBody::Empty,
        Box::new(TestHandler::new(tx)),
    );

    let events = collect_terminal(&mut rx).await;
    let message = error_of(&events).expect("the request should fail");
    assert!(message.contains("headers too large"), "{message}");
}

#[tokio::test]
async fn max_requests_per_socket_forces_a_reconnect() {
    let (listener, origin) = listen().await;
    tokio::spawn(async move {
        // 上限 1 なのでリクエストごとに新しい接続が来る
        for body in [&b"a"[..], &b"b"[..]] {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let _ = read_request(&mut stream, &mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
        }
    });

    let options = ClientOptions {
        max_requests_per_socket: Some(1),
        ..ClientOptions::default()
    };
    let client = Client::new(origin, options);
    for expected in [&b"a"[..], &b"b"[..]] {
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.dispatch(
            Request::new("GET", "/"),
            RequestBody::Empty,
            Box::new(TestHandler::new(tx)),
        );
        let events = collect_terminal(&mut rx).await;
        assert_eq!(body_of(&events), expected);
        assert!(is_complete(&events));
    }
}
