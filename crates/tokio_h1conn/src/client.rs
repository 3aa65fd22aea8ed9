//! 単一接続の HTTP/1.1 クライアントエンジン
//!
//! 1 つの接続先に対して 1 本のソケットを所有し、投入されたリクエストを
//! キープアライブ (設定によってはパイプライン) で多重化する。
//!
//! エンジンは 1 つの spawn されたタスクであり、ソケット・デコーダー・
//! キューをすべてそのタスクが所有する。外部とのやり取りはすべて
//! 操作チャネル経由で行われるため、再入は構造的に起きない。
//!
//! ## 使い方
//!
//! ```ignore
//! use tokio_h1conn::{Client, ClientOptions, Origin, RequestBody};
//! use shiguredo_h1conn::Request;
//!
//! let client = Client::new(Origin::http("example.com", 80), ClientOptions::default());
//! let request = Request::new("GET", "/");
//! client.dispatch(request, RequestBody::Empty, Box::new(my_handler));
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::Poll;
use std::time::Duration;

use rustls::ClientConfig;
use shiguredo_h1conn::{
    BodyKind, BodyProgress, BodyWriteTracker, DecodedHead, DecoderLimits, EncodeError, Framing,
    Queue, Request, ResponseDecoder, encode_chunk, encode_head, plan_framing,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;

use crate::body::RequestBody;
use crate::connector::{ConnStream, Connector, Origin};
use crate::error::Error;
use crate::handler::{AbortHandle, Dispatcher, Handler, Resumer};
use crate::upgraded::UpgradedStream;

/// ソケット読み取りバッファサイズ
const READ_BUF_SIZE: usize = 16 * 1024;

/// クライアントの設定
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// パイプライン深度 (デフォルト: 1 = キープアライブのみ)
    ///
    /// 2 以上にすると、冪等なリクエストに限り前のレスポンスを
    /// 待たずに次のリクエストを書き込む。
    pub pipelining: usize,
    /// リクエスト送信後、レスポンスヘッダー到着までのタイムアウト
    pub headers_timeout: Duration,
    /// ボディ読み取り中の無通信タイムアウト
    pub body_timeout: Duration,
    /// アイドル接続を維持する時間
    pub keep_alive_timeout: Duration,
    /// サーバーの Keep-Alive timeout ヒントに対する上限
    pub keep_alive_max_timeout: Duration,
    /// 1 本のソケットで送るリクエスト数の上限
    ///
    /// 到達するとソケットを閉じて再接続する。`None` で無制限。
    pub max_requests_per_socket: Option<usize>,
    /// 宣言された Content-Length とボディ長の不一致を厳格に扱う
    ///
    /// `false` にすると、長さ既知のボディについては宣言長を無視して
    /// 実際の長さで送信する。ストリームボディの超過・不足は
    /// ワイヤー上で訂正できないため設定に関わらずエラーになる。
    pub strict_content_length: bool,
    /// 接続確立のタイムアウト
    pub connect_timeout: Duration,
    /// レスポンスデコーダーの制限
    pub limits: DecoderLimits,
    /// TLS 設定 (未指定なら OS のルート証明書ストアを使う)
    pub tls_config: Option<Arc<ClientConfig>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pipelining: 1,
            headers_timeout: Duration::from_secs(30),
            body_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(4),
            keep_alive_max_timeout: Duration::from_secs(600),
            max_requests_per_socket: None,
            strict_content_length: true,
            connect_timeout: Duration::from_secs(10),
            limits: DecoderLimits::default(),
            tls_config: None,
        }
    }
}

/// エンジンへの操作
pub(crate) enum Op {
    /// リクエストの投入
    Dispatch {
        id: u64,
        request: Request,
        body: RequestBody,
        handler: Box<dyn Handler>,
    },
    /// 読み取りの再開
    Resume,
    /// リクエストの中断
    Abort { id: u64 },
    /// クローズ (受理済みの完了を待って終了)
    Close { done: oneshot::Sender<()> },
    /// 破棄 (未完了をすべて失敗させて即終了)
    Destroy { done: oneshot::Sender<()> },
}

/// Client とエンジンで共有する状態
struct Shared {
    unfinished: AtomicUsize,
    closed: AtomicBool,
    destroyed: AtomicBool,
    next_id: AtomicU64,
    /// リクエスト完了時の通知 (`Client::drained` 用)
    drained: Notify,
}

/// 単一接続の HTTP/1.1 クライアント
///
/// ハンドルは安価にクローンでき、すべてのクローンが同じ
/// エンジンタスクを指す。
#[derive(Clone)]
pub struct Client {
    ops: mpsc::UnboundedSender<Op>,
    shared: Arc<Shared>,
    pipelining: usize,
}

impl Client {
    /// 新しいクライアントを作成
    ///
    /// 接続は最初のリクエストが投入された時点で確立される。
    pub fn new(origin: Origin, options: ClientOptions) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            unfinished: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            drained: Notify::new(),
        });

        let mut connector = Connector::new(origin, options.connect_timeout);
        if let Some(config) = options.tls_config.clone() {
            connector = connector.tls_config(config);
        }

        let pipelining = options.pipelining.max(1);
        let engine = Engine::new(ops_rx, ops_tx.downgrade(), connector, options, shared.clone());
        tokio::spawn(engine.run());

        Self {
            ops: ops_tx,
            shared,
            pipelining,
        }
    }

    /// リクエストを投入する
    ///
    /// 戻り値はバックプレッシャーの通知。`false` はこれ以上投入すべきで
    /// ないという合図で、リクエスト自体は受理されている。
    /// クローズ済み・破棄済みのクライアントへの投入は受理されず、
    /// ハンドラーに即座にエラーが配られる。
    pub fn dispatch(
        &self,
        request: Request,
        body: RequestBody,
        mut handler: Box<dyn Handler>,
    ) -> bool {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            handler.on_error(Error::Destroyed);
            return false;
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            handler.on_error(Error::Closed);
            return false;
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        if let Err(failed) = self.ops.send(Op::Dispatch {
            id,
            request,
            body,
            handler,
        }) {
            if let Op::Dispatch { mut handler, .. } = failed.0 {
                handler.on_error(Error::Destroyed);
            }
            return false;
        }

        let unfinished = self.shared.unfinished.fetch_add(1, Ordering::SeqCst) + 1;
        unfinished < self.pipelining
    }

    /// 未完了のリクエスト数を取得
    pub fn unfinished_len(&self) -> usize {
        self.shared.unfinished.load(Ordering::SeqCst)
    }

    /// 未完了のリクエスト数がパイプライン深度を下回るまで待つ
    ///
    /// `dispatch` が `false` を返した後、投入を再開してよいタイミングを
    /// 知るために使う。
    pub async fn drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if self.shared.unfinished.load(Ordering::SeqCst) < self.pipelining {
                return;
            }
            notified.await;
        }
    }

    /// クローズ済みかどうか
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// クライアントをクローズする
    ///
    /// 新規リクエストの受理を止め、受理済みのリクエストが
    /// すべて完了するのを待ってからエンジンを終了する。
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let (done_tx, done_rx) = oneshot::channel();
        if self.ops.send(Op::Close { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// クライアントを破棄する
    ///
    /// 未完了のリクエストはすべて `Error::Destroyed` で失敗し、
    /// ソケットは即座に破棄される。
    pub async fn destroy(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.destroyed.store(true, Ordering::SeqCst);
        let (done_tx, done_rx) = oneshot::channel();
        if self.ops.send(Op::Destroy { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl Dispatcher for Client {
    fn dispatch(&self, request: Request, body: RequestBody, handler: Box<dyn Handler>) -> bool {
        Client::dispatch(self, request, body, handler)
    }
}

/// キューのエントリー
struct Entry {
    id: u64,
    request: Request,
    /// 書き込み開始時に取り出される
    body: Option<RequestBody>,
    handler: Box<dyn Handler>,
    /// 最終レスポンスのヘッダーを受信済みか
    headers_received: bool,
    /// リクエストの書き込みが完了した時刻 (ヘッダータイムアウトの起点)
    write_done_at: Option<Instant>,
}

/// 書き込み中のストリームボディの状態
struct WriteState {
    id: u64,
    body: RequestBody,
    phase: WritePhase,
}

enum WritePhase {
    /// ヘッド未送信。最初のチャンクを見てフレーミングを確定する
    FirstChunk,
    /// ヘッド送信済み、ボディ送信中
    Streaming {
        chunked: bool,
        tracker: BodyWriteTracker,
    },
}

/// 書き込み開始時の計画
enum StartKind {
    /// 長さ既知 (Empty / Buffer)。ヘッドとボディを一括で書く
    Known(Framing),
    /// 宣言長付きストリーム。ヘッドを書いてから生バイトを流す
    StreamDeclared(u64),
    /// 長さ不明ストリーム。最初のチャンク確定までヘッドを遅延する
    StreamChunked,
}

/// 飛行中のソケット書き込み
///
/// イベントループが書き込み可能になるたびに流し、すべて書けた時点で
/// `done` の続きを実行する。書き込みが飛行中でもレスポンスの読み取り・
/// タイマー・操作チャネルは止まらない。
struct PendingWrite {
    buf: Vec<u8>,
    pos: usize,
    /// 最後に書き込みが進んだ時刻 (書き込み停滞タイムアウトの起点)
    last_progress_at: Instant,
    done: WriteDone,
}

/// 書き込み完了時に行うこと
enum WriteDone {
    /// リクエスト一式 (ヘッドと長さ既知のボディ)
    Request {
        id: u64,
        resets: bool,
        body: RequestBody,
    },
    /// ストリームボディのヘッド。完了後ボディの送信に移る
    StreamHead {
        id: u64,
        resets: bool,
        body: RequestBody,
        chunked: bool,
        tracker: BodyWriteTracker,
        /// 最初のチャンクを取り出し済みでボディを再生できない
        consumed: bool,
    },
    /// ストリームボディの途中チャンク
    Chunk { state: WriteState },
    /// 終端チャンク
    Last { id: u64 },
}

impl WriteDone {
    /// 書き込み済みマーク前のエントリーの id
    fn unwritten_id(&self) -> Option<u64> {
        match self {
            WriteDone::Request { id, .. } | WriteDone::StreamHead { id, .. } => Some(*id),
            WriteDone::Chunk { .. } | WriteDone::Last { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Headers,
    Body,
    KeepAlive,
}

enum Event {
    Op(Option<Op>),
    Io(std::io::Result<IoEvent>),
    BodyChunk(std::io::Result<Option<Vec<u8>>>),
    Timer(TimerKind),
}

/// ソケット I/O の進捗
enum IoEvent {
    /// 読み取ったバイト数 (0 は EOF)
    Read(usize),
    /// 書き込めたバイト数
    Wrote(usize),
}

/// 接続エンジン
///
/// spawn されたタスクとして動き、ソケット・デコーダー・キューを所有する。
struct Engine {
    ops: mpsc::UnboundedReceiver<Op>,
    /// Resumer / AbortHandle 用 (エンジン自身がチャネルを
    /// 開きっぱなしにしないよう弱参照で持つ)
    ops_tx: mpsc::WeakUnboundedSender<Op>,
    connector: Connector,
    options: ClientOptions,
    shared: Arc<Shared>,

    socket: Option<ConnStream>,
    /// 現在のソケットの TLS SNI (リクエスト側の指定がなければ None)
    socket_server_name: Option<String>,
    decoder: ResponseDecoder,
    queue: Queue<Entry>,
    writing: Option<WriteState>,
    /// ソケットへ流しきっていない書き込み
    pending_write: Option<PendingWrite>,
    /// 消費側のフロー制御で読み取りが止まっているか
    paused: bool,
    /// 現在のレスポンス完了後にソケットを閉じるか
    close_after_response: bool,
    /// 現在のソケットで送信したリクエスト数
    requests_on_socket: usize,
    /// クローズ要求 (受理済みの完了待ち)
    closing: Option<oneshot::Sender<()>>,

    last_read_at: Instant,
    idle_since: Instant,
    /// 現在有効なアイドルタイムアウト (Keep-Alive ヒントで変わる)
    keep_alive_timeout: Duration,
}

impl Engine {
    fn new(
        ops: mpsc::UnboundedReceiver<Op>,
        ops_tx: mpsc::WeakUnboundedSender<Op>,
        connector: Connector,
        options: ClientOptions,
        shared: Arc<Shared>,
    ) -> Self {
        let now = Instant::now();
        let decoder = ResponseDecoder::with_limits(options.limits.clone());
        let keep_alive_timeout = options.keep_alive_timeout;
        Self {
            ops,
            ops_tx,
            connector,
            options,
            shared,
            socket: None,
            socket_server_name: None,
            decoder,
            queue: Queue::new(),
            writing: None,
            pending_write: None,
            paused: false,
            close_after_response: false,
            requests_on_socket: 0,
            closing: None,
            last_read_at: now,
            idle_since: now,
            keep_alive_timeout,
        }
    }

    async fn run(mut self) {
        let mut read_buf = vec![0u8; READ_BUF_SIZE];

        loop {
            self.advance().await;

            if self.closing.is_some() && self.queue.is_empty() && self.writing.is_none() {
                if let Some(done) = self.closing.take() {
                    let _ = done.send(());
                }
                self.teardown_socket();
                return;
            }

            let deadline = self.compute_deadline();
            let want_read = self.socket.is_some() && !self.paused;

            let event = tokio::select! {
                op = self.ops.recv() => Event::Op(op),
                result = socket_io(
                    &mut self.socket,
                    &mut read_buf,
                    self.pending_write.as_ref().map(|w| &w.buf[w.pos..]),
                    want_read,
                ) => Event::Io(result),
                chunk = next_body_chunk(&mut self.writing), if self.pending_write.is_none() => {
                    Event::BodyChunk(chunk)
                }
                _ = sleep_opt(deadline.map(|(at, _)| at)) => {
                    Event::Timer(deadline.map(|(_, kind)| kind).unwrap_or(TimerKind::KeepAlive))
                }
            };

            match event {
                Event::Op(None) => {
                    // ハンドルがすべてドロップされた
                    self.shutdown(Error::Destroyed);
                    return;
                }
                Event::Op(Some(op)) => {
                    if self.handle_op(op) {
                        return;
                    }
                }
                Event::Io(Ok(IoEvent::Read(0))) => self.on_eof(),
                Event::Io(Ok(IoEvent::Read(n))) => self.on_read(&read_buf[..n]),
                Event::Io(Ok(IoEvent::Wrote(n))) => self.on_wrote(n),
                Event::Io(Err(e)) => self.on_socket_error(Error::Io(e)),
                Event::BodyChunk(result) => self.on_body_chunk(result),
                Event::Timer(kind) => self.on_timer(kind),
            }
        }
    }

    /// 操作を処理する。true を返すとエンジンを終了する
    fn handle_op(&mut self, op: Op) -> bool {
        match op {
            Op::Dispatch {
                id,
                mut request,
                body,
                handler,
            } => {
                if !request.has_header("Host") {
                    request.headers.insert(
                        0,
                        (
                            "Host".to_string(),
                            self.connector.origin().host_header_value(),
                        ),
                    );
                }
                self.queue.push(Entry {
                    id,
                    request,
                    body: Some(body),
                    handler,
                    headers_received: false,
                    write_done_at: None,
                });
                false
            }
            Op::Resume => {
                self.paused = false;
                // デコーダーに溜まっているデータを配送する
                if let Err(err) = self.process_responses() {
                    self.on_socket_error(err);
                }
                false
            }
            Op::Abort { id } => {
                self.on_abort(id);
                false
            }
            Op::Close { done } => {
                self.closing = Some(done);
                false
            }
            Op::Destroy { done } => {
                self.shutdown(Error::Destroyed);
                let _ = done.send(());
                true
            }
        }
    }

    /// 再開ループ: 接続の確立と、書き込めるだけのリクエストの送信
    async fn advance(&mut self) {
        loop {
            if self.writing.is_some() || self.pending_write.is_some() {
                return;
            }
            let Some(next) = self.queue.next_pending() else {
                return;
            };
            let wanted_sni = next.request.server_name.clone();

            // transport identity (SNI) が違う場合は実行中の完了を待って張り直す
            if self.socket.is_some()
                && self.connector.origin().tls
                && wanted_sni != self.socket_server_name
            {
                if self.queue.running_len() > 0 {
                    return;
                }
                self.teardown_socket();
            }

            // ソケットあたりのリクエスト数上限
            if self.socket.is_some()
                && let Some(max) = self.options.max_requests_per_socket
                && self.requests_on_socket >= max
            {
                if self.queue.running_len() > 0 {
                    return;
                }
                self.teardown_socket();
            }

            if self.socket.is_none() {
                match self.connector.connect(wanted_sni.as_deref()).await {
                    Ok(stream) => {
                        self.socket = Some(stream);
                        self.socket_server_name = wanted_sni;
                        self.decoder = ResponseDecoder::with_limits(self.options.limits.clone());
                        self.requests_on_socket = 0;
                        self.close_after_response = false;
                        self.paused = false;
                        self.keep_alive_timeout = self.options.keep_alive_timeout;
                        self.last_read_at = Instant::now();
                    }
                    Err(err) => {
                        // 接続失敗は未完了のリクエストすべてに配る
                        for mut entry in self.queue.take_unfinished() {
                            entry.handler.on_error(err.clone());
                            self.finish_entry();
                        }
                        self.note_idle();
                        return;
                    }
                }
            }

            if !self.can_write_next() {
                return;
            }
            if !self.start_write() {
                return;
            }
        }
    }

    /// 次の未書き込みリクエストを今書いてよいか
    fn can_write_next(&self) -> bool {
        let running = self.queue.running_len();
        if running >= self.options.pipelining.max(1) {
            return false;
        }
        if self.close_after_response {
            return false;
        }
        let Some(next) = self.queue.next_pending() else {
            return false;
        };
        if running == 0 {
            return true;
        }

        // 保守的パイプライン規則: 非冪等・アップグレード・ストリームボディは
        // パイプラインに同居させない
        if next.request.is_upgrade() || !next.request.is_idempotent() {
            return false;
        }
        if next.body.as_ref().is_some_and(|b| b.is_stream()) {
            return false;
        }
        if self
            .queue
            .running_contains(|e| !e.request.is_idempotent() || e.request.is_upgrade())
        {
            return false;
        }
        // ブロッキングリクエストはヘッダー到着まで後続を止める
        if self
            .queue
            .running_contains(|e| e.request.blocking && !e.headers_received)
        {
            return false;
        }
        if self.queue.running_contains(|e| e.request.requests_close()) {
            return false;
        }
        true
    }

    /// 次の未書き込みリクエストの送信を開始する
    ///
    /// 書き込むバイト列は飛行中の書き込みとして積まれ、イベントループが
    /// ソケットへ流しきった時点で書き込み済みに進む。
    /// false は何も始められなかったことを意味する。
    fn start_write(&mut self) -> bool {
        let mut head_bytes: Option<Vec<u8>> = None;
        let mut plan_err: Option<Error> = None;
        let mut plan: Option<(u64, RequestBody, StartKind)> = None;
        let resets;

        {
            let Some(entry) = self.queue.next_pending_mut() else {
                return false;
            };
            let id = entry.id;
            // HEAD とアップグレードは後続をパイプラインするとストリームが
            // 脱同期し得るため、このソケットはレスポンス完了後に閉じる
            resets = entry.request.is_head()
                || entry.request.is_upgrade()
                || entry.request.requests_close();
            let body = entry.body.take().unwrap_or(RequestBody::Empty);

            let planned = match body.known_len() {
                Some(len) => match plan_framing(&entry.request, Some(len)) {
                    Ok(framing) => Ok(StartKind::Known(framing)),
                    Err(EncodeError::ContentLengthMismatch { .. })
                        if !self.options.strict_content_length =>
                    {
                        // 緩和モード: 宣言長を無視して実際の長さで送る
                        let framing = if len == 0 && !entry.request.method_expects_payload() {
                            Framing::None
                        } else {
                            Framing::ContentLength(len)
                        };
                        Ok(StartKind::Known(framing))
                    }
                    Err(e) => Err(Error::Encode(e)),
                },
                None => match plan_framing(&entry.request, None) {
                    Ok(Framing::ContentLength(declared)) => Ok(StartKind::StreamDeclared(declared)),
                    Ok(_) => Ok(StartKind::StreamChunked),
                    Err(e) => Err(Error::Encode(e)),
                },
            };

            match planned {
                Ok(kind) => {
                    // chunked ストリームはヘッドを最初のチャンク確定まで遅延する
                    let framing = match &kind {
                        StartKind::Known(framing) => Some(*framing),
                        StartKind::StreamDeclared(declared) => {
                            Some(Framing::ContentLength(*declared))
                        }
                        StartKind::StreamChunked => None,
                    };
                    if let Some(framing) = framing {
                        match encode_head(&entry.request, &framing) {
                            Ok(head) => head_bytes = Some(head),
                            Err(e) => plan_err = Some(Error::Encode(e)),
                        }
                    }
                    if plan_err.is_none() {
                        if head_bytes.is_some() {
                            entry
                                .handler
                                .on_connect(AbortHandle::new(id, self.ops_tx.clone()));
                        }
                        plan = Some((id, body, kind));
                    }
                }
                Err(e) => plan_err = Some(e),
            }
        }

        if let Some(err) = plan_err {
            if let Some(mut entry) = self.queue.remove_next_pending() {
                entry.handler.on_error(err);
                self.finish_entry();
                self.note_idle();
            }
            return true;
        }

        let Some((id, body, kind)) = plan else {
            return false;
        };

        match kind {
            StartKind::Known(_) => {
                let mut bytes = head_bytes.unwrap_or_default();
                if let RequestBody::Buffer(data) = &body {
                    bytes.extend_from_slice(data);
                }
                self.enqueue_write(bytes, WriteDone::Request { id, resets, body });
            }
            StartKind::StreamDeclared(declared) => {
                let bytes = head_bytes.unwrap_or_default();
                self.enqueue_write(
                    bytes,
                    WriteDone::StreamHead {
                        id,
                        resets,
                        body,
                        chunked: false,
                        tracker: BodyWriteTracker::new(Some(declared)),
                        consumed: false,
                    },
                );
            }
            StartKind::StreamChunked => {
                self.writing = Some(WriteState {
                    id,
                    body,
                    phase: WritePhase::FirstChunk,
                });
            }
        }
        true
    }

    /// 書き込みを飛行中として積む
    fn enqueue_write(&mut self, buf: Vec<u8>, done: WriteDone) {
        self.pending_write = Some(PendingWrite {
            buf,
            pos: 0,
            last_progress_at: Instant::now(),
            done,
        });
    }

    /// 飛行中の書き込みの進捗を処理する
    fn on_wrote(&mut self, n: usize) {
        let Some(mut write) = self.pending_write.take() else {
            return;
        };
        if n == 0 {
            self.pending_write = Some(write);
            self.on_socket_error(Error::Io(std::io::ErrorKind::WriteZero.into()));
            return;
        }
        write.pos += n;
        write.last_progress_at = Instant::now();
        if write.pos < write.buf.len() {
            self.pending_write = Some(write);
            return;
        }

        // 書き込み完了
        match write.done {
            WriteDone::Request { id, resets, .. } => {
                self.mark_written();
                self.close_after_response |= resets;
                if let Some(entry) = self.queue.running_iter_mut().find(|e| e.id == id) {
                    entry.handler.on_body_sent();
                }
            }
            WriteDone::StreamHead {
                id,
                resets,
                body,
                chunked,
                tracker,
                ..
            } => {
                self.mark_written();
                self.close_after_response |= resets;
                self.writing = Some(WriteState {
                    id,
                    body,
                    phase: WritePhase::Streaming { chunked, tracker },
                });
            }
            WriteDone::Chunk { state } => {
                self.writing = Some(state);
            }
            WriteDone::Last { id } => {
                if let Some(entry) = self.queue.running_iter_mut().find(|e| e.id == id) {
                    entry.handler.on_body_sent();
                }
            }
        }
    }

    /// ストリームボディの次のチャンクを処理する
    fn on_body_chunk(&mut self, result: std::io::Result<Option<Vec<u8>>>) {
        let Some(mut writing) = self.writing.take() else {
            return;
        };

        let chunk = match result {
            Ok(chunk) => chunk,
            Err(e) => {
                match writing.phase {
                    WritePhase::FirstChunk => {
                        // まだ何も書いていないのでエントリーだけ失敗させる
                        if let Some(mut entry) =
                            self.queue.remove_pending_where(|e| e.id == writing.id)
                        {
                            entry.handler.on_error(Error::Io(e));
                            self.finish_entry();
                            self.note_idle();
                        }
                    }
                    WritePhase::Streaming { .. } => {
                        // ヘッド送信済み。メッセージを完結できないのでソケットごと破棄
                        self.on_socket_error(Error::Io(e));
                    }
                }
                return;
            }
        };

        match &mut writing.phase {
            WritePhase::FirstChunk => {
                let id = writing.id;
                let framing = match &chunk {
                    // 最初のチャンクが来たのでフレーミングは chunked で確定
                    Some(_) => Framing::Chunked,
                    // 空のストリーム: 長さ 0 の固定長として送る
                    None => Framing::ContentLength(0),
                };

                // 遅延していたヘッドをエンコードする
                let (head, resets) = {
                    let Some(entry) = self.queue.next_pending_mut() else {
                        return;
                    };
                    if entry.id != id {
                        return;
                    }
                    let resets = entry.request.is_head()
                        || entry.request.is_upgrade()
                        || entry.request.requests_close();
                    // ボディなしメソッドの空ストリームはフレーミングヘッダーを省く
                    let framing = if matches!(framing, Framing::ContentLength(0))
                        && !entry.request.method_expects_payload()
                    {
                        Framing::None
                    } else {
                        framing
                    };
                    match encode_head(&entry.request, &framing) {
                        Ok(head) => {
                            entry
                                .handler
                                .on_connect(AbortHandle::new(id, self.ops_tx.clone()));
                            (head, resets)
                        }
                        Err(e) => {
                            let mut entry = self.queue.remove_next_pending().unwrap();
                            entry.handler.on_error(Error::Encode(e));
                            self.finish_entry();
                            self.note_idle();
                            return;
                        }
                    }
                };

                let mut bytes = head;
                if let Some(data) = &chunk {
                    bytes.extend_from_slice(&encode_chunk(data));
                }
                match chunk {
                    Some(data) => {
                        let mut tracker = BodyWriteTracker::new(None);
                        // 宣言長なしのため record は失敗しない
                        let _ = tracker.record(data.len() as u64);
                        self.enqueue_write(
                            bytes,
                            WriteDone::StreamHead {
                                id,
                                resets,
                                body: writing.body,
                                chunked: true,
                                tracker,
                                // 最初のチャンクはソースから取り出し済みで
                                // 再生できない
                                consumed: true,
                            },
                        );
                    }
                    None => {
                        // 空ストリーム: ヘッドのみで送信完了
                        self.enqueue_write(
                            bytes,
                            WriteDone::Request {
                                id,
                                resets,
                                body: writing.body,
                            },
                        );
                    }
                }
            }
            WritePhase::Streaming { chunked, tracker } => {
                let id = writing.id;
                let chunked = *chunked;
                match chunk {
                    Some(data) => {
                        if data.is_empty() {
                            self.writing = Some(writing);
                            return;
                        }
                        if let Err(e) = tracker.record(data.len() as u64) {
                            // 宣言長超過はワイヤー上で訂正できない
                            self.on_socket_error(Error::Encode(e));
                            return;
                        }
                        let bytes = if chunked { encode_chunk(&data) } else { data };
                        self.enqueue_write(bytes, WriteDone::Chunk { state: writing });
                    }
                    None => {
                        if chunked {
                            // 終端チャンク
                            self.enqueue_write(b"0\r\n\r\n".to_vec(), WriteDone::Last { id });
                            return;
                        }
                        if let Err(e) = tracker.finish() {
                            // 宣言長に満たないまま終端した
                            self.on_socket_error(Error::Encode(e));
                            return;
                        }
                        if let Some(entry) = self.queue.running_iter_mut().find(|e| e.id == id) {
                            entry.handler.on_body_sent();
                        }
                    }
                }
            }
        }
    }

    /// 受信したバイト列をデコーダーに通してレスポンスを配送する
    fn on_read(&mut self, data: &[u8]) {
        self.last_read_at = Instant::now();
        let result = self
            .decoder
            .feed(data)
            .map_err(Error::from)
            .and_then(|()| self.process_responses());
        if let Err(err) = result {
            self.on_socket_error(err);
        }
    }

    /// デコーダーに溜まっているレスポンスを配送できるだけ配送する
    fn process_responses(&mut self) -> Result<(), Error> {
        loop {
            if self.paused {
                return Ok(());
            }
            if self.queue.running_len() == 0 {
                if self.socket.is_some() && !self.decoder.is_idle() && !self.decoder.is_tunnel() {
                    return Err(Error::Socket(
                        "unsolicited data on connection".to_string(),
                    ));
                }
                return Ok(());
            }

            let headers_received = self
                .queue
                .oldest_running()
                .map(|e| e.headers_received)
                .unwrap_or(false);

            if !headers_received {
                let (expect_no_body, expect_tunnel) = {
                    let entry = self.queue.oldest_running().unwrap();
                    (entry.request.is_head(), entry.request.method == "CONNECT")
                };
                self.decoder.set_expect_no_body(expect_no_body);
                self.decoder.set_expect_tunnel(expect_tunnel);

                match self.decoder.decode_headers()? {
                    None => return Ok(()),
                    Some(DecodedHead::Informational(head)) => {
                        let entry = self.queue.oldest_running_mut().unwrap();
                        entry.handler.on_informational(&head);
                        continue;
                    }
                    Some(DecodedHead::Final { head, body_kind }) => {
                        self.on_final_head(head, body_kind)?;
                        continue;
                    }
                }
            }

            // ボディの配送
            let mut completed: Option<Vec<(String, String)>> = None;
            if let Some(data) = self.decoder.peek_body() {
                let len = data.len();
                let entry = self.queue.oldest_running_mut().unwrap();
                let keep_going = entry.handler.on_data(data);
                if !keep_going {
                    self.paused = true;
                }
                match self.decoder.consume_body(len)? {
                    BodyProgress::Complete { trailers } => completed = Some(trailers),
                    BodyProgress::Continue => {}
                }
            } else {
                match self.decoder.progress()? {
                    BodyProgress::Complete { trailers } => completed = Some(trailers),
                    BodyProgress::Continue => return Ok(()),
                }
            }

            if let Some(trailers) = completed {
                self.finish_response(trailers);
            }
        }
    }

    /// 最終レスポンスヘッダーの処理
    fn on_final_head(
        &mut self,
        head: shiguredo_h1conn::ResponseHead,
        body_kind: BodyKind,
    ) -> Result<(), Error> {
        // キープアライブの判定
        let requests_close = self
            .queue
            .oldest_running()
            .map(|e| e.request.requests_close())
            .unwrap_or(false);
        if !head.is_keep_alive() || requests_close {
            self.close_after_response = true;
        }
        if let Some(secs) = head.keep_alive_timeout() {
            let hint = Duration::from_secs(secs);
            self.keep_alive_timeout = hint.min(self.options.keep_alive_max_timeout);
        }

        if body_kind == BodyKind::Tunnel {
            // プロトコル切り替え: ソケットの所有権を引き渡す
            let Some(mut entry) = self.queue.complete_oldest() else {
                return Ok(());
            };
            let prelude = self.decoder.take_remaining();
            let Some(stream) = self.socket.take() else {
                entry.handler.on_error(Error::Socket(
                    "socket lost during protocol upgrade".to_string(),
                ));
                self.finish_entry();
                self.note_idle();
                return Ok(());
            };
            self.decoder = ResponseDecoder::with_limits(self.options.limits.clone());
            self.requests_on_socket = 0;
            self.close_after_response = false;
            entry
                .handler
                .on_upgrade(head, UpgradedStream::new(stream, prelude));
            self.finish_entry();
            // パイプライン規則によりここに実行中エントリーは残らないはずだが、
            // 残っていればレスポンスは届かないため失敗させる
            if self.queue.running_len() > 0 {
                self.fail_running(Error::Socket("connection was upgraded".to_string()));
            }
            self.note_idle();
            return Ok(());
        }

        let resumer = Resumer::new(self.ops_tx.clone());
        let entry = self.queue.oldest_running_mut().unwrap();
        entry.headers_received = true;
        let keep_going = entry.handler.on_headers(head, resumer);
        if !keep_going {
            self.paused = true;
        }
        Ok(())
    }

    /// 最も古い実行中リクエストのレスポンス完了
    fn finish_response(&mut self, trailers: Vec<(String, String)>) {
        if let Some(mut entry) = self.queue.complete_oldest() {
            entry.handler.on_complete(trailers);
            self.finish_entry();
        }

        if self.close_after_response {
            // サーバーが接続を閉じる。後続のレスポンスは届かない
            self.teardown_socket();
            self.fail_running(Error::Socket("server closed the connection".to_string()));
        }
        self.note_idle();
    }

    /// ソケットの EOF 処理
    fn on_eof(&mut self) {
        match self.decoder.mark_eof() {
            Ok(()) => {
                // close-delimited ボディの終端かもしれないので先に配送する
                if let Err(err) = self.process_responses() {
                    self.on_socket_error(err);
                    return;
                }
                let had_running = self.queue.running_len() > 0;
                self.teardown_socket();
                if had_running {
                    self.fail_running(Error::Socket("the connection was closed".to_string()));
                } else {
                    // アイドル中のソケット切断は静かに握りつぶす
                    // (未書き込みリクエストは再接続で送られる)
                }
            }
            Err(e) => self.on_socket_error(Error::Http(e)),
        }
    }

    /// リクエストの中断
    fn on_abort(&mut self, id: u64) {
        // ヘッドの書き込みが飛行中の中断はソケットに中途半端な
        // バイト列が残り得るため、ソケットごと破棄する
        if self
            .pending_write
            .as_ref()
            .is_some_and(|w| w.done.unwritten_id() == Some(id))
        {
            self.pending_write = None;
            self.teardown_socket();
            if let Some(mut entry) = self.queue.remove_pending_where(|e| e.id == id) {
                entry.handler.on_error(Error::Aborted);
                self.finish_entry();
            }
            self.fail_running(Error::Socket(
                "connection destroyed by an aborted request".to_string(),
            ));
            return;
        }

        // 未書き込みならキューから外すだけでよい
        if let Some(mut entry) = self.queue.remove_pending_where(|e| e.id == id) {
            if self.writing.as_ref().is_some_and(|w| w.id == id) {
                self.writing = None;
            }
            entry.handler.on_error(Error::Aborted);
            self.finish_entry();
            self.note_idle();
            return;
        }

        // 書き込み済みはレスポンスの整合が取れないためソケットごと破棄する
        if self.queue.running_contains(|e| e.id == id) {
            self.teardown_socket();
            for mut entry in self.queue.take_running() {
                let err = if entry.id == id {
                    Error::Aborted
                } else {
                    Error::Socket("connection destroyed by an aborted request".to_string())
                };
                entry.handler.on_error(err);
                self.finish_entry();
            }
            self.note_idle();
        }
        // 既に完了済みの中断は何もしない
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Headers => {
                // 停滞した書き込みが時間切れの対象なら、そのリクエストを
                // 失敗させる (実行中があればタイマーは実行中のもの)
                if self.queue.running_len() == 0
                    && let Some(write) = self.pending_write.take()
                    && let Some(id) = write.done.unwritten_id()
                    && let Some(mut entry) = self.queue.remove_pending_where(|e| e.id == id)
                {
                    entry.handler.on_error(Error::HeadersTimeout);
                    self.finish_entry();
                }
                self.on_socket_error(Error::HeadersTimeout);
            }
            TimerKind::Body => self.on_socket_error(Error::BodyTimeout),
            TimerKind::KeepAlive => {
                if self.queue.is_empty() {
                    self.teardown_socket();
                }
            }
        }
    }

    /// 次に起こすべきタイムアウトを決める
    fn compute_deadline(&self) -> Option<(Instant, TimerKind)> {
        self.socket.as_ref()?;
        if self.queue.running_len() > 0 {
            if self.paused {
                // 消費側が止めている間はタイムアウトさせない
                return None;
            }
            let oldest = self.queue.oldest_running()?;
            if oldest.headers_received {
                let timeout = oldest
                    .request
                    .body_timeout
                    .unwrap_or(self.options.body_timeout);
                Some((self.last_read_at + timeout, TimerKind::Body))
            } else {
                let base = oldest.write_done_at?;
                let timeout = oldest
                    .request
                    .headers_timeout
                    .unwrap_or(self.options.headers_timeout);
                Some((base + timeout, TimerKind::Headers))
            }
        } else if let Some(write) = &self.pending_write {
            // 書き込みが進まないままの停滞にもタイムアウトを適用する
            let timeout = write
                .done
                .unwritten_id()
                .and_then(|id| self.queue.next_pending().filter(|e| e.id == id))
                .and_then(|e| e.request.headers_timeout)
                .unwrap_or(self.options.headers_timeout);
            Some((write.last_progress_at + timeout, TimerKind::Headers))
        } else if self.queue.is_empty() && self.writing.is_none() {
            Some((self.idle_since + self.keep_alive_timeout, TimerKind::KeepAlive))
        } else {
            None
        }
    }

    /// ソケット喪失: 実行中は失敗、未書き込みは再接続後に再送
    fn on_socket_error(&mut self, err: Error) {
        self.dispose_pending_write(&err);
        self.teardown_socket();
        self.fail_running(err);
    }

    /// 飛行中の書き込みを片付ける
    ///
    /// 再送可能なボディはエントリーへ戻す。最初のチャンクを取り出し済みの
    /// ストリームボディは再生できないため、そのエントリーを失敗させる。
    fn dispose_pending_write(&mut self, err: &Error) {
        let Some(write) = self.pending_write.take() else {
            return;
        };
        match write.done {
            WriteDone::Request { id, body, .. } => self.restore_pending_body(id, body),
            WriteDone::StreamHead {
                id, body, consumed, ..
            } => {
                if consumed {
                    if let Some(mut entry) = self.queue.remove_pending_where(|e| e.id == id) {
                        entry.handler.on_error(err.clone());
                        self.finish_entry();
                    }
                } else {
                    self.restore_pending_body(id, body);
                }
            }
            WriteDone::Chunk { .. } | WriteDone::Last { .. } => {}
        }
    }

    fn fail_running(&mut self, err: Error) {
        for mut entry in self.queue.take_running() {
            entry.handler.on_error(err.clone());
            self.finish_entry();
        }
        self.note_idle();
    }

    /// ソケットとデコーダーの状態を破棄する
    ///
    /// 未書き込みエントリーには触れない。遅延ヘッド書き込み中の
    /// ボディは再送できるようにエントリーへ戻す。
    fn teardown_socket(&mut self) {
        self.dispose_pending_write(&Error::Socket("the connection was closed".to_string()));
        self.socket = None;
        self.socket_server_name = None;
        if let Some(writing) = self.writing.take()
            && let Some(entry) = self.queue.next_pending_mut()
            && entry.id == writing.id
        {
            entry.body = Some(writing.body);
        }
        self.decoder = ResponseDecoder::with_limits(self.options.limits.clone());
        self.requests_on_socket = 0;
        self.close_after_response = false;
        self.paused = false;
        self.keep_alive_timeout = self.options.keep_alive_timeout;
    }

    /// エンジンの終了処理: 未完了をすべて失敗させる
    fn shutdown(&mut self, err: Error) {
        self.dispose_pending_write(&err);
        self.teardown_socket();
        self.writing = None;
        for mut entry in self.queue.take_unfinished() {
            entry.handler.on_error(err.clone());
            self.finish_entry();
        }
    }

    /// 次の未書き込みエントリーを書き込み済みに進める
    fn mark_written(&mut self) {
        if let Some(entry) = self.queue.next_pending_mut() {
            entry.write_done_at = Some(Instant::now());
        }
        self.queue.advance_pending();
        self.requests_on_socket += 1;
    }

    /// ソケット喪失時に遅延ヘッド書き込み中だったボディをエントリーへ戻す
    fn restore_pending_body(&mut self, id: u64, body: RequestBody) {
        if let Some(entry) = self.queue.next_pending_mut()
            && entry.id == id
        {
            entry.body = Some(body);
        }
    }

    fn finish_entry(&self) {
        self.shared.unfinished.fetch_sub(1, Ordering::SeqCst);
        self.shared.drained.notify_waiters();
    }

    fn note_idle(&mut self) {
        if self.queue.is_empty() {
            self.idle_since = Instant::now();
        }
    }
}

/// ソケットの読み書きを 1 つのイベントとして待つ
///
/// 流しきっていない書き込みがあれば書き込みを優先しつつ、読み取りも
/// 並行して待つ。どちらも進められない間は Pending のまま。
async fn socket_io(
    socket: &mut Option<ConnStream>,
    buf: &mut [u8],
    out: Option<&[u8]>,
    want_read: bool,
) -> std::io::Result<IoEvent> {
    let Some(stream) = socket.as_mut() else {
        return std::future::pending().await;
    };
    std::future::poll_fn(|cx| {
        if let Some(bytes) = out {
            match Pin::new(&mut *stream).poll_write(cx, bytes) {
                Poll::Ready(Ok(n)) => return Poll::Ready(Ok(IoEvent::Wrote(n))),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }
        if want_read {
            let mut read_buf = ReadBuf::new(buf);
            match Pin::new(&mut *stream).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    return Poll::Ready(Ok(IoEvent::Read(read_buf.filled().len())));
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }
        Poll::Pending
    })
    .await
}

/// 書き込み中のボディがあれば次のチャンクを取り出す
async fn next_body_chunk(
    writing: &mut Option<WriteState>,
) -> std::io::Result<Option<Vec<u8>>> {
    match writing {
        Some(state) => state.body.next_chunk().await,
        None => std::future::pending().await,
    }
}

/// 期限があればそこまで眠り、なければ永遠に眠る
async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
