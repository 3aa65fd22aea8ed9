//! ディスパッチのコールバック契約

use shiguredo_h1conn::{Request, ResponseHead};
use tokio::sync::mpsc;

use crate::body::RequestBody;
use crate::client::Op;
use crate::error::Error;
use crate::upgraded::UpgradedStream;

/// リクエストごとのコールバックハンドラー
///
/// エンジンはレスポンスのライフサイクルに沿ってメソッドを呼び出す。
/// 呼び出し順序の保証:
///
/// 1. `on_connect` (ソケットに書き込まれる直前、一度だけ)
/// 2. `on_informational` (0 回以上)
/// 3. `on_headers` または `on_upgrade` (どちらか一度)
/// 4. `on_data` (0 回以上、`on_headers` の後のみ)
/// 5. 終端: `on_complete` / `on_error` / `on_upgrade` のいずれか一度だけ
///
/// `on_error` はどの段階からでも呼ばれ得る。終端イベントの後に
/// 呼び出しが起きることはない。
pub trait Handler: Send + 'static {
    /// リクエストがソケットに書き込まれる直前に呼ばれる
    ///
    /// `abort` を保持しておくと後からリクエストを中断できる。
    fn on_connect(&mut self, abort: AbortHandle) {
        let _ = abort;
    }

    /// 中間レスポンス (1xx、101 を除く) を受信した
    fn on_informational(&mut self, head: &ResponseHead) {
        let _ = head;
    }

    /// リクエストボディの送信が完了した
    fn on_body_sent(&mut self) {}

    /// 最終レスポンスのヘッダーを受信した
    ///
    /// `false` を返すとソケットの読み取りが一時停止し、
    /// `resumer.resume()` が呼ばれるまでボディは届かない。
    fn on_headers(&mut self, head: ResponseHead, resumer: Resumer) -> bool;

    /// レスポンスボディの一部を受信した
    ///
    /// `false` を返すと読み取りが一時停止する。再開には `on_headers` で
    /// 受け取った `Resumer` を使う。
    fn on_data(&mut self, data: &[u8]) -> bool;

    /// レスポンスが完了した (終端イベント)
    fn on_complete(&mut self, trailers: Vec<(String, String)>);

    /// リクエストが失敗した (終端イベント)
    fn on_error(&mut self, error: Error);

    /// プロトコル切り替え (101 / CONNECT 2xx) が成立した (終端イベント)
    ///
    /// ソケットの所有権が `stream` として引き渡される。
    /// デフォルト実装はアップグレードを想定しないためエラーにする。
    fn on_upgrade(&mut self, head: ResponseHead, stream: UpgradedStream) {
        let _ = (head, stream);
        self.on_error(Error::InvalidArgument(
            "handler does not support upgrade".to_string(),
        ));
    }
}

/// 読み取り再開ハンドル
///
/// `Handler::on_headers` / `Handler::on_data` が `false` を返して
/// 読み取りを止めた後、消費側の準備ができた時点で `resume()` を呼ぶ。
#[derive(Debug, Clone)]
pub struct Resumer {
    ops: mpsc::WeakUnboundedSender<Op>,
}

impl Resumer {
    pub(crate) fn new(ops: mpsc::WeakUnboundedSender<Op>) -> Self {
        Self { ops }
    }

    /// ソケットの読み取りを再開する
    pub fn resume(&self) {
        // エンジンが既に終了している場合は何もしない
        if let Some(ops) = self.ops.upgrade() {
            let _ = ops.send(Op::Resume);
        }
    }
}

/// リクエスト中断ハンドル
#[derive(Debug, Clone)]
pub struct AbortHandle {
    id: u64,
    ops: mpsc::WeakUnboundedSender<Op>,
}

impl AbortHandle {
    pub(crate) fn new(id: u64, ops: mpsc::WeakUnboundedSender<Op>) -> Self {
        Self { id, ops }
    }

    /// リクエストを中断する
    ///
    /// 未書き込みのリクエストはキューから取り除かれる。
    /// 書き込み済みのリクエストはレスポンスの整合が取れないため
    /// ソケットごと破棄される。どちらの場合もハンドラーには
    /// `Error::Aborted` が配られる。
    pub fn abort(&self) {
        if let Some(ops) = self.ops.upgrade() {
            let _ = ops.send(Op::Abort { id: self.id });
        }
    }
}

/// リクエストのディスパッチ先
///
/// [`crate::Client`] が実装するほか、リダイレクトやリトライの
/// インターセプターがこのトレイトで合成される。
pub trait Dispatcher: Send + Sync {
    /// リクエストを投入する
    ///
    /// 戻り値はバックプレッシャーの通知で、`false` でもリクエスト自体は
    /// 受理されている (これ以上投入すべきでないという合図)。
    fn dispatch(&self, request: Request, body: RequestBody, handler: Box<dyn Handler>) -> bool;
}
