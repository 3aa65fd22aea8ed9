//! ディスパッチインターセプター
//!
//! [`Dispatcher`] を包んでリダイレクト追従とリトライを追加する。
//! どちらもボディを再生できるリクエスト (Empty / Buffer) にのみ作用し、
//! ストリームボディのリクエストはそのまま素通しする。

use std::sync::Arc;

use shiguredo_h1conn::{Request, ResponseHead};

use crate::body::RequestBody;
use crate::error::Error;
use crate::handler::{AbortHandle, Dispatcher, Handler, Resumer};
use crate::upgraded::UpgradedStream;

/// 再生用に保持するボディ
#[derive(Debug, Clone)]
enum ReplayBody {
    Empty,
    Buffer(Vec<u8>),
}

impl ReplayBody {
    fn capture(body: &RequestBody) -> Option<Self> {
        match body {
            RequestBody::Empty => Some(ReplayBody::Empty),
            RequestBody::Buffer(data) => Some(ReplayBody::Buffer(data.clone())),
            _ => None,
        }
    }

    fn to_body(&self) -> RequestBody {
        match self {
            ReplayBody::Empty => RequestBody::Empty,
            ReplayBody::Buffer(data) => RequestBody::Buffer(data.clone()),
        }
    }
}

/// リダイレクト追従ディスパッチャー
///
/// 同一接続先への相対 Location (301/302/303/307/308) を追従する。
/// 別オリジンへのリダイレクトは単一接続のエンジンでは追えないため、
/// レスポンスをそのままハンドラーに渡す。
pub struct RedirectDispatcher {
    inner: Arc<dyn Dispatcher>,
    max_redirects: usize,
}

impl RedirectDispatcher {
    /// 新しいリダイレクトディスパッチャーを作成
    pub fn new(inner: Arc<dyn Dispatcher>, max_redirects: usize) -> Self {
        Self {
            inner,
            max_redirects,
        }
    }
}

impl Dispatcher for RedirectDispatcher {
    fn dispatch(&self, request: Request, body: RequestBody, handler: Box<dyn Handler>) -> bool {
        let Some(replay) = ReplayBody::capture(&body) else {
            // ストリームボディは再生できないので追従しない
            return self.inner.dispatch(request, body, handler);
        };
        if self.max_redirects == 0 {
            return self.inner.dispatch(request, body, handler);
        }

        let wrapper = RedirectHandler {
            dispatcher: self.inner.clone(),
            inner: Some(handler),
            request: request.clone(),
            replay,
            remaining: self.max_redirects,
            pending: None,
        };
        self.inner.dispatch(request, body, Box::new(wrapper))
    }
}

/// 追従が確定したリダイレクトの情報
struct PendingRedirect {
    target: String,
    /// 303 (および POST への 301/302) ではメソッドを GET に変えてボディを落とす
    to_get: bool,
}

struct RedirectHandler {
    dispatcher: Arc<dyn Dispatcher>,
    inner: Option<Box<dyn Handler>>,
    request: Request,
    replay: ReplayBody,
    remaining: usize,
    pending: Option<PendingRedirect>,
}

impl RedirectHandler {
    fn redirect_of(&self, head: &ResponseHead) -> Option<PendingRedirect> {
        if !matches!(head.status_code, 301 | 302 | 303 | 307 | 308) {
            return None;
        }
        let location = head.get_header("Location")?;
        // 同一オリジンの origin-form のみ追従する
        if !location.starts_with('/') || location.starts_with("//") {
            return None;
        }
        let to_get = match head.status_code {
            303 => !matches!(self.request.method.as_str(), "GET" | "HEAD"),
            301 | 302 => self.request.method == "POST",
            _ => false,
        };
        Some(PendingRedirect {
            target: location.to_string(),
            to_get,
        })
    }

    fn follow(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let mut request = self.request.clone();
        request.target = pending.target;
        let replay = if pending.to_get {
            request.method = "GET".to_string();
            request.content_length = None;
            request.headers.retain(|(name, _)| {
                !name.eq_ignore_ascii_case("Content-Length")
                    && !name.eq_ignore_ascii_case("Content-Type")
                    && !name.eq_ignore_ascii_case("Transfer-Encoding")
            });
            ReplayBody::Empty
        } else {
            self.replay.clone()
        };

        let next = RedirectHandler {
            dispatcher: self.dispatcher.clone(),
            inner: self.inner.take(),
            request: request.clone(),
            replay: replay.clone(),
            remaining: self.remaining - 1,
            pending: None,
        };
        self.dispatcher
            .dispatch(request, replay.to_body(), Box::new(next));
    }

    fn inner_mut(&mut self) -> Option<&mut Box<dyn Handler>> {
        self.inner.as_mut()
    }
}

impl Handler for RedirectHandler {
    fn on_connect(&mut self, abort: AbortHandle) {
        if let Some(inner) = self.inner_mut() {
            inner.on_connect(abort);
        }
    }

    fn on_informational(&mut self, head: &ResponseHead) {
        if let Some(inner) = self.inner_mut() {
            inner.on_informational(head);
        }
    }

    fn on_body_sent(&mut self) {
        if let Some(inner) = self.inner_mut() {
            inner.on_body_sent();
        }
    }

    fn on_headers(&mut self, head: ResponseHead, resumer: Resumer) -> bool {
        if self.remaining > 0 {
            if let Some(pending) = self.redirect_of(&head) {
                // 追従する。リダイレクトレスポンスのボディは読み捨てる
                self.pending = Some(pending);
                return true;
            }
        }
        match self.inner_mut() {
            Some(inner) => inner.on_headers(head, resumer),
            None => true,
        }
    }

    fn on_data(&mut self, data: &[u8]) -> bool {
        if self.pending.is_some() {
            // 読み捨て
            return true;
        }
        match self.inner_mut() {
            Some(inner) => inner.on_data(data),
            None => true,
        }
    }

    fn on_complete(&mut self, trailers: Vec<(String, String)>) {
        if self.pending.is_some() {
            self.follow();
            return;
        }
        if let Some(inner) = self.inner_mut() {
            inner.on_complete(trailers);
        }
    }

    fn on_error(&mut self, error: Error) {
        if let Some(inner) = self.inner_mut() {
            inner.on_error(error);
        }
    }

    fn on_upgrade(&mut self, head: ResponseHead, stream: UpgradedStream) {
        if let Some(inner) = self.inner_mut() {
            inner.on_upgrade(head, stream);
        }
    }
}

/// リトライディスパッチャー
///
/// レスポンスを 1 バイトも受け取る前にソケット起因で失敗した
/// 冪等リクエストを再投入する。
pub struct RetryDispatcher {
    inner: Arc<dyn Dispatcher>,
    max_retries: usize,
}

impl RetryDispatcher {
    /// 新しいリトライディスパッチャーを作成
    pub fn new(inner: Arc<dyn Dispatcher>, max_retries: usize) -> Self {
        Self { inner, max_retries }
    }
}

impl Dispatcher for RetryDispatcher {
    fn dispatch(&self, request: Request, body: RequestBody, handler: Box<dyn Handler>) -> bool {
        let replay = ReplayBody::capture(&body);
        let retryable = replay.is_some() && request.is_idempotent() && self.max_retries > 0;
        if !retryable {
            return self.inner.dispatch(request, body, handler);
        }

        let wrapper = RetryHandler {
            dispatcher: self.inner.clone(),
            inner: Some(handler),
            request: request.clone(),
            replay: replay.unwrap(),
            remaining: self.max_retries,
            saw_response: false,
        };
        self.inner.dispatch(request, body, Box::new(wrapper))
    }
}

struct RetryHandler {
    dispatcher: Arc<dyn Dispatcher>,
    inner: Option<Box<dyn Handler>>,
    request: Request,
    replay: ReplayBody,
    remaining: usize,
    /// 最終レスポンスのヘッダーを受け取ったか
    ///
    /// 受け取った後の失敗はレスポンスの途中なので再試行できない。
    saw_response: bool,
}

impl RetryHandler {
    fn should_retry(&self, error: &Error) -> bool {
        !self.saw_response && self.remaining > 0 && error.is_retryable()
    }

    fn retry(&mut self) {
        let next = RetryHandler {
            dispatcher: self.dispatcher.clone(),
            inner: self.inner.take(),
            request: self.request.clone(),
            replay: self.replay.clone(),
            remaining: self.remaining - 1,
            saw_response: false,
        };
        self.dispatcher
            .dispatch(self.request.clone(), self.replay.to_body(), Box::new(next));
    }
}

impl Handler for RetryHandler {
    fn on_connect(&mut self, abort: AbortHandle) {
        if let Some(inner) = self.inner.as_mut() {
            inner.on_connect(abort);
        }
    }

    fn on_informational(&mut self, head: &ResponseHead) {
        if let Some(inner) = self.inner.as_mut() {
            inner.on_informational(head);
        }
    }

    fn on_body_sent(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.on_body_sent();
        }
    }

    fn on_headers(&mut self, head: ResponseHead, resumer: Resumer) -> bool {
        self.saw_response = true;
        match self.inner.as_mut() {
            Some(inner) => inner.on_headers(head, resumer),
            None => true,
        }
    }

    fn on_data(&mut self, data: &[u8]) -> bool {
        match self.inner.as_mut() {
            Some(inner) => inner.on_data(data),
            None => true,
        }
    }

    fn on_complete(&mut self, trailers: Vec<(String, String)>) {
        if let Some(inner) = self.inner.as_mut() {
            inner.on_complete(trailers);
        }
    }

    fn on_error(&mut self, error: Error) {
        if self.should_retry(&error) {
            self.retry();
            return;
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.on_error(error);
        }
    }

    fn on_upgrade(&mut self, head: ResponseHead, stream: UpgradedStream) {
        self.saw_response = true;
        if let Some(inner) = self.inner.as_mut() {
            inner.on_upgrade(head, stream);
        }
    }
}
