use std::time::Duration;

/// HTTP クライアントリクエスト
///
/// 接続エンジンに投入する 1 リクエスト分の記述子。
/// エンキュー後は不変として扱う (完了フラグの管理はエンジン側が持つ)。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// HTTP メソッド (GET, POST, etc.)
    pub method: String,
    /// リクエストターゲット (origin-form のパス、CONNECT では authority-form)
    pub target: String,
    /// HTTP バージョン (デフォルト: HTTP/1.1)
    pub version: String,
    /// ヘッダー
    pub headers: Vec<(String, String)>,
    /// 宣言されたボディ長
    ///
    /// ボディソースの実長と食い違う場合、strict モードではリクエストが
    /// 失敗する。未指定ならボディソースから決定する。
    pub content_length: Option<u64>,
    /// 冪等フラグ (未指定ならメソッドから導出)
    pub idempotent: Option<bool>,
    /// このリクエストの完了後に接続を閉じる
    pub reset: bool,
    /// このリクエストのレスポンスヘッダー到着まで後続のパイプラインを止める
    pub blocking: bool,
    /// TLS の SNI (接続の transport identity)
    ///
    /// 現在の接続と異なる場合、エンジンは実行中リクエストの完了を待って
    /// 新しい identity で再接続する。
    pub server_name: Option<String>,
    /// このリクエストだけのヘッダータイムアウト (未指定ならエンジン設定)
    pub headers_timeout: Option<Duration>,
    /// このリクエストだけのボディタイムアウト (未指定ならエンジン設定)
    pub body_timeout: Option<Duration>,
}

impl Request {
    /// 新しいリクエストを作成 (HTTP/1.1)
    pub fn new(method: &str, target: &str) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            content_length: None,
            idempotent: None,
            reset: false,
            blocking: false,
            server_name: None,
            headers_timeout: None,
            body_timeout: None,
        }
    }

    /// ヘッダーを追加 (ビルダーパターン)
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// 宣言ボディ長を設定 (ビルダーパターン)
    pub fn content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    /// 冪等フラグを明示的に設定 (ビルダーパターン)
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    /// 完了後に接続を閉じるよう指定 (ビルダーパターン)
    pub fn reset(mut self) -> Self {
        self.reset = true;
        self
    }

    /// ブロッキングリクエストとして指定 (ビルダーパターン)
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// SNI を指定 (ビルダーパターン)
    pub fn server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.to_string());
        self
    }

    /// ヘッダータイムアウトを上書き (ビルダーパターン)
    pub fn headers_timeout(mut self, timeout: Duration) -> Self {
        self.headers_timeout = Some(timeout);
        self
    }

    /// ボディタイムアウトを上書き (ビルダーパターン)
    pub fn body_timeout(mut self, timeout: Duration) -> Self {
        self.body_timeout = Some(timeout);
        self
    }

    /// ヘッダーを取得 (大文字小文字を区別しない)
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// ヘッダーが存在するか確認
    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// 冪等なリクエストかどうかを判定
    ///
    /// 明示的に指定されていない場合はメソッドから導出する。
    /// RFC 9110 Section 9.2.2: GET, HEAD, PUT, DELETE, OPTIONS, TRACE は冪等。
    pub fn is_idempotent(&self) -> bool {
        match self.idempotent {
            Some(idempotent) => idempotent,
            None => matches!(
                self.method.as_str(),
                "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS" | "TRACE"
            ),
        }
    }

    /// メソッドがリクエストボディを伴うかどうかを判定
    ///
    /// RFC 9110 Section 9.3: GET/HEAD/DELETE/OPTIONS/TRACE/CONNECT では
    /// リクエストボディに定義された意味がない。
    pub fn method_expects_payload(&self) -> bool {
        !matches!(
            self.method.as_str(),
            "GET" | "HEAD" | "DELETE" | "OPTIONS" | "TRACE" | "CONNECT"
        )
    }

    /// HEAD リクエストかどうかを判定
    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    /// アップグレード (または CONNECT) リクエストかどうかを判定
    ///
    /// レスポンス側でトンネル/プロトコル切り替えが起きるため、
    /// パイプライン上で他のリクエストと同居できない。
    pub fn is_upgrade(&self) -> bool {
        self.method == "CONNECT" || self.has_header("Upgrade")
    }

    /// 完了後に接続クローズが必要なリクエストかどうかを判定
    ///
    /// Connection: close を明示しているか、reset フラグが立っている場合。
    pub fn requests_close(&self) -> bool {
        if self.reset {
            return true;
        }
        self.get_header("Connection").is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        })
    }
}

/// メソッド名が有効か確認
///
/// RFC 9110 Section 9 では method = token と定義されているが、
/// セキュリティ上の理由から大文字アルファベット、アンダースコア、ハイフンのみを許可する。
/// 小文字メソッドは正当なクライアントが使用しないため拒否する。
pub(crate) fn is_valid_method(method: &str) -> bool {
    !method.is_empty()
        && method
            .bytes()
            .all(|b| matches!(b, b'A'..=b'Z' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_derived_from_method() {
        assert!(Request::new("GET", "/").is_idempotent());
        assert!(Request::new("HEAD", "/").is_idempotent());
        assert!(Request::new("PUT", "/").is_idempotent());
        assert!(!Request::new("POST", "/").is_idempotent());
        assert!(!Request::new("CONNECT", "example.com:443").is_idempotent());
    }

    #[test]
    fn idempotent_explicit_override() {
        assert!(!Request::new("GET", "/").idempotent(false).is_idempotent());
        assert!(Request::new("POST", "/").idempotent(true).is_idempotent());
    }

    #[test]
    fn payload_expectation() {
        assert!(Request::new("POST", "/").method_expects_payload());
        assert!(Request::new("PUT", "/").method_expects_payload());
        assert!(!Request::new("GET", "/").method_expects_payload());
        assert!(!Request::new("HEAD", "/").method_expects_payload());
    }

    #[test]
    fn upgrade_detection() {
        assert!(Request::new("CONNECT", "example.com:443").is_upgrade());
        assert!(
            Request::new("GET", "/ws")
                .header("Connection", "upgrade")
                .header("Upgrade", "websocket")
                .is_upgrade()
        );
        assert!(!Request::new("GET", "/").is_upgrade());
    }

    #[test]
    fn close_request() {
        assert!(Request::new("GET", "/").reset().requests_close());
        assert!(
            Request::new("GET", "/")
                .header("Connection", "close")
                .requests_close()
        );
        assert!(!Request::new("GET", "/").requests_close());
    }

    #[test]
    fn valid_method() {
        assert!(is_valid_method("GET"));
        assert!(is_valid_method("GET_PARAMETER"));
        assert!(!is_valid_method("get"));
        assert!(!is_valid_method(""));
    }
}
