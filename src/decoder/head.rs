//! レスポンスヘッダー型の定義

/// レスポンスヘッダー（ボディなし）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP バージョン (HTTP/1.1 等)
    pub version: String,
    /// ステータスコード (200, 404, etc.)
    pub status_code: u16,
    /// ステータスフレーズ (OK, Not Found, etc.)
    pub reason_phrase: String,
    /// ヘッダー
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// ヘッダーを取得 (大文字小文字を区別しない)
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 指定した名前のヘッダーをすべて取得
    pub fn get_headers(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// ヘッダーが存在するか確認
    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// ステータスコードが情報レスポンス (1xx) か確認
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    /// ステータスコードが成功 (2xx) か確認
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// ステータスコードがリダイレクト (3xx) か確認
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status_code)
    }

    /// キープアライブ接続かどうかを判定
    ///
    /// RFC 9110 Section 9.1: 複数の Connection ヘッダーはリストとして結合して処理する。
    /// close トークンがいずれかのヘッダーに存在すれば false を返す。
    /// HTTP/1.1 はデフォルトでキープアライブ、HTTP/1.0 は keep-alive 明示が必要。
    pub fn is_keep_alive(&self) -> bool {
        let mut has_keep_alive = false;

        for conn in self.get_headers("Connection") {
            for token in conn.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    return false;
                }
                if token.eq_ignore_ascii_case("keep-alive") {
                    has_keep_alive = true;
                }
            }
        }

        if has_keep_alive {
            return true;
        }
        self.version.ends_with("/1.1")
    }

    /// Keep-Alive ヘッダーの timeout ヒントを取得 (秒)
    ///
    /// RFC 9112 Appendix C.1 / Keep-Alive ヘッダー:
    /// `Keep-Alive: timeout=5, max=100` の timeout パラメータを返す。
    /// エンジン側で上限 (keep_alive_max_timeout) にクランプして使う。
    pub fn keep_alive_timeout(&self) -> Option<u64> {
        let value = self.get_header("Keep-Alive")?;
        for param in value.split(',') {
            let param = param.trim();
            if let Some(timeout) = param.strip_prefix("timeout=") {
                return timeout.trim().parse().ok();
            }
        }
        None
    }
}
