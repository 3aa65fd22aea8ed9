//! tokio-h1conn エラー型

use std::fmt;

/// tokio-h1conn エラー
///
/// リクエストの失敗理由を表す。エンジンは同じソケット上の複数の
/// リクエストに同じエラーを配る必要があるため `Clone` を実装する。
#[derive(Debug)]
pub enum Error {
    /// I/O エラー
    Io(std::io::Error),
    /// HTTP パースエラー
    Http(shiguredo_h1conn::Error),
    /// リクエストのエンコードエラー (宣言長不一致を含む)
    Encode(shiguredo_h1conn::EncodeError),
    /// TLS エラー
    Tls(String),
    /// 接続タイムアウト
    ConnectTimeout,
    /// レスポンスヘッダー到着タイムアウト
    HeadersTimeout,
    /// レスポンスボディ読み取りタイムアウト
    BodyTimeout,
    /// レスポンス完了前にソケットが失われた
    Socket(String),
    /// リクエストが呼び出し側によって中断された
    Aborted,
    /// クライアントがクローズ済み (新規リクエスト不可)
    Closed,
    /// クライアントが破棄済み
    Destroyed,
    /// 不正な引数
    InvalidArgument(String),
}

impl Error {
    /// 接続の張り直しで解決し得るエラーかどうか
    ///
    /// サーバーがレスポンスを返す前の転送路起因の失敗だけが対象。
    /// プロトコル違反やタイムアウトは再試行しても同じ結果になる
    /// 可能性が高いため含めない。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Socket(_) | Error::ConnectTimeout
        )
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            // io::Error は Clone できないため種別とメッセージを引き継ぐ
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Http(e) => Error::Http(e.clone()),
            Error::Encode(e) => Error::Encode(e.clone()),
            Error::Tls(e) => Error::Tls(e.clone()),
            Error::ConnectTimeout => Error::ConnectTimeout,
            Error::HeadersTimeout => Error::HeadersTimeout,
            Error::BodyTimeout => Error::BodyTimeout,
            Error::Socket(msg) => Error::Socket(msg.clone()),
            Error::Aborted => Error::Aborted,
            Error::Closed => Error::Closed,
            Error::Destroyed => Error::Destroyed,
            Error::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::Encode(e) => write!(f, "encode error: {}", e),
            Error::Tls(e) => write!(f, "TLS error: {}", e),
            Error::ConnectTimeout => write!(f, "connect timeout"),
            Error::HeadersTimeout => write!(f, "headers timeout"),
            Error::BodyTimeout => write!(f, "body timeout"),
            Error::Socket(msg) => write!(f, "socket error: {}", msg),
            Error::Aborted => write!(f, "request aborted"),
            Error::Closed => write!(f, "client is closed"),
            Error::Destroyed => write!(f, "client is destroyed"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(e),
            Error::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<shiguredo_h1conn::Error> for Error {
    fn from(e: shiguredo_h1conn::Error) -> Self {
        Error::Http(e)
    }
}

impl From<shiguredo_h1conn::EncodeError> for Error {
    fn from(e: shiguredo_h1conn::EncodeError) -> Self {
        Error::Encode(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<rustls_pki_types::InvalidDnsNameError> for Error {
    fn from(e: rustls_pki_types::InvalidDnsNameError) -> Self {
        Error::Tls(e.to_string())
    }
}

/// Result 型エイリアス
pub type Result<T> = std::result::Result<T, Error>;
