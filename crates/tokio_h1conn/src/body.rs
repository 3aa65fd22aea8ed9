//! リクエストボディソース

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// ストリーム読み取りのチャンクサイズ
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// リクエストボディのソース
///
/// ボディの供給方法ごとにワイヤーフレーミングが変わる:
///
/// - [`RequestBody::Empty`] / [`RequestBody::Buffer`]: 長さ既知。Content-Length で送る
/// - [`RequestBody::Reader`] / [`RequestBody::Channel`]: 長さ不明。リクエスト側に
///   宣言長があれば Content-Length、なければ chunked で送る
pub enum RequestBody {
    /// ボディなし
    Empty,
    /// 長さ既知のバッファ
    Buffer(Vec<u8>),
    /// 非同期リーダーからのストリーム
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// チャネル経由で供給されるチャンク列
    ///
    /// 送信側をドロップするとボディ終端になる。
    Channel(mpsc::Receiver<Vec<u8>>),
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("RequestBody::Empty"),
            RequestBody::Buffer(data) => write!(f, "RequestBody::Buffer({} bytes)", data.len()),
            RequestBody::Reader(_) => f.write_str("RequestBody::Reader"),
            RequestBody::Channel(_) => f.write_str("RequestBody::Channel"),
        }
    }
}

impl RequestBody {
    /// 既知のボディ長を取得
    ///
    /// ストリーム系ソースでは `None`。
    pub fn known_len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Buffer(data) => Some(data.len() as u64),
            RequestBody::Reader(_) | RequestBody::Channel(_) => None,
        }
    }

    /// ストリーム系ソースかどうか
    ///
    /// ストリームボディを持つリクエストはパイプラインに同居できない。
    pub fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Reader(_) | RequestBody::Channel(_))
    }

    /// 再送可能なソースかどうか
    ///
    /// リトライやリダイレクトでリクエストを出し直せるのは
    /// ボディを再生できる場合のみ。
    pub fn is_replayable(&self) -> bool {
        matches!(self, RequestBody::Empty | RequestBody::Buffer(_))
    }

    /// 次のチャンクを取得
    ///
    /// ボディ終端で `None` を返す。
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match self {
            RequestBody::Empty => Ok(None),
            RequestBody::Buffer(data) => {
                if data.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(data)))
                }
            }
            RequestBody::Reader(reader) => {
                let mut buf = vec![0u8; READ_CHUNK_SIZE];
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    Ok(None)
                } else {
                    buf.truncate(n);
                    Ok(Some(buf))
                }
            }
            RequestBody::Channel(receiver) => Ok(receiver.recv().await),
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(data: Vec<u8>) -> Self {
        if data.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Buffer(data)
        }
    }
}

impl From<&[u8]> for RequestBody {
    fn from(data: &[u8]) -> Self {
        data.to_vec().into()
    }
}

impl From<&str> for RequestBody {
    fn from(data: &str) -> Self {
        data.as_bytes().into()
    }
}
