//! リクエストのワイヤーエンコーダー
//!
//! 1 リクエスト分のヘッド (リクエストライン + ヘッダーブロック) と
//! chunked ボディのフレーミングをバイト列に変換する。
//! ソケットへの書き込み自体は行わない (Sans I/O)。

use crate::error::EncodeError;
use crate::request::{Request, is_valid_method};

/// ボディのフレーミング方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// ボディなし (フレーミングヘッダーも出力しない)
    None,
    /// Content-Length による固定長
    ContentLength(u64),
    /// Transfer-Encoding: chunked
    Chunked,
}

/// ボディのフレーミング方法を決定
///
/// - ボディ長が既知 (バッファ) なら Content-Length
/// - 長さ不明のストリームは、宣言長があれば Content-Length、なければ chunked
/// - ボディなしで正の宣言長があれば不一致エラー
///
/// 宣言長と既知のボディ長の不一致はここでエラーになる。
/// 緩和モードで続行するかどうかの判断は呼び出し側 (エンジン) が行う。
pub fn plan_framing(request: &Request, body_len: Option<u64>) -> Result<Framing, EncodeError> {
    let declared = resolve_declared_length(request)?;

    match body_len {
        Some(len) => {
            if let Some(declared) = declared {
                if declared != len {
                    return Err(EncodeError::ContentLengthMismatch {
                        declared,
                        actual: len,
                    });
                }
            }
            if len == 0 && !request.method_expects_payload() {
                return Ok(Framing::None);
            }
            Ok(Framing::ContentLength(len))
        }
        None => match declared {
            // 長さ不明のソースでも宣言長があれば固定長として送る
            // (実際に書いた長さとの一致は BodyWriteTracker が検証する)
            Some(declared) => Ok(Framing::ContentLength(declared)),
            None => Ok(Framing::Chunked),
        },
    }
}

/// 宣言されたボディ長を解決
///
/// `content_length` フィールドと Content-Length ヘッダーの両方を確認する。
/// 両方が存在して食い違う場合はエラー。
/// Transfer-Encoding ヘッダーとの同時指定もエラー (RFC 9112 Section 6.2)。
fn resolve_declared_length(request: &Request) -> Result<Option<u64>, EncodeError> {
    let header_len = match request.get_header("Content-Length") {
        Some(value) => Some(value.trim().parse::<u64>().map_err(|_| {
            EncodeError::InvalidHeader(format!("invalid Content-Length: {}", value))
        })?),
        None => None,
    };

    if request.has_header("Transfer-Encoding")
        && (header_len.is_some() || request.content_length.is_some())
    {
        return Err(EncodeError::ConflictingTransferEncodingAndContentLength);
    }

    match (request.content_length, header_len) {
        (Some(field), Some(header)) if field != header => {
            Err(EncodeError::ContentLengthMismatch {
                declared: field,
                actual: header,
            })
        }
        (Some(field), _) => Ok(Some(field)),
        (None, header) => Ok(header),
    }
}

/// リクエストヘッドをエンコード
///
/// リクエストライン、ユーザーヘッダー、フレーミングヘッダー、
/// 終端の空行までを出力する。Content-Length / Transfer-Encoding は
/// `framing` から出力するため、ユーザーヘッダー側の同名ヘッダーは除外する。
pub fn encode_head(request: &Request, framing: &Framing) -> Result<Vec<u8>, EncodeError> {
    if !is_valid_method(&request.method) {
        return Err(EncodeError::InvalidMethod(request.method.clone()));
    }
    if !is_valid_target(&request.target) {
        return Err(EncodeError::InvalidTarget(request.target.clone()));
    }

    let mut buf = Vec::new();

    // Request line: METHOD SP target SP VERSION CRLF
    buf.extend_from_slice(request.method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(request.target.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(request.version.as_bytes());
    buf.extend_from_slice(b"\r\n");

    // Headers (フレーミング関連は除外)
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
        {
            continue;
        }
        if !is_valid_header_name(name) {
            return Err(EncodeError::InvalidHeader(format!(
                "invalid header name: {}",
                name
            )));
        }
        if !is_valid_field_value(value) {
            return Err(EncodeError::InvalidHeader(format!(
                "invalid header value for {}",
                name
            )));
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Framing header
    match framing {
        Framing::None => {}
        Framing::ContentLength(len) => {
            buf.extend_from_slice(b"Content-Length: ");
            buf.extend_from_slice(len.to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Framing::Chunked => {
            buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }

    // End of headers
    buf.extend_from_slice(b"\r\n");

    Ok(buf)
}

/// Chunked Transfer Encoding 用のチャンクをエンコード
///
/// データを HTTP chunked 形式にエンコードします。
/// 空のデータを渡すと終端チャンク (0\r\n\r\n) を生成します。
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();

    if data.is_empty() {
        // 終端チャンク
        buf.extend_from_slice(b"0\r\n\r\n");
    } else {
        // チャンクサイズ (16進数)
        buf.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        // チャンクデータ
        buf.extend_from_slice(data);
        // CRLF
        buf.extend_from_slice(b"\r\n");
    }

    buf
}

/// 書き込んだボディ長と宣言長の一致を検証するトラッカー
///
/// ソケットに渡したボディのバイト数を数え、宣言された Content-Length との
/// 整合性を強制する。超過は即座に、不足は `finish()` で検出される。
#[derive(Debug)]
pub struct BodyWriteTracker {
    declared: Option<u64>,
    written: u64,
}

impl BodyWriteTracker {
    /// 新しいトラッカーを作成
    pub fn new(declared: Option<u64>) -> Self {
        Self {
            declared,
            written: 0,
        }
    }

    /// 書き込んだバイト数を取得
    pub fn written(&self) -> u64 {
        self.written
    }

    /// ボディの書き込みを記録
    ///
    /// 宣言長を超えた時点でエラーを返す。
    pub fn record(&mut self, len: u64) -> Result<(), EncodeError> {
        self.written += len;
        if let Some(declared) = self.declared {
            if self.written > declared {
                return Err(EncodeError::ContentLengthMismatch {
                    declared,
                    actual: self.written,
                });
            }
        }
        Ok(())
    }

    /// ボディ書き込みの完了を検証
    ///
    /// 宣言長に満たない場合はエラーを返す。
    pub fn finish(&self) -> Result<u64, EncodeError> {
        if let Some(declared) = self.declared {
            if self.written != declared {
                return Err(EncodeError::ContentLengthMismatch {
                    declared,
                    actual: self.written,
                });
            }
        }
        Ok(self.written)
    }
}

/// リクエストターゲットが有効か確認
///
/// RFC 9112 Section 3: request-target には制御文字と空白を含めない。
fn is_valid_target(target: &str) -> bool {
    !target.is_empty() && target.bytes().all(|b| b > 0x20 && b != 0x7F)
}

/// ヘッダー名が有効か確認
fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(is_token_char)
}

/// トークン文字か確認
fn is_token_char(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'0'..=b'9' | b'A'..=b'Z' | b'^' | b'_' | b'`' | b'a'..=b'z' | b'|' | b'~'
    )
}

/// ヘッダー値に許可される文字か確認 (RFC 9110 Section 5.5)
fn is_valid_field_value(value: &str) -> bool {
    value
        .bytes()
        .all(|b| matches!(b, 0x09 | 0x20..=0x7E | 0x80..=0xFF))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_buffer_body() {
        let request = Request::new("POST", "/upload");
        assert_eq!(
            plan_framing(&request, Some(5)).unwrap(),
            Framing::ContentLength(5)
        );
    }

    #[test]
    fn framing_stream_body_without_length() {
        let request = Request::new("POST", "/upload");
        assert_eq!(plan_framing(&request, None).unwrap(), Framing::Chunked);
    }

    #[test]
    fn framing_stream_body_with_declared_length() {
        let request = Request::new("POST", "/upload").content_length(100);
        assert_eq!(
            plan_framing(&request, None).unwrap(),
            Framing::ContentLength(100)
        );
    }

    #[test]
    fn framing_declared_length_mismatch() {
        let request = Request::new("POST", "/upload").content_length(10);
        assert_eq!(
            plan_framing(&request, Some(5)),
            Err(EncodeError::ContentLengthMismatch {
                declared: 10,
                actual: 5
            })
        );
    }

    #[test]
    fn framing_empty_body_for_get() {
        let request = Request::new("GET", "/");
        assert_eq!(plan_framing(&request, Some(0)).unwrap(), Framing::None);
    }

    #[test]
    fn framing_empty_body_with_positive_declared_length() {
        let request = Request::new("POST", "/").content_length(3);
        assert_eq!(
            plan_framing(&request, Some(0)),
            Err(EncodeError::ContentLengthMismatch {
                declared: 3,
                actual: 0
            })
        );
    }

    #[test]
    fn framing_conflicting_headers() {
        let request = Request::new("POST", "/")
            .header("Transfer-Encoding", "chunked")
            .header("Content-Length", "5");
        assert_eq!(
            plan_framing(&request, Some(5)),
            Err(EncodeError::ConflictingTransferEncodingAndContentLength)
        );
    }

    #[test]
    fn encode_head_content_length() {
        let request = Request::new("POST", "/api").header("Host", "example.com");
        let head = encode_head(&request, &Framing::ContentLength(5)).unwrap();
        assert_eq!(
            head,
            b"POST /api HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\n"
        );
    }

    #[test]
    fn encode_head_chunked() {
        let request = Request::new("POST", "/api").header("Host", "example.com");
        let head = encode_head(&request, &Framing::Chunked).unwrap();
        assert_eq!(
            head,
            b"POST /api HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\n"
        );
    }

    #[test]
    fn encode_head_skips_user_framing_headers() {
        let request = Request::new("POST", "/api")
            .header("Host", "example.com")
            .header("Content-Length", "5");
        let head = encode_head(&request, &Framing::ContentLength(5)).unwrap();
        let text = String::from_utf8(head).unwrap();
        assert_eq!(text.matches("Content-Length").count(), 1);
    }

    #[test]
    fn encode_head_rejects_invalid_input() {
        assert!(encode_head(&Request::new("get", "/"), &Framing::None).is_err());
        assert!(encode_head(&Request::new("GET", "/a b"), &Framing::None).is_err());
        let bad_header = Request::new("GET", "/").header("X-Test", "a\r\nb");
        assert!(encode_head(&bad_header, &Framing::None).is_err());
    }

    #[test]
    fn chunk_encoding() {
        assert_eq!(encode_chunk(b"hello"), b"5\r\nhello\r\n");
        assert_eq!(encode_chunk(&[0u8; 16]), [b"10\r\n".as_ref(), &[0u8; 16], b"\r\n"].concat());
        assert_eq!(encode_chunk(b""), b"0\r\n\r\n");
    }

    #[test]
    fn tracker_detects_overflow_and_shortfall() {
        let mut tracker = BodyWriteTracker::new(Some(5));
        tracker.record(3).unwrap();
        assert!(tracker.finish().is_err());
        tracker.record(2).unwrap();
        assert_eq!(tracker.finish().unwrap(), 5);
        assert!(tracker.record(1).is_err());
    }

    #[test]
    fn tracker_without_declared_length() {
        let mut tracker = BodyWriteTracker::new(None);
        tracker.record(10).unwrap();
        assert_eq!(tracker.finish().unwrap(), 10);
    }
}
