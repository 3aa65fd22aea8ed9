//! ボディデコーダーの定義

use crate::error::Error;
use crate::limits::DecoderLimits;

use super::phase::DecodePhase;

/// ボディの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Content-Length で指定された固定長
    ContentLength(usize),
    /// Transfer-Encoding: chunked
    Chunked,
    /// 接続が閉じるまでがボディ (close-delimited)
    ///
    /// RFC 9112: レスポンスで Transfer-Encoding も Content-Length もない場合、
    /// 接続が閉じられるまでをボディとして扱う
    CloseDelimited,
    /// ボディなし
    None,
    /// トンネルモード (101 / CONNECT 2xx レスポンス用)
    ///
    /// RFC 9112 Section 6.3: CONNECT メソッドへの 2xx レスポンスと
    /// 101 Switching Protocols はトンネルに切り替わり、
    /// Transfer-Encoding と Content-Length は無視される
    Tunnel,
}

/// ボディデコードの進捗
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyProgress {
    /// まだデータがある（続きを読む）
    Continue,
    /// 完了（トレーラーがある場合は含む）
    Complete { trailers: Vec<(String, String)> },
}

/// ボディデコーダー (内部用)
#[derive(Debug)]
pub(crate) struct BodyDecoder {
    /// トレーラーヘッダー
    trailers: Vec<(String, String)>,
    /// ボディ内での消費済みバイト数
    body_consumed: usize,
    /// トレーラー数
    trailer_count: usize,
}

impl Default for BodyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyDecoder {
    /// 新しいボディデコーダーを作成
    pub fn new() -> Self {
        Self {
            trailers: Vec::new(),
            body_consumed: 0,
            trailer_count: 0,
        }
    }

    /// リセット
    pub fn reset(&mut self) {
        self.trailers.clear();
        self.body_consumed = 0;
        self.trailer_count = 0;
    }

    /// 利用可能なボディデータを覗く（ゼロコピー）
    pub fn peek_body<'a>(&self, buf: &'a [u8], phase: &DecodePhase) -> Option<&'a [u8]> {
        match phase {
            DecodePhase::BodyContentLength { remaining }
            | DecodePhase::BodyChunkedData { remaining } => {
                let available = buf.len().min(*remaining);
                if available > 0 {
                    Some(&buf[..available])
                } else {
                    None
                }
            }
            DecodePhase::BodyCloseDelimited => {
                if buf.is_empty() {
                    None
                } else {
                    Some(buf)
                }
            }
            _ => None,
        }
    }

    /// ボディデータを消費
    pub fn consume_body(
        &mut self,
        buf: &mut Vec<u8>,
        phase: &mut DecodePhase,
        len: usize,
        limits: &DecoderLimits,
    ) -> Result<BodyProgress, Error> {
        match phase {
            DecodePhase::BodyContentLength { remaining } => {
                drain_body(buf, remaining, len)?;
                self.record_consumed(len, limits)?;

                if *remaining == 0 {
                    *phase = DecodePhase::Complete;
                    return Ok(BodyProgress::Complete {
                        trailers: Vec::new(),
                    });
                }
                Ok(BodyProgress::Continue)
            }
            DecodePhase::BodyChunkedSize => {
                self.process_chunked_size(buf, phase, limits)?;

                match phase {
                    DecodePhase::Complete => Ok(BodyProgress::Complete {
                        trailers: std::mem::take(&mut self.trailers),
                    }),
                    _ => Ok(BodyProgress::Continue),
                }
            }
            DecodePhase::BodyChunkedData { remaining } => {
                drain_body(buf, remaining, len)?;
                self.record_consumed(len, limits)?;

                if *remaining == 0 {
                    // チャンクデータの直後は CRLF。既に届いていれば即座に処理する
                    *phase = DecodePhase::BodyChunkedDataCrlf;
                    finish_chunk_data(buf, phase)?;
                }
                Ok(BodyProgress::Continue)
            }
            DecodePhase::BodyChunkedDataCrlf => {
                finish_chunk_data(buf, phase)?;
                Ok(BodyProgress::Continue)
            }
            DecodePhase::ChunkedTrailer => {
                self.process_trailers(buf, phase, limits)?;

                match phase {
                    DecodePhase::Complete => Ok(BodyProgress::Complete {
                        trailers: std::mem::take(&mut self.trailers),
                    }),
                    _ => Ok(BodyProgress::Continue),
                }
            }
            DecodePhase::BodyCloseDelimited => {
                // close-delimited はバッファにあるデータをすべて消費できる。
                // Complete への遷移は mark_eof() が行う
                if len > buf.len() {
                    return Err(Error::InvalidData(
                        "consume_body: len exceeds available body".to_string(),
                    ));
                }
                let total = self.body_consumed.checked_add(len).unwrap_or(usize::MAX);
                if total > limits.max_body_size {
                    return Err(Error::BodyTooLarge {
                        size: total,
                        limit: limits.max_body_size,
                    });
                }

                buf.drain(..len);
                self.body_consumed = total;
                Ok(BodyProgress::Continue)
            }
            DecodePhase::Complete => Ok(BodyProgress::Complete {
                trailers: std::mem::take(&mut self.trailers),
            }),
            DecodePhase::StartLine | DecodePhase::Headers => Err(Error::InvalidData(
                "consume_body called before decode_headers".to_string(),
            )),
            DecodePhase::Tunnel => Err(Error::InvalidData(
                "consume_body cannot be used in tunnel mode, use take_remaining instead"
                    .to_string(),
            )),
        }
    }

    fn record_consumed(&mut self, len: usize, limits: &DecoderLimits) -> Result<(), Error> {
        self.body_consumed =
            self.body_consumed
                .checked_add(len)
                .ok_or(Error::BodyTooLarge {
                    size: usize::MAX,
                    limit: limits.max_body_size,
                })?;
        Ok(())
    }

    /// chunked のチャンクサイズ行を処理
    fn process_chunked_size(
        &mut self,
        buf: &mut Vec<u8>,
        phase: &mut DecodePhase,
        limits: &DecoderLimits,
    ) -> Result<(), Error> {
        if !matches!(phase, DecodePhase::BodyChunkedSize) {
            return Ok(());
        }
        let Some(pos) = find_line(buf) else {
            return Ok(());
        };
        if pos > limits.max_chunk_line_size {
            return Err(Error::ChunkLineTooLong {
                size: pos,
                limit: limits.max_chunk_line_size,
            });
        }

        let line = String::from_utf8(buf[..pos].to_vec())
            .map_err(|e| Error::InvalidData(format!("invalid UTF-8: {e}")))?;
        buf.drain(..pos + 2);

        // チャンク拡張 (";" 以降) は読み飛ばす
        let size_str = line.split(';').next().unwrap_or(&line).trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::InvalidData(format!("invalid chunk size: {}", size_str)))?;

        if chunk_size == 0 {
            // 終端チャンク。続きはトレーラーと空行
            *phase = DecodePhase::ChunkedTrailer;
            return self.process_trailers(buf, phase, limits);
        }

        // このチャンクを足すと上限を超えるなら、データを読む前に拒否する
        let projected = self
            .body_consumed
            .checked_add(chunk_size)
            .unwrap_or(usize::MAX);
        if projected > limits.max_body_size {
            return Err(Error::BodyTooLarge {
                size: projected,
                limit: limits.max_body_size,
            });
        }
        *phase = DecodePhase::BodyChunkedData {
            remaining: chunk_size,
        };
        Ok(())
    }

    /// トレーラーヘッダーを処理
    fn process_trailers(
        &mut self,
        buf: &mut Vec<u8>,
        phase: &mut DecodePhase,
        limits: &DecoderLimits,
    ) -> Result<(), Error> {
        while matches!(phase, DecodePhase::ChunkedTrailer) {
            let Some(pos) = find_line(buf) else {
                return Ok(());
            };
            if pos == 0 {
                // 空行でメッセージ終端
                buf.drain(..2);
                *phase = DecodePhase::Complete;
                return Ok(());
            }
            if pos > limits.max_header_line_size {
                return Err(Error::HeaderLineTooLong {
                    size: pos,
                    limit: limits.max_header_line_size,
                });
            }
            if self.trailer_count >= limits.max_headers_count {
                return Err(Error::TooManyHeaders {
                    count: self.trailer_count + 1,
                    limit: limits.max_headers_count,
                });
            }

            let line = String::from_utf8(buf[..pos].to_vec())
                .map_err(|e| Error::InvalidData(format!("invalid UTF-8: {e}")))?;
            buf.drain(..pos + 2);

            // 不正なトレーラー行はエラーにする
            let (name, value) = parse_header_line(&line)?;
            self.trailers.push((name, value));
            self.trailer_count += 1;
        }
        Ok(())
    }
}

/// チャンクデータ末尾の CRLF を取り除き、次のサイズ行へ遷移する
///
/// CRLF がまだ届いていなければ何もしない (CRLF 待ちフェーズのまま)
fn finish_chunk_data(buf: &mut Vec<u8>, phase: &mut DecodePhase) -> Result<(), Error> {
    if buf.len() < 2 {
        return Ok(());
    }
    if buf[..2] != *b"\r\n" {
        return Err(Error::InvalidData(
            "invalid chunked encoding: expected CRLF after chunk data".to_string(),
        ));
    }
    buf.drain(..2);
    *phase = DecodePhase::BodyChunkedSize;
    Ok(())
}

/// 消費対象の長さを検証してバッファから取り除く
fn drain_body(buf: &mut Vec<u8>, remaining: &mut usize, len: usize) -> Result<(), Error> {
    if len > *remaining || len > buf.len() {
        return Err(Error::InvalidData(
            "consume_body: len exceeds available body".to_string(),
        ));
    }
    buf.drain(..len);
    *remaining -= len;
    Ok(())
}

/// CRLF で終わる行を探す
pub(crate) fn find_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// ヘッダー行をパース
///
/// 名前はトークン文字のみ (空白が混ざる行は不正)、値は制御文字を
/// 含まないこと (RFC 9110 Section 5.5)。obs-fold は受け付けない。
pub(crate) fn parse_header_line(line: &str) -> Result<(String, String), Error> {
    if line.starts_with(' ') || line.starts_with('\t') {
        return Err(Error::InvalidData(
            "invalid header line: obs-fold".to_string(),
        ));
    }

    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| Error::InvalidData("invalid header line: missing colon".to_string()))?;
    // トークン文字の検査が空白・制御文字・空の名前もまとめて弾く
    if !is_valid_header_name(name) {
        return Err(Error::InvalidData(
            "invalid header line: invalid name".to_string(),
        ));
    }
    let value = value.trim();
    if !is_valid_field_value(value) {
        return Err(Error::InvalidData(
            "invalid header line: invalid value".to_string(),
        ));
    }

    Ok((name.to_string(), value.to_string()))
}

/// ヘッダー名が有効か確認
pub(crate) fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(is_token_char)
}

/// トークン文字か確認
pub(crate) fn is_token_char(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'0'..=b'9' | b'A'..=b'Z' | b'^' | b'_' | b'`' | b'a'..=b'z' | b'|' | b'~'
    )
}

/// ヘッダー値に許可される文字か確認 (RFC 9110 Section 5.5)
///
/// field-vchar = VCHAR / obs-text、SP と HTAB も field-content の一部として許可
pub(crate) fn is_valid_field_value(value: &str) -> bool {
    value
        .bytes()
        .all(|b| matches!(b, 0x09 | 0x20..=0x7E | 0x80..=0xFF))
}

/// Transfer-Encoding ヘッダーを解析
///
/// RFC 9112: chunked は一度だけ指定可能で、最後のエンコーディングでなければならない
/// 複数の Transfer-Encoding ヘッダーは連結して単一のリストとして扱う
pub(crate) fn parse_transfer_encoding_chunked(headers: &[(String, String)]) -> Result<bool, Error> {
    let mut chunked = false;

    let values = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("Transfer-Encoding"))
        .map(|(_, value)| value);
    for value in values {
        for token in value.split(',') {
            let token = token.trim();
            if token.is_empty() {
                return Err(Error::InvalidData(
                    "invalid Transfer-Encoding: empty token".to_string(),
                ));
            }
            if !token.eq_ignore_ascii_case("chunked") {
                // chunked 以外の転送エンコーディングは扱わない
                return Err(Error::InvalidData(
                    "invalid Transfer-Encoding: unsupported coding".to_string(),
                ));
            }
            if chunked {
                return Err(Error::InvalidData(
                    "invalid Transfer-Encoding: duplicate chunked".to_string(),
                ));
            }
            chunked = true;
        }
    }

    Ok(chunked)
}

/// Content-Length ヘッダーを解析
pub(crate) fn parse_content_length(headers: &[(String, String)]) -> Result<Option<usize>, Error> {
    let mut result: Option<usize> = None;
    for (name, raw) in headers {
        if !name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let parsed = parse_content_length_value(raw)?;
        // 重複は同じ値なら許容する
        match result {
            Some(prev) if prev != parsed => {
                return Err(Error::InvalidData(
                    "invalid Content-Length: mismatched values".to_string(),
                ));
            }
            _ => result = Some(parsed),
        }
    }
    Ok(result)
}

/// Content-Length 値をパース
fn parse_content_length_value(input: &str) -> Result<usize, Error> {
    let input = input.trim();
    if input.is_empty() || !input.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidData(
            "invalid Content-Length: not a number".to_string(),
        ));
    }
    input
        .parse::<usize>()
        .map_err(|_| Error::InvalidData("invalid Content-Length: overflow".to_string()))
}

/// ボディ関連ヘッダーを解決
pub(crate) fn resolve_body_headers(
    headers: &[(String, String)],
) -> Result<(bool, Option<usize>), Error> {
    let transfer_encoding_chunked = parse_transfer_encoding_chunked(headers)?;
    let content_length = parse_content_length(headers)?;

    if transfer_encoding_chunked && content_length.is_some() {
        return Err(Error::InvalidData(
            "invalid message: both Transfer-Encoding and Content-Length".to_string(),
        ));
    }

    Ok((transfer_encoding_chunked, content_length))
}
