//! HTTP レスポンスデコーダー

use crate::error::Error;
use crate::limits::DecoderLimits;

use super::body::{
    BodyDecoder, BodyKind, BodyProgress, find_line, parse_header_line, resolve_body_headers,
};
use super::head::ResponseHead;
use super::phase::DecodePhase;

/// `decode_headers()` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedHead {
    /// 中間レスポンス (1xx、101 を除く)
    ///
    /// デコーダーは自動的に次のスタートライン待ちに戻る。
    /// 同じリクエストの最終レスポンスが続くため、呼び出し側は
    /// 引き続き `decode_headers()` を呼ぶ。
    Informational(ResponseHead),
    /// 最終レスポンス
    Final {
        head: ResponseHead,
        body_kind: BodyKind,
    },
}

/// HTTP レスポンスデコーダー (Sans I/O)
///
/// クライアント側でサーバーからのレスポンスをパースする際に使用。
/// バイト列を `feed()` で追加し、`decode_headers()` / `peek_body()` /
/// `consume_body()` / `progress()` でインクリメンタルにデコードする。
/// キープアライブ接続では 1 つのデコーダーを連続するレスポンスに使い回す。
#[derive(Debug)]
pub struct ResponseDecoder {
    buf: Vec<u8>,
    phase: DecodePhase,
    start_line: Option<String>,
    headers: Vec<(String, String)>,
    body_decoder: BodyDecoder,
    limits: DecoderLimits,
    /// ヘッダー部の累計バイト数 (スタートライン含む、メッセージごと)
    head_size: usize,
    /// HEAD リクエストへのレスポンスかどうか
    expect_no_body: bool,
    /// CONNECT リクエストへのレスポンスかどうか
    ///
    /// 2xx レスポンスでトンネルモードに切り替わる。
    expect_tunnel: bool,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    /// 新しいデコーダーを作成
    pub fn new() -> Self {
        Self::with_limits(DecoderLimits::default())
    }

    /// 制限付きでデコーダーを作成
    pub fn with_limits(limits: DecoderLimits) -> Self {
        Self {
            buf: Vec::new(),
            phase: DecodePhase::StartLine,
            start_line: None,
            headers: Vec::new(),
            body_decoder: BodyDecoder::new(),
            limits,
            head_size: 0,
            expect_no_body: false,
            expect_tunnel: false,
        }
    }

    /// HEAD リクエストへのレスポンスとしてデコード (ボディなし)
    ///
    /// 次のレスポンスのヘッダーをデコードする前に設定する。
    pub fn set_expect_no_body(&mut self, expect_no_body: bool) {
        self.expect_no_body = expect_no_body;
    }

    /// CONNECT リクエストへのレスポンスとしてデコード
    ///
    /// 2xx レスポンスでヘッダー以降をトンネルとして扱う。
    pub fn set_expect_tunnel(&mut self, expect_tunnel: bool) {
        self.expect_tunnel = expect_tunnel;
    }

    /// 制限設定を取得
    pub fn limits(&self) -> &DecoderLimits {
        &self.limits
    }

    /// バッファにデータを追加
    pub fn feed(&mut self, data: &[u8]) -> Result<(), Error> {
        let new_size = self.buf.len() + data.len();
        if new_size > self.limits.max_buffer_size {
            return Err(Error::BufferOverflow {
                size: new_size,
                limit: self.limits.max_buffer_size,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// バッファの残りデータを取得
    pub fn remaining(&self) -> &[u8] {
        &self.buf
    }

    /// バッファの残りデータを取り出す (トンネル引き渡し用)
    ///
    /// 101 / CONNECT 2xx でトンネルモードに入った後、レスポンスヘッダーと
    /// 同時に受信済みだったバイト列をアップグレード先に引き渡すために使う。
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// トンネルモードかどうかを判定
    pub fn is_tunnel(&self) -> bool {
        matches!(self.phase, DecodePhase::Tunnel)
    }

    /// メッセージの途中でないかどうかを判定
    ///
    /// スタートライン待ちでバッファが空、または直前のメッセージが
    /// 完了済みでバッファが空の場合に true。アイドル中のソケット切断を
    /// エラーにせず扱うための判定。
    pub fn is_idle(&self) -> bool {
        self.buf.is_empty()
            && matches!(self.phase, DecodePhase::StartLine | DecodePhase::Complete)
            && self.start_line.is_none()
    }

    /// デコーダーをリセット
    pub fn reset(&mut self) {
        self.buf.clear();
        self.phase = DecodePhase::StartLine;
        self.start_line = None;
        self.headers.clear();
        self.body_decoder.reset();
        self.head_size = 0;
        self.expect_no_body = false;
        self.expect_tunnel = false;
    }

    /// 接続終了を通知
    ///
    /// close-delimited ボディの読み取り中であればボディが確定し Complete に
    /// 遷移する。アイドル状態 (メッセージ境界) であれば何もしない。
    /// メッセージの途中 (ヘッダー未完了、固定長/チャンクボディ未完了) で
    /// あれば `UnexpectedEof` を返す。
    pub fn mark_eof(&mut self) -> Result<(), Error> {
        match self.phase {
            DecodePhase::BodyCloseDelimited => {
                self.phase = DecodePhase::Complete;
                Ok(())
            }
            DecodePhase::Tunnel => Ok(()),
            DecodePhase::Complete => Ok(()),
            DecodePhase::StartLine if self.buf.is_empty() && self.start_line.is_none() => Ok(()),
            _ => Err(Error::UnexpectedEof),
        }
    }

    /// close-delimited ボディを読み取り中かどうかを判定
    pub fn is_close_delimited(&self) -> bool {
        matches!(self.phase, DecodePhase::BodyCloseDelimited)
    }

    /// ステータスコードからボディがあるかどうかを判定
    fn status_has_body(status_code: u16) -> bool {
        // 1xx, 204, 304 はボディなし
        !((100..200).contains(&status_code) || status_code == 204 || status_code == 304)
    }

    /// ボディモードを決定
    ///
    /// RFC 9112 Section 6.3 の優先順位に従う:
    /// 1. 101 と CONNECT への 2xx はトンネル
    /// 2. HEAD レスポンス、1xx/204/304 はボディなし
    /// 3. Transfer-Encoding がある場合は chunked
    /// 4. Content-Length がある場合は固定長
    /// 5. それ以外は close-delimited (接続が閉じるまでがボディ)
    fn determine_body_kind(
        &self,
        status_code: u16,
        headers: &[(String, String)],
    ) -> Result<BodyKind, Error> {
        if status_code == 101 || (self.expect_tunnel && (200..300).contains(&status_code)) {
            return Ok(BodyKind::Tunnel);
        }

        let (transfer_encoding_chunked, content_length) = resolve_body_headers(headers)?;

        if self.expect_no_body || !Self::status_has_body(status_code) {
            return Ok(BodyKind::None);
        }

        if transfer_encoding_chunked {
            return Ok(BodyKind::Chunked);
        }

        if let Some(len) = content_length {
            if len > self.limits.max_body_size {
                return Err(Error::BodyTooLarge {
                    size: len,
                    limit: self.limits.max_body_size,
                });
            }
            return Ok(BodyKind::ContentLength(len));
        }

        Ok(BodyKind::CloseDelimited)
    }

    /// ヘッダー部の累計サイズを加算してチェック
    fn record_head_bytes(&mut self, len: usize) -> Result<(), Error> {
        self.head_size += len;
        if self.head_size > self.limits.max_headers_size {
            return Err(Error::HeadersTooLarge {
                size: self.head_size,
                limit: self.limits.max_headers_size,
            });
        }
        Ok(())
    }

    /// ヘッダーをデコード
    ///
    /// ヘッダーが完了したら `Some(DecodedHead)` を返す。
    /// 中間レスポンス (1xx、101 を除く) の場合は
    /// `DecodedHead::Informational` を返し、自動的に次の
    /// スタートライン待ちに戻るので、続けて呼び出せば
    /// 最終レスポンスのヘッダーが得られる。
    /// データ不足の場合は `None` を返す。
    pub fn decode_headers(&mut self) -> Result<Option<DecodedHead>, Error> {
        loop {
            match &self.phase {
                DecodePhase::StartLine => {
                    if let Some(pos) = find_line(&self.buf) {
                        self.record_head_bytes(pos + 2)?;

                        let line = String::from_utf8(self.buf[..pos].to_vec())
                            .map_err(|e| Error::InvalidData(format!("invalid UTF-8: {e}")))?;
                        self.buf.drain(..pos + 2);

                        // VERSION SP STATUS-CODE SP REASON-PHRASE CRLF
                        let parts: Vec<&str> = line.splitn(3, ' ').collect();
                        if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
                            return Err(Error::InvalidData(format!(
                                "invalid status line: {}",
                                line
                            )));
                        }

                        self.start_line = Some(line);
                        self.phase = DecodePhase::Headers;
                    } else {
                        // CRLF 未受信でもヘッダー部の上限は適用する
                        if self.head_size + self.buf.len() > self.limits.max_headers_size {
                            return Err(Error::HeadersTooLarge {
                                size: self.head_size + self.buf.len(),
                                limit: self.limits.max_headers_size,
                            });
                        }
                        return Ok(None);
                    }
                }
                DecodePhase::Headers => {
                    if let Some(pos) = find_line(&self.buf) {
                        if pos == 0 {
                            // 空行 = ヘッダー終了
                            self.record_head_bytes(2)?;
                            self.buf.drain(..2);
                            return self.finish_head().map(Some);
                        } else {
                            if pos > self.limits.max_header_line_size {
                                return Err(Error::HeaderLineTooLong {
                                    size: pos,
                                    limit: self.limits.max_header_line_size,
                                });
                            }
                            if self.headers.len() >= self.limits.max_headers_count {
                                return Err(Error::TooManyHeaders {
                                    count: self.headers.len() + 1,
                                    limit: self.limits.max_headers_count,
                                });
                            }
                            self.record_head_bytes(pos + 2)?;

                            let line = String::from_utf8(self.buf[..pos].to_vec())
                                .map_err(|e| Error::InvalidData(format!("invalid UTF-8: {e}")))?;
                            self.buf.drain(..pos + 2);

                            let (name, value) = parse_header_line(&line)?;
                            self.headers.push((name, value));
                        }
                    } else {
                        if self.head_size + self.buf.len() > self.limits.max_headers_size {
                            return Err(Error::HeadersTooLarge {
                                size: self.head_size + self.buf.len(),
                                limit: self.limits.max_headers_size,
                            });
                        }
                        return Ok(None);
                    }
                }
                DecodePhase::Complete => {
                    // 完了状態から次のメッセージへ遷移
                    self.phase = DecodePhase::StartLine;
                    self.start_line = None;
                    self.headers.clear();
                    self.body_decoder.reset();
                    self.head_size = 0;
                    self.expect_no_body = false;
                    self.expect_tunnel = false;
                    continue;
                }
                DecodePhase::Tunnel => {
                    return Err(Error::InvalidData(
                        "decode_headers called in tunnel mode".to_string(),
                    ));
                }
                _ => {
                    return Err(Error::InvalidData(
                        "decode_headers called during body decoding".to_string(),
                    ));
                }
            }
        }
    }

    /// ヘッダー終了時の処理
    fn finish_head(&mut self) -> Result<DecodedHead, Error> {
        let start_line = self
            .start_line
            .take()
            .ok_or_else(|| Error::InvalidData("missing status line".to_string()))?;
        let parts: Vec<&str> = start_line.splitn(3, ' ').collect();
        let status_code: u16 = parts[1]
            .parse()
            .map_err(|_| Error::InvalidData(format!("invalid status code: {}", parts[1])))?;
        if !(100..=599).contains(&status_code) {
            return Err(Error::InvalidData(format!(
                "invalid status code: {}",
                status_code
            )));
        }

        let head = ResponseHead {
            version: parts[0].to_string(),
            status_code,
            reason_phrase: parts.get(2).unwrap_or(&"").to_string(),
            headers: std::mem::take(&mut self.headers),
        };

        // 中間レスポンス: 101 以外の 1xx は読み飛ばして次のヘッダーへ
        if head.is_informational() && status_code != 101 {
            self.phase = DecodePhase::StartLine;
            self.head_size = 0;
            return Ok(DecodedHead::Informational(head));
        }

        // ヘッダーは head に移動済みなので head 側から参照する
        let body_kind = self.determine_body_kind(status_code, &head.headers)?;
        match body_kind {
            BodyKind::ContentLength(len) => {
                if len > 0 {
                    self.phase = DecodePhase::BodyContentLength { remaining: len };
                } else {
                    self.phase = DecodePhase::Complete;
                }
            }
            BodyKind::Chunked => {
                self.phase = DecodePhase::BodyChunkedSize;
            }
            BodyKind::CloseDelimited => {
                self.phase = DecodePhase::BodyCloseDelimited;
            }
            BodyKind::None => {
                self.phase = DecodePhase::Complete;
            }
            BodyKind::Tunnel => {
                self.phase = DecodePhase::Tunnel;
            }
        }

        Ok(DecodedHead::Final { head, body_kind })
    }

    /// 利用可能なボディデータを覗く（ゼロコピー）
    ///
    /// `decode_headers()` 成功後に呼ぶ。
    /// データがある場合はスライスを返す。
    /// ボディがない場合や完了済みの場合は `None` を返す。
    pub fn peek_body(&self) -> Option<&[u8]> {
        self.body_decoder.peek_body(&self.buf, &self.phase)
    }

    /// ボディデータを消費
    ///
    /// `peek_body()` で取得したデータを処理した後に呼ぶ。
    /// `len` は消費するバイト数 (1 以上)。
    pub fn consume_body(&mut self, len: usize) -> Result<BodyProgress, Error> {
        if len == 0 {
            return Err(Error::InvalidData(
                "consume_body(0) is not allowed, use progress() instead".to_string(),
            ));
        }
        self.body_decoder
            .consume_body(&mut self.buf, &mut self.phase, len, &self.limits)
    }

    /// 状態機械を進める (ボディデータは消費しない)
    ///
    /// Chunked エンコーディングの場合、チャンクサイズ行のパースや
    /// 終端チャンクの処理を行う。
    pub fn progress(&mut self) -> Result<BodyProgress, Error> {
        self.body_decoder
            .consume_body(&mut self.buf, &mut self.phase, 0, &self.limits)
    }
}
