//! HTTP/1.1 レスポンスデコーダーモジュール
//!
//! Sans I/O 設計に基づくストリーミングデコーダーを提供。
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_h1conn::{BodyKind, BodyProgress, DecodedHead, ResponseDecoder};
//!
//! let mut decoder = ResponseDecoder::new();
//!
//! // 受信データを投入
//! decoder.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").unwrap();
//!
//! // ヘッダーをデコード
//! let Some(DecodedHead::Final { head, body_kind }) = decoder.decode_headers().unwrap() else {
//!     panic!("need more data");
//! };
//! assert_eq!(head.status_code, 200);
//! assert_eq!(body_kind, BodyKind::ContentLength(5));
//!
//! // ボディをストリーミングで読み取り
//! let mut body = Vec::new();
//! loop {
//!     if let Some(data) = decoder.peek_body() {
//!         body.extend_from_slice(data);
//!         let len = data.len();
//!         if let BodyProgress::Complete { .. } = decoder.consume_body(len).unwrap() {
//!             break;
//!         }
//!     } else {
//!         // peek_body() が None でも progress() で状態遷移を試みる
//!         // Chunked の場合、チャンクサイズ行や終端チャンクのパースが進む
//!         if let BodyProgress::Complete { .. } = decoder.progress().unwrap() {
//!             break;
//!         }
//!         // Continue の場合は追加データが必要
//!         break;
//!     }
//! }
//! assert_eq!(body, b"hello");
//! ```

mod body;
mod head;
mod phase;
mod response;

// 公開 API
pub use body::{BodyKind, BodyProgress};
pub use head::ResponseHead;
pub use response::{DecodedHead, ResponseDecoder};
