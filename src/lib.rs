//! # shiguredo_h1conn
//!
//! 依存なしの HTTP/1.1 クライアント接続プロトコルライブラリ (Sans I/O)
//!
//! ## 特徴
//!
//! - **依存なし**: 標準ライブラリのみ使用
//! - **Sans I/O**: I/O を完全に分離した設計
//! - **接続エンジン向け**: 単一接続上のリクエスト多重化 (キープアライブ、
//!   パイプライン) に必要な部品を提供
//!
//! ## 構成
//!
//! - [`Request`]: エンジンに投入するリクエスト記述子
//! - [`encoder`]: リクエストヘッドと chunked フレーミングのエンコード
//! - [`ResponseDecoder`]: インクリメンタルなレスポンスデコード
//!   (中間 1xx、トンネル、close-delimited 対応)
//! - [`Queue`]: 書き込み済みカーソル方式のリクエストキュー
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_h1conn::{
//!     DecodedHead, Request, ResponseDecoder, encoder::{Framing, encode_head, plan_framing},
//! };
//!
//! // リクエストをエンコード
//! let request = Request::new("GET", "/").header("Host", "example.com");
//! let framing = plan_framing(&request, Some(0)).unwrap();
//! assert_eq!(framing, Framing::None);
//! let bytes = encode_head(&request, &framing).unwrap();
//! // bytes を送信...
//!
//! // レスポンスをデコード
//! let mut decoder = ResponseDecoder::new();
//! decoder.feed(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
//! let Some(DecodedHead::Final { head, .. }) = decoder.decode_headers().unwrap() else {
//!     panic!("need more data");
//! };
//! assert_eq!(head.status_code, 204);
//! ```
//!
//! 実際のソケット I/O とタイマーを組み合わせた接続エンジンは
//! `tokio_h1conn` クレートが提供する。

mod decoder;
pub mod encoder;
mod error;
mod limits;
mod queue;
mod request;

pub use decoder::{BodyKind, BodyProgress, DecodedHead, ResponseDecoder, ResponseHead};
pub use encoder::{BodyWriteTracker, Framing, encode_chunk, encode_head, plan_framing};
pub use error::{EncodeError, Error};
pub use limits::DecoderLimits;
pub use queue::Queue;
pub use request::Request;
