//! tokio 向け HTTP/1.1 クライアント接続エンジン
//!
//! [shiguredo_h1conn] のワイヤー処理 (エンコーダー / デコーダー / キュー) を
//! tokio のソケットに結び付けた、単一接続先のクライアントエンジンを提供する。
//!
//! - [`Client`]: 1 つの接続先に対して 1 本のソケットを所有するエンジンのハンドル
//! - [`Handler`]: レスポンスのライフサイクルを受け取るコールバック契約
//! - [`Dispatcher`]: リクエスト投入の抽象。リダイレクト / リトライの
//!   インターセプターで合成できる
//!
//! ## 特徴
//!
//! - キープアライブと保守的なパイプライン
//! - Content-Length / chunked / 長さ不明ストリームのリクエストボディ
//! - 101 / CONNECT によるプロトコル切り替え ([`UpgradedStream`])
//! - 消費側のフロー制御 ([`Resumer`]) とリクエスト中断 ([`AbortHandle`])
//! - ヘッダー / ボディ / アイドルの各タイムアウト
mod body;
mod client;
mod connector;
mod error;
mod handler;
mod interceptor;
mod upgraded;

pub use body::RequestBody;
pub use client::{Client, ClientOptions};
pub use connector::{ConnStream, Connector, Origin};
pub use error::{Error, Result};
pub use handler::{AbortHandle, Dispatcher, Handler, Resumer};
pub use interceptor::{RedirectDispatcher, RetryDispatcher};
pub use upgraded::UpgradedStream;

pub use shiguredo_h1conn::{DecoderLimits, Request, ResponseHead};
