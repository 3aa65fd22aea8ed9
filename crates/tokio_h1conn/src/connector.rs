//! 接続の確立 (TCP / TLS)

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// OS のルート証明書ストアを使用するデフォルトの TLS 設定を作成
fn default_tls_config() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(rustls_platform_verifier::Verifier::new()))
            .with_no_client_auth(),
    )
}

/// 接続先
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// ホスト名
    pub host: String,
    /// ポート番号
    pub port: u16,
    /// TLS を使用するかどうか
    pub tls: bool,
}

impl Origin {
    /// HTTP の接続先を作成
    pub fn http(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            tls: false,
        }
    }

    /// HTTPS の接続先を作成
    pub fn https(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            tls: true,
        }
    }

    /// Host ヘッダー用の値を取得
    pub fn host_header_value(&self) -> String {
        if self.port == 80 || self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// コネクター
///
/// 接続先に対して TCP (必要なら TLS) で接続を確立する。
/// エンジンはリクエストごとの SNI 指定に応じて `server_name` を
/// 切り替えて再接続できる。
#[derive(Clone)]
pub struct Connector {
    origin: Origin,
    connect_timeout: Duration,
    tls_config: Option<Arc<ClientConfig>>,
}

impl Connector {
    /// 新しいコネクターを作成
    pub fn new(origin: Origin, connect_timeout: Duration) -> Self {
        Self {
            origin,
            connect_timeout,
            tls_config: None,
        }
    }

    /// TLS 設定を指定 (HTTPS 用)
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// 接続先を取得
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// 接続を確立
    ///
    /// `server_name` を指定すると TLS の SNI をホスト名の代わりに使う。
    pub async fn connect(&self, server_name: Option<&str>) -> Result<ConnStream> {
        let addr = format!("{}:{}", self.origin.host, self.origin.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        stream.set_nodelay(true)?;

        if !self.origin.tls {
            return Ok(ConnStream::Plain(stream));
        }

        let tls_config = self.tls_config.clone().unwrap_or_else(default_tls_config);
        let connector = TlsConnector::from(tls_config);
        let sni = server_name.unwrap_or(&self.origin.host);
        let server_name = ServerName::try_from(sni.to_string())?;
        let tls_stream = tokio::time::timeout(
            self.connect_timeout,
            connector.connect(server_name, stream),
        )
        .await
        .map_err(|_| Error::ConnectTimeout)?
        .map_err(|e| Error::Tls(e.to_string()))?;

        Ok(ConnStream::Tls(Box::new(tls_stream)))
    }
}

/// 確立済みの接続ストリーム
pub enum ConnStream {
    /// 平文 TCP
    Plain(TcpStream),
    /// TLS
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for ConnStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnStream::Plain(_) => f.write_str("ConnStream::Plain"),
            ConnStream::Tls(_) => f.write_str("ConnStream::Tls"),
        }
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
