//! アップグレード後のストリーム

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::connector::ConnStream;

/// プロトコル切り替え後のストリーム
///
/// 101 / CONNECT 2xx の成立時に `Handler::on_upgrade` へ引き渡される。
/// レスポンスヘッダーと同時に受信済みだったバイト列 (prelude) を
/// 先に読み出してから、ソケット本体の読み取りに切り替わる。
/// 書き込みは最初からソケットへ素通しされる。
#[derive(Debug)]
pub struct UpgradedStream {
    stream: ConnStream,
    prelude: Vec<u8>,
    prelude_pos: usize,
}

impl UpgradedStream {
    pub(crate) fn new(stream: ConnStream, prelude: Vec<u8>) -> Self {
        Self {
            stream,
            prelude,
            prelude_pos: 0,
        }
    }

    /// 未読の prelude のバイト数
    pub fn prelude_len(&self) -> usize {
        self.prelude.len() - self.prelude_pos
    }

    /// 内部のストリームと未読 prelude に分解する
    pub fn into_parts(self) -> (ConnStream, Vec<u8>) {
        let Self {
            stream,
            mut prelude,
            prelude_pos,
        } = self;
        prelude.drain(..prelude_pos);
        (stream, prelude)
    }
}

impl AsyncRead for UpgradedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.prelude_pos < this.prelude.len() {
            let available = &this.prelude[this.prelude_pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.prelude_pos += n;
            if this.prelude_pos == this.prelude.len() {
                this.prelude.clear();
                this.prelude_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for UpgradedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
