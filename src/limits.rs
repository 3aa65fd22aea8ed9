/// レスポンスデコーダーの制限設定
///
/// 悪意ある、あるいは壊れたサーバーからの応答でメモリを使い果たさない
/// ための上限。いずれかを超えるとデコードはエラーになり、接続エンジンは
/// そのソケットを破棄する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderLimits {
    /// 受信バッファの最大サイズ (デフォルト: 64KB)
    pub max_buffer_size: usize,
    /// ヘッダー数の上限。トレーラーにも同じ値を適用する (デフォルト: 100)
    pub max_headers_count: usize,
    /// ヘッダー 1 行の最大長 (デフォルト: 8KB)
    pub max_header_line_size: usize,
    /// ヘッダー部の累計最大バイト数 (デフォルト: 16KB)
    ///
    /// スタートラインとすべてのヘッダー行 (CRLF 含む) の合計サイズ。
    /// 個々の行が短くても、合計がこの上限を超えた時点でエラーになる。
    pub max_headers_size: usize,
    /// ボディの最大サイズ (デフォルト: 10MB)
    pub max_body_size: usize,
    /// chunked のチャンクサイズ行の最大長 (デフォルト: 64バイト)
    ///
    /// チャンクサイズは 16 進数なので、拡張を使わない限り 10 バイト程度で足りる。
    pub max_chunk_line_size: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_buffer_size: 64 * 1024, // 64KB
            max_headers_count: 100,
            max_header_line_size: 8 * 1024,  // 8KB
            max_headers_size: 16 * 1024,     // 16KB
            max_body_size: 10 * 1024 * 1024, // 10MB
            max_chunk_line_size: 64,         // 64 bytes
        }
    }
}

impl DecoderLimits {
    /// 制限なしの設定を作成
    pub fn unlimited() -> Self {
        Self {
            max_buffer_size: usize::MAX,
            max_headers_count: usize::MAX,
            max_header_line_size: usize::MAX,
            max_headers_size: usize::MAX,
            max_body_size: usize::MAX,
            max_chunk_line_size: usize::MAX,
        }
    }
}
