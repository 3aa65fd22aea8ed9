//! PBT テスト共通ユーティリティ

use proptest::prelude::*;

// ========================================
// トークン / ヘッダー生成 (RFC 9110)
// ========================================

/// トークン文字
pub fn token_char() -> impl Strategy<Value = char> {
    prop_oneof![
        prop::char::range('a', 'z'),
        prop::char::range('A', 'Z'),
        prop::char::range('0', '9'),
        Just('-'),
        Just('_'),
        Just('.'),
    ]
}

/// トークン文字列 (1..=max_len 文字)
pub fn token_string(max_len: usize) -> impl Strategy<Value = String> {
    proptest::collection::vec(token_char(), 1..=max_len)
        .prop_map(|chars| chars.into_iter().collect())
}

/// ヘッダー名
///
/// フレーミングや接続管理に影響する名前 (Content-Length,
/// Transfer-Encoding, Connection, Keep-Alive, Trailer) は
/// ラウンドトリップの意味を変えてしまうため X- 接頭辞で避ける。
pub fn header_name() -> impl Strategy<Value = String> {
    token_string(24).prop_map(|s| format!("X-{}", s))
}

/// ヘッダー値 (CR/LF と先頭末尾の空白を含まない可視文字)
pub fn header_value() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 !#-+./:;=?@-]{0,64}".prop_map(|s| s.trim().to_string())
}

/// ヘッダーのリスト
pub fn headers() -> impl Strategy<Value = Vec<(String, String)>> {
    proptest::collection::vec((header_name(), header_value()), 0..8)
}

// ========================================
// レスポンス生成
// ========================================

/// ボディを持ち得る最終ステータスコード
pub fn final_status_code() -> impl Strategy<Value = u16> {
    prop_oneof![
        200u16..=203,
        205u16..=206,
        300u16..=303,
        305u16..=308,
        400u16..=451,
        500u16..=511,
    ]
}

/// Reason phrase
pub fn reason_phrase() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("OK".to_string()),
        Just("Not Found".to_string()),
        "[A-Za-z ]{1,24}".prop_map(|s| s.trim().to_string()),
    ]
}

/// レスポンスボディ
pub fn body(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..max_len)
}

/// chunked ボディのチャンク列 (空チャンクは終端と紛らわしいので除外)
pub fn chunks() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 1..128),
        0..8,
    )
}

// ========================================
// リクエスト生成
// ========================================

/// HTTP メソッド
pub fn http_method() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("GET".to_string()),
        Just("POST".to_string()),
        Just("PUT".to_string()),
        Just("DELETE".to_string()),
        Just("HEAD".to_string()),
        Just("OPTIONS".to_string()),
        Just("PATCH".to_string()),
    ]
}

/// リクエストターゲット (origin-form)
pub fn request_target() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("/".to_string()),
        "/[a-zA-Z0-9/_.-]{1,48}".prop_map(|s| s),
    ]
}
