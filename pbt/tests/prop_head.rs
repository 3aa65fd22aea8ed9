//! キープアライブ判定のプロパティテスト

use proptest::prelude::*;
use shiguredo_h1conn::ResponseHead;

fn version() -> impl Strategy<Value = String> {
    prop_oneof![Just("HTTP/1.1".to_string()), Just("HTTP/1.0".to_string())]
}

/// Connection ヘッダーのトークン (大文字小文字をランダムに混ぜる)
fn connection_token() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("close".to_string()),
        Just("Close".to_string()),
        Just("CLOSE".to_string()),
        Just("keep-alive".to_string()),
        Just("Keep-Alive".to_string()),
        Just("upgrade".to_string()),
        Just("x-custom".to_string()),
    ]
}

fn connection_headers() -> impl Strategy<Value = Vec<Vec<String>>> {
    proptest::collection::vec(
        proptest::collection::vec(connection_token(), 1..4),
        0..3,
    )
}

fn head(version: String, connection: &[Vec<String>]) -> ResponseHead {
    ResponseHead {
        version,
        status_code: 200,
        reason_phrase: "OK".to_string(),
        headers: connection
            .iter()
            .map(|tokens| ("Connection".to_string(), tokens.join(", ")))
            .collect(),
    }
}

proptest! {
    /// close トークンが 1 つでもあれば常に閉じる。なければ keep-alive
    /// トークンか HTTP/1.1 のときだけ維持する
    #[test]
    fn keep_alive_decision_table(
        version in version(),
        connection in connection_headers(),
    ) {
        let has_close = connection
            .iter()
            .flatten()
            .any(|t| t.eq_ignore_ascii_case("close"));
        let has_keep_alive = connection
            .iter()
            .flatten()
            .any(|t| t.eq_ignore_ascii_case("keep-alive"));

        let expected = if has_close {
            false
        } else if has_keep_alive {
            true
        } else {
            version == "HTTP/1.1"
        };

        prop_assert_eq!(head(version, &connection).is_keep_alive(), expected);
    }

    /// Keep-Alive の timeout パラメータは位置とパラメータ数に関係なく拾える
    #[test]
    fn keep_alive_timeout_hint_position_independent(
        timeout in 0u64..100_000,
        max in 0u64..1000,
        timeout_first in any::<bool>(),
    ) {
        let value = if timeout_first {
            format!("timeout={}, max={}", timeout, max)
        } else {
            format!("max={}, timeout={}", max, timeout)
        };
        let head = ResponseHead {
            version: "HTTP/1.1".to_string(),
            status_code: 200,
            reason_phrase: "OK".to_string(),
            headers: vec![("Keep-Alive".to_string(), value)],
        };
        prop_assert_eq!(head.keep_alive_timeout(), Some(timeout));
    }
}
