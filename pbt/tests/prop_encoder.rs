//! リクエストエンコーダーのプロパティテスト

use pbt::{body, header_value, http_method, request_target, token_string};
use proptest::prelude::*;
use shiguredo_h1conn::{BodyWriteTracker, Framing, Request, encode_chunk, encode_head};

fn x_header_name() -> impl Strategy<Value = String> {
    token_string(24).prop_map(|s| format!("X-{}", s))
}

proptest! {
    /// ヘッドは常にリクエストラインで始まり空行で終わる
    #[test]
    fn head_structure(
        method in http_method(),
        target in request_target(),
        headers in proptest::collection::vec((x_header_name(), header_value()), 0..8),
    ) {
        let mut request = Request::new(&method, &target);
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        let head = encode_head(&request, &Framing::None).expect("encode_head");
        let text = String::from_utf8(head).expect("ASCII head");

        let request_line = format!("{} {} HTTP/1.1\r\n", method, target);
        prop_assert!(text.starts_with(&request_line));
        prop_assert!(text.ends_with("\r\n\r\n"));
        for (name, value) in &headers {
            let header_line = format!("{}: {}\r\n", name, value);
            prop_assert!(text.contains(&header_line));
        }
    }

    /// フレーミングヘッダーは framing 引数だけから出力される
    #[test]
    fn framing_header_emitted_exactly_once(
        declared in 0u64..1_000_000,
        user_declared in 0u64..1_000_000,
    ) {
        let request = Request::new("POST", "/upload")
            .header("Content-Length", &user_declared.to_string());

        let head = encode_head(&request, &Framing::ContentLength(declared)).expect("encode_head");
        let text = String::from_utf8(head).expect("ASCII head");

        // ユーザー指定の Content-Length は除外され framing 側の値だけが残る
        prop_assert_eq!(text.matches("Content-Length").count(), 1);
        let content_length_line = format!("Content-Length: {}\r\n", declared);
        prop_assert!(text.contains(&content_length_line));

        let head = encode_head(&request, &Framing::Chunked).expect("encode_head");
        let text = String::from_utf8(head).expect("ASCII head");
        prop_assert!(!text.contains("Content-Length"));
        prop_assert_eq!(text.matches("Transfer-Encoding: chunked").count(), 1);
    }

    /// チャンクエンコードは「16 進サイズ CRLF データ CRLF」の形になる
    #[test]
    fn chunk_encoding_shape(data in body(512)) {
        let encoded = encode_chunk(&data);
        if data.is_empty() {
            prop_assert_eq!(encoded, b"0\r\n\r\n".to_vec());
        } else {
            let mut expected = format!("{:x}\r\n", data.len()).into_bytes();
            expected.extend_from_slice(&data);
            expected.extend_from_slice(b"\r\n");
            prop_assert_eq!(encoded, expected);
        }
    }

    /// トラッカーは書き込み合計が宣言長と一致したときだけ finish を通す
    #[test]
    fn tracker_accepts_exact_total_only(
        pieces in proptest::collection::vec(1u64..512, 1..16),
    ) {
        let total: u64 = pieces.iter().sum();
        let mut tracker = BodyWriteTracker::new(Some(total));
        for piece in &pieces {
            tracker.record(*piece).expect("within the declared length");
        }
        prop_assert_eq!(tracker.finish().expect("exact total"), total);

        // 1 バイトでも超過すると record が失敗する
        prop_assert!(tracker.record(1).is_err());

        // 宣言長に満たないと finish が失敗する
        let mut short = BodyWriteTracker::new(Some(total + 1));
        for piece in &pieces {
            short.record(*piece).expect("within the declared length");
        }
        prop_assert!(short.finish().is_err());
    }
}
