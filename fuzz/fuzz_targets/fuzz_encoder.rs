#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shiguredo_h1conn::{Framing, Request, encode_head, plan_framing};

#[derive(Arbitrary, Debug)]
struct FuzzEncoder {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    declared: Option<u64>,
    body_len: Option<u64>,
}

fuzz_target!(|input: FuzzEncoder| {
    let mut request = Request::new(&input.method, &input.target);
    for (name, value) in &input.headers {
        request = request.header(name, value);
    }
    if let Some(declared) = input.declared {
        request = request.content_length(declared);
    }

    // plan と encode はどんな入力でもパニックせずエラーを返す
    if let Ok(framing) = plan_framing(&request, input.body_len) {
        if let Ok(head) = encode_head(&request, &framing) {
            // 出力されたヘッドは CRLF 区切りの ASCII で空行終端になる
            assert!(head.ends_with(b"\r\n\r\n"));
            let text = std::str::from_utf8(&head).expect("an ASCII head");
            assert!(text.lines().count() >= 1);
        }
    }

    let _ = encode_head(&request, &Framing::Chunked);
});
