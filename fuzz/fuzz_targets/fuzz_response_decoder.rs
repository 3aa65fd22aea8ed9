#![no_main]

use libfuzzer_sys::fuzz_target;
use shiguredo_h1conn::{BodyProgress, DecodedHead, ResponseDecoder};

fn run_to_completion(decoder: &mut ResponseDecoder) {
    loop {
        if let Some(data) = decoder.peek_body() {
            let len = data.len();
            match decoder.consume_body(len) {
                Ok(BodyProgress::Complete { .. }) | Err(_) => return,
                Ok(BodyProgress::Continue) => continue,
            }
        }
        match decoder.progress() {
            Ok(BodyProgress::Complete { .. }) | Err(_) => return,
            Ok(BodyProgress::Continue) => return,
        }
    }
}

fuzz_target!(|data: &[u8]| {
    // 通常のレスポンスデコード
    let mut decoder = ResponseDecoder::new();
    if decoder.feed(data).is_ok() {
        match decoder.decode_headers() {
            Ok(Some(DecodedHead::Final { .. })) => run_to_completion(&mut decoder),
            Ok(_) | Err(_) => {}
        }
        let _ = decoder.mark_eof();
    }

    // HEAD リクエストへのレスポンスとしてデコード
    let mut decoder = ResponseDecoder::new();
    decoder.set_expect_no_body(true);
    if decoder.feed(data).is_ok() {
        let _ = decoder.decode_headers();
    }

    // CONNECT のレスポンスとしてデコード (2xx でトンネル化する)
    let mut decoder = ResponseDecoder::new();
    decoder.set_expect_tunnel(true);
    if decoder.feed(data).is_ok() {
        if decoder.decode_headers().is_ok() && decoder.is_tunnel() {
            let _ = decoder.take_remaining();
        }
    }

    // データを分割して feed (ストリーミングシナリオ)
    let mut decoder = ResponseDecoder::new();
    for chunk in data.chunks(23) {
        if decoder.feed(chunk).is_err() {
            return;
        }
        match decoder.decode_headers() {
            Ok(Some(DecodedHead::Final { .. })) => {
                run_to_completion(&mut decoder);
                return;
            }
            Ok(_) => {}
            Err(_) => return,
        }
    }
    let _ = decoder.mark_eof();
});
