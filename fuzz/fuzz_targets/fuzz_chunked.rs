#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shiguredo_h1conn::{BodyProgress, DecodedHead, ResponseDecoder, encode_chunk};

#[derive(Arbitrary, Debug)]
struct FuzzChunked {
    chunks: Vec<Vec<u8>>,
    trailers: bool,
    split_hint: u8,
}

fn normalize_chunks(mut chunks: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    chunks.retain(|chunk| !chunk.is_empty());
    if chunks.len() > 64 {
        chunks.truncate(64);
    }
    chunks
}

fn concat_chunks(chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    for chunk in chunks {
        body.extend_from_slice(chunk);
    }
    body
}

fn decode(encoded: &[u8], split_size: usize) -> Option<(Vec<u8>, Vec<(String, String)>)> {
    let mut decoder = ResponseDecoder::new();
    let mut saw_head = false;
    let mut body = Vec::new();

    for part in encoded.chunks(split_size) {
        if decoder.feed(part).is_err() {
            return None;
        }
        if !saw_head {
            match decoder.decode_headers() {
                Ok(Some(DecodedHead::Final { .. })) => saw_head = true,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        loop {
            if let Some(data) = decoder.peek_body() {
                let len = data.len();
                body.extend_from_slice(data);
                match decoder.consume_body(len) {
                    Ok(BodyProgress::Complete { trailers }) => return Some((body, trailers)),
                    Ok(BodyProgress::Continue) => continue,
                    Err(_) => return None,
                }
            }
            match decoder.progress() {
                Ok(BodyProgress::Complete { trailers }) => return Some((body, trailers)),
                Ok(BodyProgress::Continue) => break,
                Err(_) => return None,
            }
        }
    }
    None
}

fuzz_target!(|input: FuzzChunked| {
    let chunks = normalize_chunks(input.chunks);
    let expected = concat_chunks(&chunks);
    let split_size = (input.split_hint as usize % 32) + 1;

    let mut encoded =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    for chunk in &chunks {
        encoded.extend_from_slice(&encode_chunk(chunk));
    }
    if input.trailers {
        encoded.extend_from_slice(b"0\r\nX-Checksum: 0\r\n\r\n");
    } else {
        encoded.extend_from_slice(&encode_chunk(&[]));
    }

    let (body, trailers) = decode(&encoded, split_size).expect("a valid chunked response");
    assert_eq!(body, expected);
    if input.trailers {
        assert_eq!(
            trailers,
            vec![("X-Checksum".to_string(), "0".to_string())]
        );
    } else {
        assert!(trailers.is_empty());
    }
});
