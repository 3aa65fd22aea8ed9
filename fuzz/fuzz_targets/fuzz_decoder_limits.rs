#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shiguredo_h1conn::{DecoderLimits, ResponseDecoder};

#[derive(Arbitrary, Debug)]
struct FuzzLimits {
    max_buffer_size: u16,
    max_headers_count: u8,
    max_header_line_size: u16,
    max_headers_size: u16,
    max_body_size: u32,
    max_chunk_line_size: u8,
    data: Vec<u8>,
}

fn build_limits(input: &FuzzLimits) -> DecoderLimits {
    DecoderLimits {
        max_buffer_size: input.max_buffer_size as usize,
        max_headers_count: input.max_headers_count as usize,
        max_header_line_size: input.max_header_line_size as usize,
        max_headers_size: input.max_headers_size as usize,
        max_body_size: input.max_body_size as usize,
        max_chunk_line_size: input.max_chunk_line_size as usize,
    }
}

fuzz_target!(|input: FuzzLimits| {
    let limits = build_limits(&input);

    let mut decoder = ResponseDecoder::with_limits(limits);
    if decoder.feed(&input.data).is_ok() {
        let _ = decoder.decode_headers();
        if let Some(data) = decoder.peek_body() {
            let len = data.len();
            let _ = decoder.consume_body(len);
        }
        let _ = decoder.mark_eof();
    }
});
