#![no_main]

use bytes::{BufMut, BytesMut};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buffer = BytesMut::new();
    buffer.put(data);
    let _frame = scheelite::frame::parse_frame(&mut buffer, scheelite::DEFAULT_MAX_MESSAGE_SIZE);
});
