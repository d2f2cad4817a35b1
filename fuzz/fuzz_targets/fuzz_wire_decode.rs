#![no_main]

use libfuzzer_sys::fuzz_target;
use wisp_runtime::RuntimeConfig;
use wisp_web::{MemoryUploadClient, WebSession, decode_forward_msg};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Decoding must never panic.
    let _ = decode_forward_msg(text);

    // Neither may a session fed one frame per line, whatever they contain.
    let mut web = WebSession::new(RuntimeConfig::default(), MemoryUploadClient::new());
    for line in text.lines() {
        let _ = web.push_inbound(line);
    }
    web.end_of_task();
    for frame in web.drain_outbound() {
        assert!(frame.starts_with('{'), "outbound frame is not a JSON object");
    }
});
