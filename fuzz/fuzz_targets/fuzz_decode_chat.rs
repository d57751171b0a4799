#![no_main]
use chatwire::protocol::chat::decode_envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for msg in decode_envelope(data) {
        assert!(msg.speaker_id > 0);
        assert!(!msg.text.is_empty());
    }
});
