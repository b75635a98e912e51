#![no_main]

use libfuzzer_sys::fuzz_target;

// The base-92 MiniDescriptor codec is itself a textual wire format parsed
// from untrusted input (e.g. over RPC when registering extensions at
// runtime), so it gets its own fuzz target independent of message decoding.
fuzz_target!(|data: &str| {
    let _ = minipb::mini_descriptor::decode_message_descriptor(data);
});
