#![no_main]

use libfuzzer_sys::fuzz_target;
use vpn_fleet::docker::logs::{decode_frames, demux_log_frames};

fuzz_target!(|data: &[u8]| {
    let frames = decode_frames(data);
    let payload: usize = frames.iter().map(|f| f.payload.len()).sum();
    assert!(payload <= data.len());
    let _ = demux_log_frames(data);
});
