#![no_main]
use libfuzzer_sys::fuzz_target;
use mountkeeper::{MountRecord, Registry};
use std::path::PathBuf;

fuzz_target!(|data: &[u8]| {
    if let Ok(content) = std::str::from_utf8(data) {
        // Try to parse as a mount record
        if let Ok(record) = serde_json::from_str::<MountRecord>(content) {
            let _ = serde_json::to_string(&record);
        }

        // Whatever lands in the state directory, listing must not fail
        let dir = PathBuf::from("/tmp/mntk_fuzz/mounts");
        if let Ok(registry) = Registry::new(&dir) {
            if std::fs::write(dir.join("fuzz.json"), content).is_ok() {
                let _ = registry.list();
                let _ = std::fs::remove_file(dir.join("fuzz.json"));
            }
        }
    }
});
