#![no_main]
use libfuzzer_sys::fuzz_target;
use mountkeeper::AccessPolicy;

fuzz_target!(|data: &[u8]| {
    if let Ok(allow) = std::str::from_utf8(data) {
        // Anything accepted must name itself the same way again
        if let Ok(policy) = allow.parse::<AccessPolicy>() {
            assert_eq!(policy.as_str(), allow);
        }
    }
});
