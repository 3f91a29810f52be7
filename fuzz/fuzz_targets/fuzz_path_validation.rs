//! Fuzz testing for the lexical path checks.
//!
//! Every request path reaches `check_requested_path` before any filesystem
//! access, so it must never panic and must never accept a path that climbs
//! out of the static root.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_path_validation -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use static_shield::validation::{check_requested_path, file_extension, normalize_extension};

fuzz_target!(|data: &[u8]| {
    let Ok(path) = std::str::from_utf8(data) else {
        return;
    };

    if check_requested_path(path).is_ok() {
        // Anything accepted must be relative and free of parent segments.
        assert!(!path.starts_with('/') && !path.starts_with('\\'));
        assert!(!path.contains('\0'));
        assert!(
            !path
                .split(['/', '\\'])
                .any(|segment| segment == "..")
        );
    }

    if let Some(ext) = file_extension(path) {
        assert!(ext.starts_with('.'));
        assert_eq!(ext, ext.to_ascii_lowercase());
    }

    let _ = normalize_extension(path);
});
