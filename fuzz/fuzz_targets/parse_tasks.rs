#![no_main]

use libfuzzer_sys::fuzz_target;
use tick_core::jsonl;

fuzz_target!(|data: &[u8]| {
    // Any input either parses or reports a line number; never panics.
    if let Ok(tasks) = jsonl::parse_tasks(data) {
        let Ok(bytes) = jsonl::marshal_tasks(&tasks) else {
            return;
        };
        let reparsed = jsonl::parse_tasks(&bytes).expect("marshalled tasks must parse");
        assert_eq!(reparsed, tasks);
    }
});
