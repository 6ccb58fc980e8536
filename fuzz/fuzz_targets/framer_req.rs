#![no_main]
use libfuzzer_sys::fuzz_target;

use h1_reactor::framer::Framer;

fuzz_target!(|data: &[u8]| {
    let mut f = Framer::new(8 * 1024, 64 * 1024);
    f.push(data);

    if f.should_parse_top_part() && f.parse_top_part().is_err() {
        return;
    }

    if f.should_parse_bottom_part() && f.parse_bottom_part().is_err() {
        return;
    }

    if f.is_complete() {
        let _ = f.take_parsed();
        f.reset();
    }
});
