#![no_main]
use libfuzzer_sys::fuzz_target;

use h1_reactor::framer::Framer;

// (method, uri, headers, body) or None on any parse failure
type Outcome = Option<(String, String, Vec<(String, Vec<u8>)>, Option<Vec<u8>>)>;

fn frame(data: &[u8], step: usize) -> Outcome {
    let mut f = Framer::new(8 * 1024, 64 * 1024);

    for piece in data.chunks(step) {
        f.push(piece);

        if f.should_parse_top_part() {
            f.parse_top_part().ok()?;
        }
        if !f.should_read_more() {
            break;
        }
    }

    if f.should_parse_bottom_part() {
        f.parse_bottom_part().ok()?;
    }

    if !f.is_complete() {
        return None;
    }

    let (head, body) = f.take_parsed()?;
    let headers = head
        .headers()
        .iter()
        .map(|(n, v)| (n.to_string(), v.as_bytes().to_vec()))
        .collect();

    Some((
        head.method().to_string(),
        head.uri().to_string(),
        headers,
        body,
    ))
}

// A request framed from split input must equal the one framed from the whole input.
fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    let step = data[0] as usize % 32 + 1;
    let data = &data[1..];

    if let Some(split) = frame(data, step) {
        assert_eq!(frame(data, data.len()), Some(split));
    }
});
