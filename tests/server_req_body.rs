use h1_reactor::Error;
use std::io::Write;
use std::thread;
use std::time::Duration;

mod common;

#[test]
fn server_request_with_body_clen() -> Result<(), Error> {
    let l = common::serve(
        common::config(),
        |req: http::Request<Vec<u8>>| -> common::Res {
            assert_eq!(req.method(), "POST");
            assert_eq!(req.uri().path(), "/path");
            assert_eq!(req.body(), b"OK\n");
            Ok(http::Response::new(Vec::new()))
        },
    );

    let mut tcp = common::connect(&l)?;

    tcp.write_all(b"POST /path HTTP/1.1\r\nconnection: close\r\ncontent-length: 3\r\n\r\nOK\n")?;

    let head = common::read_head(&mut tcp)?;
    assert_eq!(
        head,
        "HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
    );

    assert!(common::is_closed(&mut tcp));

    Ok(())
}

#[test]
fn server_waits_for_body() -> Result<(), Error> {
    let l = common::serve(common::config(), common::echo);

    let mut tcp = common::connect(&l)?;

    tcp.write_all(b"POST /hello HTTP/1.1\r\nContent-Length: 5\r\n")?;
    thread::sleep(Duration::from_millis(30));
    tcp.write_all(b"Host: x\r\n\r\n")?;
    thread::sleep(Duration::from_millis(30));
    tcp.write_all(b"HEL")?;
    thread::sleep(Duration::from_millis(30));
    tcp.write_all(b"LO")?;

    let res = common::read_response(&mut tcp)?;
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "POST /hello host=x len=5\nHELLO");

    Ok(())
}

#[test]
fn server_zero_content_length() -> Result<(), Error> {
    let l = common::serve(common::config(), common::echo);

    let mut tcp = common::connect(&l)?;
    let res = common::roundtrip(
        &mut tcp,
        b"PUT /empty HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
    )?;

    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "PUT /empty host=- len=0\n");

    Ok(())
}

#[test]
fn server_big_body() -> Result<(), Error> {
    let l = common::serve(common::config(), common::echo);

    let body: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

    let mut tcp = common::connect(&l)?;

    let head = format!(
        "POST /big HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );

    // write in a separate thread, the response is as big as the request.
    let mut writer = tcp.try_clone()?;
    let to_send = body.clone();
    let t = thread::spawn(move || {
        writer.write_all(head.as_bytes()).unwrap();
        // odd size to force weird offsets
        for chunk in to_send.chunks(11_111) {
            writer.write_all(chunk).unwrap();
        }
    });

    let res = common::read_response(&mut tcp)?;
    t.join().unwrap();

    let prefix = format!("POST /big host=x len={}\n", body.len());
    assert_eq!(res.status, 200);
    assert_eq!(&res.body[..prefix.len()], prefix.as_bytes());
    assert!(res.body[prefix.len()..] == body[..]);

    Ok(())
}

#[test]
fn server_body_over_limit() -> Result<(), Error> {
    let l = common::serve(
        common::config()
            .max_request_bytes(4096)
            .max_header_bytes(1024),
        common::echo,
    );

    let mut tcp = common::connect(&l)?;
    let res = common::roundtrip(
        &mut tcp,
        b"POST / HTTP/1.1\r\nContent-Length: 100000\r\n\r\n",
    )?;

    assert_eq!(res.status, 400);
    assert!(common::is_closed(&mut tcp));

    Ok(())
}

#[test]
fn server_peer_closes_mid_body() -> Result<(), Error> {
    let l = common::serve(common::config(), common::echo);

    let mut tcp = common::connect(&l)?;
    tcp.write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc")?;
    tcp.shutdown(std::net::Shutdown::Write)?;

    // head was complete, so the short request is answered as bad
    let res = common::read_response(&mut tcp)?;
    assert_eq!(res.status, 400);
    assert!(common::is_closed(&mut tcp));

    Ok(())
}

#[test]
fn server_bad_request_answers_in_request_version() -> Result<(), Error> {
    let l = common::serve(
        common::config()
            .max_request_bytes(4096)
            .max_header_bytes(1024),
        common::echo,
    );

    let mut tcp = common::connect(&l)?;
    let res = common::roundtrip(
        &mut tcp,
        b"POST / HTTP/1.0\r\nContent-Length: 100000\r\n\r\n",
    )?;
    assert_eq!(res.status, 400);
    assert_eq!(res.version, 0);

    // no version to go by
    let mut tcp = common::connect(&l)?;
    let res = common::roundtrip(&mut tcp, b"BADLINE\r\n\r\n")?;
    assert_eq!(res.status, 400);
    assert_eq!(res.version, 1);

    Ok(())
}
