use h1_reactor::tls::{sni_server_config, SniCert};
use h1_reactor::{AcceptStrategy, Error};
use std::io::Write;

mod common;

fn tls_get(strategy: AcceptStrategy) -> Result<(), Error> {
    let l = common::serve(
        common::config()
            .tls(common::tls_server_config())
            .accept_strategy(strategy),
        common::conn_info,
    );

    let mut tls = common::tls_connect(&l, "localhost")?;
    let res = common::roundtrip(&mut tls, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    assert_eq!(res.status, 200);
    let body = res.body_str();
    assert!(body.contains("secure=true"), "{}", body);
    assert!(body.contains("version=TLSv1_3"), "{}", body);
    assert!(body.contains("sni=localhost"), "{}", body);

    assert_eq!(tls.conn.alpn_protocol(), Some(&b"http/1.1"[..]));

    Ok(())
}

#[test]
fn server_tls_get_direct() -> Result<(), Error> {
    tls_get(AcceptStrategy::Direct)
}

#[test]
fn server_tls_get_central() -> Result<(), Error> {
    tls_get(AcceptStrategy::Central)
}

#[test]
fn server_tls_keep_alive() -> Result<(), Error> {
    let l = common::serve(
        common::config().tls(common::tls_server_config()),
        common::echo,
    );

    let mut tls = common::tls_connect(&l, "localhost")?;

    let res = common::roundtrip(&mut tls, b"GET /1 HTTP/1.1\r\nHost: a\r\n\r\n")?;
    assert_eq!(res.body_str(), "GET /1 host=a len=0\n");
    assert_eq!(res.header("connection"), Some("keep-alive"));

    let res = common::roundtrip(
        &mut tls,
        b"POST /2 HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbody",
    )?;
    assert_eq!(res.body_str(), "POST /2 host=a len=4\nbody");
    assert_eq!(res.header("connection"), Some("close"));

    assert!(common::is_closed(&mut tls));

    Ok(())
}

#[test]
fn server_tls_big_body() -> Result<(), Error> {
    let l = common::serve(
        common::config().tls(common::tls_server_config()),
        common::echo,
    );

    // several tls records each way
    let body = vec![b'x'; 200 * 1024];
    let mut req = format!(
        "PUT /big HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    req.extend_from_slice(&body);

    let mut tls = common::tls_connect(&l, "localhost")?;
    let res = common::roundtrip(&mut tls, &req)?;

    assert_eq!(res.status, 200);
    let prefix = format!("PUT /big host=- len={}\n", body.len());
    assert_eq!(res.body.len(), prefix.len() + body.len());
    assert!(res.body[prefix.len()..] == body[..]);

    Ok(())
}

#[test]
fn server_tls_sni() -> Result<(), Error> {
    let config = sni_server_config(&[SniCert {
        server_name: "localhost",
        cert_pem: common::SERVER_PEM,
        key_pem: common::SERVER_KEY,
    }])?;

    let l = common::serve(common::config().num_worker_threads(1).tls(config), common::conn_info);

    // no certificate for that name
    let mut tls = common::tls_connect(&l, "unknown.test")?;
    assert!(common::roundtrip(&mut tls, b"GET / HTTP/1.1\r\n\r\n").is_err());

    // the worker carries on
    let mut tls = common::tls_connect(&l, "localhost")?;
    let res = common::roundtrip(&mut tls, b"GET / HTTP/1.1\r\n\r\n")?;
    assert_eq!(res.status, 200);
    assert!(res.body_str().contains("sni=localhost"));

    assert!(common::wait_for(std::time::Duration::from_secs(2), || {
        common::live_connections(&l) == 1
    }));

    Ok(())
}

#[test]
fn server_tls_sni_empty_is_config_error() {
    match sni_server_config(&[]) {
        Err(Error::Config(_)) => {}
        other => panic!("expected config error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn server_tls_bad_pem() {
    assert!(h1_reactor::tls::server_config_from_pem(b"not pem", common::SERVER_KEY).is_err());
    assert!(h1_reactor::tls::server_config_from_pem(common::SERVER_PEM, b"").is_err());
}

#[test]
fn server_tls_plaintext_client() -> Result<(), Error> {
    let l = common::serve(
        common::config().tls(common::tls_server_config()),
        common::echo,
    );

    let mut tcp = common::connect(&l)?;
    tcp.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")?;

    assert!(common::is_closed(&mut tcp));
    assert!(common::wait_for(std::time::Duration::from_secs(2), || {
        common::live_connections(&l) == 0
    }));

    Ok(())
}

#[test]
fn server_tls_pipelined_after_body() -> Result<(), Error> {
    let l = common::serve(
        common::config().tls(common::tls_server_config()),
        common::echo,
    );

    let mut tls = common::tls_connect(&l, "localhost")?;

    tls.write_all(b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\n")?;
    tls.flush()?;
    std::thread::sleep(std::time::Duration::from_millis(200));

    // the rest of the body and a whole second request in one record
    tls.write_all(b"abcGET /b HTTP/1.1\r\nHost: y\r\n\r\n")?;
    tls.flush()?;

    let res = common::read_response(&mut tls)?;
    assert_eq!(res.body_str(), "POST /a host=- len=3\nabc");

    let res = common::read_response(&mut tls)?;
    assert_eq!(res.body_str(), "GET /b host=y len=0\n");

    Ok(())
}
