//! Hello world server.
//!
//! ```text
//! cargo run --example server_hello
//! cargo run --example server_hello -- cert.pem key.pem
//! ```
//!
//! With a certificate and key the server speaks TLS only.

use h1_reactor::{ConnInfo, Error, HandlerError, Listener, ServerConfig};

fn hello(req: http::Request<Vec<u8>>) -> Result<http::Response<Vec<u8>>, HandlerError> {
    let who = req
        .extensions()
        .get::<ConnInfo>()
        .map(|c| c.client_address())
        .unwrap_or_default();

    Ok(http::Response::builder()
        .header("content-type", "text/plain")
        .body(format!("Hello {}!\n", who).into_bytes())?)
}

fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let mut config = ServerConfig::new().host("127.0.0.1").port(3000);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [cert, key] = &args[..] {
        config = config.tls(h1_reactor::tls::load_server_config(cert, key)?);
    }

    let listener = Listener::bind(config, hello)?;

    println!(
        "Listening to {:?} ({:?})",
        listener.local_addr(),
        listener.strategy()
    );

    listener.join();

    Ok(())
}
