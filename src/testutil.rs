//! In-process HTTP backends for unit tests

use crate::proxy::Body;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::time::Duration;
use tokio::net::TcpListener;

pub fn empty_body() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn empty_request(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(empty_body()).unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Serve `"{name} {path?query}"` on an ephemeral port, after an optional delay
async fn serve(name: String, delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(accept_loop(listener, name, delay));
    port
}

async fn accept_loop(listener: TcpListener, name: String, delay: Duration) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let name = name.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let name = name.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    let pq = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(format!("{} {}", name, pq)))))
                }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

pub async fn spawn_backend(name: &str) -> u16 {
    serve(name.to_string(), Duration::ZERO).await
}

pub async fn spawn_slow_backend(delay: Duration) -> u16 {
    serve("slow".to_string(), delay).await
}

/// Like [`spawn_backend`] but on a fixed port, starting after `delay`
pub fn spawn_backend_later(port: u16, name: &str, delay: Duration) {
    let name = name.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        accept_loop(listener, name, Duration::ZERO).await;
    });
}

/// A port nothing is listening on right now
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
