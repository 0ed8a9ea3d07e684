//! HTTP relay — forwards one inbound exchange to a tunnel's loopback port
//! and streams the response back.
//!
//! The outbound URL is `scheme://localhost:<local_port>/<root><path>?<query>`
//! with exactly one `/` between root and path. Request headers are copied
//! except host identity; response headers are copied except `Server`, and
//! every `Set-Cookie` is rewritten to `Path=/` so cookies survive the
//! path-prefix rewrite the gateway performs. Bodies stream in both
//! directions; nothing is buffered in full. Failures terminate the exchange
//! and are never retried — the registry converges via the reaper.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, Response};
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use crate::error::GatewayError;
use crate::tunnel::dependency::{DependencyKind, TunnelDependency};

use super::copier;

/// Loopback client shared by all HTTP relays.
pub type HttpClient = Client<HttpConnector, Body>;

pub fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Rewrite a `Set-Cookie` value to `Path=/`, dropping the original
/// attributes: the cookie was scoped to the target's own path layout, which
/// does not exist under the proxy prefix.
pub fn rewrite_set_cookie(value: &str) -> String {
    let name_value = value.split(';').next().unwrap_or(value).trim();
    format!("{name_value}; Path=/")
}

/// Legacy content-rewrite transform: point root-relative `href`/`src`
/// references at the proxy prefix so applications not designed to run behind
/// one keep resolving their assets.
pub fn rewrite_root_links(prefix: &str, line: &str) -> String {
    line.replace("href=\"/", &format!("href=\"{prefix}/"))
        .replace("src=\"/", &format!("src=\"{prefix}/"))
}

/// Relay one inbound exchange through `dependency`'s forward.
pub async fn relay(
    client: &HttpClient,
    dependency: &TunnelDependency,
    remote_path: &str,
    request: Request,
) -> Result<Response<Body>, GatewayError> {
    let (parts, body) = request.into_parts();

    let target = dependency
        .target_url(false, remote_path, parts.uri.query())
        .ok_or(GatewayError::NoSuchTunnel)?;
    let uri: hyper::Uri = target
        .parse()
        .map_err(|e| GatewayError::RelayIo(format!("bad target url {target}: {e}")))?;

    let mut outbound = hyper::Request::builder().method(parts.method).uri(uri);
    for (name, value) in &parts.headers {
        // The Host header names the gateway origin; forwarding it would break
        // the loopback hop. hyper derives the correct one from the URI.
        if name == header::HOST {
            continue;
        }
        outbound = outbound.header(name, value);
    }
    let outbound = outbound
        .body(body)
        .map_err(|e| GatewayError::RelayIo(e.to_string()))?;

    let response = client
        .request(outbound)
        .await
        .map_err(|e| GatewayError::RelayIo(e.to_string()))?;

    let (parts, inbound_body) = response.into_parts();

    let rewrite = matches!(dependency.kind(), DependencyKind::Http(t) if t.rewrite_html)
        && is_plain_html(&parts.headers);

    let mut builder = Response::builder().status(parts.status);
    {
        let headers = builder.headers_mut().expect("fresh response builder");
        for (name, value) in &parts.headers {
            if name == header::SERVER {
                continue;
            }
            if name == header::SET_COOKIE {
                if let Ok(raw) = value.to_str() {
                    if let Ok(rewritten) = rewrite_set_cookie(raw).parse() {
                        headers.append(header::SET_COOKIE, rewritten);
                    }
                }
                continue;
            }
            // Length changes under the line rewrite; the transfer becomes chunked.
            if rewrite && name == header::CONTENT_LENGTH {
                continue;
            }
            headers.append(name, value.clone());
        }
    }

    let body = if rewrite {
        let prefix = format!("/api/proxy/{}", dependency.id());
        let reader = StreamReader::new(
            BodyExt::into_data_stream(inbound_body).map_err(std::io::Error::other),
        );
        let (write_end, read_end) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let result = copier::copy_lines(
                tokio::io::BufReader::new(reader),
                write_end,
                move |line| rewrite_root_links(&prefix, line),
            )
            .await;
            if let Err(e) = result {
                debug!("HTML rewrite relay ended: {e}");
            }
        });
        Body::from_stream(ReaderStream::new(read_end))
    } else {
        Body::new(inbound_body)
    };

    builder
        .body(body)
        .map_err(|e| GatewayError::RelayIo(e.to_string()))
}

fn is_plain_html(headers: &axum::http::HeaderMap) -> bool {
    let html = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/html"));
    html && !headers.contains_key(header::CONTENT_ENCODING)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::Tunnel;
    use axum::extract::RawQuery;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::Router;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn test_dependency(local_port: u16, root: &str, rewrite_html: bool) -> TunnelDependency {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, _rx) = tokio::sync::oneshot::channel();
        let tunnel = Tunnel::handle(local_port, "vis01".to_string(), 8888, running, tx);
        TunnelDependency::http(
            9,
            root.to_string(),
            false,
            rewrite_html,
            "vis01".to_string(),
            8888,
            tunnel,
        )
    }

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[test]
    fn test_rewrite_set_cookie_forces_root_path() {
        assert_eq!(
            rewrite_set_cookie("sid=abc; Path=/base; HttpOnly"),
            "sid=abc; Path=/"
        );
        assert_eq!(rewrite_set_cookie("sid=abc"), "sid=abc; Path=/");
    }

    #[test]
    fn test_rewrite_root_links_targets_prefix() {
        assert_eq!(
            rewrite_root_links("/api/proxy/9", r#"<a href="/static/x.css">"#),
            r#"<a href="/api/proxy/9/static/x.css">"#
        );
        assert_eq!(
            rewrite_root_links("/api/proxy/9", r#"<img src="/logo.png">"#),
            r#"<img src="/api/proxy/9/logo.png">"#
        );
        // Absolute and relative references pass through untouched.
        assert_eq!(
            rewrite_root_links("/p", r#"<a href="https://x/y">"#),
            r#"<a href="https://x/y">"#
        );
    }

    #[tokio::test]
    async fn test_relay_round_trip_preserves_status_and_body() {
        // Status and body come back unchanged; Set-Cookie is rewritten
        // to Path=/ and the Server header is dropped.
        let app = Router::new().route(
            "/base/echo",
            get(|RawQuery(query): RawQuery| async move {
                (
                    [
                        (header::SET_COOKIE, "sid=abc; Path=/base; HttpOnly"),
                        (header::SERVER, "target/1.0"),
                    ],
                    format!("query={}", query.unwrap_or_default()),
                )
                    .into_response()
            }),
        );
        let port = serve(app).await;

        let dependency = test_dependency(port, "base", false);
        let client = build_client();
        let request = Request::builder()
            .method("GET")
            .uri("/api/proxy/9/echo?x=1")
            .body(Body::empty())
            .unwrap();

        let response = relay(&client, &dependency, "echo", request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response
                .headers()
                .get(header::SET_COOKIE)
                .and_then(|v| v.to_str().ok()),
            Some("sid=abc; Path=/")
        );
        assert!(response.headers().get(header::SERVER).is_none());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"query=x=1");
    }

    #[tokio::test]
    async fn test_relay_streams_request_body() {
        let app = Router::new().route("/echo", post(|body: String| async move { body }));
        let port = serve(app).await;

        let dependency = test_dependency(port, "", false);
        let client = build_client();
        let request = Request::builder()
            .method("POST")
            .uri("/api/proxy/9/echo")
            .body(Body::from("payload"))
            .unwrap();

        let response = relay(&client, &dependency, "echo", request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"payload");
    }

    #[tokio::test]
    async fn test_relay_propagates_error_status() {
        let app = Router::new().route(
            "/missing",
            get(|| async { (axum::http::StatusCode::NOT_FOUND, "gone") }),
        );
        let port = serve(app).await;

        let dependency = test_dependency(port, "", false);
        let client = build_client();
        let request = Request::builder()
            .uri("/api/proxy/9/missing")
            .body(Body::empty())
            .unwrap();

        let response = relay(&client, &dependency, "missing", request).await.unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_relay_unreachable_target_is_relay_io() {
        // Port came from a dropped listener, so nothing is listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let dependency = test_dependency(port, "", false);
        let client = build_client();
        let request = Request::builder()
            .uri("/api/proxy/9/x")
            .body(Body::empty())
            .unwrap();

        let result = relay(&client, &dependency, "x", request).await;
        assert!(matches!(result, Err(GatewayError::RelayIo(_))));
    }

    #[tokio::test]
    async fn test_relay_rewrites_html_when_enabled() {
        let app = Router::new().route(
            "/page",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/html")],
                    "<a href=\"/static/app.js\">go</a>\n",
                )
            }),
        );
        let port = serve(app).await;

        let dependency = test_dependency(port, "", true);
        let client = build_client();
        let request = Request::builder()
            .uri("/api/proxy/9/page")
            .body(Body::empty())
            .unwrap();

        let response = relay(&client, &dependency, "page", request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            "<a href=\"/api/proxy/9/static/app.js\">go</a>\n"
        );
    }
}
