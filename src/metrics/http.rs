//! Minimal HTTP server for Prometheus `/metrics` scraping.
//! Uses raw `TcpListener`, no HTTP server dependency.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::MetricsRegistry;

/// Binds `addr` (e.g. "127.0.0.1:9091") and serves every scope of `registry`
/// at any path until `cancel` fires.
pub async fn serve_metrics(
    addr: &str,
    registry: Arc<MetricsRegistry>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics HTTP: listening on http://{}/metrics", listener.local_addr()?);
    serve(listener, registry, cancel).await;
    Ok(())
}

/// Serves metrics on an already bound listener.
pub async fn serve(listener: TcpListener, registry: Arc<MetricsRegistry>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Metrics HTTP: shutting down");
                break;
            }
            accept = listener.accept() => {
                let (mut stream, peer) = match accept {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::debug!("Metrics HTTP: accept failed: {}", e);
                        continue;
                    }
                };

                let body = registry.to_prometheus();
                let response = format!(
                    "HTTP/1.1 200 OK\r\n\
                     Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\
                     \r\n\
                     {}",
                    body.len(),
                    body
                );

                if let Err(e) = stream.write_all(response.as_bytes()).await {
                    tracing::debug!(%peer, "Metrics HTTP: write failed: {}", e);
                }
                let _ = stream.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    use super::*;

    #[tokio::test]
    async fn test_serves_registered_scopes() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.scope("indexingWorkScheduler").record_enqueue();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, registry, cancel.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("replsched_enqueue_calls_total{scope=\"indexingWorkScheduler\"} 1"));

        cancel.cancel();
        server.await.unwrap();
    }
}
