//! HTTP server for the Prometheus metrics endpoint.

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{error, info};
use prometheus::{Encoder, TextEncoder};
use std::io::Write;
use tokio::net::{TcpListener, TcpStream};

use super::REGISTRY;

/// Handles one HTTP request for metrics.
async fn handle_metrics_request(stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);
    let mut connection = tokio::io::BufWriter::new(write_half);
    let mut headers = [0; 1024];

    let n = match tokio::io::AsyncReadExt::read(&mut reader, &mut headers).await {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to read HTTP request: {e}");
            return;
        }
    };

    let headers_str = match std::str::from_utf8(&headers[..n]) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to parse HTTP headers: {e}");
            return;
        }
    };

    let accepts_gzip =
        headers_str.contains("Accept-Encoding") && headers_str.to_lowercase().contains("gzip");

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {e}");
        return;
    }

    let content_type = encoder.format_type();

    let (response_body, content_encoding) = if accepts_gzip {
        let mut compressed = Vec::new();
        {
            let mut encoder = GzEncoder::new(&mut compressed, Compression::default());
            if let Err(e) = encoder.write_all(&buffer) {
                error!("Failed to compress metrics data: {e}");
                return;
            }
            if let Err(e) = encoder.finish() {
                error!("Failed to finish gzip compression: {e}");
                return;
            }
        }
        (compressed, "Content-Encoding: gzip\r\n")
    } else {
        (buffer, "")
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\n{}Content-Length: {}\r\n\r\n",
        content_type,
        content_encoding,
        response_body.len()
    );

    if let Err(e) = tokio::io::AsyncWriteExt::write_all(&mut connection, response.as_bytes()).await
    {
        error!("Failed to write HTTP response header: {e}");
        return;
    }

    if let Err(e) = tokio::io::AsyncWriteExt::write_all(&mut connection, &response_body).await {
        error!("Failed to write metrics data: {e}");
        return;
    }

    if let Err(e) = tokio::io::AsyncWriteExt::flush(&mut connection).await {
        error!("Failed to flush connection: {e}");
    }
}

/// Starts the prometheus exporter.
pub async fn start_metrics_server(host: &str) {
    let listener = match TcpListener::bind(host).await {
        Ok(listener) => listener,
        Err(e) => {
            panic!("Failed to bind metrics exporter to {host}: {e}");
        }
    };
    info!("prometheus exporter listening on {host}");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(async move {
                    handle_metrics_request(stream).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {e}");
            }
        }
    }
}
