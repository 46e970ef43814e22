//! Minimal HTTP surface proving which instance accepted a connection.
//!
//! One task per accepted connection, nothing shared between them except the
//! read-only [`ServiceInfo`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::role::Role;

const MAX_HEADER_LINES: usize = 100;
const MAX_LINE_LEN: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub node_name: String,
    pub role: Role,
}

impl ServiceInfo {
    pub fn body(&self) -> String {
        format!("hello from {} ({})\n", self.node_name, self.role)
    }
}

/// Accept until `shutdown` resolves. The listener is closed on return,
/// which removes it from the reuseport group.
pub async fn serve_until<S>(listener: TcpListener, info: ServiceInfo, shutdown: S)
where
    S: Future<Output = ()>,
{
    let info = Arc::new(info);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let info = info.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle(stream, addr, &info).await {
                            tracing::debug!(addr = %addr, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            _ = &mut shutdown => {
                tracing::info!(role = %info.role, "service loop stopping");
                return;
            }
        }
    }
}

/// Accept forever.
pub async fn serve(listener: TcpListener, info: ServiceInfo) {
    serve_until(listener, info, std::future::pending()).await
}

async fn handle(stream: TcpStream, addr: SocketAddr, info: &ServiceInfo) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let request_line = read_line(&mut reader).await?.unwrap_or_default();
    for _ in 0..MAX_HEADER_LINES {
        match read_line(&mut reader).await? {
            Some(line) if !line.is_empty() => continue,
            _ => break,
        }
    }
    tracing::debug!(addr = %addr, request = %request_line, role = %info.role, "served");

    let body = info.body();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await
}

/// One CRLF- or LF-terminated line, at most `MAX_LINE_LEN` bytes.
/// `None` at end of stream.
async fn read_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if n > MAX_LINE_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "request line too long",
        ));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
