//! Load-generating client.
//!
//! Opens `connections` concurrent connections; each sends `requests` arrays
//! of `payload_size` values in descending order, checks that every response
//! is the ascending sequence `1..=payload_size`, and sleeps `delay` between
//! requests. Timings are wall-clock over the whole run.

use crate::error::ClientError;
use crate::protocol::{frame, ArrayMessage};
use prost::Message;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Header of the summary line printed after a run.
pub const REPORT_HEADER: &str = "total_ms,per_request_ms,per_request_minus_delay_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Number of int32 values per request.
    pub payload_size: usize,
    /// Pause between consecutive requests on a connection.
    pub delay: Duration,
    /// Requests per connection.
    pub requests: usize,
    pub connections: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4444,
            payload_size: 4096,
            delay: Duration::from_millis(10),
            requests: 10,
            connections: 1,
        }
    }
}

/// Wall-clock summary of a client run.
#[derive(Debug, Clone, Copy)]
pub struct ClientReport {
    pub total: Duration,
    /// Requests per connection.
    pub requests: usize,
    pub delay: Duration,
}

impl ClientReport {
    /// Average time per request on a connection, sleeps included.
    pub fn per_request(&self) -> Duration {
        match u32::try_from(self.requests) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.total / n,
        }
    }

    /// Average time per request with the inter-request sleeps taken out.
    pub fn per_request_excluding_delay(&self) -> Duration {
        let sleeps = self.requests.saturating_sub(1) as u32;
        let busy = self.total.saturating_sub(self.delay.saturating_mul(sleeps));
        match u32::try_from(self.requests) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => busy / n,
        }
    }

    /// Summary line matching [`REPORT_HEADER`].
    pub fn csv_line(&self) -> String {
        format!(
            "{:.3},{:.3},{:.3}",
            millis(self.total),
            millis(self.per_request()),
            millis(self.per_request_excluding_delay())
        )
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// The request array: `n, n-1, ..., 1`.
pub fn request_payload(n: usize) -> Vec<i32> {
    (1..=n as i32).rev().collect()
}

/// Run every connection to completion.
pub async fn run(config: &ClientConfig) -> Result<ClientReport, ClientError> {
    info!(
        host = %config.host,
        port = config.port,
        connections = config.connections,
        requests = config.requests,
        payload_size = config.payload_size,
        "Starting client"
    );

    let started = Instant::now();
    let mut connections = JoinSet::new();
    for conn_id in 0..config.connections {
        let config = config.clone();
        connections.spawn(async move {
            let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
            stream.set_nodelay(true)?;
            run_connection(stream, &config).await?;
            debug!(conn_id, "Connection finished");
            Ok::<(), ClientError>(())
        });
    }

    while let Some(joined) = connections.join_next().await {
        joined.map_err(|e| ClientError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
    }

    let report = ClientReport {
        total: started.elapsed(),
        requests: config.requests,
        delay: config.delay,
    };
    info!(total_ms = millis(report.total), "Client finished");
    Ok(report)
}

/// Drive one connection: send, validate, sleep, repeat. Half-closes the
/// stream afterwards so the server sees a graceful end.
pub async fn run_connection<S>(mut stream: S, config: &ClientConfig) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = request_payload(config.payload_size);
    for i in 0..config.requests {
        if i > 0 && !config.delay.is_zero() {
            tokio::time::sleep(config.delay).await;
        }
        let response = exchange(&mut stream, &request).await?;
        validate(&response, config.payload_size)?;
    }
    stream.shutdown().await?;
    Ok(())
}

/// Send one array and read back the response array.
pub async fn exchange<S>(stream: &mut S, values: &[i32]) -> Result<Vec<i32>, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = frame::encode_frame(&ArrayMessage::new(values.to_vec()));
    stream.write_all(&request).await?;
    stream.flush().await?;

    let len = match stream.read_i32().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(ClientError::Closed),
        Err(e) => return Err(e.into()),
    };
    let len = usize::try_from(len).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, format!("negative response length {len}"))
    })?;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(ArrayMessage::decode(body.as_slice())?.values)
}

/// Check that `response` is `1..=n`.
fn validate(response: &[i32], n: usize) -> Result<(), ClientError> {
    if response.len() != n {
        return Err(ClientError::LengthMismatch {
            expected: n,
            actual: response.len(),
        });
    }
    for (index, &actual) in response.iter().enumerate() {
        let expected = index as i32 + 1;
        if actual != expected {
            return Err(ClientError::Mismatch {
                index,
                expected,
                actual,
            });
        }
    }
    Ok(())
}
