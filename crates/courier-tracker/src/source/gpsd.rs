//! gpsd client location source.
//!
//! Speaks the gpsd JSON protocol over TCP: after `?WATCH={"enable":true,"json":true}`
//! the daemon streams one JSON report per line. `TPV` reports with a 2D or
//! 3D fix are collected and flushed as one batch per deferred interval.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::{Batcher, FixStream, LocationSource, PermissionState, SourceError, UpdateOptions};
use crate::error::{Error, Result};
use crate::tracking::LocationFix;

/// Default gpsd endpoint.
pub const DEFAULT_GPSD_ADDR: &str = "127.0.0.1:2947";

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// Location source backed by a gpsd daemon.
#[derive(Debug, Clone)]
pub struct GpsdSource {
    addr: String,
    connect_timeout: Duration,
}

impl GpsdSource {
    /// Create a source for the gpsd daemon at `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::subscription(format!("gpsd at {}: {e}", self.addr))),
            Err(_) => Err(Error::subscription(format!(
                "gpsd at {}: connect timed out",
                self.addr
            ))),
        }
    }
}

impl Default for GpsdSource {
    fn default() -> Self {
        Self::new(DEFAULT_GPSD_ADDR, Duration::from_secs(5))
    }
}

#[derive(Debug, Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    time: Option<DateTime<Utc>>,
}

/// Parse one gpsd report line into a fix, if it carries a position.
pub(crate) fn parse_tpv(line: &str) -> Option<LocationFix> {
    let report: Report = serde_json::from_str(line).ok()?;
    if report.class != "TPV" || report.mode < 2 {
        return None;
    }
    Some(LocationFix::new(
        report.lat?,
        report.lon?,
        report.time.unwrap_or_else(Utc::now),
    ))
}

#[async_trait::async_trait]
impl LocationSource for GpsdSource {
    fn name(&self) -> &'static str {
        "gpsd"
    }

    // gpsd has no permission model; a reachable daemon is a granted one.
    async fn request_foreground_permission(&self) -> Result<PermissionState> {
        Ok(match self.connect().await {
            Ok(_) => PermissionState::Granted,
            Err(e) => {
                warn!("{}", e);
                PermissionState::Denied
            }
        })
    }

    async fn request_background_permission(&self) -> Result<PermissionState> {
        Ok(PermissionState::Granted)
    }

    async fn subscribe(&self, options: UpdateOptions) -> Result<FixStream> {
        let mut stream = self.connect().await?;
        stream.write_all(WATCH_COMMAND).await?;
        debug!(addr = %self.addr, "gpsd watch enabled");

        let (tx, fixes) = FixStream::channel(4);
        let addr = self.addr.clone();
        let producer = tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            let mut batcher = Batcher::new(&options);
            let mut flush = tokio::time::interval(options.deferred_interval);
            flush.tick().await;

            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(fix) = parse_tpv(&line) {
                                trace!(lat = fix.latitude, lon = fix.longitude, "gpsd fix");
                                batcher.push(fix);
                            }
                        }
                        Ok(None) => {
                            let _ = tx.send(Err(SourceError::Unavailable(format!("gpsd at {addr} closed the connection")))).await;
                            break;
                        }
                        Err(e) => {
                            let _ = tx.send(Err(SourceError::Unavailable(format!("gpsd at {addr}: {e}")))).await;
                            break;
                        }
                    },
                    _ = flush.tick() => {
                        if let Some(batch) = batcher.take() {
                            if tx.send(Ok(batch)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(fixes.with_producer(producer.abort_handle()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_parse_tpv_with_fix() {
        let line = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":3,"time":"2024-05-01T08:05:00.000Z","lat":10.75,"lon":106.66,"alt":12.0}"#;
        let fix = parse_tpv(line).unwrap();
        assert!((fix.latitude - 10.75).abs() < f64::EPSILON);
        assert!((fix.longitude - 106.66).abs() < f64::EPSILON);
        assert_eq!(fix.timestamp.to_rfc3339(), "2024-05-01T08:05:00+00:00");
    }

    #[test]
    fn test_parse_tpv_rejects_non_fix_reports() {
        assert!(parse_tpv(r#"{"class":"TPV","mode":1}"#).is_none());
        assert!(parse_tpv(r#"{"class":"SKY","satellites":[]}"#).is_none());
        assert!(parse_tpv(r#"{"class":"VERSION","release":"3.25"}"#).is_none());
        assert!(parse_tpv(r#"{"class":"TPV","mode":2,"lat":1.0}"#).is_none());
        assert!(parse_tpv("garbage").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_denied() {
        let source = GpsdSource::new("127.0.0.1:1", Duration::from_millis(200));
        let state = source.request_foreground_permission().await.unwrap();
        assert_eq!(state, PermissionState::Denied);
        assert!(source.subscribe(UpdateOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_streams_batches_from_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"?WATCH="));
            socket
                .write_all(
                    b"{\"class\":\"VERSION\"}\n\
                      {\"class\":\"TPV\",\"mode\":3,\"lat\":10.0,\"lon\":106.0}\n\
                      {\"class\":\"TPV\",\"mode\":3,\"lat\":10.01,\"lon\":106.0}\n",
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            // Closing the socket ends the subscription.
        });

        let source = GpsdSource::new(addr, Duration::from_secs(1));
        let mut stream = source
            .subscribe(UpdateOptions {
                deferred_interval: Duration::from_millis(30),
                distance_interval_m: 0.0,
            })
            .await
            .unwrap();

        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert!((batch[1].latitude - 10.01).abs() < f64::EPSILON);

        let end = stream.next().await.unwrap();
        assert!(matches!(end, Err(SourceError::Unavailable(_))));
        server.await.unwrap();
    }
}
