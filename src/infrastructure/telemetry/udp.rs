//! Fire-and-forget UDP writer for an InfluxDB UDP listener

use crate::domain::models::Reading;
use crate::domain::settings::TelemetrySettings;
use crate::infrastructure::telemetry::line_protocol::{join_lines, Point};
use crate::infrastructure::telemetry::ReadingSink;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, error};

pub struct UdpSink {
    socket: UdpSocket,
    measurement: String,
}

impl UdpSink {
    /// Resolves the collector once and connects a local socket to it
    pub async fn connect(settings: &TelemetrySettings) -> io::Result<Self> {
        let target = lookup_host((settings.host.as_str(), settings.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} did not resolve", settings.host),
                )
            })?;
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        debug!("Telemetry to udp://{}", target);
        Ok(Self {
            socket,
            measurement: settings.measurement.clone(),
        })
    }

    /// Sends `lines` as one datagram. Failures are logged, never returned.
    pub async fn write_many(&self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let payload = join_lines(lines.iter().map(String::as_str));
        debug!("Sending {} point(s), {} bytes", lines.len(), payload.len());
        if let Err(e) = self.socket.send(payload.as_bytes()).await {
            error!("Telemetry send failed: {}", e);
        }
    }
}

impl ReadingSink for UdpSink {
    async fn publish(&self, readings: &[Reading]) {
        let lines: Vec<String> = readings
            .iter()
            .filter(|r| !r.fields.is_empty())
            .map(|r| Point::from_reading(&self.measurement, r).to_line())
            .collect();
        self.write_many(&lines).await;
    }
}
