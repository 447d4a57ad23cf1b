//! Device transport
//!
//! The link adapter opens its device through a [`Connector`], so the serial
//! port used in production can be swapped for an in-memory stream.

use crate::error::LinkError;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// A byte-oriented duplex stream to the adapter
pub trait DeviceStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DeviceStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens the device at a path
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<Box<dyn DeviceStream>, LinkError>> + Send;
}

/// Opens a pre-bound serial device (e.g. `/dev/rfcomm0`) with tokio-serial
#[derive(Debug, Clone)]
pub struct SerialConnector {
    /// Baud rate for serial communication
    pub baud_rate: u32,
    /// Upper bound on how long opening the device may take
    pub connect_timeout: Duration,
}

impl SerialConnector {
    pub fn new(baud_rate: u32, connect_timeout: Duration) -> Self {
        Self {
            baud_rate,
            connect_timeout,
        }
    }
}

impl Connector for SerialConnector {
    fn open(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<Box<dyn DeviceStream>, LinkError>> + Send {
        let path = path.to_string();
        let baud_rate = self.baud_rate;
        let connect_timeout = self.connect_timeout;

        async move {
            if !Path::new(&path).exists() {
                return Err(LinkError::DeviceAbsent(path));
            }

            debug!("Opening {} at {} baud", path, baud_rate);
            let builder = tokio_serial::new(path.as_str(), baud_rate).timeout(connect_timeout);

            // Opening an RFCOMM tty blocks until the radio link is up
            let open = tokio::task::spawn_blocking(move || {
                tokio_serial::SerialPortBuilderExt::open_native_async(builder)
            });

            let stream = match tokio::time::timeout(connect_timeout, open).await {
                Err(_) => {
                    return Err(LinkError::OpenTimeout {
                        path,
                        timeout_ms: connect_timeout.as_millis() as u64,
                    })
                }
                Ok(Err(join_err)) => {
                    return Err(LinkError::Open {
                        path,
                        reason: join_err.to_string(),
                    })
                }
                Ok(Ok(Err(serial_err))) => {
                    return Err(LinkError::Open {
                        path,
                        reason: serial_err.to_string(),
                    })
                }
                Ok(Ok(Ok(stream))) => stream,
            };

            info!("Opened serial device {}", path);
            Ok(Box::new(stream) as Box<dyn DeviceStream>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_device_is_absent() {
        let connector = SerialConnector::new(38400, Duration::from_millis(100));
        let result = connector.open("/dev/definitely-not-an-obd-adapter").await;
        assert!(matches!(result, Err(LinkError::DeviceAbsent(_))));
    }
}
