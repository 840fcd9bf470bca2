//! Active checks run against one target.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time;

use crate::config::{HealthcheckKind, ProbeProtocol};
use crate::core::Target;
use crate::discovery::exec::run_command;

/// Result of one check run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail(String),
    /// Neither pass nor fail; the tracker is left untouched.
    Unknown(String),
}

/// A configured check strategy.
#[derive(Debug, Clone)]
pub enum Check {
    Ping,
    Probe {
        protocol: ProbeProtocol,
        send: Vec<u8>,
        recv: Vec<u8>,
    },
    Exec {
        command: Vec<String>,
        positive: String,
        negative: String,
    },
}

impl Check {
    /// `None` for `kind = "none"`.
    pub fn from_kind(kind: &HealthcheckKind) -> Option<Self> {
        match kind {
            HealthcheckKind::None => None,
            HealthcheckKind::Ping => Some(Check::Ping),
            HealthcheckKind::Probe {
                probe_protocol,
                probe_send,
                probe_recv,
            } => Some(Check::Probe {
                protocol: *probe_protocol,
                send: probe_send.as_bytes().to_vec(),
                recv: probe_recv.as_bytes().to_vec(),
            }),
            HealthcheckKind::Exec {
                exec_command,
                exec_expected_positive_output,
                exec_expected_negative_output,
            } => Some(Check::Exec {
                command: exec_command.clone(),
                positive: exec_expected_positive_output.clone(),
                negative: exec_expected_negative_output.clone(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Check::Ping => "ping",
            Check::Probe { .. } => "probe",
            Check::Exec { .. } => "exec",
        }
    }

    /// Run once, bounded by `timeout`.
    pub async fn run(&self, target: &Target, timeout: Duration) -> Outcome {
        match time::timeout(timeout, self.run_inner(target)).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Fail(format!("timed out after {:?}", timeout)),
        }
    }

    async fn run_inner(&self, target: &Target) -> Outcome {
        match self {
            Check::Ping => match TcpStream::connect(target.address()).await {
                Ok(_) => Outcome::Pass,
                Err(e) => Outcome::Fail(e.to_string()),
            },
            Check::Probe {
                protocol,
                send,
                recv,
            } => {
                let result = match protocol {
                    ProbeProtocol::Tcp => probe_tcp(target, send, recv.len()).await,
                    ProbeProtocol::Udp => probe_udp(target, send, recv.len()).await,
                };
                match result {
                    Ok(actual) if actual.starts_with(recv) => Outcome::Pass,
                    Ok(actual) => Outcome::Fail(format!(
                        "unexpected reply {:?}",
                        String::from_utf8_lossy(&actual)
                    )),
                    Err(e) => Outcome::Fail(e.to_string()),
                }
            }
            Check::Exec {
                command,
                positive,
                negative,
            } => {
                let mut argv = command.clone();
                argv.push(target.host.clone());
                argv.push(target.port.clone());

                match run_command(&argv).await {
                    Ok(out) => {
                        let out = out.trim();
                        if out == positive {
                            Outcome::Pass
                        } else if out == negative {
                            Outcome::Fail("negative output".to_string())
                        } else {
                            Outcome::Unknown(format!("unexpected output {:?}", out))
                        }
                    }
                    Err(e) => Outcome::Fail(e.to_string()),
                }
            }
        }
    }
}

async fn probe_tcp(target: &Target, send: &[u8], expect: usize) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(target.address()).await?;
    stream.write_all(send).await?;
    let mut buf = vec![0u8; expect];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn probe_udp(target: &Target, send: &[u8], expect: usize) -> std::io::Result<Vec<u8>> {
    let remote = tokio::net::lookup_host(target.address())
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))?;
    let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    socket.send(send).await?;
    let mut buf = vec![0u8; expect.max(1500)];
    let n = socket.recv(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}
