//! Backend discovery.
//!
//! # Data Flow
//! ```text
//! source (static list, HTTP text, HTTP JSON, command)
//!     → fetch under timeout
//!     → full snapshot → scheduler
//! on failure: failpolicy (keep last / publish empty) → retry after retry_wait
//! interval 0: fetch until the first success, then idle
//! ```

pub mod exec;
pub mod json;
pub mod line;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::{DiscoveryConfig, DiscoveryKind, FailPolicy};
use crate::core::Backend;

pub use json::JsonPatterns;
pub use line::LineParser;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid backend pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("backend pattern must define `host` and `port` groups")]
    PatternGroups,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a json array of backends")]
    NotArray,
    #[error("entry {index}: {message}")]
    Entry { index: usize, message: String },
    #[error("command failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("command exited with {0}")]
    ExitStatus(std::process::ExitStatus),
    #[error("empty command")]
    EmptyCommand,
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug)]
enum Source {
    Static(Vec<Backend>),
    Plaintext {
        endpoint: String,
        parser: LineParser,
        client: reqwest::Client,
    },
    Json {
        endpoint: String,
        patterns: JsonPatterns,
        client: reqwest::Client,
    },
    Exec {
        command: Vec<String>,
        parser: LineParser,
    },
}

/// A configured discovery source, ready to spawn.
#[derive(Debug)]
pub struct Discovery {
    source: Source,
    interval: Option<Duration>,
    timeout: Duration,
    retry_wait: Duration,
    failpolicy: FailPolicy,
}

impl Discovery {
    pub fn new(cfg: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let mut interval = Some(cfg.interval_ms)
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis);

        let source = match cfg.kind {
            DiscoveryKind::Static { static_list } => {
                interval = None;
                let parser = LineParser::default();
                Source::Static(parser.parse_lines(static_list.iter().map(String::as_str)))
            }
            DiscoveryKind::Plaintext {
                plaintext_endpoint,
                plaintext_regex_pattern,
            } => Source::Plaintext {
                endpoint: plaintext_endpoint,
                parser: LineParser::new(plaintext_regex_pattern.as_deref())?,
                client: reqwest::Client::builder().build()?,
            },
            DiscoveryKind::Json {
                json_endpoint,
                json_host_pattern,
                json_port_pattern,
                json_weight_pattern,
                json_priority_pattern,
                json_sni_pattern,
                json_max_connections_pattern,
            } => Source::Json {
                endpoint: json_endpoint,
                patterns: JsonPatterns {
                    host: json_host_pattern,
                    port: json_port_pattern,
                    weight: json_weight_pattern,
                    priority: json_priority_pattern,
                    sni: json_sni_pattern,
                    max_connections: json_max_connections_pattern,
                },
                client: reqwest::Client::builder().build()?,
            },
            DiscoveryKind::Exec { exec_command } => {
                if exec_command.is_empty() {
                    return Err(DiscoveryError::EmptyCommand);
                }
                Source::Exec {
                    command: exec_command,
                    parser: LineParser::default(),
                }
            }
        };

        Ok(Self {
            source,
            interval,
            timeout: Duration::from_millis(cfg.timeout_ms.max(1)),
            retry_wait: Duration::from_millis(cfg.retry_wait_ms),
            failpolicy: cfg.failpolicy,
        })
    }

    fn kind(&self) -> &'static str {
        match self.source {
            Source::Static(_) => "static",
            Source::Plaintext { .. } => "plaintext",
            Source::Json { .. } => "json",
            Source::Exec { .. } => "exec",
        }
    }

    /// Fetch one snapshot.
    pub async fn fetch(&self) -> Result<Vec<Backend>, DiscoveryError> {
        let fetch = async {
            match &self.source {
                Source::Static(backends) => Ok(backends.clone()),
                Source::Plaintext {
                    endpoint,
                    parser,
                    client,
                } => {
                    let body = get_text(client, endpoint).await?;
                    Ok(parser.parse_lines(body.lines()))
                }
                Source::Json {
                    endpoint,
                    patterns,
                    client,
                } => {
                    let body = get_text(client, endpoint).await?;
                    json::parse_backends(&body, patterns)
                }
                Source::Exec { command, parser } => {
                    let out = exec::run_command(command).await?;
                    Ok(parser.parse_lines(out.lines()))
                }
            }
        };

        time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| DiscoveryError::Timeout(self.timeout))?
    }

    /// Publish snapshots to `out` until `stop` is cancelled.
    pub fn spawn(self, out: mpsc::Sender<Vec<Backend>>, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(out, stop))
    }

    async fn run(self, out: mpsc::Sender<Vec<Backend>>, stop: CancellationToken) {
        let kind = self.kind();
        tracing::debug!(kind, "Discovery starting");

        loop {
            let result = tokio::select! {
                _ = stop.cancelled() => return,
                result = self.fetch() => result,
            };

            let wait = match result {
                Ok(backends) => {
                    tracing::debug!(kind, count = backends.len(), "Discovery fetched backends");
                    if !publish(&out, &stop, backends).await {
                        return;
                    }
                    match self.interval {
                        Some(interval) => interval,
                        None => return,
                    }
                }
                Err(e) => {
                    tracing::error!(
                        kind,
                        error = %e,
                        retry_in = ?self.retry_wait,
                        failpolicy = ?self.failpolicy,
                        "Discovery fetch failed"
                    );
                    if self.failpolicy == FailPolicy::Setempty
                        && !publish(&out, &stop, Vec::new()).await
                    {
                        return;
                    }
                    self.retry_wait
                }
            };

            tokio::select! {
                _ = stop.cancelled() => return,
                _ = time::sleep(wait) => {}
            }
        }
    }
}

async fn get_text(client: &reqwest::Client, url: &str) -> Result<String, DiscoveryError> {
    tracing::debug!(url = %url, "Fetching backends");
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DiscoveryError::Status {
            url: url.to_string(),
            status,
        });
    }
    Ok(response.text().await?)
}

async fn publish(
    out: &mpsc::Sender<Vec<Backend>>,
    stop: &CancellationToken,
    backends: Vec<Backend>,
) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        sent = out.send(backends) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::core::Target;

    fn config(kind: DiscoveryKind) -> DiscoveryConfig {
        DiscoveryConfig {
            kind,
            ..DiscoveryConfig::default()
        }
    }

    #[tokio::test]
    async fn static_list_publishes_once() {
        let discovery = Discovery::new(config(DiscoveryKind::Static {
            static_list: vec!["a:1 weight=2".into(), "junk".into(), "b:2".into()],
        }))
        .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let handle = discovery.spawn(tx, CancellationToken::new());

        let backends = rx.recv().await.unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].weight, 2);
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_source_reads_lines() {
        let discovery = Discovery::new(config(DiscoveryKind::Exec {
            exec_command: vec!["sh".into(), "-c".into(), "echo 10.0.0.1:80 priority=3".into()],
        }))
        .unwrap();

        let backends = discovery.fetch().await.unwrap();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].target, Target::new("10.0.0.1", "80"));
        assert_eq!(backends[0].priority, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_source_reads_script_file() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(script, "echo a:1").unwrap();
        writeln!(script, "echo b:2 sni=b.example").unwrap();
        let path = script.path().to_string_lossy().into_owned();

        let discovery = Discovery::new(config(DiscoveryKind::Exec {
            exec_command: vec!["sh".into(), path],
        }))
        .unwrap();
        let backends = discovery.fetch().await.unwrap();
        assert_eq!(backends[1].sni.as_deref(), Some("b.example"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_fetch_times_out() {
        let discovery = Discovery::new(DiscoveryConfig {
            kind: DiscoveryKind::Exec {
                exec_command: vec!["sleep".into(), "5".into()],
            },
            timeout_ms: 50,
            ..DiscoveryConfig::default()
        })
        .unwrap();
        assert!(matches!(
            discovery.fetch().await,
            Err(DiscoveryError::Timeout(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn setempty_publishes_empty_snapshot_on_failure() {
        let discovery = Discovery::new(DiscoveryConfig {
            kind: DiscoveryKind::Exec {
                exec_command: vec!["false".into()],
            },
            retry_wait_ms: 10,
            failpolicy: FailPolicy::Setempty,
            ..DiscoveryConfig::default()
        })
        .unwrap();

        let stop = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = discovery.spawn(tx, stop.clone());

        assert!(rx.recv().await.unwrap().is_empty());
        assert!(rx.recv().await.unwrap().is_empty());
        stop.cancel();
        handle.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn keeplast_publishes_nothing_on_failure() {
        let discovery = Discovery::new(DiscoveryConfig {
            kind: DiscoveryKind::Exec {
                exec_command: vec!["false".into()],
            },
            retry_wait_ms: 10,
            ..DiscoveryConfig::default()
        })
        .unwrap();

        let stop = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = discovery.spawn(tx, stop.clone());

        let waited = time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(waited.is_err());
        stop.cancel();
        handle.await.unwrap();
    }

    async fn serve_once(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}/backends", addr)
    }

    #[tokio::test]
    async fn plaintext_source_fetches_over_http() {
        let endpoint = serve_once("127.0.0.1:9000 weight=7\n127.0.0.1:9001\n").await;
        let discovery = Discovery::new(config(DiscoveryKind::Plaintext {
            plaintext_endpoint: endpoint,
            plaintext_regex_pattern: None,
        }))
        .unwrap();

        let backends = discovery.fetch().await.unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].weight, 7);
    }

    #[tokio::test]
    async fn json_source_fetches_over_http() {
        let endpoint = serve_once(r#"[{"host":"127.0.0.1","port":9000,"max_connections":3}]"#).await;
        let discovery = Discovery::new(config(DiscoveryKind::Json {
            json_endpoint: endpoint,
            json_host_pattern: "host".into(),
            json_port_pattern: "port".into(),
            json_weight_pattern: "weight".into(),
            json_priority_pattern: "priority".into(),
            json_sni_pattern: "sni".into(),
            json_max_connections_pattern: "max_connections".into(),
        }))
        .unwrap();

        let backends = discovery.fetch().await.unwrap();
        assert_eq!(backends[0].max_connections, 3);
    }

    #[test]
    fn empty_exec_command_is_rejected() {
        assert!(matches!(
            Discovery::new(config(DiscoveryKind::Exec { exec_command: vec![] })),
            Err(DiscoveryError::EmptyCommand)
        ));
    }

    #[test]
    fn invalid_plaintext_pattern_is_rejected() {
        assert!(Discovery::new(config(DiscoveryKind::Plaintext {
            plaintext_endpoint: "http://127.0.0.1:1/".into(),
            plaintext_regex_pattern: Some("(".into()),
        }))
        .is_err());
    }
}
