use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::debug;

use crate::context::ProbeContext;
use crate::criteria::ResponseTimeTarget;
use crate::error::{DialError, Result};
use crate::task::{Fields, Probe, RunContext, TaskClass, TaskMeta, Tags, Variable, base_tags, parse_duration, status_of};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSuccess {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_time: Vec<ResponseTimeTarget>,
}

/// Open a TCP connection and measure how long the handshake takes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpTask {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_when: Vec<TcpSuccess>,

    #[serde(skip)]
    timeout_duration: Duration,
    #[serde(skip)]
    elapsed: Option<Duration>,
    #[serde(skip)]
    fail_reason: Option<String>,
}

impl TcpTask {
    fn target(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[async_trait]
impl Probe for TcpTask {
    fn class(&self) -> TaskClass {
        TaskClass::Tcp
    }

    fn metric_name(&self) -> &'static str {
        "tcp_dial_testing"
    }

    fn check(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(DialError::config("host should not be empty"));
        }
        if self.port == 0 {
            return Err(DialError::config("port should not be zero"));
        }
        if !self.timeout.is_empty() {
            parse_duration(&self.timeout)?;
        }
        for success in &self.success_when {
            for rt in &success.response_time {
                rt.validate()?;
            }
        }
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        self.timeout_duration = if self.timeout.is_empty() {
            DEFAULT_TIMEOUT
        } else {
            parse_duration(&self.timeout)?
        };
        Ok(())
    }

    async fn run(&mut self, _ctx: &RunContext<'_>) -> Result<()> {
        let limit = if self.timeout_duration.is_zero() { DEFAULT_TIMEOUT } else { self.timeout_duration };
        let target = self.target();
        let start = Instant::now();

        let outcome = match timeout(limit, TcpStream::connect(&target)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "tcp connection timeout")),
        };

        match outcome {
            Ok(()) => {
                let elapsed = start.elapsed();
                debug!(addr = %target, ?elapsed, "tcp connection established");
                self.elapsed = Some(elapsed);
                Ok(())
            }
            Err(err) => {
                self.fail_reason = Some(format!("tcp connection failed: {err}"));
                Err(DialError::Socket(err))
            }
        }
    }

    fn clear(&mut self) {
        self.elapsed = None;
        self.fail_reason = None;
    }

    fn results(&self, meta: &TaskMeta) -> (Tags, Fields) {
        let (reasons, success) = self.check_result();

        let mut tags = base_tags(meta);
        tags.insert("dest_host".into(), self.host.clone());
        tags.insert("dest_port".into(), self.port.to_string());
        tags.insert("status".into(), status_of(success).into());

        let mut fields = Fields::new();
        let micros = self.elapsed.map(|d| d.as_micros() as u64).unwrap_or_default();
        fields.insert("response_time".into(), json!(micros));
        fields.insert("success".into(), json!(if success { 1 } else { -1 }));

        let mut message = json!({ "response_time": micros });
        if !success {
            let reason = reasons.join(";");
            message["fail_reason"] = Value::String(reason.clone());
            fields.insert("fail_reason".into(), Value::String(reason));
        }
        fields.insert("message".into(), Value::String(message.to_string()));

        (tags, fields)
    }

    fn check_result(&self) -> (Vec<String>, bool) {
        let mut reasons = Vec::new();
        match (&self.fail_reason, self.elapsed) {
            (Some(reason), _) => reasons.push(reason.clone()),
            (None, None) => reasons.push("tcp connection not attempted".to_string()),
            (None, Some(elapsed)) => {
                for success in &self.success_when {
                    reasons.extend(success.response_time.iter().filter_map(|rt| rt.evaluate(elapsed)));
                }
            }
        }
        let success = reasons.is_empty();
        (reasons, success)
    }

    fn variable_value(&self, _variable: &Variable, _ctx: &ProbeContext) -> Result<String> {
        Err(DialError::Unsupported("variable extraction", TaskClass::Tcp))
    }

    fn host_names(&self) -> Result<Vec<String>> {
        Ok(vec![self.host.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::GlobalVars;
    use tokio::net::TcpListener;

    fn task(host: &str, port: u16) -> TcpTask {
        let mut task = TcpTask { host: host.into(), port, ..Default::default() };
        task.init().unwrap();
        task
    }

    #[test]
    fn test_check() {
        assert!(TcpTask { host: "h".into(), port: 80, ..Default::default() }.check().is_ok());
        assert!(TcpTask { host: "".into(), port: 80, ..Default::default() }.check().is_err());
        assert!(TcpTask { host: "h".into(), port: 0, ..Default::default() }.check().is_err());
    }

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ctx = ProbeContext::default();
        let globals = GlobalVars::new();
        let run = RunContext { probe: &ctx, globals: &globals, config_vars: &[] };

        let mut tcp = task("127.0.0.1", port);
        tcp.run(&run).await.unwrap();
        let (reasons, ok) = tcp.check_result();
        assert!(ok, "{reasons:?}");

        let (tags, fields) = tcp.results(&TaskMeta::default());
        assert_eq!(tags["status"], "OK");
        assert_eq!(tags["dest_port"], port.to_string());
        assert_eq!(fields["success"], 1);
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        let ctx = ProbeContext::default();
        let globals = GlobalVars::new();
        let run = RunContext { probe: &ctx, globals: &globals, config_vars: &[] };

        let mut tcp = task("127.0.0.1", 1);
        assert!(tcp.run(&run).await.is_err());
        let (reasons, ok) = tcp.check_result();
        assert!(!ok);
        assert!(reasons[0].starts_with("tcp connection failed"));
    }

    #[test]
    fn test_ipv6_target_is_bracketed() {
        assert_eq!(task("::1", 22).target(), "[::1]:22");
        assert_eq!(task("example.com", 22).target(), "example.com:22");
    }
}
