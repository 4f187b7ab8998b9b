mod packet;
mod probe;
mod resolve;
mod sequence;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::context::ProbeContext;
use crate::criteria::{ResponseTimeTarget, RttFunc, ValueTarget};
use crate::error::{DialError, Result};
use crate::task::{Fields, Probe, RunContext, TaskClass, TaskMeta, Tags, Variable, base_tags, parse_duration, status_of};

pub use packet::{
    ECHO_PAYLOAD, EchoMatcher, ICMPV4_ECHO_REPLY, ICMPV4_ECHO_REQUEST, ICMPV6_ECHO_REPLY, ICMPV6_ECHO_REQUEST,
    IcmpFamily, ReplyMatch, checksum, encode_echo, ipv4_payload,
};
pub use probe::{EchoSocket, IcmpProber, await_reply};
pub use resolve::{IpPreference, choose_address, resolve_target};
pub use sequence::IcmpSequencer;

const DEFAULT_PACKET_COUNT: u32 = 3;
const MAX_PACKET_COUNT: u32 = 100;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

fn default_packet_count() -> u32 {
    DEFAULT_PACKET_COUNT
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IcmpSuccess {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_time: Vec<ResponseTimeTarget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packet_loss_percent: Vec<ValueTarget>,
}

/// Round-trip statistics of one run, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RttStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
}

impl RttStats {
    fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        let n = ms.len() as f64;
        let avg = ms.iter().sum::<f64>() / n;
        let variance = ms.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n;
        Self {
            avg,
            min: ms.iter().copied().fold(f64::INFINITY, f64::min),
            max: ms.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            std: variance.sqrt(),
        }
    }

    fn get(&self, func: RttFunc) -> f64 {
        match func {
            RttFunc::Avg => self.avg,
            RttFunc::Min => self.min,
            RttFunc::Max => self.max,
            RttFunc::Std => self.std,
        }
    }
}

/// Ping a host `packet_count` times.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IcmpTask {
    pub host: String,
    #[serde(default = "default_packet_count")]
    pub packet_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_when: Vec<IcmpSuccess>,

    #[serde(skip)]
    timeout_duration: Duration,
    #[serde(skip)]
    rtts: Vec<Duration>,
    #[serde(skip)]
    sent: u32,
}

impl IcmpTask {
    pub fn stats(&self) -> RttStats {
        RttStats::from_samples(&self.rtts)
    }

    pub fn packets_received(&self) -> usize {
        self.rtts.len()
    }

    pub fn packet_loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 100.0;
        }
        let lost = f64::from(self.sent) - self.rtts.len() as f64;
        lost * 100.0 / f64::from(self.sent)
    }

    fn probe_timeout(&self) -> Duration {
        if self.timeout_duration.is_zero() { DEFAULT_TIMEOUT } else { self.timeout_duration }
    }
}

#[async_trait]
impl Probe for IcmpTask {
    fn class(&self) -> TaskClass {
        TaskClass::Icmp
    }

    fn metric_name(&self) -> &'static str {
        "icmp_dial_testing"
    }

    fn check(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(DialError::config("host should not be empty"));
        }
        if !(1..=MAX_PACKET_COUNT).contains(&self.packet_count) {
            return Err(DialError::config(format!(
                "packet_count should be between 1 and {MAX_PACKET_COUNT}, got {}",
                self.packet_count
            )));
        }
        if !self.timeout.is_empty() {
            parse_duration(&self.timeout)?;
        }
        for success in &self.success_when {
            for rt in &success.response_time {
                rt.validate()?;
            }
            for loss in &success.packet_loss_percent {
                loss.validate()?;
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

    async fn run(&mut self, ctx: &RunContext<'_>) -> Result<()> {
        let limit = self.probe_timeout();
        for _ in 0..self.packet_count {
            let _permit = ctx.probe.acquire_icmp_permit().await?;
            self.sent += 1;
            let (rtt, ok) = ctx.probe.icmp().probe(limit, &self.host).await;
            if ok {
                self.rtts.push(rtt);
            } else {
                warn!(host = %self.host, "echo request got no reply");
            }
        }
        debug!(host = %self.host, sent = self.sent, received = self.rtts.len(), "icmp run finished");
        Ok(())
    }

    fn clear(&mut self) {
        self.rtts.clear();
        self.sent = 0;
    }

    fn results(&self, meta: &TaskMeta) -> (Tags, Fields) {
        let (reasons, success) = self.check_result();
        let stats = self.stats();

        let mut tags = base_tags(meta);
        tags.insert("dest_host".into(), self.host.clone());
        tags.insert("status".into(), status_of(success).into());

        let mut fields = Fields::new();
        fields.insert("average_round_trip_time".into(), json!(stats.avg));
        fields.insert("min_round_trip_time".into(), json!(stats.min));
        fields.insert("max_round_trip_time".into(), json!(stats.max));
        fields.insert("std_round_trip_time".into(), json!(stats.std));
        fields.insert("packets_sent".into(), json!(self.sent));
        fields.insert("packets_received".into(), json!(self.rtts.len()));
        fields.insert("packet_loss_percent".into(), json!(self.packet_loss_percent()));
        fields.insert("success".into(), json!(if success { 1 } else { -1 }));

        let mut message = json!({
            "average_round_trip_time": stats.avg,
            "packet_loss_percent": self.packet_loss_percent(),
        });
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
        if self.rtts.is_empty() {
            reasons.push(format!("all {} packets lost", self.sent));
        }

        let stats = self.stats();
        let loss = self.packet_loss_percent();
        for success in &self.success_when {
            for rt in &success.response_time {
                let func = rt.func.parse::<RttFunc>().unwrap_or(RttFunc::Avg);
                let actual = Duration::from_secs_f64(stats.get(func).max(0.0) / 1000.0);
                if let Some(reason) = rt.evaluate(actual) {
                    reasons.push(format!("{func} {reason}"));
                }
            }
            for target in &success.packet_loss_percent {
                if let Some(reason) = target.evaluate("packet loss percent", loss) {
                    reasons.push(reason);
                }
            }
        }

        let success = reasons.is_empty();
        (reasons, success)
    }

    fn variable_value(&self, _variable: &Variable, _ctx: &ProbeContext) -> Result<String> {
        Err(DialError::Unsupported("variable extraction", TaskClass::Icmp))
    }

    fn host_names(&self) -> Result<Vec<String>> {
        Ok(vec![self.host.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(json: Value) -> IcmpTask {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_defaults_and_check() {
        let t = task(json!({ "host": "localhost" }));
        assert_eq!(t.packet_count, 3);
        assert!(t.check().is_ok());

        assert!(task(json!({ "host": "" })).check().is_err());
        assert!(task(json!({ "host": "a", "packet_count": 0 })).check().is_err());
        assert!(task(json!({ "host": "a", "packet_count": 101 })).check().is_err());
        assert!(task(json!({ "host": "a", "timeout": "later" })).check().is_err());
    }

    #[test]
    fn test_stats() {
        let stats = RttStats::from_samples(&[
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(30),
        ]);
        assert!((stats.avg - 20.0).abs() < 1e-9);
        assert!((stats.min - 10.0).abs() < 1e-9);
        assert!((stats.max - 30.0).abs() < 1e-9);
        assert!((stats.std - 8.164_965_809).abs() < 1e-6);
    }

    #[test]
    fn test_check_result_thresholds() {
        let mut t = task(json!({
            "host": "localhost",
            "success_when": [{
                "response_time": [{ "func": "avg", "op": "lt", "target": "15ms" }],
                "packet_loss_percent": [{ "op": "leq", "target": 0.0 }],
            }]
        }));
        t.sent = 2;
        t.rtts = vec![Duration::from_millis(10), Duration::from_millis(12)];
        let (reasons, ok) = t.check_result();
        assert!(ok, "{reasons:?}");

        t.sent = 3;
        let (reasons, ok) = t.check_result();
        assert!(!ok);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].starts_with("packet loss percent"));
    }

    #[test]
    fn test_no_replies_is_failure() {
        let mut t = task(json!({ "host": "localhost" }));
        t.sent = 3;
        let (reasons, ok) = t.check_result();
        assert!(!ok);
        assert_eq!(reasons, vec!["all 3 packets lost".to_string()]);

        let (tags, fields) = t.results(&TaskMeta { name: "ping".into(), ..Default::default() });
        assert_eq!(tags["status"], "FAIL");
        assert_eq!(fields["success"], -1);
        assert_eq!(fields["packet_loss_percent"], 100.0);
    }
}
