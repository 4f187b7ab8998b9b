use std::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{DialError, Result};
use crate::icmp::{IcmpProber, IcmpSequencer, IpPreference};
use crate::script::ScriptEngine;

/// Tunables for the shared probing resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Upper bound on ICMP probes in flight across all tasks.
    pub max_icmp_concurrency: usize,
    pub ip_preference: IpPreference,
    /// Operation budget of a single post-script invocation.
    pub script_max_operations: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_icmp_concurrency: 1000,
            ip_preference: IpPreference::default(),
            script_max_operations: 1_000_000,
        }
    }
}

/// Process-wide resources handed to every run: the script engine, the ICMP
/// prober and the ICMP concurrency gate.
pub struct ProbeContext {
    config: ProbeConfig,
    scripts: ScriptEngine,
    icmp: IcmpProber,
    icmp_gate: Semaphore,
}

impl ProbeContext {
    pub fn new(config: ProbeConfig) -> Self {
        let sequencer = Arc::new(IcmpSequencer::new());
        Self {
            scripts: ScriptEngine::new(config.script_max_operations),
            icmp: IcmpProber::new(sequencer, config.ip_preference),
            icmp_gate: Semaphore::new(config.max_icmp_concurrency.max(1)),
            config,
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn scripts(&self) -> &ScriptEngine {
        &self.scripts
    }

    pub fn icmp(&self) -> &IcmpProber {
        &self.icmp
    }

    pub async fn acquire_icmp_permit(&self) -> Result<SemaphorePermit<'_>> {
        self.icmp_gate
            .acquire()
            .await
            .map_err(|_| DialError::Socket(io::Error::other("icmp gate closed")))
    }
}

impl Default for ProbeContext {
    fn default() -> Self {
        Self::new(ProbeConfig::default())
    }
}

impl fmt::Debug for ProbeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeContext")
            .field("config", &self.config)
            .field("icmp_permits", &self.icmp_gate.available_permits())
            .finish_non_exhaustive()
    }
}
