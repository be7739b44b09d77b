//! Two-tier scan over a set of device ids.
//!
//! The sorted id set is cut into chunks. Every id of a chunk is probed once
//! with the short fast timeout; ids whose reply was not conclusive (a
//! timeout or an unrecognised reply) are probed a second time with the slow
//! timeout before the next chunk starts. When a target inverter count is set
//! the scan stops right after the probe that reaches it.
//!
//! ```no_run
//! use sunspec_scan_lib::connection::{Connection, ConnectionConfig};
//! use sunspec_scan_lib::protocol::DeviceIds;
//! use sunspec_scan_lib::scanner::{ScanConfig, Scanner};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::new(ConnectionConfig::new("192.168.1.20"));
//!     let mut scanner = Scanner::new(connection, ScanConfig::default().with_target_count(2));
//!     let ids: DeviceIds = "1-10".parse()?;
//!     let summary = scanner.scan(&ids, |report| println!("{report:?}"))?;
//!     println!("Found {} inverters", summary.inverter_count());
//!     Ok(())
//! }
//! ```

use crate::connection::{Reply, Transport};
use crate::error::Result;
use crate::protocol::{classify, DeviceId, DeviceIds, DeviceKind, RequestFrame, TransactionCounter};
use log::*;
use std::fmt;
use std::time::Duration;

/// Chunk size used when no target count is given.
pub const DEFAULT_CHUNK_SIZE: usize = 4;
pub const DEFAULT_FAST_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_SLOW_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Read timeout of the first pass over a chunk.
    pub fast_timeout: Duration,
    /// Read timeout of the second pass over inconclusive ids.
    pub slow_timeout: Duration,
    /// Stop once this many inverters were found. `None` scans every id.
    pub target: Option<usize>,
    /// Overrides the chunk size derived from `target`.
    pub chunk_size: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            fast_timeout: DEFAULT_FAST_TIMEOUT,
            slow_timeout: DEFAULT_SLOW_TIMEOUT,
            target: None,
            chunk_size: None,
        }
    }
}

impl ScanConfig {
    /// Sets the target from a signed count where `<= 0` means exhaustive.
    pub fn with_target_count(mut self, count: i64) -> Self {
        self.target = usize::try_from(count).ok().filter(|count| *count > 0);
        self
    }

    /// Ids per chunk: one and a half times the target, or
    /// [`DEFAULT_CHUNK_SIZE`] for an exhaustive scan.
    pub fn chunk_size(&self) -> usize {
        if let Some(size) = self.chunk_size.filter(|size| *size > 0) {
            return size;
        }
        match self.target {
            Some(target) if target > 0 => (target.saturating_mul(3) / 2).max(1),
            _ => DEFAULT_CHUNK_SIZE,
        }
    }

    fn timeout(&self, pass: Pass) -> Duration {
        match pass {
            Pass::Fast => self.fast_timeout,
            Pass::Slow => self.slow_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    Fast,
    Slow,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::Fast => write!(f, "fast"),
            Pass::Slow => write!(f, "slow"),
        }
    }
}

/// Result of probing one device id once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeOutcome {
    Timeout,
    Unknown,
    NonInverter,
    Inverter,
}

impl ProbeOutcome {
    /// Conclusive outcomes are never probed again.
    pub fn is_conclusive(&self) -> bool {
        matches!(self, ProbeOutcome::Inverter | ProbeOutcome::NonInverter)
    }
}

impl From<DeviceKind> for ProbeOutcome {
    fn from(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Unknown => ProbeOutcome::Unknown,
            DeviceKind::NonInverter => ProbeOutcome::NonInverter,
            DeviceKind::Inverter => ProbeOutcome::Inverter,
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Timeout => write!(f, "Timed out"),
            ProbeOutcome::Unknown => write!(f, "{}", DeviceKind::Unknown),
            ProbeOutcome::NonInverter => write!(f, "{}", DeviceKind::NonInverter),
            ProbeOutcome::Inverter => write!(f, "{}", DeviceKind::Inverter),
        }
    }
}

/// Everything known about a single probe, handed to the caller after each
/// exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub device_id: DeviceId,
    pub pass: Pass,
    pub transaction_id: u16,
    pub outcome: ProbeOutcome,
    /// Raw reply, empty on timeout.
    pub response: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Ids classified as inverters, in the order they were found.
    pub inverters: Vec<DeviceId>,
    /// Ids that answered with a valid header but are not inverters.
    pub non_inverters: Vec<DeviceId>,
    /// Number of requests sent.
    pub probes: usize,
    /// The scan stopped early because the target count was reached.
    pub target_reached: bool,
}

impl ScanSummary {
    pub fn inverter_count(&self) -> usize {
        self.inverters.len()
    }

    fn record(&mut self, report: &ProbeReport) {
        self.probes += 1;
        match report.outcome {
            ProbeOutcome::Inverter => self.inverters.push(report.device_id),
            ProbeOutcome::NonInverter => self.non_inverters.push(report.device_id),
            ProbeOutcome::Timeout | ProbeOutcome::Unknown => {}
        }
    }
}

/// Drives a scan session over one [`Transport`].
///
/// The scanner owns the session state: the transport and the transaction
/// counter. Transaction ids are never reused within a session, slow pass
/// probes included.
#[derive(Debug)]
pub struct Scanner<T: Transport> {
    transport: T,
    config: ScanConfig,
    counter: TransactionCounter,
}

impl<T: Transport> Scanner<T> {
    pub fn new(transport: T, config: ScanConfig) -> Self {
        Self {
            transport,
            config,
            counter: TransactionCounter::new(),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The id carried by the most recent request.
    pub fn last_transaction_id(&self) -> u16 {
        self.counter.current()
    }

    /// Closes the transport and hands it back.
    pub fn finish(mut self) -> T {
        self.transport.close();
        self.transport
    }

    /// Scans `ids`, calling `on_probe` after every exchange.
    ///
    /// Returns the aggregated result, also when the target was not reached.
    /// An error means the transport gave up and the scan was aborted; probes
    /// reported up to then stay valid.
    pub fn scan<F>(&mut self, ids: &DeviceIds, mut on_probe: F) -> Result<ScanSummary>
    where
        F: FnMut(&ProbeReport),
    {
        let chunk_size = self.config.chunk_size();
        let mut summary = ScanSummary::default();
        info!(
            "Scanning {} device ids ({ids}) in chunks of {chunk_size}, target {:?}",
            ids.len(),
            self.config.target
        );

        for chunk in ids.chunks(chunk_size) {
            let mut inconclusive = Vec::new();
            for &device_id in chunk {
                let report = self.probe(device_id, Pass::Fast)?;
                if !report.outcome.is_conclusive() {
                    inconclusive.push(device_id);
                }
                if self.record(&mut summary, &report, &mut on_probe) {
                    return Ok(summary);
                }
            }

            if !inconclusive.is_empty() {
                debug!("Retrying {} ids with slow timeout", inconclusive.len());
            }
            for device_id in inconclusive {
                let report = self.probe(device_id, Pass::Slow)?;
                if self.record(&mut summary, &report, &mut on_probe) {
                    return Ok(summary);
                }
            }
        }

        info!(
            "Scan complete: {} inverters after {} probes",
            summary.inverter_count(),
            summary.probes
        );
        Ok(summary)
    }

    /// Adds `report` to the summary and tells whether the target is met.
    fn record<F>(&self, summary: &mut ScanSummary, report: &ProbeReport, on_probe: &mut F) -> bool
    where
        F: FnMut(&ProbeReport),
    {
        summary.record(report);
        on_probe(report);
        match self.config.target {
            Some(target) if summary.inverter_count() >= target => {
                info!("Found all {target} inverters after {} probes", summary.probes);
                summary.target_reached = true;
                true
            }
            _ => false,
        }
    }

    fn probe(&mut self, device_id: DeviceId, pass: Pass) -> Result<ProbeReport> {
        let request = RequestFrame::next(device_id, &mut self.counter);
        let timeout = self.config.timeout(pass);
        debug!(
            "Probing device id {device_id} ({pass} pass, transaction {}, timeout {timeout:?})",
            request.transaction_id()
        );
        let (outcome, response) = match self.transport.exchange(&request, timeout)? {
            Reply::Timeout => (ProbeOutcome::Timeout, Vec::new()),
            Reply::Response(bytes) => (classify(request.as_bytes(), &bytes).into(), bytes),
        };
        Ok(ProbeReport {
            device_id,
            pass,
            transaction_id: request.transaction_id(),
            outcome,
            response,
        })
    }
}
