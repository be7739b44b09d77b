//! Modbus-TCP inverter scanner CLI
//!
//! Probes a range of Modbus unit ids on a Modbus-TCP server and reports which
//! of them answer like a SunSpec inverter.
//!
//! - Device ids are scanned in chunks, first with a short timeout, then once
//!   more with a long timeout for ids that did not answer conclusively.
//! - With a target count the scan stops as soon as that many inverters were
//!   found.
//! - A lost connection is re-established up to the configured number of
//!   retries; beyond that the scan aborts with a non-zero exit code.
//!
//! The CLI leverages the `sunspec_scan_lib` crate for framing, classification
//! and connection handling.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::panic;
use sunspec_scan_lib::{
    connection::Connection,
    scanner::{ProbeOutcome, ProbeReport, Scanner},
};

mod commandline;
mod config;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Formats up to `max` bytes as hex, appending `...` if bytes were cut off.
fn hex_preview(bytes: &[u8], max: usize) -> String {
    let shown = bytes
        .iter()
        .take(max)
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    if bytes.len() > max {
        format!("{shown}...")
    } else {
        shown
    }
}

fn probe_line(report: &ProbeReport, max_hex: usize) -> String {
    let mut line = format!(
        "Scanning ID: {} ({} pass) ... {}",
        report.device_id, report.pass, report.outcome
    );
    if report.outcome != ProbeOutcome::Timeout {
        line.push_str(&format!(" Received ({} bytes)", report.response.len()));
        if max_hex > 0 {
            line.push_str(&format!(": {}", hex_preview(&report.response, max_hex)));
        }
    }
    line
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "mbscan started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Merge the optional scan profile with the command line
    let profile = match &args.config {
        Some(path) => config::ScanProfile::load(path)
            .with_context(|| format!("Cannot load scan profile {}", path.display()))?,
        None => config::ScanProfile::default(),
    };
    let settings = config::Settings::resolve(&args, profile);
    debug!("Settings: {settings:?}");

    println!(
        "Scanning {}:{} for device IDs {}",
        settings.connection.host, settings.connection.port, settings.device_ids
    );

    // 3. Run the scan, the connection is closed whatever the outcome
    let mut scanner = Scanner::new(
        Connection::new(settings.connection.clone()),
        settings.scan.clone(),
    );
    let result = scanner.scan(&settings.device_ids, |report| {
        println!("{}", probe_line(report, settings.max_hex));
    });
    scanner.finish();
    let summary = result.with_context(|| "Scan aborted")?;

    // 4. Report
    if summary.target_reached {
        println!("Found all {} inverters!", summary.inverter_count());
    }
    println!();
    let inverters = summary
        .inverters
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    println!(
        "Found {} inverter(s) after {} probes{}",
        summary.inverter_count(),
        summary.probes,
        if inverters.is_empty() {
            String::new()
        } else {
            format!(": {inverters}")
        }
    );
    println!("DONE!");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunspec_scan_lib::protocol::DeviceId;
    use sunspec_scan_lib::scanner::Pass;

    fn report(outcome: ProbeOutcome, response: Vec<u8>) -> ProbeReport {
        ProbeReport {
            device_id: DeviceId::try_from(7u8).unwrap(),
            pass: Pass::Fast,
            transaction_id: 1,
            outcome,
            response,
        }
    }

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0x00, 0x1f, 0xab], 8), "00 1f ab");
        assert_eq!(hex_preview(&[0x00, 0x1f, 0xab], 3), "00 1f ab");
        assert_eq!(hex_preview(&[0x00, 0x1f, 0xab], 2), "00 1f...");
        assert_eq!(hex_preview(&[], 4), "");
    }

    #[test]
    fn test_probe_line() {
        assert_eq!(
            probe_line(&report(ProbeOutcome::Timeout, Vec::new()), 4),
            "Scanning ID: 7 (fast pass) ... Timed out"
        );
        assert_eq!(
            probe_line(&report(ProbeOutcome::Unknown, vec![1, 2, 3]), 0),
            "Scanning ID: 7 (fast pass) ... Unknown device Received (3 bytes)"
        );
        assert_eq!(
            probe_line(&report(ProbeOutcome::Inverter, vec![1, 2, 3]), 2),
            "Scanning ID: 7 (fast pass) ... INVERTER Received (3 bytes): 01 02..."
        );
    }
}
