use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;
use sunspec_scan_lib::{connection as conn, protocol as proto};

fn parse_device_ids(s: &str) -> Result<proto::DeviceIds, String> {
    s.parse::<proto::DeviceIds>().map_err(|e| e.to_string())
}

fn parse_port(s: &str) -> Result<u16, String> {
    clap_num::number_range(s, conn::PORT_MIN, conn::PORT_MAX)
}

fn parse_retries(s: &str) -> Result<u8, String> {
    clap_num::number_range(s, 0, conn::RETRIES_MAX)
}

fn parse_chunk_size(s: &str) -> Result<usize, String> {
    clap_num::number_range(s, 1, proto::DeviceId::MAX as usize)
}

/// Accepts plain seconds ("2.5") or a humantime duration ("500ms").
pub(crate) fn parse_timeout(s: &str) -> Result<Duration, String> {
    let timeout = match s.trim().parse::<f64>() {
        Ok(seconds) if (0.0..=conn::TIMEOUT_MAX.as_secs_f64()).contains(&seconds) => {
            Duration::from_secs_f64(seconds)
        }
        Ok(_) => return Err(format!("{s} must be between 0.0 and 60.0 seconds")),
        Err(_) => humantime::parse_duration(s.trim())
            .map_err(|e| format!("Invalid timeout format: {e}"))?,
    };
    if timeout > conn::TIMEOUT_MAX {
        return Err(format!("{s} must be between 0.0 and 60.0 seconds"));
    }
    Ok(timeout)
}

const fn about_text() -> &'static str {
    "Performs a scan of Modbus-TCP device IDs looking for SunSpec inverters."
}

#[derive(Parser, Debug)]
#[command(name = "mbscan", author, version, about = about_text(), long_about = None)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// The Modbus-TCP server to query (IP address or host name).
    pub host: String,

    /// The number of inverters to find. Use <= 0 to scan all device IDs.
    /// Default is -1.
    #[arg(allow_negative_numbers = true, verbatim_doc_comment)]
    pub count: Option<i64>,

    /// The device IDs to scan: comma-separated IDs or hyphenated ranges,
    /// e.g. "1,2,4-7,10". Default is 1-247.
    #[arg(short, long, value_parser = parse_device_ids, verbatim_doc_comment)]
    pub device_ids: Option<proto::DeviceIds>,

    /// The port number (1024-49151) of the Modbus-TCP server. Default is 1502.
    #[arg(short, long, value_parser = parse_port)]
    pub port: Option<u16>,

    /// Read timeout of the fast pass. Seconds ("0.5") or a duration ("500ms").
    /// Default is 0.5s.
    #[arg(short, long, value_parser = parse_timeout, verbatim_doc_comment)]
    pub fast_timeout: Option<Duration>,

    /// Read timeout of the slow pass over unresolved IDs. Default is 3.0s.
    #[arg(short = 't', long = "timeout", value_parser = parse_timeout)]
    pub slow_timeout: Option<Duration>,

    /// Timeout of a single connect attempt. Default is 3.0s.
    #[arg(short, long, value_parser = parse_timeout)]
    pub connect_timeout: Option<Duration>,

    /// The number of retries (0-10) on a communication failure. Default is 3.
    #[arg(short, long, value_parser = parse_retries)]
    pub retries: Option<u8>,

    /// Pause after a failed connection attempt, e.g. "1s". Default is 1s.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub retry_delay: Option<Duration>,

    /// IDs per chunk. Default is 1.5 times the count, or 4 for a full scan.
    #[arg(long, value_parser = parse_chunk_size)]
    pub chunk_size: Option<usize>,

    /// The maximum length of the response hex dump.
    /// Use <= 0 to not dump responses. Default is -1.
    #[arg(short = 'x', long, allow_negative_numbers = true, verbatim_doc_comment)]
    pub max_hex: Option<i64>,

    /// YAML scan profile providing defaults for every option above.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timeout_accepts_seconds_and_durations() {
        assert_eq!(parse_timeout("3.0"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_timeout("0"), Ok(Duration::ZERO));
        assert_eq!(parse_timeout("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_timeout("60"), Ok(Duration::from_secs(60)));
        assert!(parse_timeout("60.5").is_err());
        assert!(parse_timeout("-1").is_err());
        assert!(parse_timeout("2min").is_err());
        assert!(parse_timeout("soon").is_err());
    }

    #[test]
    fn parse_port_range() {
        assert!(parse_port("1023").is_err());
        assert_eq!(parse_port("1024"), Ok(1024));
        assert_eq!(parse_port("49151"), Ok(49151));
        assert!(parse_port("49152").is_err());
    }

    #[test]
    fn parse_retries_range() {
        assert_eq!(parse_retries("0"), Ok(0));
        assert_eq!(parse_retries("10"), Ok(10));
        assert!(parse_retries("11").is_err());
    }

    #[test]
    fn parse_full_commandline() {
        let args = CliArgs::try_parse_from([
            "mbscan", "192.168.1.20", "-1", "-d", "1-3,7", "-p", "1502", "-f", "250ms", "-t",
            "2.5", "-r", "0", "-x", "16",
        ])
        .unwrap();
        assert_eq!(args.host, "192.168.1.20");
        assert_eq!(args.count, Some(-1));
        assert_eq!(args.device_ids.unwrap().to_string(), "1-3,7");
        assert_eq!(args.port, Some(1502));
        assert_eq!(args.fast_timeout, Some(Duration::from_millis(250)));
        assert_eq!(args.slow_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(args.retries, Some(0));
        assert_eq!(args.max_hex, Some(16));
        assert_eq!(args.connect_timeout, None);
    }

    #[test]
    fn reject_invalid_device_ids() {
        assert!(CliArgs::try_parse_from(["mbscan", "host", "-d", "0-5"]).is_err());
        assert!(CliArgs::try_parse_from(["mbscan", "host", "-d", "5-1"]).is_err());
        assert!(CliArgs::try_parse_from(["mbscan", "host", "-d", "1-2-3"]).is_err());
    }
}
