use std::time::Duration;

use clap::Parser;

#[derive(Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Address of the inverter's data logger, for example `10.0.0.5`.
    #[clap(long, env = "SOLIS_ADDRESS")]
    pub address: String,

    /// Serial number the device is expected to report.
    #[clap(long, env = "SOLIS_SERIAL")]
    pub serial: String,

    /// Seconds between scheduled fetches.
    #[clap(long = "scan-interval-secs", default_value = "30", env = "SCAN_INTERVAL_SECS")]
    pub scan_interval_secs: u64,
}

impl Args {
    #[must_use]
    pub const fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_minimal_command_line() {
        let args =
            Args::parse_from(["solis-monitor", "--address", "10.0.0.5", "--serial", "100200300"]);
        assert_eq!(args.address, "10.0.0.5");
        assert_eq!(args.serial, "100200300");
        assert_eq!(args.scan_interval(), Duration::from_secs(30));
    }
}
