use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;

#[derive(Clone, Debug, Parser)]
#[command(version, about = "mdb-server (managed-runtime debugger backend)")]
pub struct Options {
    /// Target executable to spawn under the debugger.
    pub executable: Option<PathBuf>,
    /// Arguments passed to the target.
    pub args: Vec<String>,
    /// Attach to a running process instead of spawning.
    #[arg(long, short = 'p', required = false)]
    pub pid: Option<i32>,
    /// Working directory for the spawned target.
    #[arg(long, required = false)]
    pub cwd: Option<PathBuf>,
    /// Capture the target's stdout/stderr through the I/O worker.
    #[arg(long)]
    pub redirect: bool,
    /// Breakpoint addresses (hex) to insert before the first continue.
    #[arg(long = "break", value_name = "ADDR")]
    pub breakpoints: Vec<String>,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if let Some(pid) = self.pid
            && pid <= 0
        {
            return Err(anyhow!("PID must be greater than zero: {:?}", pid));
        }
        if self.executable.is_none() && self.pid.is_none() {
            return Err(anyhow!("either an executable or --pid is required"));
        }
        if self.executable.is_some() && self.pid.is_some() {
            return Err(anyhow!("an executable and --pid are mutually exclusive"));
        }
        Ok(())
    }
}

/// Parse a breakpoint address, with or without the `0x` prefix.
pub fn parse_address(s: &str) -> Result<u64> {
    let trimmed = s.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).map_err(|e| anyhow!("bad address {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::parse_address;

    #[test]
    fn addresses_parse_with_and_without_prefix() {
        assert_eq!(parse_address("0x400100").unwrap(), 0x400100);
        assert_eq!(parse_address("400100").unwrap(), 0x400100);
        assert!(parse_address("zz").is_err());
    }
}
