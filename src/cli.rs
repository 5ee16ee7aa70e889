use std::env;
use std::process;

use crate::config::Job;

/// Prints usage instructions for the program.
///
/// Uses `PROGRAM_NAME` constant from `crate` for the executable name.
pub fn print_usage() {
    println!(
        "Usage: {} [-h] [-v] [-V] [-c] [-l logfile] [-o results] [-p parallel] [-t connect_timeout] [--insecure-skip-verify] jobs_file",
        crate::PROGRAM_NAME
    );
}

/// Command-line options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    /// Log every control-channel line for every job (-V)
    pub verbose: bool,
    /// Continue after failed items unless a job says otherwise (-c)
    pub continue_on_fail: bool,
    /// Log file, stderr when None (-l)
    pub log_file: Option<String>,
    /// Results file, stdout when None (-o)
    pub output_file: Option<String>,
    /// Number of sessions run at the same time (-p)
    pub parallel: usize,
    /// Connect timeout in seconds overriding the jobs file (-t)
    pub connect_timeout: Option<u64>,
    /// Disable server certificate verification (--insecure-skip-verify)
    pub insecure_skip_verify: bool,
    pub jobs_file: String,
}

impl Args {
    /// Applies the command-line overrides to a parsed job
    pub fn apply_overrides(&self, job: &mut Job) {
        if self.verbose {
            job.connection.verbose = true;
        }
        if let Some(timeout) = self.connect_timeout {
            job.connection.timeouts.connect = timeout;
        }
        if self.insecure_skip_verify {
            job.connection.tls.reject_unauthorized = false;
        }
    }
}

/// Parses command line arguments
///
/// Prints usage and exits on `-h`, `-v` and on invalid input.
///
/// # Example
/// ```text
/// // let args = parse_args();
/// ```
pub fn parse_args() -> Args {
    match parse_from(env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => process::exit(0),
        Err(msg) => {
            eprintln!("Error: {}", msg);
            print_usage();
            process::exit(1);
        }
    }
}

/// Parses an argument list without the program name
///
/// `Ok(None)` means the request was served (help or version).
pub fn parse_from<I: Iterator<Item = String>>(mut args: I) -> Result<Option<Args>, String> {
    let mut verbose = false;
    let mut continue_on_fail = false;
    let mut log_file = None;
    let mut output_file = None;
    let mut parallel = 1;
    let mut connect_timeout: Option<u64> = None;
    let mut insecure_skip_verify = false;
    let mut jobs_file = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => {
                print_usage();
                return Ok(None);
            }
            "-v" => {
                println!("{} version {}", crate::PROGRAM_NAME, crate::PROGRAM_VERSION);
                return Ok(None);
            }
            "-V" => verbose = true,
            "-c" => continue_on_fail = true,
            "-l" => log_file = Some(args.next().ok_or("Missing log file argument")?),
            "-o" => output_file = Some(args.next().ok_or("Missing results file argument")?),
            "-p" => {
                let value = args.next().ok_or("Missing parallel count argument")?;
                parallel = match value.parse::<usize>() {
                    Ok(n) if n > 0 => n,
                    _ => return Err("Parallel count must be a positive number".to_string()),
                };
            }
            "-t" => {
                let value = args.next().ok_or("Missing connect timeout argument")?;
                connect_timeout = match value.parse::<u64>() {
                    Ok(n) if n > 0 => Some(n),
                    _ => return Err("Connect timeout must be a positive number".to_string()),
                };
            }
            "--insecure-skip-verify" => insecure_skip_verify = true,
            _ => {
                if jobs_file.is_none() {
                    jobs_file = Some(arg);
                } else {
                    return Err(format!("Unexpected argument: {}", arg));
                }
            }
        }
    }

    let jobs_file = jobs_file.ok_or("Missing jobs file argument")?;
    Ok(Some(Args {
        verbose,
        continue_on_fail,
        log_file,
        output_file,
        parallel,
        connect_timeout,
        insecure_skip_verify,
        jobs_file,
    }))
}
