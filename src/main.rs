use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::process;

use rayon::prelude::*;

use ftpsession::shutdown::{get_signal_type, install_signal_handlers, signal_name};
use ftpsession::{log, parse_args, parse_jobs, run_job, set_log_file, JobReport, PROGRAM_NAME, PROGRAM_VERSION};

fn main() {
    let args = parse_args();
    if let Some(log_file) = &args.log_file {
        set_log_file(log_file);
    }

    let _ = log(format!("{} {} started", PROGRAM_NAME, PROGRAM_VERSION));

    if let Err(e) = install_signal_handlers() {
        let _ = log(format!("Warning: cannot install signal handlers: {}", e));
    }

    let mut jobs = match parse_jobs(&args.jobs_file) {
        Ok(jobs) => jobs,
        Err(e) => {
            let _ = log(format!("Error parsing jobs file {}: {}", args.jobs_file, e));
            eprintln!("Error parsing jobs file {}: {}", args.jobs_file, e);
            process::exit(1);
        }
    };
    for job in &mut jobs {
        args.apply_overrides(job);
    }

    let mut output: Box<dyn Write> = match &args.output_file {
        Some(path) => match File::create(path) {
            Ok(file) => Box::new(BufWriter::new(file)),
            Err(e) => {
                let _ = log(format!("Error creating results file {}: {}", path, e));
                eprintln!("Error creating results file {}: {}", path, e);
                process::exit(1);
            }
        },
        None => Box::new(io::stdout()),
    };

    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(args.parallel)
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            let _ = log(format!("Error creating thread pool: {}", e));
            process::exit(1);
        }
    };

    let continue_on_fail = args.continue_on_fail;
    let reports: Vec<JobReport> = pool.install(|| {
        jobs.into_par_iter()
            .enumerate()
            .map(|(index, job)| {
                let host = job.connection.host.clone();
                let outcome = run_job(job, continue_on_fail, index + 1);
                JobReport::new(index + 1, host, outcome)
            })
            .collect()
    });

    let mut failed = 0;
    for report in &reports {
        if !report.is_success() {
            failed += 1;
        }
        let written = serde_json::to_string(report)
            .map_err(io::Error::from)
            .and_then(|line| writeln!(output, "{}", line));
        if let Err(e) = written {
            let _ = log(format!("Error writing results: {}", e));
            process::exit(1);
        }
    }
    if let Err(e) = output.flush() {
        let _ = log(format!("Error writing results: {}", e));
        process::exit(1);
    }

    if let Some(signal) = get_signal_type() {
        let _ = log(format!("Stopped by {}", signal_name(signal)));
    }
    let _ = log(format!(
        "{} job(s) finished, {} failed",
        reports.len(),
        failed
    ));

    if failed > 0 {
        process::exit(1);
    }
}
