//! The string-command console surface.
//!
//! The interactive console lives outside the engine; it hands command
//! lines here and prints whatever comes back.

use std::fmt::Write;

use thiserror::Error;

use crate::engine::Engine;

/// Command errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Dispatch one console command and return its rendered output.
pub fn handle_command(engine: &Engine, line: &str) -> Result<String, CliError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["cdr", "set", "debug", value] => match *value {
            "on" => {
                engine.set_debug(true);
                Ok("CDR debugging enabled\n".to_string())
            }
            "off" => {
                engine.set_debug(false);
                Ok("CDR debugging disabled\n".to_string())
            }
            _ => Err(CliError::Usage("cdr set debug [on|off]")),
        },
        ["cdr", "show", "status"] => Ok(render_status(engine)),
        ["cdr", "submit"] => {
            engine.submit_batch();
            Ok(
                "Submitted CDRs to backend engines for processing.  This may take a while.\n"
                    .to_string(),
            )
        }
        _ => Err(CliError::Unknown(line.to_string())),
    }
}

fn render_status(engine: &Engine) -> String {
    let status = engine.status();
    let mut out = String::new();

    let yes_no = |b: bool| if b { "Yes" } else { "No" };

    let _ = writeln!(out);
    let _ = writeln!(out, "Call Detail Record (CDR) settings");
    let _ = writeln!(out, "----------------------------------");
    let _ = writeln!(
        out,
        "  Logging:                    {}",
        if status.enabled { "Enabled" } else { "Disabled" }
    );
    let _ = writeln!(
        out,
        "  Mode:                       {}",
        if status.batch_mode { "Batch" } else { "Simple" }
    );
    if status.enabled {
        let _ = writeln!(
            out,
            "  Log unanswered calls:       {}",
            yes_no(status.unanswered)
        );
        let _ = writeln!(
            out,
            "  Log congestion:             {}\n",
            yes_no(status.congestion)
        );
        if status.batch_mode {
            let _ = writeln!(out, "* Batch Mode Settings");
            let _ = writeln!(out, "  -------------------");
            let _ = writeln!(
                out,
                "  Safe shutdown:              {}",
                if status.safe_shutdown { "Enabled" } else { "Disabled" }
            );
            let _ = writeln!(
                out,
                "  Threading model:            {}",
                if status.scheduler_only {
                    "Scheduler only"
                } else {
                    "Scheduler plus separate threads"
                }
            );
            let _ = writeln!(
                out,
                "  Current batch size:         {} record(s)",
                status.batch_size
            );
            let _ = writeln!(
                out,
                "  Maximum batch size:         {} record(s)",
                status.max_batch_size
            );
            let _ = writeln!(
                out,
                "  Maximum batch time:         {} second(s)",
                status.max_batch_time
            );
            let _ = writeln!(
                out,
                "  Next batch processing time: {} second(s)\n",
                status.next_flush_secs.unwrap_or(0)
            );
        }
        let _ = writeln!(out, "* Registered Backends");
        let _ = writeln!(out, "  -------------------");
        if status.backends.is_empty() {
            let _ = writeln!(out, "    (none)");
        } else {
            for (name, _) in &status.backends {
                let _ = writeln!(out, "    {name}");
            }
        }
    }

    out
}
