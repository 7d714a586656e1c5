use std::io::Write;
use std::fs::File;


/// A simple logger.
/// Messages at or below the configured verbosity go to stderr and, when
/// present, to the log file. Status lines (progress redraws) go to stderr
/// only, so the log file is not flooded with carriage returns.
#[derive(Debug)]
pub struct Logger {
    verbosity: u32,
    log_file: Option<File>,
}

impl Logger {
    /// Create a new logger.
    pub fn new(verbosity: u32, log_file: Option<File>) -> Self
    {
        Self {
            verbosity,
            log_file,
        }
    }

    /// Log a message line, with a specified level.
    /// Logs also into the log file, if present.
    pub fn logln(&mut self, level: u32, msg: &str)
    {
        if self.verbosity >= level {
            eprintln!("{}", msg);
            self.to_file(msg);
            self.to_file("\n");
        }
    }

    /// Write a transient status fragment (no log file, no newline).
    pub fn status(&mut self, level: u32, msg: &str)
    {
        if self.verbosity >= level {
            eprint!("{}", msg);
        }
    }

    fn to_file(&mut self, msg: &str)
    {
        if let Some(log_file) = &mut self.log_file {
            write!(log_file, "{}", msg).unwrap_or_else(|_| {
                eprintln!("warning: couldn't write into the log file");
            });
        }
    }
}
