use crate::env;
use console::{Term, style};
use log::{Level, LevelFilter, Metadata, Record};
use once_cell::sync::Lazy;
use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

#[derive(Debug)]
struct Logger {
    level: LevelFilter,
    term_level: LevelFilter,
    file_level: LevelFilter,
    log_file: Option<Mutex<File>>,
    colors: bool,
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if record.level() <= self.file_level
            && let Some(log_file) = &self.log_file
        {
            let mut log_file = log_file.lock().unwrap_or_else(|e| e.into_inner());
            let out = format!(
                "{} {} {} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                std::process::id(),
                record.level(),
                record.args()
            );
            let _ = writeln!(log_file, "{}", console::strip_ansi_codes(&out));
        }
        if record.level() <= self.term_level {
            let out = self.render(record);
            if !out.is_empty() {
                eprintln!("{out}");
            }
        }
    }

    fn flush(&self) {
        if let Some(log_file) = &self.log_file {
            let mut log_file = log_file.lock().unwrap_or_else(|e| e.into_inner());
            let _ = log_file.flush();
        }
    }
}

static LOGGER: Lazy<Logger> = Lazy::new(Logger::init);

impl Logger {
    fn init() -> Self {
        let term_level = *env::TETHER_LOG;
        let file_level = *env::TETHER_LOG_FILE_LEVEL;

        let mut logger = Logger {
            level: std::cmp::max(term_level, file_level),
            term_level,
            file_level,
            log_file: None,
            colors: Term::stderr().is_term(),
        };

        let log_file = &*env::TETHER_LOG_FILE;
        if let Ok(log_file) = init_log_file(log_file) {
            logger.log_file = Some(Mutex::new(log_file));
        } else {
            // only the terminal gets output if the state dir is not writable
            logger.file_level = LevelFilter::Off;
            logger.level = term_level;
        }

        logger
    }

    fn render(&self, record: &Record) -> String {
        let prefix = match record.level() {
            Level::Error => self.paint("ERROR", |s| style(s).red().bold().to_string()),
            Level::Warn => self.paint("WARN", |s| style(s).yellow().bold().to_string()),
            Level::Info => self.paint("INFO", |s| style(s).cyan().to_string()),
            Level::Debug => self.paint("DEBUG", |s| style(s).blue().to_string()),
            Level::Trace => self.paint("TRACE", |s| style(s).dim().to_string()),
        };
        format!("tether {prefix} {}", record.args())
    }

    fn paint(&self, label: &str, f: impl Fn(&str) -> String) -> String {
        if self.colors {
            f(label)
        } else {
            label.to_string()
        }
    }
}

pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if let Err(err) = log::set_logger(&*LOGGER).map(|()| log::set_max_level(LOGGER.level)) {
            eprintln!("tether: failed to initialize logger: {err}");
        }
    });
}

fn init_log_file(log_file: &std::path::Path) -> std::io::Result<File> {
    if let Some(log_dir) = log_file.parent() {
        std::fs::create_dir_all(log_dir)?;
    }
    File::options().append(true).create(true).open(log_file)
}
