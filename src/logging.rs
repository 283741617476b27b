//! Logging initialization. Text output goes through `simple_logger`;
//! JSON output is a small `log::Log` implementor of our own, since
//! `simple_logger` only ever writes human-readable lines.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};
use simple_logger::SimpleLogger;

use crate::config::LogFormat;

pub fn init(level: LevelFilter, format: LogFormat) {
    match format {
        LogFormat::Text => {
            SimpleLogger::new().with_level(level).init().unwrap();
        }
        LogFormat::Json => {
            log::set_boxed_logger(Box::new(JsonLogger { level }))
                .map(|()| log::set_max_level(level))
                .unwrap();
        }
    }
}

struct JsonLogger {
    level: LevelFilter,
}

#[derive(serde::Serialize)]
struct LogLine<'a> {
    timestamp_millis: u64,
    level: &'a str,
    target: &'a str,
    message: String,
}

impl Log for JsonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = LogLine {
            timestamp_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            level: record.level().as_str(),
            target: record.target(),
            message: record.args().to_string(),
        };
        match serde_json::to_string(&line) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("failed to serialize log line: {err}"),
        }
    }

    fn flush(&self) {}
}
