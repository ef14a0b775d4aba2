use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn rank(&self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

static THRESHOLD: AtomicU8 = AtomicU8::new(1);
static INIT: OnceLock<()> = OnceLock::new();

pub fn set_level(level: LogLevel) {
    INIT.get_or_init(|| ());
    THRESHOLD.store(level.rank(), Ordering::Relaxed);
}

// REWRITER_LOG=debug|info|warn|error, read once on first use
fn threshold() -> u8 {
    INIT.get_or_init(|| {
        if let Ok(value) = std::env::var("REWRITER_LOG") {
            let rank = match value.to_ascii_lowercase().as_str() {
                "debug" => 0,
                "info" => 1,
                "warn" => 2,
                "error" => 3,
                _ => 1,
            };
            THRESHOLD.store(rank, Ordering::Relaxed);
        }
    });
    THRESHOLD.load(Ordering::Relaxed)
}

fn log(level: LogLevel, args: fmt::Arguments) {
    if level.rank() < threshold() {
        return;
    }
    let now = SystemTime::now();
    let epoch = now.duration_since(UNIX_EPOCH).unwrap();
    let unix = epoch.as_secs();
    let hours = (unix / 3600) % 24;
    let minutes = (unix / 60) % 60;
    let seconds = unix % 60;
    println!(
        "[{:02}:{:02}:{:02}] [{}] {}",
        hours, minutes, seconds, level, args
    );
}

pub fn debug(fmt: impl fmt::Display) {
    log(LogLevel::Debug, format_args!("{}", fmt));
}

pub fn info(fmt: impl fmt::Display) {
    log(LogLevel::Info, format_args!("{}", fmt));
}

pub fn warn(fmt: impl fmt::Display) {
    log(LogLevel::Warn, format_args!("{}", fmt));
}

pub fn error(fmt: impl fmt::Display) {
    log(LogLevel::Error, format_args!("{}", fmt));
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::debug(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::info(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::error(format_args!($($arg)*))
    };
}
