//! A process-wide logger that mirrors messages to stdout and fans them out to
//! any subscribed observers, with debounced progress counters for long walks.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        OnceLock,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::sync::broadcast::{channel, Receiver, Sender};

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, creating it on first use.
pub fn global() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(channel(100).0))
}

#[derive(Debug)]
pub struct Logger {
    sender: Sender<LogItem>,
    current: AtomicU64,
    total: AtomicU64,
    last_sent: AtomicU64,
}

#[derive(Clone, Serialize)]
pub enum LogItem {
    Message(String),
    Progress(Progress),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Progress {
    current: u64,
    total: u64,
    file: String,
}

impl Logger {
    pub fn new(sender: Sender<LogItem>) -> Self {
        Self {
            sender,
            current: Default::default(),
            total: Default::default(),
            last_sent: Default::default(),
        }
    }

    pub fn log(&self, msg: impl Into<String> + Clone) {
        // ignore sending errors because they are not very meaningful
        self.sender.send(LogItem::Message(msg.clone().into())).ok();
        println!("[log] {}", msg.into());
    }

    pub fn subscribe(&self) -> Receiver<LogItem> {
        self.sender.subscribe()
    }

    pub fn progress_set_total(&self, total: u64) {
        self.total.store(total, Relaxed);
        self.current.store(0, Relaxed);
    }

    pub fn increment_progress(&self, file: impl Into<String>) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;

        // debounce progress updates, send at most once every 100ms
        if now - self.last_sent.load(Relaxed) >= 100 {
            self.sender
                .send(LogItem::Progress(Progress {
                    current: self.current.fetch_add(1, Relaxed),
                    total: self.total.load(Relaxed),
                    file: file.into(),
                }))
                .ok();

            self.last_sent.store(now, Relaxed);
        } else {
            self.current.fetch_add(1, Relaxed);
        }
    }
}

#[macro_export]
macro_rules! log {
    ($msg:literal $(, $args:expr)*) => {
        { $crate::logger::global().log(format!($msg, $($args),*)); }
    };
}
