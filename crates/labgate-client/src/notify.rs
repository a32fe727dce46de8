use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;

/// Default number of notices kept by [`NoticeLog`].
pub const DEFAULT_NOTICE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Error,
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "ok",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        })
    }
}

/// An operator-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Sink for operator-facing notifications.
pub trait Notifier {
    fn notify(&self, level: NoticeLevel, message: &str);

    fn success(&self, message: &str) {
        self.notify(NoticeLevel::Success, message);
    }

    fn info(&self, message: &str) {
        self.notify(NoticeLevel::Info, message);
    }

    fn warning(&self, message: &str) {
        self.notify(NoticeLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.notify(NoticeLevel::Error, message);
    }
}

/// Writes notices as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Success | NoticeLevel::Info => {
                tracing::info!(target: "labgate::notice", %level, "{message}")
            },
            NoticeLevel::Warning => tracing::warn!(target: "labgate::notice", "{message}"),
            NoticeLevel::Error => tracing::error!(target: "labgate::notice", "{message}"),
        }
    }
}

/// Bounded in-memory queue of notices, oldest dropped first.
#[derive(Debug)]
pub struct NoticeLog {
    notices: RefCell<VecDeque<Notice>>,
    capacity: usize,
}

impl Default for NoticeLog {
    fn default() -> Self {
        Self::new(DEFAULT_NOTICE_CAPACITY)
    }
}

impl NoticeLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            notices: RefCell::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Remove and return every queued notice, oldest first.
    pub fn drain(&self) -> Vec<Notice> {
        self.notices.borrow_mut().drain(..).collect()
    }

    pub fn latest(&self) -> Option<Notice> {
        self.notices.borrow().back().cloned()
    }

    /// Copy of the queue, oldest first.
    pub fn snapshot(&self) -> Vec<Notice> {
        self.notices.borrow().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.notices.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.borrow().is_empty()
    }

    /// Number of queued notices at `level`.
    pub fn count(&self, level: NoticeLevel) -> usize {
        self.notices
            .borrow()
            .iter()
            .filter(|n| n.level == level)
            .count()
    }
}

impl Notifier for NoticeLog {
    fn notify(&self, level: NoticeLevel, message: &str) {
        let mut notices = self.notices.borrow_mut();
        if notices.len() == self.capacity {
            notices.pop_front();
        }
        notices.push_back(Notice {
            level,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_keeps_order_and_levels() {
        let log = NoticeLog::default();
        log.success("Unlocked PC-1");
        log.error("Unable to reach the server.");
        assert_eq!(log.len(), 2);
        assert_eq!(log.count(NoticeLevel::Error), 1);
        assert_eq!(log.latest().unwrap().level, NoticeLevel::Error);

        let drained = log.drain();
        assert_eq!(drained[0].message, "Unlocked PC-1");
        assert!(log.is_empty());
    }

    #[test]
    fn log_drops_oldest_when_full() {
        let log = NoticeLog::new(2);
        log.info("a");
        log.info("b");
        log.info("c");
        let messages: Vec<_> = log.snapshot().into_iter().map(|n| n.message).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn tracing_notifier_does_not_panic_without_subscriber() {
        TracingNotifier.warning("no subscriber installed");
    }
}
