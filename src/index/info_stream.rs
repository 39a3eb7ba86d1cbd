//! Component-scoped diagnostic messages.
//!
//! The writer, the buffered updates stream, the file deleter, commit
//! discovery and the merge machinery all report what they do through an
//! [`InfoStream`]. The default implementation forwards to the `log` facade
//! with a per-component target (`galley::IW`, `galley::BD`, ...), so the
//! usual logger configuration decides what is kept.

use std::fmt::Debug;

use parking_lot::Mutex;

/// Writer.
pub const IW: &str = "IW";
/// Buffered updates stream.
pub const BD: &str = "BD";
/// File deleter.
pub const IFD: &str = "IFD";
/// Commit discovery.
pub const SIS: &str = "SIS";
/// Merge scheduler.
pub const MS: &str = "MS";
/// Merge policy.
pub const TMP: &str = "TMP";

/// A sink for diagnostic messages.
pub trait InfoStream: Send + Sync + Debug {
    /// Whether messages for `component` are wanted. Callers check this
    /// before formatting.
    fn is_enabled(&self, component: &str) -> bool;

    fn message(&self, component: &str, message: &str);
}

/// Forwards messages to `log::debug!`.
#[derive(Debug, Default, Clone)]
pub struct LogInfoStream;

impl InfoStream for LogInfoStream {
    fn is_enabled(&self, component: &str) -> bool {
        match component {
            IW => log::log_enabled!(target: "galley::IW", log::Level::Debug),
            BD => log::log_enabled!(target: "galley::BD", log::Level::Debug),
            IFD => log::log_enabled!(target: "galley::IFD", log::Level::Debug),
            SIS => log::log_enabled!(target: "galley::SIS", log::Level::Debug),
            MS => log::log_enabled!(target: "galley::MS", log::Level::Debug),
            TMP => log::log_enabled!(target: "galley::TMP", log::Level::Debug),
            _ => log::log_enabled!(log::Level::Debug),
        }
    }

    fn message(&self, component: &str, message: &str) {
        match component {
            IW => log::debug!(target: "galley::IW", "{message}"),
            BD => log::debug!(target: "galley::BD", "{message}"),
            IFD => log::debug!(target: "galley::IFD", "{message}"),
            SIS => log::debug!(target: "galley::SIS", "{message}"),
            MS => log::debug!(target: "galley::MS", "{message}"),
            TMP => log::debug!(target: "galley::TMP", "{message}"),
            other => log::debug!("{other}: {message}"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone)]
pub struct NoInfoStream;

impl InfoStream for NoInfoStream {
    fn is_enabled(&self, _component: &str) -> bool {
        false
    }

    fn message(&self, _component: &str, _message: &str) {}
}

/// Keeps every message in memory, for tests that assert on diagnostics.
#[derive(Debug, Default)]
pub struct RecordingInfoStream {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingInfoStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }

    /// Messages of one component that contain `needle`.
    pub fn matching(&self, component: &str, needle: &str) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(c, m)| c == component && m.contains(needle))
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl InfoStream for RecordingInfoStream {
    fn is_enabled(&self, _component: &str) -> bool {
        true
    }

    fn message(&self, component: &str, message: &str) {
        self.messages
            .lock()
            .push((component.to_string(), message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_stream() {
        let stream = RecordingInfoStream::new();
        stream.message(IW, "flush at getReader");
        stream.message(BD, "applyDeletes: 2 packets");
        stream.message(IW, "commit: done");

        assert_eq!(stream.messages().len(), 3);
        assert_eq!(stream.matching(IW, "commit"), vec!["commit: done"]);
        assert!(stream.matching(IFD, "").is_empty());
    }

    #[test]
    fn test_no_info_stream_is_disabled() {
        assert!(!NoInfoStream.is_enabled(IW));
        NoInfoStream.message(IW, "ignored");
    }
}
