//! Request lifecycle events.
//!
//! Per request the order is `request`, then `secureconnect`/`progress`,
//! then `end`, then `response`. Redirect legs repeat `request` and
//! `progress` only.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use crate::net::TlsInfo;
use crate::promise::panic_message;
use crate::request::Request;
use crate::response::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A leg is about to be sent. Fires once per physical attempt.
    Request,
    Progress,
    /// The request is about to finish, before the response is built.
    End,
    Response,
    SecureConnect,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Request => "request",
            EventKind::Progress => "progress",
            EventKind::End => "end",
            EventKind::Response => "response",
            EventKind::SecureConnect => "secureconnect",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(EventKind::Request),
            "progress" => Ok(EventKind::Progress),
            "end" => Ok(EventKind::End),
            "response" => Ok(EventKind::Response),
            "secureconnect" => Ok(EventKind::SecureConnect),
            other => Err(format!("unknown event '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub direction: ProgressDirection,
    pub loaded: u64,
    pub total: Option<u64>,
    /// `loaded / total * 100`, or 0 when the total is unknown.
    pub percent: f64,
}

impl ProgressEvent {
    pub fn new(direction: ProgressDirection, loaded: u64, total: Option<u64>) -> Self {
        let percent = match total {
            Some(total) if total > 0 => loaded as f64 / total as f64 * 100.0,
            _ => 0.0,
        };
        Self {
            direction,
            loaded,
            total,
            percent,
        }
    }
}

/// Payload handed to listeners.
pub enum RequestEvent<'a> {
    Request(&'a Request),
    Progress(ProgressEvent),
    End,
    Response(&'a Response),
    SecureConnect(&'a TlsInfo),
}

impl RequestEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            RequestEvent::Request(_) => EventKind::Request,
            RequestEvent::Progress(_) => EventKind::Progress,
            RequestEvent::End => EventKind::End,
            RequestEvent::Response(_) => EventKind::Response,
            RequestEvent::SecureConnect(_) => EventKind::SecureConnect,
        }
    }
}

pub type Listener = Arc<dyn Fn(&RequestEvent<'_>) + Send + Sync>;

/// Registered listeners in registration order.
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    entries: Vec<(EventKind, Listener)>,
}

impl Listeners {
    pub fn add(&mut self, kind: EventKind, listener: Listener) {
        self.entries.push((kind, listener));
    }

    pub fn for_kind(&self, kind: EventKind) -> Vec<Listener> {
        self.entries
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| l.clone())
            .collect()
    }
}

/// Calls every listener. A panicking listener is logged and skipped.
pub(crate) fn emit(listeners: &[Listener], event: &RequestEvent<'_>) {
    for listener in listeners {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
            log::error!(
                "'{}' listener panicked: {}",
                event.kind(),
                panic_message(payload.as_ref())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn percent_is_zero_without_total() {
        let p = ProgressEvent::new(ProgressDirection::Download, 50, None);
        assert_eq!(p.percent, 0.0);
        let p = ProgressEvent::new(ProgressDirection::Upload, 25, Some(100));
        assert_eq!(p.percent, 25.0);
    }

    #[test]
    fn event_names_parse() {
        assert_eq!("secureconnect".parse::<EventKind>().unwrap(), EventKind::SecureConnect);
        assert!("finish".parse::<EventKind>().is_err());
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let mut listeners = Listeners::default();
        listeners.add(EventKind::End, Arc::new(|_: &RequestEvent<'_>| panic!("listener failure")));
        listeners.add(
            EventKind::End,
            Arc::new(move |_: &RequestEvent<'_>| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        listeners.add(EventKind::Response, Arc::new(|_: &RequestEvent<'_>| unreachable!()));

        emit(&listeners.for_kind(EventKind::End), &RequestEvent::End);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
