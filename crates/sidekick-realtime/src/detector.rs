//! Meeting activity detection.
//!
//! The host page offers no push signal, so presence is polled. Only edges
//! are emitted: a start fires once per detected meeting, an end once when
//! the presence signal disappears.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

const DETECTOR_EVENT_CAPACITY: usize = 64;

/// Presence signal supplied by the page-scraping layer.
#[async_trait]
pub trait PresenceProbe: Send + Sync {
    /// `Some` while meeting-presence markers are visible, `None` otherwise.
    async fn probe(&self) -> Option<ProbeReading>;
}

/// One probe observation.
#[derive(Debug, Clone, Default)]
pub struct ProbeReading {
    /// Best-effort meeting title; never blocks a transition.
    pub title: Option<String>,
}

/// One contiguous detected meeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingSession {
    pub session_id: String,
    pub title: Option<String>,
    pub active: bool,
}

/// Session edge emitted by the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingEvent {
    Started {
        session_id: String,
        title: Option<String>,
    },
    Ended {
        session_id: String,
    },
}

pub struct MeetingActivityDetector {
    probe: Arc<dyn PresenceProbe>,
    poll_interval: Duration,
    session: Mutex<Option<MeetingSession>>,
    events_tx: broadcast::Sender<MeetingEvent>,
}

impl MeetingActivityDetector {
    pub fn new(probe: Arc<dyn PresenceProbe>, poll_interval: Duration) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(DETECTOR_EVENT_CAPACITY);
        Arc::new(Self {
            probe,
            poll_interval,
            session: Mutex::new(None),
            events_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeetingEvent> {
        self.events_tx.subscribe()
    }

    /// At most one session is active per context; this is its snapshot.
    pub async fn current_session(&self) -> Option<MeetingSession> {
        self.session.lock().await.clone()
    }

    /// Apply one probe observation. Split out from the poll loop so
    /// transition logic is drivable without timers.
    pub async fn observe(&self, reading: Option<ProbeReading>) {
        let mut session = self.session.lock().await;
        match (session.as_ref(), reading) {
            (None, Some(reading)) => {
                let started = MeetingSession {
                    session_id: Uuid::new_v4().to_string(),
                    title: reading.title,
                    active: true,
                };
                debug!(session_id = %started.session_id, "meeting started");
                self.emit(MeetingEvent::Started {
                    session_id: started.session_id.clone(),
                    title: started.title.clone(),
                });
                *session = Some(started);
            }
            (Some(active), None) => {
                let session_id = active.session_id.clone();
                debug!(session_id = %session_id, "meeting ended");
                self.emit(MeetingEvent::Ended { session_id });
                *session = None;
            }
            // no edge: never re-fire a start while a session is active
            _ => {}
        }
    }

    /// Poll the probe every `poll_interval` for the lifetime of the context.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(detector.poll_interval);
            loop {
                ticks.tick().await;
                let reading = detector.probe.probe().await;
                detector.observe(reading).await;
            }
        })
    }

    fn emit(&self, event: MeetingEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("meeting event dropped: no subscribers");
        }
    }
}
