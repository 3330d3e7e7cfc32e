use chrono::{DateTime, Utc};

use crate::model::{RawEventType, ReleaseAction, ReleaseEvent, SuppressReason};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Dispatch,
    Suppress(SuppressReason),
}

/// Removes the two kinds of synthetic noise: superseded revisions and the
/// `Create`s replayed by the initial listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuppressionFilter {
    started_at: DateTime<Utc>,
}

impl SuppressionFilter {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self { started_at }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn evaluate(&self, event: &ReleaseEvent) -> Verdict {
        if event.action == ReleaseAction::SupersededReplace {
            return Verdict::Suppress(SuppressReason::Superseded);
        }
        match event.raw_type {
            // A record without a creation instant cannot prove it is new.
            RawEventType::Create => match event.created_at() {
                Some(created) if created > self.started_at => Verdict::Dispatch,
                _ => Verdict::Suppress(SuppressReason::StartupReplay),
            },
            RawEventType::Update | RawEventType::Delete => Verdict::Dispatch,
        }
    }
}
