//! Checks a picked session must pass before placement

use chrono::{DateTime, Utc};
use slotsched_core::{PendingSession, PredicateRecord, ScalingGroupOpts, SessionType};

/// Result of running every predicate on a session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredicateOutcome {
    pub passed: Vec<PredicateRecord>,
    pub failed: Vec<PredicateRecord>,
}

impl PredicateOutcome {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    /// Failure messages joined for the session status
    pub fn failure_message(&self) -> String {
        self.failed
            .iter()
            .filter_map(|r| r.msg.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn record(&mut self, name: &str, result: Result<(), String>) {
        match result {
            Ok(()) => self.passed.push(PredicateRecord {
                name: name.to_string(),
                msg: None,
            }),
            Err(msg) => self.failed.push(PredicateRecord {
                name: name.to_string(),
                msg: Some(msg),
            }),
        }
    }
}

/// A batch session with a reserved start time may only start once it is reached
pub fn check_reserved_batch_session(
    session: &PendingSession,
    now: DateTime<Utc>,
) -> Result<(), String> {
    if session.session_type != SessionType::Batch {
        return Ok(());
    }
    match session.starts_at {
        Some(starts_at) if now < starts_at.with_timezone(&Utc) => Err(format!(
            "Before start time ({})",
            starts_at.to_rfc3339()
        )),
        _ => Ok(()),
    }
}

/// The scaling group must accept the session's type
pub fn check_allowed_session_types(
    session: &PendingSession,
    opts: &ScalingGroupOpts,
) -> Result<(), String> {
    if opts.allowed_session_types.contains(&session.session_type) {
        Ok(())
    } else {
        Err(format!(
            "The scaling group {} does not accept {} sessions",
            session.scaling_group, session.session_type
        ))
    }
}

/// Run every predicate and collect the passed and failed ones
pub fn check_predicates(
    session: &PendingSession,
    opts: &ScalingGroupOpts,
    now: DateTime<Utc>,
) -> PredicateOutcome {
    let mut outcome = PredicateOutcome::default();
    outcome.record(
        "reserved_time",
        check_reserved_batch_session(session, now),
    );
    outcome.record(
        "allowed_session_types",
        check_allowed_session_types(session, opts),
    );
    outcome
}
