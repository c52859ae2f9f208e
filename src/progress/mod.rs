use crate::model::{ProgressState, ProgressStatus, SessionError};
use crate::protocol::{ProgressCounters, ProtocolEvent};

/// Applies one decoded event to `state` and returns the successor.
///
/// Pure: heartbeat bookkeeping and transport teardown are the session's job.
pub fn reduce(state: &ProgressState, event: &ProtocolEvent) -> ProgressState {
    let mut next = state.clone();
    match event {
        ProtocolEvent::Connection => {
            next.status = ProgressStatus::InProgress;
        }
        ProtocolEvent::Progress(payload) => {
            let counters = payload.progress.clone().unwrap_or_default();
            if let Some(pct) = percent_complete(&counters) {
                next.progress = pct;
            }
            next.current_service = counters.current_service;
            next.total_services = counters.total_services;
            next.completed_services = counters.completed_services;
            next.message = payload.message.clone();
            next.status = ProgressStatus::InProgress;
        }
        ProtocolEvent::Completion(payload) => {
            next.progress = 100;
            next.status = ProgressStatus::Completed;
            if let Some(text) = payload.status_text() {
                next.message = Some(text);
            }
        }
        ProtocolEvent::Error(payload) => {
            next.fail(&SessionError::ServerReported(payload.description()));
        }
        ProtocolEvent::Heartbeat => {}
        ProtocolEvent::Unknown { .. } => {
            next.fail(&SessionError::Protocol);
        }
    }
    if next.status != ProgressStatus::Error {
        next.error = None;
    }
    next.last_event = Some(event.clone());
    next
}

fn percent_complete(counters: &ProgressCounters) -> Option<u8> {
    let processed = counters.processed_items?;
    let total = counters.total_items?;
    if total <= 0.0 || !total.is_finite() || !processed.is_finite() {
        return None;
    }
    let pct = (100.0 * processed / total).round().clamp(0.0, 100.0);
    Some(pct as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_frame, CompletionPayload, ErrorPayload, ProgressPayload};
    use serde_json::json;

    fn in_progress(progress: u8) -> ProgressState {
        ProgressState {
            status: ProgressStatus::InProgress,
            progress,
            ..Default::default()
        }
    }

    fn progress_event(processed: Option<f64>, total: Option<f64>) -> ProtocolEvent {
        ProtocolEvent::Progress(ProgressPayload {
            progress: Some(ProgressCounters {
                processed_items: processed,
                total_items: total,
                ..Default::default()
            }),
            message: None,
        })
    }

    #[test]
    fn connection_ack_moves_to_in_progress() {
        let next = reduce(&ProgressState::connecting(), &ProtocolEvent::Connection);
        assert_eq!(next.status, ProgressStatus::InProgress);
        assert_eq!(next.last_event, Some(ProtocolEvent::Connection));
    }

    #[test]
    fn progress_percentage_is_rounded_ratio() {
        let next = reduce(&in_progress(0), &progress_event(Some(5.0), Some(10.0)));
        assert_eq!(next.progress, 50);

        let next = reduce(&in_progress(0), &progress_event(Some(1.0), Some(3.0)));
        assert_eq!(next.progress, 33);

        let next = reduce(&in_progress(0), &progress_event(Some(2.0), Some(3.0)));
        assert_eq!(next.progress, 67);
    }

    #[test]
    fn progress_without_usable_total_keeps_previous_value() {
        let state = in_progress(42);
        assert_eq!(reduce(&state, &progress_event(Some(5.0), None)).progress, 42);
        assert_eq!(reduce(&state, &progress_event(Some(5.0), Some(0.0))).progress, 42);
        assert_eq!(reduce(&state, &progress_event(None, Some(10.0))).progress, 42);
        assert_eq!(reduce(&state, &progress_event(Some(5.0), Some(-3.0))).progress, 42);
    }

    #[test]
    fn progress_is_not_forced_monotonic_but_stays_in_range() {
        assert_eq!(reduce(&in_progress(80), &progress_event(Some(1.0), Some(10.0))).progress, 10);
        assert_eq!(reduce(&in_progress(0), &progress_event(Some(15.0), Some(10.0))).progress, 100);
    }

    #[test]
    fn progress_copies_descriptive_fields_through() {
        let state = ProgressState {
            current_service: Some("crm".to_string()),
            message: Some("old".to_string()),
            ..in_progress(10)
        };
        let event = decode_frame(
            r#"{"type":"progress","message":"Ingesting billing",
                "progress":{"current_service":"billing","total_services":4,"completed_services":2}}"#,
        )
        .unwrap();

        let next = reduce(&state, &event);
        assert_eq!(next.progress, 10);
        assert_eq!(next.current_service.as_deref(), Some("billing"));
        assert_eq!(next.total_services, Some(4));
        assert_eq!(next.completed_services, Some(2));
        assert_eq!(next.message.as_deref(), Some("Ingesting billing"));

        let bare = reduce(&next, &ProtocolEvent::Progress(ProgressPayload::default()));
        assert_eq!(bare.current_service, None);
        assert_eq!(bare.message, None);
        assert_eq!(bare.progress, 10);
    }

    #[test]
    fn progress_after_an_error_resumes_the_session() {
        let mut state = in_progress(20);
        state.fail(&SessionError::Protocol);
        let next = reduce(&state, &progress_event(Some(3.0), Some(10.0)));
        assert_eq!(next.status, ProgressStatus::InProgress);
        assert_eq!(next.progress, 30);
        assert_eq!(next.error, None);
    }

    #[test]
    fn completion_always_forces_one_hundred() {
        let event = ProtocolEvent::Completion(CompletionPayload::default());
        let next = reduce(&in_progress(30), &event);
        assert_eq!(next.progress, 100);
        assert_eq!(next.status, ProgressStatus::Completed);
    }

    #[test]
    fn completion_message_prefers_summary() {
        let state = ProgressState {
            message: Some("Ingesting crm".to_string()),
            ..in_progress(90)
        };
        let summarised = reduce(
            &state,
            &ProtocolEvent::Completion(CompletionPayload {
                summary: Some(json!("12 services ingested")),
                message: Some("done".to_string()),
            }),
        );
        assert_eq!(summarised.message.as_deref(), Some("12 services ingested"));

        let silent = reduce(&state, &ProtocolEvent::Completion(CompletionPayload::default()));
        assert_eq!(silent.message.as_deref(), Some("Ingesting crm"));
    }

    #[test]
    fn server_error_uses_message_then_error_field() {
        let next = reduce(
            &in_progress(50),
            &ProtocolEvent::Error(ErrorPayload {
                message: None,
                error: Some(json!("upstream timed out")),
            }),
        );
        assert_eq!(next.status, ProgressStatus::Error);
        assert_eq!(next.error.as_deref(), Some("upstream timed out"));
        assert_eq!(next.progress, 50);
    }

    #[test]
    fn heartbeat_only_records_the_event() {
        let state = in_progress(70);
        let next = reduce(&state, &ProtocolEvent::Heartbeat);
        assert_eq!(next.last_event, Some(ProtocolEvent::Heartbeat));
        assert_eq!(
            ProgressState {
                last_event: None,
                ..next
            },
            state
        );
    }

    #[test]
    fn unknown_event_is_an_invalid_message() {
        let event = decode_frame(r#"{"kind":"progress"}"#).unwrap();
        let next = reduce(&in_progress(10), &event);
        assert_eq!(next.status, ProgressStatus::Error);
        assert_eq!(next.error.as_deref(), Some("invalid message"));
        assert_eq!(next.last_event, Some(event));
    }
}
