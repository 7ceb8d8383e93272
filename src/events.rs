//! Outbound UI events. The presentation layer implements `EventSink` (or
//! drains a `ChannelSink`) and renders what it receives.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::discovery::Stage;
use crate::queue::PromptJob;
use crate::recipe::Recipe;
use crate::stream::StreamSegment;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    Segment { job_id: String, segment: StreamSegment },
    JobStateChanged { job: PromptJob },
    RecipeUpdated { recipe: Recipe },
    StageChanged { stage: Stage },
}

/// Called from the queue worker and the session; implementations must not block.
pub trait EventSink: Send + Sync {
    /// Append a thinking or answer delta to the job's live view.
    fn on_segment(&self, job_id: &str, segment: &StreamSegment);

    fn on_job_state_change(&self, job: &PromptJob);

    fn on_recipe_updated(&self, _recipe: &Recipe) {}

    fn on_stage_changed(&self, _stage: Stage) {}
}

/// Forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: UiEvent) {
        // A closed receiver means the UI went away; nothing left to render.
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_segment(&self, job_id: &str, segment: &StreamSegment) {
        self.send(UiEvent::Segment {
            job_id: job_id.to_string(),
            segment: segment.clone(),
        });
    }

    fn on_job_state_change(&self, job: &PromptJob) {
        self.send(UiEvent::JobStateChanged { job: job.clone() });
    }

    fn on_recipe_updated(&self, recipe: &Recipe) {
        self.send(UiEvent::RecipeUpdated {
            recipe: recipe.clone(),
        });
    }

    fn on_stage_changed(&self, stage: Stage) {
        self.send(UiEvent::StageChanged { stage });
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_segment(&self, _job_id: &str, _segment: &StreamSegment) {}

    fn on_job_state_change(&self, _job: &PromptJob) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SegmentKind;

    #[test]
    fn test_channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        let segment = StreamSegment {
            kind: SegmentKind::Answer,
            text: "Witaj".into(),
            is_final: false,
        };
        sink.on_stage_changed(Stage::Discovery);
        sink.on_segment("job-1", &segment);
        sink.on_recipe_updated(&Recipe::new());

        assert_eq!(rx.try_recv().unwrap(), UiEvent::StageChanged { stage: Stage::Discovery });
        assert_eq!(
            rx.try_recv().unwrap(),
            UiEvent::Segment {
                job_id: "job-1".into(),
                segment
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), UiEvent::RecipeUpdated { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_stage_changed(Stage::Greeting);
    }
}
